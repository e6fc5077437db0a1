//! Advisory file lock coordinating concurrent access to one cache file.
//!
//! The lock lives in `<cache>.lock` next to the cache file. Readers take the
//! whole-file `flock` in shared mode, writers in exclusive mode. An exclusive
//! holder records `"<pid> <unix-time>\n"` in the file body; a later acquirer
//! that finds the lock contended inspects that body and takes over when the
//! holder is dead or has not refreshed the timestamp for a long time (a
//! crashed process releases the flock automatically, a wedged one does not).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use indu_core::{InduError, InduResult};

/// Holder is considered stale once its timestamp is this many seconds old.
const STALE_LOCK_THRESHOLD: u64 = 300;

const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(10);
const MAX_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Default)]
pub struct CacheLock {
    lock_path: Option<PathBuf>,
    held: Option<(File, LockMode)>,
}

impl CacheLock {
    pub fn new() -> Self {
        CacheLock::default()
    }

    /// Point the lock at `<cache_path>.lock`, releasing anything still held.
    pub fn init(&mut self, cache_path: &Path) {
        self.release();
        self.lock_path = Some(lock_path_for(cache_path));
    }

    pub fn lock_path(&self) -> Option<&Path> {
        self.lock_path.as_deref()
    }

    /// Mode of the currently held lock, if any.
    pub fn mode(&self) -> Option<LockMode> {
        self.held.as_ref().map(|(_, mode)| *mode)
    }

    /// Acquire the lock in `mode`. `timeout_sec` is -1 to block, 0 to fail
    /// immediately on contention, or a bounded number of seconds.
    ///
    /// Re-acquisition under a compatible mode is an immediate success; an
    /// upgrade from shared to exclusive releases the shared lock first, so
    /// there is a short window in which the lock is not held at all.
    pub fn acquire(&mut self, mode: LockMode, timeout_sec: i32) -> InduResult<()> {
        let lock_path = self
            .lock_path
            .clone()
            .ok_or_else(|| InduError::Cache("cache lock not initialized".into()))?;

        if let Some((_, held_mode)) = &self.held {
            if *held_mode == LockMode::Exclusive || mode == LockMode::Shared {
                return Ok(());
            }
            self.release();
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(&lock_path)?;

        let start = Instant::now();
        let mut retry_delay = INITIAL_RETRY_DELAY;
        let mut first_attempt = true;

        loop {
            match try_flock(&file, mode, false) {
                Ok(()) => {
                    // Exclusive holders advertise themselves in the body.
                    if mode == LockMode::Exclusive {
                        if let Err(err) = write_lock_info(&mut file) {
                            unlock(&file);
                            return Err(err.into());
                        }
                    }
                    self.held = Some((file, mode));
                    return Ok(());
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(err.into()),
            }

            if first_attempt {
                first_attempt = false;
                // One takeover attempt per acquisition. Getting the exclusive
                // flock here means the stale holder vanished between checks;
                // losing the race is treated as ordinary contention.
                if is_stale(&mut file) && try_flock(&file, LockMode::Exclusive, false).is_ok() {
                    if mode == LockMode::Exclusive {
                        if let Err(err) = write_lock_info(&mut file) {
                            unlock(&file);
                            return Err(err.into());
                        }
                    } else {
                        // Downgrade to the requested shared mode.
                        unlock(&file);
                        try_flock(&file, LockMode::Shared, false)?;
                    }
                    log::debug!("took over stale lock at {}", lock_path.display());
                    self.held = Some((file, mode));
                    return Ok(());
                }
            }

            if timeout_sec == 0
                || (timeout_sec > 0 && start.elapsed() >= Duration::from_secs(timeout_sec as u64))
            {
                return Err(InduError::LockTimeout(lock_path.display().to_string()));
            }

            std::thread::sleep(retry_delay);
            retry_delay = (retry_delay * 2).min(MAX_RETRY_DELAY);
        }
    }

    /// Drop the held lock; a no-op when none is held.
    pub fn release(&mut self) {
        if let Some((file, _)) = self.held.take() {
            unlock(&file);
        }
    }

    /// Release and forget the lock file path.
    pub fn cleanup(&mut self) {
        self.release();
        self.lock_path = None;
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn lock_path_for(cache_path: &Path) -> PathBuf {
    let mut raw = cache_path.as_os_str().to_os_string();
    raw.push(".lock");
    PathBuf::from(raw)
}

fn try_flock(file: &File, mode: LockMode, blocking: bool) -> std::io::Result<()> {
    let mut op = match mode {
        LockMode::Shared => libc::LOCK_SH,
        LockMode::Exclusive => libc::LOCK_EX,
    };
    if !blocking {
        op |= libc::LOCK_NB;
    }
    if unsafe { libc::flock(file.as_raw_fd(), op) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

fn unlock(file: &File) {
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Signal-0 probe; EPERM means the process exists but belongs to someone else.
fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    (unsafe { libc::kill(pid, 0) == 0 })
        || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn read_lock_info(file: &mut File) -> Option<(i32, u64)> {
    file.seek(SeekFrom::Start(0)).ok()?;
    let mut raw = [0u8; 64];
    let n = file.read(&mut raw).ok()?;
    if n == 0 {
        return None;
    }
    let text = std::str::from_utf8(&raw[..n]).ok()?;
    let mut fields = text.split_whitespace();
    let pid = fields.next()?.parse().ok()?;
    let timestamp = fields.next()?.parse().ok()?;
    Some((pid, timestamp))
}

fn write_lock_info(file: &mut File) -> std::io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    let body = format!("{} {}\n", std::process::id(), unix_now());
    file.write_all(body.as_bytes())?;
    file.sync_all()
}

/// An unreadable body counts as stale, as does a dead holder or a timestamp
/// past the threshold.
fn is_stale(file: &mut File) -> bool {
    match read_lock_info(file) {
        None => true,
        Some((pid, timestamp)) => {
            if !process_alive(pid) {
                return true;
            }
            timestamp > 0 && unix_now().saturating_sub(timestamp) > STALE_LOCK_THRESHOLD
        }
    }
}
