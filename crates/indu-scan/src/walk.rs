//! Depth-first directory walker.
//!
//! The walker chdirs through the tree, keeping a single textual current path
//! and the root device. Each directory's names are read fully into memory
//! before recursing so no directory handles stay open across recursion
//! levels. For every clean directory the incremental cache is consulted
//! first; on a hit the cached subtree is replayed into the output sink and
//! the directory is not descended. After a fresh walk of a directory its
//! immediate children are written back to the cache, post-order, so child
//! entries always exist by the time their parent stores its record.
//!
//! The current working directory is a process-global resource: the walker
//! owns it for the whole scan and must never run concurrently with anything
//! else that chdirs.

use std::env;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::io::{self, Read};
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use anyhow::{Context, Result};

use indu_cache::cache::{CacheChild, CacheStore};
use indu_core::error::InduError;
use indu_core::item::{
    DirSummary, ExtInfo, OutputSink, FF_CACHED, FF_DIR, FF_ERR, FF_EXCLUDE_MASK, FF_EXL,
    FF_EXT, FF_FILE, FF_HLNKC, FF_KERNFS, FF_OTHFS,
};

use crate::exclude::ExcludePatterns;

#[derive(Debug, Default)]
pub struct ScanOptions {
    /// Stay on the filesystem of the scan root.
    pub one_file_system: bool,
    /// Skip Linux pseudo filesystems (procfs, sysfs, cgroup, ...).
    pub exclude_kernfs: bool,
    /// Skip entries reached through macOS firmlinks.
    pub exclude_firmlinks: bool,
    /// Follow symlinks that point at non-directories.
    pub follow_symlinks: bool,
    /// Skip directories carrying a CACHEDIR.TAG file.
    pub cachedir_tags: bool,
    pub exclude: ExcludePatterns,
}

/// Walk `path` and stream the result into `sink`. On a clean run the cache,
/// when one is configured, is saved and then dropped. A fatal error (a root
/// that is not a directory, losing the working directory, a sink rejection)
/// aborts the walk without saving; per-entry stat failures only flag the
/// entry. Returns the sink's exit status.
pub fn scan<S: OutputSink>(
    path: &Path,
    opts: &ScanOptions,
    mut cache: Option<&mut CacheStore>,
    sink: &mut S,
) -> Result<i32> {
    match run(path, opts, cache.as_deref_mut(), sink) {
        Ok(()) => {
            if let Some(cache) = cache {
                if let Err(err) = cache.save() {
                    log::warn!("cache save skipped: {:#}", err);
                }
                cache.destroy();
            }
            Ok(sink.finish(false))
        }
        Err(err) => {
            if let Some(cache) = cache {
                cache.destroy();
            }
            sink.finish(true);
            Err(err)
        }
    }
}

fn run<S: OutputSink>(
    path: &Path,
    opts: &ScanOptions,
    cache: Option<&mut CacheStore>,
    sink: &mut S,
) -> Result<()> {
    let root = fs::canonicalize(path).with_context(|| format!("resolving {}", path.display()))?;
    let meta = fs::symlink_metadata(&root).context("could not stat the scan root")?;
    if !meta.is_dir() {
        return Err(InduError::NotADirectory(root.display().to_string()).into());
    }
    env::set_current_dir(&root)
        .with_context(|| format!("changing directory to {}", root.display()))?;

    let (names, partial) = read_dir_names().context("could not read the scan root")?;

    let root_path = root.to_string_lossy().into_owned();
    let mut walker = Walker {
        opts,
        cache,
        sink,
        cur_path: root_path.clone(),
        cur_dev: meta.dev(),
    };

    let mut summary = DirSummary::default();
    let mut ext = ExtInfo::default();
    let mut nlink = 0;
    stat_to_summary(
        &meta,
        walker.cur_dev,
        opts.one_file_system,
        &mut summary,
        &mut ext,
        &mut nlink,
    );
    if partial {
        summary.flags |= FF_ERR;
    }

    walker
        .sink
        .item(&summary, &root_path, Some(&ext), nlink)
        .context("output error")?;
    // The root itself is never cached; its subdirectories are.
    walker.walk(names, None)?;
    walker.sink.close_dir().context("output error")?;
    Ok(())
}

struct Walker<'a, S: OutputSink> {
    opts: &'a ScanOptions,
    cache: Option<&'a mut CacheStore>,
    sink: &'a mut S,
    cur_path: String,
    cur_dev: u64,
}

impl<'a, S: OutputSink> Walker<'a, S> {
    /// Process the named entries of the current working directory in the
    /// order the OS returned them. `collect` receives the shallow child
    /// records destined for the cache when caching is enabled.
    fn walk(&mut self, names: Vec<OsString>, mut collect: Option<&mut Vec<CacheChild>>) -> Result<()> {
        for name_os in names {
            let name = name_os.to_string_lossy().into_owned();
            let saved_len = self.cur_path.len();
            if !self.cur_path.ends_with('/') {
                self.cur_path.push('/');
            }
            self.cur_path.push_str(&name);
            let result = self.scan_item(&name_os, &name, collect.as_deref_mut());
            self.cur_path.truncate(saved_len);
            result?;
        }
        Ok(())
    }

    fn scan_item(
        &mut self,
        name_os: &OsStr,
        name: &str,
        mut parent: Option<&mut Vec<CacheChild>>,
    ) -> Result<()> {
        let mut summary = DirSummary::default();
        let mut ext: Option<ExtInfo> = None;
        let mut nlink: u32 = 0;

        if self.opts.exclude.matches(&self.cur_path) {
            summary.flags |= FF_EXL;
        }

        let mut meta = None;
        if summary.flags & (FF_ERR | FF_EXL) == 0 {
            match fs::symlink_metadata(name_os) {
                Ok(m) => meta = Some(m),
                Err(_) => summary.flags |= FF_ERR,
            }
        }

        #[cfg(target_os = "linux")]
        if self.opts.exclude_kernfs
            && summary.flags & (FF_ERR | FF_EXL) == 0
            && meta.as_ref().is_some_and(fs::Metadata::is_dir)
        {
            match statfs_type(name_os) {
                Ok(fs_type) if is_kernfs(fs_type) => summary.flags |= FF_KERNFS,
                Ok(_) => {}
                Err(_) => summary.flags |= FF_ERR,
            }
        }

        #[cfg(target_os = "macos")]
        if self.opts.exclude_firmlinks && summary.flags & (FF_ERR | FF_EXL) == 0 {
            use indu_core::item::FF_FRMLNK;
            match firmlink::nofirmlink_path(name_os) {
                Ok(resolved) if resolved != self.cur_path.as_bytes() => {
                    summary.flags |= FF_FRMLNK;
                }
                Ok(_) => {}
                Err(_) => summary.flags |= FF_ERR,
            }
        }

        if summary.flags & (FF_ERR | FF_EXL) == 0 {
            if let Some(lstat) = meta.as_ref() {
                let followed = if self.opts.follow_symlinks && lstat.file_type().is_symlink() {
                    // Symlinks to directories are never followed.
                    fs::metadata(name_os).ok().filter(|m| !m.is_dir())
                } else {
                    None
                };
                let mut info = ExtInfo::default();
                stat_to_summary(
                    followed.as_ref().unwrap_or(lstat),
                    self.cur_dev,
                    self.opts.one_file_system,
                    &mut summary,
                    &mut info,
                    &mut nlink,
                );
                ext = Some(info);
            }
        }

        let clean_dir = is_clean_dir(summary.flags);

        // A validated cache entry replaces the whole descent.
        if clean_dir {
            if let Some(cache) = self.cache.as_deref() {
                let mtime = ext.as_ref().and_then(|e| e.mtime).unwrap_or(0);
                if cache
                    .lookup(&self.cur_path, mtime, summary.dev, summary.ino)
                    .is_some()
                {
                    summary.flags |= FF_CACHED;
                    if let Some(children) = parent.as_deref_mut() {
                        children.push(child_record(name, &summary, ext.as_ref(), nlink));
                    }
                    self.sink
                        .item(&summary, name, ext.as_ref(), nlink)
                        .context("output error")?;
                    cache.replay(&self.cur_path, &mut *self.sink)?;
                    self.sink.close_dir().context("output error")?;
                    return Ok(());
                }
            }
        }

        if self.opts.cachedir_tags && clean_dir && has_cachedir_tag(name_os) {
            summary.flags |= FF_EXL;
            summary.size = 0;
            summary.asize = 0;
        }

        if let Some(children) = parent.as_deref_mut() {
            children.push(child_record(name, &summary, ext.as_ref(), nlink));
        }

        if summary.flags & FF_DIR != 0 && is_clean_dir(summary.flags) {
            self.scan_dir(name_os, name, summary, ext, nlink)
        } else if summary.flags & FF_DIR != 0 {
            self.sink
                .item(&summary, name, ext.as_ref(), 0)
                .context("output error")?;
            self.sink.close_dir().context("output error")
        } else {
            self.sink
                .item(&summary, name, ext.as_ref(), nlink)
                .context("output error")
        }
    }

    /// Descend into a clean directory: chdir in, read its names, walk them,
    /// store the collected children, chdir back out.
    fn scan_dir(
        &mut self,
        name_os: &OsStr,
        name: &str,
        mut summary: DirSummary,
        ext: Option<ExtInfo>,
        nlink: u32,
    ) -> Result<()> {
        if env::set_current_dir(name_os).is_err() {
            summary.flags |= FF_ERR;
            self.sink
                .item(&summary, name, ext.as_ref(), nlink)
                .context("output error")?;
            return self.sink.close_dir().context("output error");
        }

        let (names, partial) = match read_dir_names() {
            Ok(listing) => listing,
            Err(_) => {
                summary.flags |= FF_ERR;
                self.sink
                    .item(&summary, name, ext.as_ref(), nlink)
                    .context("output error")?;
                self.sink.close_dir().context("output error")?;
                return env::set_current_dir("..")
                    .context("could not go back to the parent directory");
            }
        };
        if partial {
            // A readdir failure halfway through is not fatal.
            summary.flags |= FF_ERR;
        }

        self.sink
            .item(&summary, name, ext.as_ref(), nlink)
            .context("output error")?;

        let mut collected: Option<Vec<CacheChild>> = self.cache.is_some().then(Vec::new);
        let walked = self.walk(names, collected.as_mut());

        if let Err(err) = walked {
            let _ = self.sink.close_dir();
            return Err(err);
        }

        if let (Some(children), Some(cache)) = (collected, self.cache.as_deref_mut()) {
            cache.store(&self.cur_path, &summary, ext.as_ref(), children);
        }

        // Not being able to get back up is fatal: every later relative path
        // would resolve against the wrong directory.
        env::set_current_dir("..").context("could not go back to the parent directory")?;
        self.sink.close_dir().context("output error")?;
        Ok(())
    }
}

fn is_clean_dir(flags: u16) -> bool {
    flags & FF_DIR != 0 && flags & (FF_ERR | FF_EXCLUDE_MASK) == 0
}

/// Names in the current working directory, fully materialized. The boolean
/// reports a readdir error partway through the listing.
fn read_dir_names() -> io::Result<(Vec<OsString>, bool)> {
    let entries = fs::read_dir(".")?;
    let mut names = Vec::new();
    let mut partial = false;
    for entry in entries {
        match entry {
            Ok(entry) => names.push(entry.file_name()),
            Err(_) => partial = true,
        }
    }
    Ok((names, partial))
}

/// Fill the summary and extended info from a stat result. Sizes stay zero
/// for entries excluded by pattern, device boundary or pseudo filesystem.
fn stat_to_summary(
    meta: &fs::Metadata,
    root_dev: u64,
    one_file_system: bool,
    summary: &mut DirSummary,
    ext: &mut ExtInfo,
    nlink: &mut u32,
) {
    summary.flags |= FF_EXT;
    summary.ino = meta.ino();
    summary.dev = meta.dev();

    let file_type = meta.file_type();
    if file_type.is_file() {
        summary.flags |= FF_FILE;
    } else if file_type.is_dir() {
        summary.flags |= FF_DIR;
    }

    if !file_type.is_dir() && meta.nlink() > 1 {
        summary.flags |= FF_HLNKC;
        *nlink = meta.nlink() as u32;
    } else {
        *nlink = 0;
    }

    if one_file_system && summary.dev != root_dev {
        summary.flags |= FF_OTHFS;
    }

    if summary.flags & (FF_OTHFS | FF_EXL | FF_KERNFS) == 0 {
        summary.size = (meta.blocks() as i64).saturating_mul(512);
        summary.asize = meta.size() as i64;
    }

    ext.mtime = Some(meta.mtime().max(0) as u64);
    ext.uid = Some(meta.uid());
    ext.gid = Some(meta.gid());
    ext.mode = Some(meta.mode() as u16);
}

fn child_record(name: &str, dir: &DirSummary, ext: Option<&ExtInfo>, nlink: u32) -> CacheChild {
    CacheChild {
        name: name.to_string(),
        flags: dir.flags,
        size: dir.size,
        asize: dir.asize,
        ino: dir.ino,
        dev: dir.dev,
        mtime: ext.and_then(|e| e.mtime).unwrap_or(0),
        uid: ext.and_then(|e| e.uid).unwrap_or(0),
        gid: ext.and_then(|e| e.gid).unwrap_or(0),
        mode: ext.and_then(|e| e.mode).unwrap_or(0),
        nlink,
        children: Vec::new(),
    }
}

const CACHEDIR_TAG_SIGNATURE: &[u8] = b"Signature: 8a477f597d28d172789f06886806bc55";

fn has_cachedir_tag(dir: &OsStr) -> bool {
    let mut file = match fs::File::open(Path::new(dir).join("CACHEDIR.TAG")) {
        Ok(file) => file,
        Err(_) => return false,
    };
    let mut buf = [0u8; 43];
    file.read_exact(&mut buf).is_ok() && buf[..] == *CACHEDIR_TAG_SIGNATURE
}

#[cfg(target_os = "linux")]
fn statfs_type(name: &OsStr) -> io::Result<i64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let cname = CString::new(name.as_bytes())
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let mut fst: libc::statfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statfs(cname.as_ptr(), &mut fst) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fst.f_type as i64)
}

/// Pseudo filesystems whose contents carry no real disk usage.
#[cfg(target_os = "linux")]
fn is_kernfs(fs_type: i64) -> bool {
    // Not exposed by the libc crate.
    const PSTOREFS_MAGIC: i64 = 0x6165676c;
    const BINFMTFS_MAGIC: i64 = 0x42494e4d;
    [
        BINFMTFS_MAGIC,
        libc::BPF_FS_MAGIC as i64,
        libc::CGROUP_SUPER_MAGIC as i64,
        libc::CGROUP2_SUPER_MAGIC as i64,
        libc::DEBUGFS_MAGIC as i64,
        libc::DEVPTS_SUPER_MAGIC as i64,
        libc::PROC_SUPER_MAGIC as i64,
        PSTOREFS_MAGIC,
        libc::SECURITYFS_MAGIC as i64,
        libc::SELINUX_MAGIC as i64,
        libc::SYSFS_MAGIC as i64,
        libc::TRACEFS_MAGIC as i64,
    ]
    .contains(&fs_type)
}

#[cfg(target_os = "macos")]
mod firmlink {
    use std::ffi::{CString, OsStr};
    use std::io;
    use std::os::unix::ffi::OsStrExt;

    const ATTR_BIT_MAP_COUNT: u16 = 5;
    const ATTR_CMNEXT_NOFIRMLINKPATH: u32 = 0x0000_0800;
    const FSOPT_ATTR_CMN_EXTENDED: u32 = 0x0000_0020;

    #[repr(C, packed(4))]
    struct AttrList {
        bitmapcount: u16,
        reserved: u16,
        commonattr: u32,
        volattr: u32,
        dirattr: u32,
        fileattr: u32,
        forkattr: u32,
    }

    /// Resolved path of `name` with firmlinks undone, without the trailing
    /// NUL. Divergence from the expected path marks a firmlink crossing.
    pub fn nofirmlink_path(name: &OsStr) -> io::Result<Vec<u8>> {
        let cname = CString::new(name.as_bytes())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let mut list = AttrList {
            bitmapcount: ATTR_BIT_MAP_COUNT,
            reserved: 0,
            commonattr: 0,
            volattr: 0,
            dirattr: 0,
            fileattr: 0,
            forkattr: ATTR_CMNEXT_NOFIRMLINKPATH,
        };
        // Layout: u32 total length, attrreference (i32 offset, u32 length),
        // then the path bytes the reference points into.
        let mut buf = vec![0u8; 12 + libc::PATH_MAX as usize];
        let rc = unsafe {
            libc::getattrlist(
                cname.as_ptr(),
                &mut list as *mut AttrList as *mut libc::c_void,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                FSOPT_ATTR_CMN_EXTENDED,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        let offset = i32::from_ne_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let length = u32::from_ne_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
        // The data offset is relative to the attrreference itself.
        let start = 4usize.saturating_add(offset.max(0) as usize);
        let end = start.saturating_add(length);
        if length == 0 || end > buf.len() {
            return Err(io::Error::from(io::ErrorKind::InvalidData));
        }
        Ok(buf[start..end - 1].to_vec())
    }
}
