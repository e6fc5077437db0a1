//! The item vocabulary shared by the scanner, the cache and output sinks:
//! per-entry flag bits, the fixed-size directory summary, the optional
//! extended metadata and the sink callback interface.

use anyhow::Result;

/// Entry is a directory.
pub const FF_DIR: u16 = 1 << 0;
/// Entry is a regular file.
pub const FF_FILE: u16 = 1 << 1;
/// A stat or readdir call failed for this entry.
pub const FF_ERR: u16 = 1 << 2;
/// Entry matched a user exclusion pattern (or a CACHEDIR.TAG).
pub const FF_EXL: u16 = 1 << 3;
/// Entry lives on another filesystem than the scan root.
pub const FF_OTHFS: u16 = 1 << 4;
/// Entry is on a Linux pseudo filesystem (procfs, sysfs, ...).
pub const FF_KERNFS: u16 = 1 << 5;
/// Entry is reached through a macOS firmlink.
pub const FF_FRMLNK: u16 = 1 << 6;
/// Non-directory with a link count above one.
pub const FF_HLNKC: u16 = 1 << 7;
/// Extended metadata (mtime/uid/gid/mode) is attached.
pub const FF_EXT: u16 = 1 << 8;
/// Directory was served from the incremental cache.
pub const FF_CACHED: u16 = 1 << 9;

/// The exclusion flags are mutually exclusive; at most one may be set.
pub const FF_EXCLUDE_MASK: u16 = FF_EXL | FF_OTHFS | FF_KERNFS | FF_FRMLNK;

/// Fixed-size record carrying the per-entry measurements.
///
/// `size` is the on-disk footprint (`st_blocks * 512`), `asize` the apparent
/// size. Both stay zero for excluded, cross-filesystem and pseudo-fs entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirSummary {
    pub flags: u16,
    pub size: i64,
    pub asize: i64,
    pub ino: u64,
    pub dev: u64,
}

/// Optionally captured POSIX metadata. `None` means unknown, which is how
/// zero-valued fields come back out of the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtInfo {
    pub mtime: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mode: Option<u16>,
}

impl ExtInfo {
    pub fn is_empty(&self) -> bool {
        self.mtime.is_none() && self.uid.is_none() && self.gid.is_none() && self.mode.is_none()
    }
}

/// Where the item stream goes: the browse tree, an exporter, a test recorder.
///
/// The producer emits exactly one `item` per visited entry and one
/// `close_dir` after the children of each directory. An `Err` from either
/// callback aborts the scan.
pub trait OutputSink {
    fn item(&mut self, dir: &DirSummary, name: &str, ext: Option<&ExtInfo>, nlink: u32)
        -> Result<()>;

    fn close_dir(&mut self) -> Result<()>;

    /// Called once at the end of the run; returns the process exit status.
    fn finish(&mut self, failed: bool) -> i32;
}

/// Add two signed 64-bit sizes, clamping at `i64::MAX` instead of wrapping
/// and at zero instead of going negative.
pub fn adds64(a: i64, b: i64) -> i64 {
    a.saturating_add(b).max(0)
}
