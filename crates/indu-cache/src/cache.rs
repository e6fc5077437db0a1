//! The incremental scan cache: an in-memory index of per-directory records
//! backed by a JSON file, plus the replay engine that re-emits a cached
//! subtree to an output sink instead of walking it again.
//!
//! Every directory is a standalone entry keyed by its absolute path and
//! holding only its immediate children; a child directory's own children
//! live in that child's entry. Validation is per directory against the
//! (mtime, dev, ino) triple captured when the directory was scanned, so one
//! changed directory invalidates exactly itself while the rest of the tree
//! keeps replaying from the cache.

use std::cell::Cell;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use indu_core::item::{adds64, DirSummary, ExtInfo, OutputSink, FF_CACHED, FF_DIR, FF_EXT};

use crate::json;
use crate::lock::{CacheLock, LockMode};

const LOAD_LOCK_TIMEOUT_SEC: i32 = 5;
const SAVE_LOCK_TIMEOUT_SEC: i32 = 10;

/// Shallow record of one filesystem entry as the child of a cached
/// directory. `children` is only populated while decoding documents that
/// carry the nested shape; entries in the index always hold it empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheChild {
    pub name: String,
    pub flags: u16,
    pub size: i64,
    pub asize: i64,
    pub ino: u64,
    pub dev: u64,
    pub mtime: u64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u16,
    pub nlink: u32,
    pub children: Vec<CacheChild>,
}

/// One cached directory. `used` marks entries touched by the current scan;
/// only those survive the next save.
#[derive(Debug)]
pub struct CacheEntry {
    pub path: String,
    pub mtime: u64,
    pub dev: u64,
    pub ino: u64,
    pub size: i64,
    pub asize: i64,
    pub items: u64,
    pub used: Cell<bool>,
    pub children: Vec<CacheChild>,
}

/// Map from absolute path to a slot in the entry arena. The arena keeps
/// every entry ever created, including ones displaced from the map by a
/// replacement, so `destroy` can drop them all in one place.
#[derive(Debug)]
pub struct CacheStore {
    file: PathBuf,
    index: HashMap<String, usize>,
    entries: Vec<CacheEntry>,
    lock: CacheLock,
}

impl CacheStore {
    pub fn new(cache_file: &Path) -> Self {
        let mut lock = CacheLock::new();
        lock.init(cache_file);
        CacheStore {
            file: cache_file.to_path_buf(),
            index: HashMap::new(),
            entries: Vec::new(),
            lock,
        }
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    // ========================================================================
    // Load
    // ========================================================================

    /// Read the cache file under a shared lock. Lock contention and a
    /// missing file both leave an empty index and are not errors; only a
    /// malformed document is.
    pub fn load(&mut self) -> Result<()> {
        if self
            .lock
            .acquire(LockMode::Shared, LOAD_LOCK_TIMEOUT_SEC)
            .is_err()
        {
            log::warn!(
                "could not lock cache file {}, continuing without cached results",
                self.file.display()
            );
            return Ok(());
        }

        let text = match fs::read_to_string(&self.file) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.lock.release();
                return Ok(());
            }
            Err(err) => {
                self.lock.release();
                return Err(err)
                    .with_context(|| format!("reading cache file {}", self.file.display()));
            }
        };
        let parsed = json::read_document(&text);
        self.lock.release();

        let (records, skipped) =
            parsed.with_context(|| format!("malformed cache file {}", self.file.display()))?;
        if skipped > 0 {
            log::debug!("dropped {} unusable cache records", skipped);
        }
        for record in records {
            self.insert_loaded(record);
        }
        Ok(())
    }

    /// Turn one decoded top-level record into an index entry. Only this
    /// directory gets an entry: its child directories have their own
    /// top-level records carrying the full children lists, so synthesizing
    /// entries from the shallow nested copies here would shadow those with
    /// childless impostors.
    fn insert_loaded(&mut self, mut record: CacheChild) {
        if record.flags & FF_DIR == 0 || record.name.is_empty() {
            return;
        }
        let path = std::mem::take(&mut record.name);
        if self.index.contains_key(&path) {
            // Corrupt input with duplicate records: the first one wins.
            return;
        }
        let children: Vec<CacheChild> = record
            .children
            .into_iter()
            .map(|mut child| {
                child.children = Vec::new();
                child
            })
            .collect();
        let entry = CacheEntry {
            path: path.clone(),
            mtime: record.mtime,
            dev: record.dev,
            ino: record.ino,
            size: record.size,
            asize: record.asize,
            items: children.len() as u64,
            used: Cell::new(false),
            children,
        };
        self.index.insert(path, self.entries.len());
        self.entries.push(entry);
    }

    // ========================================================================
    // Lookup and store
    // ========================================================================

    /// A hit requires all three validation fields to match; the directory
    /// inode's mtime is the only freshness signal. A hit marks the entry as
    /// used so it survives the next save.
    pub fn lookup(&self, path: &str, mtime: u64, dev: u64, ino: u64) -> Option<&CacheEntry> {
        let entry = &self.entries[*self.index.get(path)?];
        if entry.mtime != mtime || entry.dev != dev || entry.ino != ino {
            return None;
        }
        entry.used.set(true);
        Some(entry)
    }

    /// Record a freshly walked directory. The shallow children list is
    /// stored as given (nested grand-children stripped); aggregates are
    /// computed here, pulling each clean child directory's subtree totals
    /// from its own entry, which a post-order walk or a replayed hit has
    /// already put in place.
    pub fn store(
        &mut self,
        path: &str,
        dir: &DirSummary,
        ext: Option<&ExtInfo>,
        children: Vec<CacheChild>,
    ) {
        let children: Vec<CacheChild> = children
            .into_iter()
            .map(|mut child| {
                child.children = Vec::new();
                // Presence flags are derived again at replay time.
                child.flags &= !(FF_EXT | FF_CACHED);
                child
            })
            .collect();

        let mut size = 0i64;
        let mut asize = 0i64;
        let mut items = 0u64;
        for child in &children {
            match self.subtree_totals(path, child) {
                Some((sub_size, sub_asize, sub_items)) => {
                    size = adds64(size, sub_size);
                    asize = adds64(asize, sub_asize);
                    items += sub_items + 1;
                }
                None => {
                    size = adds64(size, child.size);
                    asize = adds64(asize, child.asize);
                    items += 1;
                }
            }
        }

        let entry = CacheEntry {
            path: path.to_string(),
            mtime: ext.and_then(|e| e.mtime).unwrap_or(0),
            dev: dir.dev,
            ino: dir.ino,
            size,
            asize,
            items,
            used: Cell::new(true),
            children,
        };

        if let Some(&old) = self.index.get(path) {
            // The displaced entry stays in the arena until destroy; marking
            // it unused keeps it out of the next save.
            self.entries[old].used.set(false);
        }
        self.index.insert(entry.path.clone(), self.entries.len());
        self.entries.push(entry);
    }

    fn subtree_totals(&self, parent: &str, child: &CacheChild) -> Option<(i64, i64, u64)> {
        if child.flags & FF_DIR == 0 {
            return None;
        }
        let path = join_path(parent, &child.name);
        let entry = &self.entries[*self.index.get(&path)?];
        Some((entry.size, entry.asize, entry.items))
    }

    // ========================================================================
    // Replay
    // ========================================================================

    /// Emit the cached subtree below `path` in the exact order a fresh walk
    /// would produce: one item event per child, recursing through each child
    /// directory's own entry, one close event per directory. Every entry the
    /// replay touches is marked used. A child directory without an entry of
    /// its own still yields its shallow item and an empty open/close pair.
    pub fn replay(&self, path: &str, sink: &mut dyn OutputSink) -> Result<()> {
        if let Some(&slot) = self.index.get(path) {
            for child in &self.entries[slot].children {
                self.replay_child(path, child, sink)?;
            }
        }
        Ok(())
    }

    fn replay_child(
        &self,
        parent: &str,
        child: &CacheChild,
        sink: &mut dyn OutputSink,
    ) -> Result<()> {
        let mut dir = DirSummary {
            flags: child.flags,
            size: child.size,
            asize: child.asize,
            ino: child.ino,
            dev: child.dev,
        };
        let ext = ExtInfo {
            mtime: (child.mtime != 0).then_some(child.mtime),
            uid: (child.uid != 0).then_some(child.uid),
            gid: (child.gid != 0).then_some(child.gid),
            mode: (child.mode != 0).then_some(child.mode),
        };
        // A zero field in the cache means unknown, so extended info is only
        // attached when at least one field carries a value.
        let ext = if ext.is_empty() {
            None
        } else {
            dir.flags |= FF_EXT;
            Some(ext)
        };

        sink.item(&dir, &child.name, ext.as_ref(), child.nlink)?;

        if child.flags & FF_DIR != 0 {
            let path = join_path(parent, &child.name);
            if let Some(&slot) = self.index.get(&path) {
                let entry = &self.entries[slot];
                entry.used.set(true);
                for nested in &entry.children {
                    self.replay_child(&path, nested, sink)?;
                }
            }
            sink.close_dir()?;
        }
        Ok(())
    }

    // ========================================================================
    // Save
    // ========================================================================

    /// Write every used entry under an exclusive lock. The document is
    /// streamed into a sibling temp file, fsynced, renamed over the target
    /// and made durable with a directory fsync; a failure anywhere before
    /// the rename leaves the previous cache file untouched.
    pub fn save(&mut self) -> Result<()> {
        self.lock
            .acquire(LockMode::Exclusive, SAVE_LOCK_TIMEOUT_SEC)
            .context("cache file is locked by another process")?;
        let result = self.save_locked();
        self.lock.release();
        result
    }

    fn save_locked(&self) -> Result<()> {
        let dir = match self.file.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("creating temporary file in {}", dir.display()))?;

        let mut writer = BufWriter::new(tmp);
        json::write_document(
            &mut writer,
            self.index
                .values()
                .map(|&slot| &self.entries[slot])
                .filter(|entry| entry.used.get()),
        )?;
        let tmp = writer.into_inner().map_err(|err| err.into_error())?;

        tmp.as_file().sync_all()?;
        tmp.persist(&self.file)
            .with_context(|| format!("replacing cache file {}", self.file.display()))?;

        // The rename itself already committed; a failed directory fsync only
        // weakens durability, so it is logged and swallowed.
        if let Err(err) = File::open(dir).and_then(|d| d.sync_all()) {
            log::warn!(
                "could not fsync {} after cache rename: {}",
                dir.display(),
                err
            );
        }
        Ok(())
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Drop every entry ever created and release the lock state.
    pub fn destroy(&mut self) {
        self.lock.cleanup();
        self.index.clear();
        self.entries.clear();
    }
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else if parent.ends_with('/') {
        format!("{}{}", parent, name)
    } else {
        format!("{}/{}", parent, name)
    }
}

#[cfg(test)]
impl CacheEntry {
    pub(crate) fn for_tests(
        path: &str,
        mtime: u64,
        dev: u64,
        ino: u64,
        children: Vec<CacheChild>,
    ) -> Self {
        CacheEntry {
            path: path.to_string(),
            mtime,
            dev,
            ino,
            size: children.iter().map(|c| c.size).sum(),
            asize: children.iter().map(|c| c.asize).sum(),
            items: children.len() as u64,
            used: Cell::new(true),
            children,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indu_core::item::{FF_FILE, FF_HLNKC};

    #[derive(Debug, PartialEq)]
    enum Event {
        Item {
            name: String,
            flags: u16,
            size: i64,
            asize: i64,
            ext: Option<ExtInfo>,
            nlink: u32,
        },
        Close,
    }

    #[derive(Default)]
    struct Recorder {
        events: Vec<Event>,
    }

    impl OutputSink for Recorder {
        fn item(
            &mut self,
            dir: &DirSummary,
            name: &str,
            ext: Option<&ExtInfo>,
            nlink: u32,
        ) -> Result<()> {
            self.events.push(Event::Item {
                name: name.to_string(),
                flags: dir.flags,
                size: dir.size,
                asize: dir.asize,
                ext: ext.copied(),
                nlink,
            });
            Ok(())
        }

        fn close_dir(&mut self) -> Result<()> {
            self.events.push(Event::Close);
            Ok(())
        }

        fn finish(&mut self, failed: bool) -> i32 {
            i32::from(failed)
        }
    }

    fn file_child(name: &str, size: i64, asize: i64, ino: u64) -> CacheChild {
        CacheChild {
            name: name.to_string(),
            flags: FF_FILE,
            size,
            asize,
            ino,
            dev: 7,
            mtime: 100,
            uid: 1000,
            gid: 1000,
            mode: 0o644,
            ..CacheChild::default()
        }
    }

    fn dir_child(name: &str, ino: u64) -> CacheChild {
        CacheChild {
            name: name.to_string(),
            flags: FF_DIR,
            size: 4096,
            asize: 4096,
            ino,
            dev: 7,
            mtime: 100,
            ..CacheChild::default()
        }
    }

    fn dir_summary(ino: u64) -> DirSummary {
        DirSummary {
            flags: FF_DIR | FF_EXT,
            size: 4096,
            asize: 4096,
            ino,
            dev: 7,
        }
    }

    fn ext_with_mtime(mtime: u64) -> ExtInfo {
        ExtInfo {
            mtime: Some(mtime),
            uid: Some(1000),
            gid: Some(1000),
            mode: Some(0o755),
        }
    }

    fn store_in(dir: &tempfile::TempDir) -> CacheStore {
        CacheStore::new(&dir.path().join("indu.cache"))
    }

    #[test]
    fn lookup_validates_the_full_triple() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store.store(
            "/t/a",
            &dir_summary(10),
            Some(&ext_with_mtime(100)),
            vec![file_child("f1", 4096, 1000, 11)],
        );

        assert!(store.lookup("/t/a", 100, 7, 10).is_some());
        assert!(store.lookup("/t/a", 101, 7, 10).is_none());
        assert!(store.lookup("/t/a", 100, 8, 10).is_none());
        assert!(store.lookup("/t/a", 100, 7, 11).is_none());
        assert!(store.lookup("/t/b", 100, 7, 10).is_none());
    }

    #[test]
    fn store_aggregates_children() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store.store(
            "/t/a",
            &dir_summary(10),
            Some(&ext_with_mtime(100)),
            vec![
                file_child("f1", 4096, 1000, 11),
                file_child("f2", 4096, 2000, 12),
            ],
        );

        let entry = store.lookup("/t/a", 100, 7, 10).unwrap();
        assert_eq!(entry.size, 8192);
        assert_eq!(entry.asize, 3000);
        assert_eq!(entry.items, 2);
        assert_eq!(entry.children.len(), 2);
    }

    #[test]
    fn store_pulls_subtree_totals_from_child_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        // Post-order: the child directory is stored before its parent.
        store.store(
            "/t/a/b",
            &dir_summary(20),
            Some(&ext_with_mtime(100)),
            vec![file_child("deep", 4096, 500, 21)],
        );
        store.store(
            "/t/a",
            &dir_summary(10),
            Some(&ext_with_mtime(100)),
            vec![file_child("f1", 4096, 1000, 11), dir_child("b", 20)],
        );

        let entry = store.lookup("/t/a", 100, 7, 10).unwrap();
        assert_eq!(entry.size, 4096 + 4096);
        assert_eq!(entry.asize, 1000 + 500);
        // f1, b itself and b's file.
        assert_eq!(entry.items, 3);
    }

    #[test]
    fn replacement_keeps_the_newest_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store.store(
            "/t/a",
            &dir_summary(10),
            Some(&ext_with_mtime(100)),
            vec![file_child("f1", 4096, 1000, 11)],
        );
        store.store(
            "/t/a",
            &dir_summary(10),
            Some(&ext_with_mtime(200)),
            vec![file_child("f1", 4096, 1500, 11)],
        );

        assert!(store.lookup("/t/a", 100, 7, 10).is_none());
        let entry = store.lookup("/t/a", 200, 7, 10).unwrap();
        assert_eq!(entry.asize, 1500);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn replay_emits_depth_first_with_close_events() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store.store(
            "/t/a/b",
            &dir_summary(20),
            Some(&ext_with_mtime(100)),
            vec![file_child("f2", 4096, 500, 21)],
        );
        store.store(
            "/t/a",
            &dir_summary(10),
            Some(&ext_with_mtime(100)),
            vec![file_child("f1", 4096, 1000, 11), dir_child("b", 20)],
        );

        let mut recorder = Recorder::default();
        store.replay("/t/a", &mut recorder).unwrap();

        let names: Vec<_> = recorder
            .events
            .iter()
            .map(|e| match e {
                Event::Item { name, .. } => name.as_str(),
                Event::Close => "<close>",
            })
            .collect();
        assert_eq!(names, vec!["f1", "b", "f2", "<close>"]);

        match &recorder.events[0] {
            Event::Item {
                flags,
                size,
                asize,
                ext,
                nlink,
                ..
            } => {
                assert_ne!(flags & FF_FILE, 0);
                assert_ne!(flags & FF_EXT, 0);
                assert_eq!((*size, *asize), (4096, 1000));
                assert_eq!(ext.unwrap().mtime, Some(100));
                assert_eq!(ext.unwrap().mode, Some(0o644));
                assert_eq!(*nlink, 0);
            }
            Event::Close => panic!("expected an item event"),
        }
    }

    #[test]
    fn replay_marks_nested_entries_used() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store.store(
            "/t/a/b",
            &dir_summary(20),
            Some(&ext_with_mtime(100)),
            vec![file_child("f2", 4096, 500, 21)],
        );
        store.store(
            "/t/a",
            &dir_summary(10),
            Some(&ext_with_mtime(100)),
            vec![dir_child("b", 20)],
        );
        // A reload drops the used marks, as at the start of a fresh scan.
        store.save().unwrap();
        let mut store = CacheStore::new(&dir.path().join("indu.cache"));
        store.load().unwrap();

        assert!(store.lookup("/t/a", 100, 7, 10).is_some());
        let mut recorder = Recorder::default();
        store.replay("/t/a", &mut recorder).unwrap();
        store.save().unwrap();

        let mut reloaded = CacheStore::new(&dir.path().join("indu.cache"));
        reloaded.load().unwrap();
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.lookup("/t/a/b", 100, 7, 20).is_some());
    }

    #[test]
    fn replay_of_child_without_entry_still_opens_and_closes() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        // No entry for /t/a/b: its subtree cannot be expanded.
        store.store(
            "/t/a",
            &dir_summary(10),
            Some(&ext_with_mtime(100)),
            vec![dir_child("b", 20)],
        );

        let mut recorder = Recorder::default();
        store.replay("/t/a", &mut recorder).unwrap();
        assert_eq!(recorder.events.len(), 2);
        assert!(matches!(recorder.events[1], Event::Close));
    }

    #[test]
    fn replay_preserves_hardlink_data() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        let mut linked = file_child("f1", 4096, 1000, 11);
        linked.flags |= FF_HLNKC;
        linked.nlink = 2;
        store.store("/t/a", &dir_summary(10), Some(&ext_with_mtime(100)), vec![linked]);

        let mut recorder = Recorder::default();
        store.replay("/t/a", &mut recorder).unwrap();
        match &recorder.events[0] {
            Event::Item { flags, nlink, .. } => {
                assert_ne!(flags & FF_HLNKC, 0);
                assert_eq!(*nlink, 2);
            }
            Event::Close => panic!("expected an item event"),
        }
    }

    #[test]
    fn save_load_roundtrip_keeps_used_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache_file = dir.path().join("indu.cache");
        let mut store = CacheStore::new(&cache_file);
        store.store(
            "/t/a",
            &dir_summary(10),
            Some(&ext_with_mtime(100)),
            vec![
                file_child("f1", 4096, 1000, 11),
                file_child("f2", 4096, 2000, 12),
            ],
        );
        store.store(
            "/t/b",
            &dir_summary(30),
            Some(&ext_with_mtime(150)),
            vec![dir_child("sub", 31)],
        );
        store.save().unwrap();

        let mut loaded = CacheStore::new(&cache_file);
        loaded.load().unwrap();
        assert_eq!(loaded.len(), 2);

        let a = loaded.lookup("/t/a", 100, 7, 10).unwrap();
        assert_eq!(a.size, 8192);
        assert_eq!(a.asize, 3000);
        assert_eq!(a.children.len(), 2);
        let f1 = a.children.iter().find(|c| c.name == "f1").unwrap();
        assert_eq!(f1.asize, 1000);
        assert_eq!(f1.mtime, 100);
        assert_eq!(f1.uid, 1000);
        assert_eq!(f1.mode, 0o644);

        let b = loaded.lookup("/t/b", 150, 7, 30).unwrap();
        assert_eq!(b.children[0].flags & FF_DIR, FF_DIR);
    }

    #[test]
    fn unused_entries_are_not_saved() {
        let dir = tempfile::tempdir().unwrap();
        let cache_file = dir.path().join("indu.cache");
        let mut store = CacheStore::new(&cache_file);
        store.store(
            "/t/a",
            &dir_summary(10),
            Some(&ext_with_mtime(100)),
            vec![file_child("f1", 4096, 1000, 11)],
        );
        store.save().unwrap();

        // A loaded entry starts out unused and disappears from the next save
        // unless the scan touches it.
        let mut store = CacheStore::new(&cache_file);
        store.load().unwrap();
        store.store(
            "/t/b",
            &dir_summary(30),
            Some(&ext_with_mtime(150)),
            vec![],
        );
        store.save().unwrap();

        let mut reloaded = CacheStore::new(&cache_file);
        reloaded.load().unwrap();
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.lookup("/t/b", 150, 7, 30).is_some());
    }

    #[test]
    fn load_of_missing_file_is_empty_success() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store.load().unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn load_of_garbage_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cache_file = dir.path().join("indu.cache");
        fs::write(&cache_file, "not json at all").unwrap();
        let mut store = CacheStore::new(&cache_file);
        assert!(store.load().is_err());
    }

    #[test]
    fn duplicate_records_keep_the_first() {
        let dir = tempfile::tempdir().unwrap();
        let cache_file = dir.path().join("indu.cache");
        fs::write(
            &cache_file,
            "[1,2,{\"progname\":\"indu\",\"progver\":\"0\",\"timestamp\":0}\
             ,[{\"name\":\"/t/a\",\"ino\":1,\"mtime\":5},{\"name\":\"first\"}]\
             ,[{\"name\":\"/t/a\",\"ino\":2,\"mtime\":9},{\"name\":\"second\"}]]",
        )
        .unwrap();
        let mut store = CacheStore::new(&cache_file);
        store.load().unwrap();
        assert_eq!(store.len(), 1);
        let entry = store.lookup("/t/a", 5, 0, 1).unwrap();
        assert_eq!(entry.children[0].name, "first");
    }

    #[test]
    fn loaded_nested_directories_stay_shallow() {
        let dir = tempfile::tempdir().unwrap();
        let cache_file = dir.path().join("indu.cache");
        // A record carrying the deeper nesting an older writer may produce.
        fs::write(
            &cache_file,
            "[1,2,{\"progname\":\"indu\",\"progver\":\"0\",\"timestamp\":0}\
             ,[{\"name\":\"/t/a\",\"ino\":1}\
             ,[{\"name\":\"b\",\"ino\":2},{\"name\":\"deep\"}]]]",
        )
        .unwrap();
        let mut store = CacheStore::new(&cache_file);
        store.load().unwrap();

        // The nested directory does not get a synthesized entry of its own.
        assert_eq!(store.len(), 1);
        assert!(store.lookup("/t/a/b", 0, 0, 2).is_none());
        let entry = store.lookup("/t/a", 0, 0, 1).unwrap();
        assert!(entry.children[0].children.is_empty());

        // Replaying therefore expands b as an empty directory.
        let mut recorder = Recorder::default();
        store.replay("/t/a", &mut recorder).unwrap();
        assert_eq!(recorder.events.len(), 2);
    }

    #[test]
    fn save_leaves_no_temp_files_behind() {
        let dir = tempfile::tempdir().unwrap();
        let cache_file = dir.path().join("indu.cache");
        let mut store = CacheStore::new(&cache_file);
        store.store("/t/a", &dir_summary(10), Some(&ext_with_mtime(100)), vec![]);
        store.save().unwrap();

        let mut names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec!["indu.cache".to_string(), "indu.cache.lock".to_string()]
        );
    }

    #[test]
    fn destroy_clears_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store.store("/t/a", &dir_summary(10), Some(&ext_with_mtime(100)), vec![]);
        store.destroy();
        assert!(store.is_empty());
        assert!(store.lookup("/t/a", 100, 7, 10).is_none());
    }
}
