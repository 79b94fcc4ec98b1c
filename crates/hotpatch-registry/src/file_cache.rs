//! Per-pass memoization of file modification times
//!
//! A change scan stats the same headers over and over (every compiland in a
//! module shares most of its dependency list). The cache answers each path
//! once per pass; `invalidate` resets it between passes.

use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Default)]
pub struct FileAttributeCache {
    mtimes: DashMap<PathBuf, Option<SystemTime>>,
}

impl FileAttributeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last write time of `path`; `None` when the file is gone or
    /// unreadable. Memoized until the next `invalidate`.
    pub fn last_write(&self, path: &Path) -> Option<SystemTime> {
        if let Some(cached) = self.mtimes.get(path) {
            return *cached;
        }
        let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        self.mtimes.insert(path.to_path_buf(), mtime);
        mtime
    }

    /// True when `path` has been written after `baseline`.
    pub fn changed_since(&self, path: &Path, baseline: SystemTime) -> bool {
        match self.last_write(path) {
            Some(mtime) => mtime > baseline,
            // A vanished dependency counts as changed; the compiler will say
            // what is actually wrong.
            None => true,
        }
    }

    pub fn invalidate(&self) {
        self.mtimes.clear();
    }

    pub fn len(&self) -> usize {
        self.mtimes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mtimes.is_empty()
    }
}
