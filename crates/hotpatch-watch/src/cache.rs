//! Directory-change cache
//!
//! Compilands from many modules share source directories. Each distinct
//! directory is registered exactly once; repeated registration returns the
//! same shared entry, so a change flag flip is visible to every compiland
//! that points at the directory.
//!
//! Per compile pass: `prime_notifications` latches everything that changed
//! since the last pass, `had_change` is consumed while scanning compilands,
//! and `restart_notifications` re-arms for the next interval, discarding
//! changes the pass itself produced (compiler outputs land in watched trees
//! too).

use crate::watcher::PathWatcher;
use hotpatch_core::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::trace;

/// One watched directory with its latched change flag.
pub struct Directory {
    path: PathBuf,
    changed: AtomicBool,
}

impl Directory {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Has anything under this directory changed, as of the last prime?
    pub fn had_change(&self) -> bool {
        self.changed.load(Ordering::Acquire)
    }

    fn mark(&self) {
        self.changed.store(true, Ordering::Release);
    }

    fn clear(&self) {
        self.changed.store(false, Ordering::Release);
    }
}

pub struct DirectoryCache {
    watcher: Box<dyn PathWatcher>,
    events: Mutex<mpsc::UnboundedReceiver<PathBuf>>,
    dirs: Mutex<HashMap<PathBuf, Arc<Directory>>>,
}

impl DirectoryCache {
    /// `events` is the receiving end of the channel the watcher was built
    /// with.
    pub fn new(watcher: Box<dyn PathWatcher>, events: mpsc::UnboundedReceiver<PathBuf>) -> Self {
        Self {
            watcher,
            events: Mutex::new(events),
            dirs: Mutex::new(HashMap::new()),
        }
    }

    fn dirs(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Arc<Directory>>> {
        match self.dirs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn drain(&self, f: impl Fn(PathBuf)) {
        let mut events = match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while let Ok(path) = events.try_recv() {
            f(path);
        }
    }

    /// Register a directory, or return the entry it already has. Two
    /// compilands in the same directory share one `Arc<Directory>`.
    pub fn add_directory(&self, path: &Path) -> Result<Arc<Directory>> {
        let mut dirs = self.dirs();
        if let Some(existing) = dirs.get(path) {
            return Ok(Arc::clone(existing));
        }
        self.watcher.watch(path)?;
        let dir = Arc::new(Directory {
            path: path.to_path_buf(),
            changed: AtomicBool::new(false),
        });
        dirs.insert(path.to_path_buf(), Arc::clone(&dir));
        trace!(path = %path.display(), "watching directory");
        Ok(dir)
    }

    /// Latch accumulated change events into per-directory flags. Called once
    /// at the start of a pass's change scan.
    pub fn prime_notifications(&self) {
        self.drain(|changed| {
            let parent = changed.parent().unwrap_or(&changed).to_path_buf();
            for dir in self.dirs().values() {
                if parent.starts_with(&dir.path) {
                    dir.mark();
                }
            }
        });
    }

    /// Re-arm for the next interval: throw away events produced during the
    /// pass and clear every flag.
    pub fn restart_notifications(&self) {
        self.drain(|_| {});
        for dir in self.dirs().values() {
            dir.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.dirs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs().is_empty()
    }
}
