//! Filesystem watching behind a narrow trait
//!
//! The directory cache and compile driver only need "tell me when something
//! under this directory changes". `FsWatcher` backs that with the platform
//! notifier; `FakeWatcher` lets tests inject events by hand.

use hotpatch_core::{Error, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

pub trait PathWatcher: Send + Sync {
    fn watch(&self, dir: &Path) -> Result<()>;
}

/// Watches directories recursively and forwards every changed path into the
/// channel given at construction.
pub struct FsWatcher {
    inner: Mutex<RecommendedWatcher>,
}

impl FsWatcher {
    pub fn new(events: mpsc::UnboundedSender<PathBuf>) -> Result<Self> {
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    for path in event.paths {
                        // Receiver gone means the server is shutting down.
                        let _ = events.send(path);
                    }
                }
                Err(e) => debug!(error = %e, "watch event error"),
            }
        })
        .map_err(|e| Error::internal(format!("failed to create watcher: {}", e)))?;
        Ok(Self {
            inner: Mutex::new(watcher),
        })
    }
}

impl PathWatcher for FsWatcher {
    fn watch(&self, dir: &Path) -> Result<()> {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner
            .watch(dir, RecursiveMode::Recursive)
            .map_err(|e| Error::internal(format!("failed to watch {}: {}", dir.display(), e)))
    }
}

/// Records watch registrations; events are injected by sending into the
/// paired channel directly.
#[derive(Default)]
pub struct FakeWatcher {
    watched: Mutex<Vec<PathBuf>>,
}

impl FakeWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watched(&self) -> Vec<PathBuf> {
        match self.watched.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl PathWatcher for FakeWatcher {
    fn watch(&self, dir: &Path) -> Result<()> {
        match self.watched.lock() {
            Ok(mut guard) => guard.push(dir.to_path_buf()),
            Err(poisoned) => poisoned.into_inner().push(dir.to_path_buf()),
        }
        Ok(())
    }
}
