//! Per-process live state

use crate::ports::ProcessControl;
use hotpatch_core::{ImageFingerprint, ModuleBase, ModulePath, ProcessId, Result};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// A lazily loaded module the client declared but has not mapped yet.
#[derive(Clone, Debug)]
struct LazyModule {
    base: ModuleBase,
    loaded: bool,
}

/// One attached client process.
pub struct LiveProcess {
    pid: ProcessId,
    main_thread_id: u32,
    image_path: ModulePath,
    build_arguments: String,
    /// Fingerprints of every image this process has enabled, including ones
    /// that failed to load (so a failing image is not retried every batch).
    tried_images: HashSet<ImageFingerprint>,
    loaded_images: HashSet<ImageFingerprint>,
    lazy_modules: HashMap<ModulePath, LazyModule>,
    last_heartbeat: u64,
    code_cave_installed: bool,
}

impl LiveProcess {
    pub fn new(pid: ProcessId, main_thread_id: u32, image_path: ModulePath) -> Self {
        Self {
            pid,
            main_thread_id,
            image_path,
            build_arguments: String::new(),
            tried_images: HashSet::new(),
            loaded_images: HashSet::new(),
            lazy_modules: HashMap::new(),
            last_heartbeat: 0,
            code_cave_installed: false,
        }
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn main_thread_id(&self) -> u32 {
        self.main_thread_id
    }

    pub fn image_path(&self) -> &ModulePath {
        &self.image_path
    }

    // ------------------------------------------------------------------
    // Image bookkeeping
    // ------------------------------------------------------------------

    /// Record an enable attempt. Returns false if this image was already
    /// tried by this process.
    pub fn tried_to_load_image(&mut self, fingerprint: ImageFingerprint) -> bool {
        self.tried_images.insert(fingerprint)
    }

    pub fn add_loaded_image(&mut self, fingerprint: ImageFingerprint) {
        self.loaded_images.insert(fingerprint);
    }

    pub fn remove_loaded_image(&mut self, fingerprint: ImageFingerprint) {
        self.loaded_images.remove(&fingerprint);
        self.tried_images.remove(&fingerprint);
    }

    pub fn has_loaded_image(&self, fingerprint: ImageFingerprint) -> bool {
        self.loaded_images.contains(&fingerprint)
    }

    pub fn loaded_images(&self) -> impl Iterator<Item = ImageFingerprint> + '_ {
        self.loaded_images.iter().copied()
    }

    // ------------------------------------------------------------------
    // Lazy modules
    // ------------------------------------------------------------------

    pub fn add_lazy_module(&mut self, path: ModulePath, base: ModuleBase) {
        self.lazy_modules
            .insert(path, LazyModule { base, loaded: false });
    }

    /// Declared but not yet loaded lazy modules.
    pub fn pending_lazy_modules(&self) -> Vec<ModulePath> {
        self.lazy_modules
            .iter()
            .filter(|(_, m)| !m.loaded)
            .map(|(path, _)| path.clone())
            .collect()
    }

    pub fn lazy_module_base(&self, path: &ModulePath) -> Option<ModuleBase> {
        self.lazy_modules.get(path).map(|m| m.base)
    }

    pub fn mark_lazy_loaded(&mut self, path: &ModulePath) {
        if let Some(m) = self.lazy_modules.get_mut(path) {
            m.loaded = true;
        }
    }

    // ------------------------------------------------------------------
    // Heartbeat and quiesce
    // ------------------------------------------------------------------

    /// Sample the heartbeat counter. Progress means the counter moved since
    /// the previous sample; a held process (debugger, breakpoint) shows no
    /// movement and cannot answer channel commands.
    pub fn made_progress(&mut self, control: &dyn ProcessControl) -> bool {
        let current = control.read_heartbeat(self.pid);
        let moved = current != self.last_heartbeat;
        self.last_heartbeat = current;
        moved
    }

    /// Idempotent: a cave is installed at most once per quiesce.
    pub fn install_code_cave(&mut self, control: &dyn ProcessControl) -> Result<()> {
        if self.code_cave_installed {
            return Ok(());
        }
        control.install_code_cave(self.pid)?;
        self.code_cave_installed = true;
        debug!(pid = %self.pid, "code cave installed");
        Ok(())
    }

    pub fn uninstall_code_cave(&mut self, control: &dyn ProcessControl) -> Result<()> {
        if !self.code_cave_installed {
            return Ok(());
        }
        control.uninstall_code_cave(self.pid)?;
        self.code_cave_installed = false;
        debug!(pid = %self.pid, "code cave removed");
        Ok(())
    }

    pub fn has_code_cave(&self) -> bool {
        self.code_cave_installed
    }

    // ------------------------------------------------------------------
    // Build arguments
    // ------------------------------------------------------------------

    pub fn set_build_arguments(&mut self, arguments: String) {
        self.build_arguments = arguments;
    }

    pub fn build_arguments(&self) -> &str {
        &self.build_arguments
    }
}
