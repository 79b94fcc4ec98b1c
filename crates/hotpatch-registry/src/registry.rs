//! The combined registry state behind the orchestration lock
//!
//! Everything that must stay consistent across a batch or a compile pass
//! lives here: the process table, the module table with its fingerprint
//! index, and the pools. The server wraps one `Registries` in the
//! orchestration mutex; nothing in this module locks.

use crate::module::{LiveModule, ModuleId};
use crate::pools::PoolSet;
use crate::ports::ProcessControl;
use crate::process::LiveProcess;
use hotpatch_core::{Error, ImageFingerprint, ProcessId, Result};
use std::collections::HashMap;
use tracing::{info, warn};

pub struct Registries {
    pools: PoolSet,
    processes: HashMap<ProcessId, LiveProcess>,
    modules: HashMap<ModuleId, LiveModule>,
    by_fingerprint: HashMap<ImageFingerprint, ModuleId>,
    next_module_id: u64,
}

impl Registries {
    pub fn new(pools: PoolSet) -> Self {
        Self {
            pools,
            processes: HashMap::new(),
            modules: HashMap::new(),
            by_fingerprint: HashMap::new(),
            next_module_id: 0,
        }
    }

    pub fn pools(&self) -> &PoolSet {
        &self.pools
    }

    // ------------------------------------------------------------------
    // Processes
    // ------------------------------------------------------------------

    /// Admit a process to the group. `allow_patched_group` comes from the
    /// `install_patches_multi_process` setting: when off, joining a group
    /// that already owns installed patches is refused, because the joiner
    /// would run stale code the rest of the group has already left behind.
    pub fn register_process(
        &mut self,
        process: LiveProcess,
        allow_patched_group: bool,
    ) -> Result<()> {
        let pid = process.pid();
        if self.processes.contains_key(&pid) {
            return Err(Error::DuplicateProcess(pid));
        }
        if !allow_patched_group && self.modules.values().any(LiveModule::has_installed_patches) {
            warn!(%pid, "rejected: group already has installed patches");
            return Err(Error::RejectedGroupConflict(pid));
        }
        info!(%pid, image = %process.image_path(), "process registered");
        self.processes.insert(pid, process);
        Ok(())
    }

    /// Remove a process and its module memberships. Modules left without
    /// members are destroyed and their records returned to the pools.
    pub fn remove_process(&mut self, pid: ProcessId) {
        if self.processes.remove(&pid).is_none() {
            return;
        }
        let mut emptied = Vec::new();
        for (id, module) in self.modules.iter_mut() {
            if module.unregister_process(pid) {
                emptied.push(*id);
            }
        }
        for id in emptied {
            if let Some(mut module) = self.modules.remove(&id) {
                self.by_fingerprint.remove(&module.fingerprint());
                module.unload(&self.pools);
            }
        }
        info!(%pid, "process removed");
    }

    pub fn process(&self, pid: ProcessId) -> Option<&LiveProcess> {
        self.processes.get(&pid)
    }

    pub fn process_mut(&mut self, pid: ProcessId) -> Option<&mut LiveProcess> {
        self.processes.get_mut(&pid)
    }

    pub fn processes(&self) -> impl Iterator<Item = &LiveProcess> {
        self.processes.values()
    }

    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    /// Drop processes whose OS process is gone. Returns the removed pids.
    pub fn prune_inactive(&mut self, control: &dyn ProcessControl) -> Vec<ProcessId> {
        let dead: Vec<ProcessId> = self
            .processes
            .keys()
            .copied()
            .filter(|pid| !control.is_active(*pid))
            .collect();
        for pid in &dead {
            self.remove_process(*pid);
        }
        dead
    }

    /// Sample every heartbeat; true when at least one process shows no
    /// movement since the previous sample.
    pub fn any_no_progress(&mut self, control: &dyn ProcessControl) -> bool {
        let mut stalled = false;
        for process in self.processes.values_mut() {
            if !process.made_progress(control) {
                stalled = true;
            }
        }
        stalled
    }

    /// A single held process forces caves everywhere: patch activation must
    /// not run concurrently with partially paused threads in any member.
    pub fn install_code_caves(&mut self, control: &dyn ProcessControl) -> Result<()> {
        for process in self.processes.values_mut() {
            process.install_code_cave(control)?;
        }
        Ok(())
    }

    pub fn uninstall_code_caves(&mut self, control: &dyn ProcessControl) -> Result<()> {
        for process in self.processes.values_mut() {
            process.uninstall_code_cave(control)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Modules
    // ------------------------------------------------------------------

    pub fn allocate_module_id(&mut self) -> ModuleId {
        let id = ModuleId(self.next_module_id);
        self.next_module_id += 1;
        id
    }

    pub fn module_by_fingerprint(&self, fingerprint: ImageFingerprint) -> Option<ModuleId> {
        self.by_fingerprint.get(&fingerprint).copied()
    }

    pub fn insert_module(&mut self, module: LiveModule) {
        self.by_fingerprint.insert(module.fingerprint(), module.id());
        self.modules.insert(module.id(), module);
    }

    pub fn module(&self, id: ModuleId) -> Option<&LiveModule> {
        self.modules.get(&id)
    }

    pub fn module_mut(&mut self, id: ModuleId) -> Option<&mut LiveModule> {
        self.modules.get_mut(&id)
    }

    pub fn modules(&self) -> impl Iterator<Item = &LiveModule> {
        self.modules.values()
    }

    pub fn module_ids(&self) -> Vec<ModuleId> {
        self.modules.keys().copied().collect()
    }

    /// Resolve an external manifest key (a module file name) to a live
    /// module. Matching is by file name, case-insensitively, the way build
    /// systems name modules.
    pub fn find_module_by_name(&self, name: &str) -> Option<ModuleId> {
        let wanted = name.to_ascii_lowercase();
        self.modules
            .values()
            .find(|m| m.path().file_name().to_ascii_lowercase() == wanted)
            .map(|m| m.id())
    }

    /// Remove a module if its last member left, returning its records to
    /// the pools.
    pub fn remove_module_if_empty(&mut self, id: ModuleId) {
        let empty = self
            .modules
            .get(&id)
            .map(|m| m.members().is_empty())
            .unwrap_or(false);
        if empty {
            if let Some(mut module) = self.modules.remove(&id) {
                self.by_fingerprint.remove(&module.fingerprint());
                module.unload(&self.pools);
            }
        }
    }

    pub fn log_pool_stats(&self) {
        self.pools.log_stats();
    }
}
