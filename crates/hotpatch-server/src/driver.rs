//! The compile driver
//!
//! One task owns the pass state machine: Idle until a trigger (shortcut,
//! debounced file change, or a manual request from a client), then quiesce
//! the clients, compile and link behind the orchestration lock, distribute
//! patches, and release everything in reverse order. Every pass ends with
//! exactly one terminal status, success or not.

use crate::proxy;
use crate::server::Shared;
use hotpatch_channel::send_push;
use hotpatch_core::{
    CompilationFinished, CompilationStarting, Error, FocusPolicy, ModulePath, PatchOutcome,
    ProcessId,
};
use hotpatch_registry::{LinkRequest, Registries};
use hotpatch_watch::Debouncer;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

/// Why a pass started. Shortcut wins over manual wins over file change when
/// several triggers collapse into one pass.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PassReason {
    Shortcut,
    Manual,
    FileChange,
}

/// External hotkey abstraction, polled once per driver tick.
pub trait TriggerSource: Send + Sync {
    fn shortcut_pressed(&self) -> bool;
}

pub struct NullTrigger;

impl TriggerSource for NullTrigger {
    fn shortcut_pressed(&self) -> bool {
        false
    }
}

pub struct CompileDriver {
    shared: Arc<Shared>,
    trigger: Arc<dyn TriggerSource>,
    change_events: tokio::sync::mpsc::UnboundedReceiver<PathBuf>,
    watching: bool,
    debouncer: Debouncer,
    poll_interval: Duration,
}

impl CompileDriver {
    pub fn new(
        shared: Arc<Shared>,
        trigger: Arc<dyn TriggerSource>,
        change_events: tokio::sync::mpsc::UnboundedReceiver<PathBuf>,
    ) -> Self {
        let debounce = shared.settings().continuous_compilation.debounce_ms;
        Self {
            shared,
            trigger,
            change_events,
            watching: true,
            debouncer: Debouncer::new(Duration::from_millis(debounce)),
            poll_interval: Duration::from_millis(100),
        }
    }

    pub async fn run(mut self) {
        info!("compile driver running");
        loop {
            tokio::select! {
                _ = self.shared.shutdown.cancelled() => return,
                changed = self.change_events.recv(), if self.watching => {
                    match changed {
                        Some(path) => {
                            if self.shared.settings().continuous_compilation.enabled {
                                debug!(path = %path.display(), "source change");
                                self.debouncer.bump();
                            }
                        }
                        None => self.watching = false,
                    }
                }
                _ = tokio::time::sleep(self.poll_interval) => {
                    self.tick().await;
                }
            }
        }
    }

    async fn tick(&mut self) {
        let shortcut = self.trigger.shortcut_pressed();
        let manual = self.shared.take_manual_trigger();
        let file_change = self.debouncer.fire();

        let reason = if shortcut {
            PassReason::Shortcut
        } else if manual.is_some() {
            PassReason::Manual
        } else if file_change {
            PassReason::FileChange
        } else {
            return;
        };
        self.compile_pass(reason, manual.unwrap_or_default()).await;
    }

    /// One full pass. The manifest is non-empty only for external builds
    /// (BuildPatch); the normal path scans every live module for changes.
    pub async fn compile_pass(
        &mut self,
        reason: PassReason,
        manifest: HashMap<String, Vec<PathBuf>>,
    ) -> PatchOutcome {
        let shared = Arc::clone(&self.shared);
        let settings = shared.settings();
        info!(?reason, "compile pass starting");
        shared.events.compile_started();
        if settings.clear_log_on_recompile {
            shared.events.clear_log();
        }

        // Quiesce: raise the gate, tell every client to wind down.
        let _ = shared.gate.send(true);
        for chan in shared.connection_channels() {
            let _ = send_push(&*chan, &CompilationStarting {}).await;
        }

        let caves_installed = {
            let mut reg = shared.registries.lock().await;
            let dead = reg.prune_inactive(&*shared.control);
            if !dead.is_empty() {
                info!(removed = dead.len(), "pruned dead processes");
            }
            let stalled = reg.any_no_progress(&*shared.control) && reg.process_count() > 0;
            if stalled {
                // One held process means none of them can be trusted to
                // answer; caves go in everywhere.
                if let Err(e) = reg.install_code_caves(&*shared.control) {
                    warn!(error = %e, "code cave installation failed");
                }
            }
            stalled
        };
        let exception_guard = if caves_installed {
            Some(shared.exception_lock.lock().await)
        } else {
            None
        };

        self.wait_all_ready(settings.quiesce_timeout_ms).await;

        // The pass owns the registries from here to the hand-back.
        let mut guard = Arc::clone(&shared.registries).lock_owned().await;
        if let Err(e) = shared.map_virtual_drive() {
            warn!(error = %e, "virtual drive mapping failed");
        }

        let outcome = if manifest.is_empty() {
            self.update_changed_modules(&mut guard).await
        } else {
            let (returned, outcome) = self.build_from_manifest(guard, manifest).await;
            guard = returned;
            outcome
        };

        if let Err(e) = shared.unmap_virtual_drive() {
            warn!(error = %e, "virtual drive unmapping failed");
        }

        // Terminal status, exactly once per pass.
        let message = outcome.message();
        shared.events.compile_finished(&outcome, &message);
        let focus = match settings.focus_on_recompile {
            FocusPolicy::Never => false,
            FocusPolicy::OnSuccess => outcome.is_success(),
            FocusPolicy::OnError => outcome.is_error(),
            FocusPolicy::OnShortcut => reason == PassReason::Shortcut,
        };
        if focus {
            shared.events.bring_to_front();
        }
        let sound = if outcome.is_error() {
            settings.play_sound_on_error.as_deref()
        } else if outcome.is_success() {
            settings.play_sound_on_success.as_deref()
        } else {
            None
        };
        if let Some(path) = sound {
            shared.events.play_sound(path);
        }

        // Release in reverse: caves out, locks down, gate open, clients told.
        if caves_installed {
            if let Err(e) = guard.uninstall_code_caves(&*shared.control) {
                warn!(error = %e, "code cave removal failed");
            }
        }
        drop(exception_guard);
        drop(guard);
        for chan in shared.connection_channels() {
            let _ = send_push(&*chan, &CompilationFinished {}).await;
        }
        let _ = shared.gate.send(false);
        info!(?reason, outcome = %message, "compile pass finished");
        outcome
    }

    /// Block until every connection reports ready, or the configured
    /// timeout elapses.
    async fn wait_all_ready(&self, timeout_ms: Option<u64>) {
        let receivers = self.shared.ready_receivers();
        let wait = async {
            for (conn_id, mut ready) in receivers {
                loop {
                    if *ready.borrow() {
                        break;
                    }
                    // A closed sender means the connection went away.
                    if ready.changed().await.is_err() {
                        break;
                    }
                }
                debug!(conn_id, "connection ready");
            }
        };
        match timeout_ms {
            None => wait.await,
            Some(ms) => {
                if tokio::time::timeout(Duration::from_millis(ms), wait)
                    .await
                    .is_err()
                {
                    warn!(timeout_ms = ms, "quiesce timed out, proceeding anyway");
                }
            }
        }
    }

    /// Normal path: scan every live module's compilands against the change
    /// flags and rebuild what moved.
    async fn update_changed_modules(&self, reg: &mut Registries) -> PatchOutcome {
        let shared = &self.shared;
        shared.files.invalidate();
        shared.directories.prime_notifications();

        let mut outcome = PatchOutcome::NoChange;
        for id in reg.module_ids() {
            let objects = match reg.module(id) {
                Some(module) => module.changed_objects(reg.pools(), &shared.files),
                None => continue,
            };
            if objects.is_empty() {
                continue;
            }
            let module_outcome = update_module(shared, reg, id, &objects).await;
            outcome = outcome.merge(module_outcome);
        }
        shared.directories.restart_notifications();
        outcome
    }

    /// External path: an explicit module→objects manifest. Lazy modules
    /// named by the manifest are loaded through the client proxy first;
    /// after that, a manifest key with no live module fails the whole pass
    /// before anything is installed anywhere.
    async fn build_from_manifest(
        &self,
        mut guard: OwnedMutexGuard<Registries>,
        manifest: HashMap<String, Vec<PathBuf>>,
    ) -> (OwnedMutexGuard<Registries>, PatchOutcome) {
        let shared = &self.shared;

        let mut lazy: Vec<(ProcessId, ModulePath)> = Vec::new();
        for name in manifest.keys() {
            if guard.find_module_by_name(name).is_some() {
                continue;
            }
            for process in guard.processes() {
                for path in process.pending_lazy_modules() {
                    if path.file_name().eq_ignore_ascii_case(name) {
                        lazy.push((process.pid(), path));
                    }
                }
            }
        }
        if !lazy.is_empty() {
            let (returned, result) = proxy::lazy_load_modules(shared, guard, lazy).await;
            guard = returned;
            if let Err(e) = result {
                warn!(error = %e, "lazy module load failed");
            }
        }

        for name in manifest.keys() {
            if guard.find_module_by_name(name).is_none() {
                let error = Error::UnknownModule(ModulePath::normalize(name));
                warn!(module = name, "build manifest names an unknown module, aborting pass");
                shared.events.status(&error.to_string());
                return (guard, PatchOutcome::CompileError(error.to_string()));
            }
        }

        shared.files.invalidate();
        let mut outcome = PatchOutcome::NoChange;
        for (name, objects) in &manifest {
            let Some(id) = guard.find_module_by_name(name) else {
                continue;
            };
            let module_outcome = update_module(shared, &mut guard, id, objects).await;
            outcome = outcome.merge(module_outcome);
        }
        (guard, outcome)
    }
}

/// Compile, link, and distribute one module's patch. Every registered
/// process gets the patch; the outcome reflects how that went.
async fn update_module(
    shared: &Arc<Shared>,
    reg: &mut Registries,
    id: hotpatch_registry::ModuleId,
    objects: &[PathBuf],
) -> PatchOutcome {
    let settings = shared.settings();

    let (units, request, members, known, name) = {
        let Some(module) = reg.module(id) else {
            return PatchOutcome::NoChange;
        };
        let known: Vec<PathBuf> = objects
            .iter()
            .filter(|object| {
                let hit = module.contains_object(object);
                if !hit {
                    warn!(module = %module.path(), object = %object.display(), "object not in module, skipped");
                }
                hit
            })
            .cloned()
            .collect();
        if known.is_empty() {
            return PatchOutcome::NoChange;
        }
        let units = module.compile_units(&known, reg.pools());
        let request = LinkRequest {
            module: module.path().clone(),
            linker_path: module.linker_path().to_path_buf(),
            objects: known.clone(),
            patch_index: module.next_patch_index(),
        };
        (
            units,
            request,
            module.members().to_vec(),
            known,
            module.path().file_name(),
        )
    };

    // Global arguments first, then one entry per distinct argument string a
    // member process registered.
    let mut arguments: Vec<String> = Vec::new();
    let global = settings.build_arguments.trim();
    if !global.is_empty() {
        arguments.push(global.to_string());
    }
    for (pid, _) in &members {
        let Some(args) = reg.process(*pid).map(|p| p.build_arguments().trim()) else {
            continue;
        };
        if !args.is_empty() && !arguments.iter().any(|a| a == args) {
            arguments.push(args.to_string());
        }
    }

    shared
        .events
        .status(&format!("compiling {} file(s) for {}", units.len(), name));
    if let Err(log) = shared.delegate.compile(&units, &arguments).await {
        return PatchOutcome::CompileError(log);
    }

    shared.events.status(&format!("linking patch for {}", name));
    let patch = match shared.delegate.link_patch(&request, &arguments).await {
        Ok(patch) => patch,
        Err(log) => return PatchOutcome::LinkError(log),
    };

    let mut failed = 0usize;
    for (pid, _) in &members {
        if let Err(e) = shared.control.install_patch(*pid, &patch) {
            warn!(%pid, module = %name, error = %e, "patch install failed");
            failed += 1;
        }
    }

    if !members.is_empty() && failed == members.len() {
        return PatchOutcome::LoadPatchError(format!("no process could load the patch for {}", name));
    }

    // The patch is live somewhere: record it and move the baselines so the
    // same edit does not retrigger next pass.
    if let Some(module) = reg.module_mut(id) {
        module.record_patch(patch);
    }
    if let Some(module) = reg.module(id) {
        module.refresh_baselines(&known, reg.pools(), &shared.files);
    }

    if failed > 0 {
        PatchOutcome::ActivatePatchError(format!(
            "{} of {} processes could not activate the patch for {}",
            failed,
            members.len(),
            name
        ))
    } else {
        PatchOutcome::Success
    }
}
