//! Command handlers
//!
//! One `Action` per command id, registered in `command_map()`. Module
//! enable/disable runs a sub-conversation on the same channel: the server
//! pushes GetModule, the client answers with GetModuleInfo and lazy-module
//! declarations, and ends with FinishedLazyLoadingModules. When imports are
//! requested, the server walks each new module's import list from its symbol
//! data and repeats the conversation for every dependency not seen yet. The
//! sub-conversation has its own command map; anything else arriving
//! mid-conversation is a desync.

use crate::server::{ConnCtx, Shared};
use async_trait::async_trait;
use hotpatch_channel::{
    recv_command, send_command_and_wait_for_ack, send_push, Action, CommandMap, DuplexChannel,
};
use hotpatch_core::*;
use hotpatch_registry::{CompilandRecord, LiveProcess, SymbolSession};
use hotpatch_registry::{ModuleId, Registries};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// The top-level map served to every connection.
pub fn command_map() -> CommandMap<ConnCtx> {
    CommandMap::new()
        .register(CommandId::RegisterProcess, RegisterProcessAction)
        .register(CommandId::EnableModuleBatchBegin, BatchBeginAction)
        .register(CommandId::EnableModuleBatchEnd, BatchEndAction)
        .register(CommandId::DisableModuleBatchBegin, BatchBeginAction)
        .register(CommandId::DisableModuleBatchEnd, BatchEndAction)
        .register(CommandId::EnableModule, EnableModuleAction)
        .register(CommandId::EnableAllModules, EnableAllModulesAction)
        .register(CommandId::DisableModule, DisableModuleAction)
        .register(CommandId::DisableAllModules, DisableAllModulesAction)
        .register(CommandId::TriggerRecompile, TriggerRecompileAction)
        .register(CommandId::BuildPatch, BuildPatchAction)
        .register(CommandId::SetBuildArguments, SetBuildArgumentsAction)
        .register(CommandId::ApplySettingBool, ApplySettingBoolAction)
        .register(CommandId::ApplySettingInt, ApplySettingIntAction)
        .register(CommandId::ApplySettingString, ApplySettingStringAction)
        .register(CommandId::ReadyForCompilation, ReadyForCompilationAction)
        .register(CommandId::DisconnectClient, DisconnectClientAction)
}

/// Replies accepted while a module conversation is open.
fn module_info_map() -> CommandMap<ConnCtx> {
    CommandMap::new()
        .register(CommandId::GetModuleInfo, GetModuleInfoAction)
        .register(CommandId::EnableLazyLoadedModule, EnableLazyLoadedModuleAction)
        .register(
            CommandId::FinishedLazyLoadingModules,
            FinishedLazyLoadingModulesAction,
        )
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

struct RegisterProcessAction;

#[async_trait]
impl Action<ConnCtx> for RegisterProcessAction {
    async fn run(
        &self,
        payload: serde_json::Value,
        ctx: &mut ConnCtx,
        chan: &dyn DuplexChannel,
    ) -> Result<bool> {
        let cmd: RegisterProcess = serde_json::from_value(payload)?;
        let shared = ctx.shared.clone();
        let allow = shared.settings().install_patches_multi_process;
        let process = LiveProcess::new(
            cmd.process_id,
            cmd.thread_id,
            ModulePath::normalize(&cmd.image_path),
        );
        let registered = {
            let mut reg = ctx.registries().await;
            reg.register_process(process, allow)
        };
        match registered {
            Ok(()) => {
                ctx.pid = Some(cmd.process_id);
                shared.set_connection_pid(ctx.conn_id, cmd.process_id);
                send_command_and_wait_for_ack(chan, &RegisterProcessFinished { success: true })
                    .await?;
                Ok(true)
            }
            Err(e) => {
                warn!(pid = %cmd.process_id, error = %e, "registration refused");
                send_command_and_wait_for_ack(chan, &RegisterProcessFinished { success: false })
                    .await?;
                // A refused client has nothing further to say.
                ctx.disconnecting = true;
                Ok(false)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Batches
// ---------------------------------------------------------------------------

struct BatchBeginAction;

#[async_trait]
impl Action<ConnCtx> for BatchBeginAction {
    async fn run(
        &self,
        _payload: serde_json::Value,
        ctx: &mut ConnCtx,
        _chan: &dyn DuplexChannel,
    ) -> Result<bool> {
        // The lazy-load proxy opens a batch inside a pass that already holds
        // the lock; only acquire when this context does not have one.
        if ctx.batch.is_none() {
            ctx.batch = Some(Arc::clone(&ctx.shared.registries).lock_owned().await);
            ctx.batch_owned = true;
            if let Err(e) = ctx.shared.map_virtual_drive() {
                warn!(error = %e, "virtual drive mapping failed");
            }
        }
        Ok(true)
    }
}

struct BatchEndAction;

#[async_trait]
impl Action<ConnCtx> for BatchEndAction {
    async fn run(
        &self,
        _payload: serde_json::Value,
        ctx: &mut ConnCtx,
        _chan: &dyn DuplexChannel,
    ) -> Result<bool> {
        if ctx.batch_owned {
            if let Some(guard) = ctx.batch.take() {
                guard.log_pool_stats();
            }
            ctx.batch_owned = false;
            if let Err(e) = ctx.shared.unmap_virtual_drive() {
                warn!(error = %e, "virtual drive unmapping failed");
            }
        }
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Module conversations
// ---------------------------------------------------------------------------

struct EnableModuleAction;

#[async_trait]
impl Action<ConnCtx> for EnableModuleAction {
    async fn run(
        &self,
        payload: serde_json::Value,
        ctx: &mut ConnCtx,
        chan: &dyn DuplexChannel,
    ) -> Result<bool> {
        let cmd: EnableModule = serde_json::from_value(payload)?;
        run_module_conversation(ctx, chan, cmd.path, true, false).await?;
        send_command_and_wait_for_ack(chan, &EnableModuleFinished {}).await?;
        Ok(true)
    }
}

struct EnableAllModulesAction;

#[async_trait]
impl Action<ConnCtx> for EnableAllModulesAction {
    async fn run(
        &self,
        payload: serde_json::Value,
        ctx: &mut ConnCtx,
        chan: &dyn DuplexChannel,
    ) -> Result<bool> {
        let cmd: EnableAllModules = serde_json::from_value(payload)?;
        run_module_conversation(ctx, chan, cmd.path, true, true).await?;
        send_command_and_wait_for_ack(chan, &EnableAllModulesFinished {}).await?;
        Ok(true)
    }
}

struct DisableModuleAction;

#[async_trait]
impl Action<ConnCtx> for DisableModuleAction {
    async fn run(
        &self,
        payload: serde_json::Value,
        ctx: &mut ConnCtx,
        chan: &dyn DuplexChannel,
    ) -> Result<bool> {
        let cmd: DisableModule = serde_json::from_value(payload)?;
        run_module_conversation(ctx, chan, cmd.path, false, false).await?;
        send_command_and_wait_for_ack(chan, &DisableModuleFinished {}).await?;
        Ok(true)
    }
}

struct DisableAllModulesAction;

#[async_trait]
impl Action<ConnCtx> for DisableAllModulesAction {
    async fn run(
        &self,
        payload: serde_json::Value,
        ctx: &mut ConnCtx,
        chan: &dyn DuplexChannel,
    ) -> Result<bool> {
        let cmd: DisableAllModules = serde_json::from_value(payload)?;
        run_module_conversation(ctx, chan, cmd.path, false, true).await?;
        send_command_and_wait_for_ack(chan, &DisableAllModulesFinished {}).await?;
        Ok(true)
    }
}

async fn run_module_conversation(
    ctx: &mut ConnCtx,
    chan: &dyn DuplexChannel,
    path: PathBuf,
    load: bool,
    load_imports: bool,
) -> Result<()> {
    let mut seen = HashSet::new();
    seen.insert(ModulePath::normalize(&path));
    let mut queue = vec![path];
    while let Some(next) = queue.pop() {
        send_push(
            chan,
            &GetModule {
                path: next,
                load_imports,
                load,
            },
        )
        .await?;
        ctx.pending_infos.clear();
        module_info_map().handle_commands(chan, ctx).await?;
        let infos = std::mem::take(&mut ctx.pending_infos);
        if !load {
            disable_modules(ctx, infos).await?;
            continue;
        }
        // Imports discovered in the symbol data get the same conversation,
        // until the dependency closure is exhausted.
        for import in enable_modules(ctx, infos).await? {
            if seen.insert(import.clone()) {
                queue.push(import.as_path().to_path_buf());
            }
        }
    }
    Ok(())
}

struct GetModuleInfoAction;

#[async_trait]
impl Action<ConnCtx> for GetModuleInfoAction {
    async fn run(
        &self,
        payload: serde_json::Value,
        ctx: &mut ConnCtx,
        _chan: &dyn DuplexChannel,
    ) -> Result<bool> {
        let info: GetModuleInfo = serde_json::from_value(payload)?;
        ctx.pending_infos.push(info);
        Ok(true)
    }
}

struct EnableLazyLoadedModuleAction;

#[async_trait]
impl Action<ConnCtx> for EnableLazyLoadedModuleAction {
    async fn run(
        &self,
        payload: serde_json::Value,
        ctx: &mut ConnCtx,
        _chan: &dyn DuplexChannel,
    ) -> Result<bool> {
        let cmd: EnableLazyLoadedModule = serde_json::from_value(payload)?;
        let path = ModulePath::normalize(&cmd.path);
        let mut reg = ctx.registries().await;
        if let Some(process) = reg.process_mut(cmd.process_id) {
            debug!(pid = %cmd.process_id, module = %path, "lazy module declared");
            process.add_lazy_module(path, cmd.module_base);
        }
        Ok(true)
    }
}

struct FinishedLazyLoadingModulesAction;

#[async_trait]
impl Action<ConnCtx> for FinishedLazyLoadingModulesAction {
    async fn run(
        &self,
        _payload: serde_json::Value,
        _ctx: &mut ConnCtx,
        _chan: &dyn DuplexChannel,
    ) -> Result<bool> {
        Ok(false)
    }
}

/// Symbol data pulled off the database on a worker, so the registry lock is
/// only held for the cheap insertion.
pub struct CachedSymbols {
    records: Vec<CompilandRecord>,
    linker: PathBuf,
    imports: Vec<PathBuf>,
}

impl CachedSymbols {
    pub fn gather(session: &dyn SymbolSession) -> Result<Self> {
        Ok(Self {
            records: session.gather_compilands()?,
            linker: session.linker_path()?,
            imports: session.import_modules()?,
        })
    }
}

impl SymbolSession for CachedSymbols {
    fn gather_compilands(&self) -> Result<Vec<CompilandRecord>> {
        Ok(self.records.clone())
    }

    fn linker_path(&self) -> Result<PathBuf> {
        Ok(self.linker.clone())
    }

    fn import_modules(&self) -> Result<Vec<PathBuf>> {
        Ok(self.imports.clone())
    }
}

struct ToLoad {
    path: ModulePath,
    fingerprint: ImageFingerprint,
    members: Vec<(ProcessId, ModuleBase)>,
    load_imports: bool,
}

/// Returns the import dependencies found in newly loaded modules' symbol
/// data, for the caller to enable next.
async fn enable_modules(ctx: &mut ConnCtx, infos: Vec<GetModuleInfo>) -> Result<Vec<ModulePath>> {
    let shared = ctx.shared.clone();
    let mut to_load: Vec<ToLoad> = Vec::new();

    {
        let mut reg = ctx.registries().await;
        for info in infos {
            let Some(base) = info.module_base else {
                debug!(path = %info.path.display(), "module not mapped in client, skipped");
                continue;
            };
            let path = ModulePath::normalize(&info.path);
            let fingerprint = shared.symbols.image_fingerprint(path.as_path());
            if !fingerprint.is_valid() {
                warn!(module = %path, "image unreadable, module not enabled");
                shared
                    .events
                    .status(&format!("cannot enable {}: image unreadable", path.file_name()));
                continue;
            }
            let Some(process) = reg.process_mut(info.process_id) else {
                warn!(pid = %info.process_id, "module info for unregistered process");
                continue;
            };
            if !process.tried_to_load_image(fingerprint) {
                debug!(module = %path, pid = %info.process_id, "already tried, skipped");
                continue;
            }
            if let Some(module_id) = reg.module_by_fingerprint(fingerprint) {
                // Another process already paid for the symbols.
                register_member(&mut reg, &shared, module_id, info.process_id, base);
                if let Some(process) = reg.process_mut(info.process_id) {
                    process.mark_lazy_loaded(&path);
                }
            } else if let Some(pending) =
                to_load.iter_mut().find(|t| t.fingerprint == fingerprint)
            {
                pending.members.push((info.process_id, base));
                pending.load_imports |= info.load_imports;
            } else {
                to_load.push(ToLoad {
                    path,
                    fingerprint,
                    members: vec![(info.process_id, base)],
                    load_imports: info.load_imports,
                });
            }
        }
    }

    if to_load.is_empty() {
        return Ok(Vec::new());
    }

    // One worker per new module; symbol gathering dominates enable time.
    let mut join = JoinSet::new();
    for pending in to_load {
        let symbols = Arc::clone(&shared.symbols);
        join.spawn_blocking(move || {
            let gathered = symbols
                .open(pending.path.as_path())
                .and_then(|session| CachedSymbols::gather(&*session));
            (pending, gathered)
        });
    }

    let mut gathered = Vec::new();
    while let Some(joined) = join.join_next().await {
        match joined {
            Ok((pending, Ok(symbols))) => gathered.push((pending, symbols)),
            Ok((pending, Err(e))) => {
                warn!(module = %pending.path, error = %e, "symbol load failed");
                shared.events.status(&format!(
                    "cannot enable {}: {}",
                    pending.path.file_name(),
                    e
                ));
            }
            Err(e) => warn!(error = %e, "symbol load task panicked"),
        }
    }

    let mut prewarm = Vec::new();
    let mut imports = Vec::new();
    {
        let mut reg = ctx.registries().await;
        for (pending, symbols) in gathered {
            if pending.load_imports {
                imports.extend(symbols.imports.iter().map(ModulePath::normalize));
            }
            let module_id = match reg.module_by_fingerprint(pending.fingerprint) {
                // A concurrent conversation on another connection won the
                // race; use its module.
                Some(existing) => existing,
                None => {
                    let id = reg.allocate_module_id();
                    let module = match hotpatch_registry::LiveModule::load(
                        id,
                        pending.path.clone(),
                        pending.fingerprint,
                        &symbols,
                        reg.pools(),
                        &shared.directories,
                        &shared.files,
                    ) {
                        Ok(module) => module,
                        Err(e) => {
                            warn!(module = %pending.path, error = %e, "module load failed");
                            continue;
                        }
                    };
                    prewarm.extend(module.compiler_paths(reg.pools()));
                    prewarm.push(module.linker_path().to_path_buf());
                    reg.insert_module(module);
                    id
                }
            };
            for (pid, base) in &pending.members {
                register_member(&mut reg, &shared, module_id, *pid, *base);
                if let Some(process) = reg.process_mut(*pid) {
                    process.mark_lazy_loaded(&pending.path);
                }
            }
        }
    }
    shared.prewarm_tools(prewarm);
    Ok(imports)
}

/// Add one process to a live module: membership, control-flow-guard opt-out,
/// and replay of any patches built before it joined. Replay is
/// all-or-nothing; on failure the process is backed out of the module and
/// everyone else is untouched.
fn register_member(
    reg: &mut Registries,
    shared: &Shared,
    module_id: ModuleId,
    pid: ProcessId,
    base: ModuleBase,
) {
    let Some(module) = reg.module_mut(module_id) else {
        return;
    };
    module.register_process(pid, base);
    let path = module.path().clone();
    let fingerprint = module.fingerprint();

    if let Err(e) = shared.control.disable_control_flow_guard(pid, base) {
        warn!(%pid, module = %path, error = %e, "control flow guard opt-out failed");
    }

    let replay = match reg.module(module_id) {
        Some(module) => module.install_compiled_patches(&*shared.control, pid),
        None => Ok(()),
    };
    match replay {
        Ok(()) => {
            if let Some(process) = reg.process_mut(pid) {
                process.add_loaded_image(fingerprint);
            }
            info!(%pid, module = %path, "module enabled");
        }
        Err(e) => {
            warn!(%pid, module = %path, error = %e, "patch replay failed, backing out");
            shared.events.status(&format!(
                "process {} could not load existing patches for {}",
                pid,
                path.file_name()
            ));
            if let Some(module) = reg.module_mut(module_id) {
                module.unregister_process(pid);
            }
            reg.remove_module_if_empty(module_id);
            if let Some(process) = reg.process_mut(pid) {
                process.remove_loaded_image(fingerprint);
            }
        }
    }
}

async fn disable_modules(ctx: &mut ConnCtx, infos: Vec<GetModuleInfo>) -> Result<()> {
    let mut reg = ctx.registries().await;
    for info in infos {
        let path = ModulePath::normalize(&info.path);
        let Some(module_id) = reg.modules().find(|m| m.path() == &path).map(|m| m.id()) else {
            debug!(module = %path, "disable for unknown module, skipped");
            continue;
        };
        let fingerprint = reg.module(module_id).map(|m| m.fingerprint());
        if let Some(module) = reg.module_mut(module_id) {
            module.unregister_process(info.process_id);
        }
        reg.remove_module_if_empty(module_id);
        if let (Some(process), Some(fingerprint)) =
            (reg.process_mut(info.process_id), fingerprint)
        {
            process.remove_loaded_image(fingerprint);
        }
        info!(pid = %info.process_id, module = %path, "module disabled");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Compile triggers
// ---------------------------------------------------------------------------

struct TriggerRecompileAction;

#[async_trait]
impl Action<ConnCtx> for TriggerRecompileAction {
    async fn run(
        &self,
        _payload: serde_json::Value,
        ctx: &mut ConnCtx,
        _chan: &dyn DuplexChannel,
    ) -> Result<bool> {
        ctx.shared.note_manual_trigger();
        ctx.shared.events.status("recompile requested");
        Ok(true)
    }
}

struct BuildPatchAction;

#[async_trait]
impl Action<ConnCtx> for BuildPatchAction {
    async fn run(
        &self,
        payload: serde_json::Value,
        ctx: &mut ConnCtx,
        chan: &dyn DuplexChannel,
    ) -> Result<bool> {
        let cmd: BuildPatch = serde_json::from_value(payload)?;
        // The announced packets follow back-to-back on this channel.
        for _ in 0..cmd.count {
            let packet: BuildPatchPacket = recv_command(chan).await?;
            ctx.shared
                .queue_patch_objects(packet.module.file_name(), vec![packet.object_path]);
        }
        ctx.shared.note_manual_trigger();
        ctx.shared
            .events
            .status(&format!("external build queued {} objects", cmd.count));
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Housekeeping
// ---------------------------------------------------------------------------

struct SetBuildArgumentsAction;

#[async_trait]
impl Action<ConnCtx> for SetBuildArgumentsAction {
    async fn run(
        &self,
        payload: serde_json::Value,
        ctx: &mut ConnCtx,
        _chan: &dyn DuplexChannel,
    ) -> Result<bool> {
        let cmd: SetBuildArguments = serde_json::from_value(payload)?;
        let mut reg = ctx.registries().await;
        if let Some(process) = reg.process_mut(cmd.process_id) {
            process.set_build_arguments(cmd.arguments);
        }
        Ok(true)
    }
}

struct ApplySettingBoolAction;

#[async_trait]
impl Action<ConnCtx> for ApplySettingBoolAction {
    async fn run(
        &self,
        payload: serde_json::Value,
        ctx: &mut ConnCtx,
        _chan: &dyn DuplexChannel,
    ) -> Result<bool> {
        let cmd: ApplySettingBool = serde_json::from_value(payload)?;
        ctx.shared
            .with_settings_mut(|s| s.apply_bool(&cmd.name, cmd.value));
        Ok(true)
    }
}

struct ApplySettingIntAction;

#[async_trait]
impl Action<ConnCtx> for ApplySettingIntAction {
    async fn run(
        &self,
        payload: serde_json::Value,
        ctx: &mut ConnCtx,
        _chan: &dyn DuplexChannel,
    ) -> Result<bool> {
        let cmd: ApplySettingInt = serde_json::from_value(payload)?;
        ctx.shared
            .with_settings_mut(|s| s.apply_int(&cmd.name, cmd.value));
        Ok(true)
    }
}

struct ApplySettingStringAction;

#[async_trait]
impl Action<ConnCtx> for ApplySettingStringAction {
    async fn run(
        &self,
        payload: serde_json::Value,
        ctx: &mut ConnCtx,
        _chan: &dyn DuplexChannel,
    ) -> Result<bool> {
        let cmd: ApplySettingString = serde_json::from_value(payload)?;
        ctx.shared
            .with_settings_mut(|s| s.apply_string(&cmd.name, &cmd.value));
        Ok(true)
    }
}

struct ReadyForCompilationAction;

#[async_trait]
impl Action<ConnCtx> for ReadyForCompilationAction {
    async fn run(
        &self,
        _payload: serde_json::Value,
        _ctx: &mut ConnCtx,
        _chan: &dyn DuplexChannel,
    ) -> Result<bool> {
        // Ends dispatch; the connection task reports ready and parks until
        // the gate drops.
        Ok(false)
    }
}

struct DisconnectClientAction;

#[async_trait]
impl Action<ConnCtx> for DisconnectClientAction {
    async fn run(
        &self,
        _payload: serde_json::Value,
        ctx: &mut ConnCtx,
        _chan: &dyn DuplexChannel,
    ) -> Result<bool> {
        ctx.disconnecting = true;
        Ok(false)
    }
}
