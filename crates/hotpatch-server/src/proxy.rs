//! Lazy-load client proxy
//!
//! Modules a client declared lazily have no symbol data until an external
//! build names them. Rather than a second enable pathway, the server
//! impersonates the client over an in-memory channel pair and drives the
//! ordinary enable conversation against its own command map, answering each
//! GetModule with the base address the client recorded at declaration time.
//! The pass already holds the orchestration lock, so the proxied context is
//! handed the live guard instead of taking the lock again.

use crate::handlers;
use crate::server::{ConnCtx, Shared};
use hotpatch_channel::{pair, read_frame, recv_command, send_command_and_wait_for_ack, MemoryChannel};
use hotpatch_core::{
    CommandId, DisconnectClient, EnableModule, EnableModuleBatchBegin, EnableModuleBatchEnd,
    EnableModuleFinished, Error, FinishedLazyLoadingModules, GetModuleInfo, ModuleBase,
    ModulePath, ProcessId, Result,
};
use hotpatch_registry::Registries;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

/// Load the given lazy modules through the eager enable pathway. The guard
/// is returned in every case; the `Result` reports the conversation itself.
pub async fn lazy_load_modules(
    shared: &Arc<Shared>,
    guard: OwnedMutexGuard<Registries>,
    targets: Vec<(ProcessId, ModulePath)>,
) -> (OwnedMutexGuard<Registries>, Result<()>) {
    let mut script = Vec::new();
    for (pid, path) in targets {
        match guard.process(pid).and_then(|p| p.lazy_module_base(&path)) {
            Some(base) => script.push((pid, path, base)),
            None => debug!(%pid, module = %path, "no recorded base for lazy module"),
        }
    }
    if script.is_empty() {
        return (guard, Ok(()));
    }
    debug!(modules = script.len(), "lazy loading via client proxy");

    let (server_end, client_end) = pair();
    let client = tokio::spawn(run_proxy_client(client_end, script));

    let mut ctx = ConnCtx::new(Arc::clone(shared), u64::MAX);
    ctx.batch = Some(guard);
    ctx.batch_owned = false;
    let served = handlers::command_map()
        .handle_commands(&server_end, &mut ctx)
        .await;

    let client_result = match client.await {
        Ok(result) => result,
        Err(e) => {
            warn!(error = %e, "proxy client task failed");
            Err(Error::internal("proxy client task failed"))
        }
    };

    // BatchEnd leaves a non-owned guard in place; a missing guard would be a
    // handler bug, so fall back to retaking the lock rather than poisoning
    // the pass.
    let guard = match ctx.batch.take() {
        Some(guard) => guard,
        None => {
            debug_assert!(false, "proxy context lost the pass guard");
            Arc::clone(&shared.registries).lock_owned().await
        }
    };
    (guard, served.and(client_result))
}

/// The impersonated client half of the conversation.
async fn run_proxy_client(
    chan: MemoryChannel,
    script: Vec<(ProcessId, ModulePath, ModuleBase)>,
) -> Result<()> {
    send_command_and_wait_for_ack(&chan, &EnableModuleBatchBegin {}).await?;
    for (pid, path, base) in &script {
        send_command_and_wait_for_ack(
            &chan,
            &EnableModule {
                process_id: *pid,
                path: path.as_path().to_path_buf(),
            },
        )
        .await?;

        // The server pushes GetModule; answer with the recorded base.
        let request = read_frame(&chan).await?;
        if request.id != CommandId::GetModule {
            return Err(Error::ProtocolDesync(request.id));
        }
        send_command_and_wait_for_ack(
            &chan,
            &GetModuleInfo {
                process_id: *pid,
                path: path.as_path().to_path_buf(),
                module_base: Some(*base),
                load_imports: false,
                load: true,
            },
        )
        .await?;
        send_command_and_wait_for_ack(&chan, &FinishedLazyLoadingModules {}).await?;
        let _finished: EnableModuleFinished = recv_command(&chan).await?;
    }
    send_command_and_wait_for_ack(&chan, &EnableModuleBatchEnd {}).await?;
    send_command_and_wait_for_ack(&chan, &DisconnectClient {}).await?;
    Ok(())
}
