//! Server core: shared state, connection lifecycle, listeners
//!
//! One `Shared` instance ties everything together: the registries behind the
//! orchestration lock, the settings, the ports to the outside world, the
//! compilation gate, and the connection list. Each accepted connection gets
//! a command task; the exception endpoint gets its own task per connection.

use crate::events::ServerEvents;
use crate::handlers;
use hotpatch_channel::{recv_command, send_command_and_wait_for_ack, DuplexChannel, TcpChannel};
use hotpatch_core::{
    command_port, exception_port, HandleException, HandleExceptionFinished, ProcessId, Result,
    Settings,
};
use hotpatch_registry::{
    CompileDelegate, DriveMapper, PoolSet, ProcessControl, Registries, SymbolProvider,
};
use hotpatch_watch::DirectoryCache;
use std::collections::{HashMap, HashSet};
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Concrete implementations of the external-collaborator ports.
pub struct ServerPorts {
    pub symbols: Arc<dyn SymbolProvider>,
    pub control: Arc<dyn ProcessControl>,
    pub delegate: Arc<dyn CompileDelegate>,
    pub drive: Arc<dyn DriveMapper>,
    pub events: Arc<dyn ServerEvents>,
}

/// One registered connection, as seen by the compile driver.
pub struct ConnectionEntry {
    pub chan: Arc<dyn DuplexChannel>,
    pub ready: watch::Receiver<bool>,
    pub pid: Option<ProcessId>,
}

/// Pending manual compile request: the flag plus the external
/// module→object-files manifest accumulated by BuildPatch commands.
#[derive(Default)]
pub struct ManualTrigger {
    pub requested: bool,
    pub objects: HashMap<String, Vec<PathBuf>>,
}

pub struct Shared {
    pub registries: Arc<tokio::sync::Mutex<Registries>>,
    settings: std::sync::Mutex<Settings>,
    pub directories: Arc<DirectoryCache>,
    pub files: Arc<hotpatch_registry::FileAttributeCache>,
    pub symbols: Arc<dyn SymbolProvider>,
    pub control: Arc<dyn ProcessControl>,
    pub delegate: Arc<dyn CompileDelegate>,
    pub drive: Arc<dyn DriveMapper>,
    pub events: Arc<dyn ServerEvents>,
    /// True while a compile pass is in flight; command tasks park between
    /// their client's ReadyForCompilation and the gate dropping.
    pub gate: watch::Sender<bool>,
    connections: std::sync::Mutex<HashMap<u64, ConnectionEntry>>,
    next_conn_id: AtomicU64,
    manual: std::sync::Mutex<ManualTrigger>,
    /// Held for the whole pass when code caves are installed, so exception
    /// reports queue up instead of racing patch activation.
    pub exception_lock: tokio::sync::Mutex<()>,
    prewarmed: std::sync::Mutex<HashSet<PathBuf>>,
    pub shutdown: CancellationToken,
}

impl Shared {
    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    fn settings_guard(&self) -> std::sync::MutexGuard<'_, Settings> {
        match self.settings.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn settings(&self) -> Settings {
        self.settings_guard().clone()
    }

    pub fn with_settings_mut<R>(&self, f: impl FnOnce(&mut Settings) -> R) -> R {
        f(&mut self.settings_guard())
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    fn connections_guard(&self) -> std::sync::MutexGuard<'_, HashMap<u64, ConnectionEntry>> {
        match self.connections.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn connection_channels(&self) -> Vec<Arc<dyn DuplexChannel>> {
        self.connections_guard()
            .values()
            .map(|entry| Arc::clone(&entry.chan))
            .collect()
    }

    pub fn ready_receivers(&self) -> Vec<(u64, watch::Receiver<bool>)> {
        self.connections_guard()
            .iter()
            .map(|(id, entry)| (*id, entry.ready.clone()))
            .collect()
    }

    pub fn set_connection_pid(&self, conn_id: u64, pid: ProcessId) {
        if let Some(entry) = self.connections_guard().get_mut(&conn_id) {
            entry.pid = Some(pid);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections_guard().len()
    }

    fn remove_connection(&self, conn_id: u64) {
        self.connections_guard().remove(&conn_id);
    }

    // ------------------------------------------------------------------
    // Manual triggers
    // ------------------------------------------------------------------

    fn manual_guard(&self) -> std::sync::MutexGuard<'_, ManualTrigger> {
        match self.manual.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn note_manual_trigger(&self) {
        self.manual_guard().requested = true;
    }

    pub fn queue_patch_objects(&self, module: String, objects: Vec<PathBuf>) {
        let mut manual = self.manual_guard();
        manual.requested = true;
        manual.objects.entry(module).or_default().extend(objects);
    }

    /// Consume the pending manual request, if any. Anything queued after
    /// this call belongs to the next pass.
    pub fn take_manual_trigger(&self) -> Option<HashMap<String, Vec<PathBuf>>> {
        let mut manual = self.manual_guard();
        if !manual.requested {
            return None;
        }
        manual.requested = false;
        Some(std::mem::take(&mut manual.objects))
    }

    // ------------------------------------------------------------------
    // Virtual drive and tool prewarming
    // ------------------------------------------------------------------

    pub fn map_virtual_drive(&self) -> Result<()> {
        let settings = self.settings();
        if settings.virtual_drive.enabled {
            if let Some(target) = &settings.virtual_drive.path {
                self.drive.map(&settings.virtual_drive.letter, target)?;
            }
        }
        Ok(())
    }

    pub fn unmap_virtual_drive(&self) -> Result<()> {
        let settings = self.settings();
        if settings.virtual_drive.enabled && settings.virtual_drive.path.is_some() {
            self.drive.unmap(&settings.virtual_drive.letter)?;
        }
        Ok(())
    }

    /// Kick one prewarm task per tool path not seen before.
    pub fn prewarm_tools(self: &Arc<Self>, paths: Vec<PathBuf>) {
        let mut prewarmed = match self.prewarmed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for path in paths {
            if prewarmed.insert(path.clone()) {
                let delegate = Arc::clone(&self.delegate);
                tokio::spawn(async move {
                    debug!(tool = %path.display(), "prewarming toolchain");
                    delegate.prewarm(&path).await;
                });
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Per-connection context
// ---------------------------------------------------------------------------

/// Registry access that respects an open batch: inside a batch the held
/// guard is reused (taking the lock again would deadlock against ourselves),
/// outside one a fresh guard is taken.
pub enum Reg<'a> {
    Batch(&'a mut Registries),
    Fresh(OwnedMutexGuard<Registries>),
}

impl Deref for Reg<'_> {
    type Target = Registries;
    fn deref(&self) -> &Registries {
        match self {
            Reg::Batch(reg) => reg,
            Reg::Fresh(guard) => guard,
        }
    }
}

impl DerefMut for Reg<'_> {
    fn deref_mut(&mut self) -> &mut Registries {
        match self {
            Reg::Batch(reg) => reg,
            Reg::Fresh(guard) => guard,
        }
    }
}

/// State carried across commands of one connection.
pub struct ConnCtx {
    pub shared: Arc<Shared>,
    pub conn_id: u64,
    pub pid: Option<ProcessId>,
    /// Guard held between BatchBegin and BatchEnd; `batch_owned` records
    /// whether this context acquired it (the lazy-load proxy runs inside a
    /// pass that already holds the lock).
    pub batch: Option<OwnedMutexGuard<Registries>>,
    pub batch_owned: bool,
    pub disconnecting: bool,
    /// GetModuleInfo replies collected during a module enable/disable
    /// conversation.
    pub pending_infos: Vec<hotpatch_core::GetModuleInfo>,
}

impl ConnCtx {
    pub fn new(shared: Arc<Shared>, conn_id: u64) -> Self {
        Self {
            shared,
            conn_id,
            pid: None,
            batch: None,
            batch_owned: false,
            disconnecting: false,
            pending_infos: Vec::new(),
        }
    }

    pub async fn registries(&mut self) -> Reg<'_> {
        match self.batch {
            Some(ref mut guard) => Reg::Batch(&mut **guard),
            None => Reg::Fresh(Arc::clone(&self.shared.registries).lock_owned().await),
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub struct Server {
    shared: Arc<Shared>,
}

impl Server {
    pub fn new(settings: Settings, directories: DirectoryCache, ports: ServerPorts) -> Self {
        let shared = Arc::new(Shared {
            registries: Arc::new(tokio::sync::Mutex::new(Registries::new(PoolSet::new()))),
            settings: std::sync::Mutex::new(settings),
            directories: Arc::new(directories),
            files: Arc::new(hotpatch_registry::FileAttributeCache::new()),
            symbols: ports.symbols,
            control: ports.control,
            delegate: ports.delegate,
            drive: ports.drive,
            events: ports.events,
            gate: watch::channel(false).0,
            connections: std::sync::Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(0),
            manual: std::sync::Mutex::new(ManualTrigger::default()),
            exception_lock: tokio::sync::Mutex::new(()),
            prewarmed: std::sync::Mutex::new(HashSet::new()),
            shutdown: CancellationToken::new(),
        });
        Self { shared }
    }

    pub fn shared(&self) -> Arc<Shared> {
        Arc::clone(&self.shared)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }

    /// Accept loop on the group's command and exception endpoints.
    pub async fn serve(&self, group: &str) -> Result<()> {
        let command_addr = format!("127.0.0.1:{}", command_port(group));
        let exception_addr = format!("127.0.0.1:{}", exception_port(group));
        let command_listener = TcpListener::bind(&command_addr).await?;
        let exception_listener = TcpListener::bind(&exception_addr).await?;
        info!(group, command = %command_addr, exception = %exception_addr, "listening");

        loop {
            tokio::select! {
                _ = self.shared.shutdown.cancelled() => return Ok(()),
                accepted = command_listener.accept() => {
                    let (stream, peer) = accepted?;
                    debug!(%peer, "command connection");
                    self.attach(Arc::new(TcpChannel::new(stream)));
                }
                accepted = exception_listener.accept() => {
                    let (stream, peer) = accepted?;
                    debug!(%peer, "exception connection");
                    self.attach_exception(Arc::new(TcpChannel::new(stream)));
                }
            }
        }
    }

    /// Register a command channel and start serving it. Tests attach
    /// in-memory channels here directly.
    pub fn attach(&self, chan: Arc<dyn DuplexChannel>) -> u64 {
        let conn_id = self.shared.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (ready_tx, ready_rx) = watch::channel(false);
        self.shared.connections_guard().insert(
            conn_id,
            ConnectionEntry {
                chan: Arc::clone(&chan),
                ready: ready_rx,
                pid: None,
            },
        );
        let shared = Arc::clone(&self.shared);
        tokio::spawn(run_connection(shared, chan, conn_id, ready_tx));
        conn_id
    }

    pub fn attach_exception(&self, chan: Arc<dyn DuplexChannel>) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(run_exception(shared, chan));
    }
}

/// Drive one connection: dispatch commands until the client disconnects,
/// parking through the ready/gate handshake whenever a pass quiesces.
async fn run_connection(
    shared: Arc<Shared>,
    chan: Arc<dyn DuplexChannel>,
    conn_id: u64,
    ready_tx: watch::Sender<bool>,
) {
    let map = handlers::command_map();
    let mut ctx = ConnCtx::new(Arc::clone(&shared), conn_id);
    loop {
        match map.handle_commands(&*chan, &mut ctx).await {
            Err(e) if e.is_fatal_for_connection() => {
                // Local to this connection; the process table is cleaned up
                // by the next pass's prune.
                debug!(conn_id, error = %e, "connection ended");
                break;
            }
            Err(e) => {
                // A logical failure inside a handler; the channel itself is
                // still usable.
                warn!(conn_id, error = %e, "command failed");
            }
            Ok(()) if ctx.disconnecting => {
                debug!(conn_id, "client disconnected");
                break;
            }
            Ok(()) => {
                // ReadyForCompilation: report ready, park until the gate
                // drops, then resume dispatching.
                let _ = ready_tx.send(true);
                let mut gate = shared.gate.subscribe();
                while *gate.borrow() {
                    if gate.changed().await.is_err() {
                        break;
                    }
                }
                let _ = ready_tx.send(false);
            }
        }
    }
    shared.remove_connection(conn_id);
}

/// Serve one exception channel: reports are serialized behind the exception
/// lock, which the compile driver holds while code caves are active.
async fn run_exception(shared: Arc<Shared>, chan: Arc<dyn DuplexChannel>) {
    loop {
        let report = match recv_command::<HandleException>(&*chan).await {
            Ok(report) => report,
            Err(_) => return,
        };
        let _guard = shared.exception_lock.lock().await;
        warn!(
            pid = %report.process_id,
            thread = report.thread_id,
            "client exception: {}",
            report.description
        );
        shared.events.status(&format!(
            "exception in process {}: {}",
            report.process_id, report.description
        ));
        // The server observes and logs; handling stays with the client.
        if send_command_and_wait_for_ack(&*chan, &HandleExceptionFinished { handled: false })
            .await
            .is_err()
        {
            return;
        }
    }
}
