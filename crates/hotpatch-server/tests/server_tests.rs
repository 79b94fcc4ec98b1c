//! End-to-end tests over in-memory channels: registration, module
//! enable/disable, compile passes, the lazy-load proxy

use hotpatch_channel::*;
use hotpatch_core::*;
use hotpatch_registry::*;
use hotpatch_server::*;
use hotpatch_watch::{DirectoryCache, FakeWatcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// ============================================================
// Fakes
// ============================================================

#[derive(Default)]
struct FakeSymbols {
    /// path -> (fingerprint, compiland records)
    images: Mutex<HashMap<PathBuf, (u64, Vec<CompilandRecord>)>>,
    imports: Mutex<HashMap<PathBuf, Vec<PathBuf>>>,
    opens: AtomicUsize,
}

impl FakeSymbols {
    fn add_image(&self, path: &str, fingerprint: u64, records: Vec<CompilandRecord>) {
        self.images
            .lock()
            .unwrap()
            .insert(PathBuf::from(path), (fingerprint, records));
    }

    fn add_import(&self, image: &str, import: &str) {
        self.imports
            .lock()
            .unwrap()
            .entry(PathBuf::from(image))
            .or_default()
            .push(PathBuf::from(import));
    }

    fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

struct FakeSession {
    records: Vec<CompilandRecord>,
    imports: Vec<PathBuf>,
}

impl SymbolSession for FakeSession {
    fn gather_compilands(&self) -> Result<Vec<CompilandRecord>> {
        Ok(self.records.clone())
    }
    fn linker_path(&self) -> Result<PathBuf> {
        Ok(PathBuf::from("/toolchain/ld"))
    }
    fn import_modules(&self) -> Result<Vec<PathBuf>> {
        Ok(self.imports.clone())
    }
}

impl SymbolProvider for FakeSymbols {
    fn image_fingerprint(&self, image: &Path) -> ImageFingerprint {
        self.images
            .lock()
            .unwrap()
            .get(image)
            .map(|(fp, _)| ImageFingerprint(*fp))
            .unwrap_or(ImageFingerprint::INVALID)
    }

    fn open(&self, image: &Path) -> Result<Box<dyn SymbolSession>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let records = self
            .images
            .lock()
            .unwrap()
            .get(image)
            .map(|(_, records)| records.clone())
            .ok_or_else(|| Error::internal("no symbols"))?;
        let imports = self
            .imports
            .lock()
            .unwrap()
            .get(image)
            .cloned()
            .unwrap_or_default();
        Ok(Box::new(FakeSession { records, imports }))
    }
}

#[derive(Default)]
struct FakeControl {
    installed: Mutex<Vec<(ProcessId, u32)>>,
    caves: Mutex<Vec<(ProcessId, bool)>>,
    /// While set, heartbeats stop moving and every process reads as held.
    stalled: std::sync::atomic::AtomicBool,
    beats: Mutex<HashMap<ProcessId, u64>>,
}

impl ProcessControl for FakeControl {
    fn is_active(&self, _pid: ProcessId) -> bool {
        true
    }
    fn read_heartbeat(&self, pid: ProcessId) -> u64 {
        let mut beats = self.beats.lock().unwrap();
        let counter = beats.entry(pid).or_insert(0);
        if !self.stalled.load(Ordering::SeqCst) {
            *counter += 1;
        }
        *counter
    }
    fn install_code_cave(&self, pid: ProcessId) -> Result<()> {
        self.caves.lock().unwrap().push((pid, true));
        Ok(())
    }
    fn uninstall_code_cave(&self, pid: ProcessId) -> Result<()> {
        self.caves.lock().unwrap().push((pid, false));
        Ok(())
    }
    fn disable_control_flow_guard(&self, _pid: ProcessId, _base: ModuleBase) -> Result<()> {
        Ok(())
    }
    fn install_patch(&self, pid: ProcessId, patch: &PatchImage) -> Result<()> {
        self.installed.lock().unwrap().push((pid, patch.patch_index));
        Ok(())
    }
}

#[derive(Default)]
struct FakeDelegate {
    compiles: AtomicUsize,
    links: AtomicUsize,
    compile_args: Mutex<Vec<Vec<String>>>,
    fail_compile: std::sync::atomic::AtomicBool,
}

#[async_trait::async_trait]
impl CompileDelegate for FakeDelegate {
    async fn compile(
        &self,
        units: &[CompileUnit],
        arguments: &[String],
    ) -> std::result::Result<(), String> {
        self.compiles.fetch_add(units.len(), Ordering::SeqCst);
        self.compile_args.lock().unwrap().push(arguments.to_vec());
        if self.fail_compile.load(Ordering::SeqCst) {
            return Err("synthetic compile failure".to_string());
        }
        Ok(())
    }

    async fn link_patch(
        &self,
        request: &LinkRequest,
        _arguments: &[String],
    ) -> std::result::Result<PatchImage, String> {
        self.links.fetch_add(1, Ordering::SeqCst);
        Ok(PatchImage {
            path: PathBuf::from(format!("/out/patch{}.so", request.patch_index)),
            patch_index: request.patch_index,
        })
    }
}

#[derive(Default)]
struct FakeEvents {
    clears: AtomicUsize,
}

impl ServerEvents for FakeEvents {
    fn clear_log(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
    }
}

struct Fixture {
    server: Server,
    symbols: Arc<FakeSymbols>,
    control: Arc<FakeControl>,
    delegate: Arc<FakeDelegate>,
    events: Arc<FakeEvents>,
    watch_tx: tokio::sync::mpsc::UnboundedSender<PathBuf>,
}

fn fixture() -> Fixture {
    let symbols = Arc::new(FakeSymbols::default());
    let control = Arc::new(FakeControl::default());
    let delegate = Arc::new(FakeDelegate::default());
    let events = Arc::new(FakeEvents::default());
    let (watch_tx, watch_rx) = tokio::sync::mpsc::unbounded_channel();
    let directories = DirectoryCache::new(Box::new(FakeWatcher::new()), watch_rx);
    let mut settings = Settings::default();
    // Bound every quiesce so a test bug cannot hang the suite.
    settings.quiesce_timeout_ms = Some(5_000);
    let server = Server::new(
        settings,
        directories,
        ServerPorts {
            symbols: symbols.clone(),
            control: control.clone(),
            delegate: delegate.clone(),
            drive: Arc::new(NoopDriveMapper),
            events: events.clone(),
        },
    );
    Fixture {
        server,
        symbols,
        control,
        delegate,
        events,
        watch_tx,
    }
}

fn record(source: &Path, object: &str) -> CompilandRecord {
    CompilandRecord {
        object_path: PathBuf::from(object),
        source_path: source.to_path_buf(),
        compiler_path: PathBuf::from("/toolchain/cc"),
        command_line: "-O0".to_string(),
        dependencies: Vec::new(),
        contributions: Vec::new(),
    }
}

// ============================================================
// Client scripting helpers
// ============================================================

async fn connect(server: &Server) -> MemoryChannel {
    let (client, server_end) = pair();
    server.attach(Arc::new(server_end));
    client
}

async fn register(client: &MemoryChannel, pid: u32) -> bool {
    send_command_and_wait_for_ack(
        client,
        &RegisterProcess {
            process_id: ProcessId(pid),
            thread_id: 1,
            image_path: PathBuf::from("/bin/game"),
        },
    )
    .await
    .unwrap();
    let finished: RegisterProcessFinished = recv_command(client).await.unwrap();
    finished.success
}

async fn enable_module(client: &MemoryChannel, pid: u32, image: &str, base: u64) {
    send_command_and_wait_for_ack(client, &EnableModuleBatchBegin {})
        .await
        .unwrap();
    send_command_and_wait_for_ack(
        client,
        &EnableModule {
            process_id: ProcessId(pid),
            path: PathBuf::from(image),
        },
    )
    .await
    .unwrap();
    let request = read_frame(client).await.unwrap();
    assert_eq!(request.id, CommandId::GetModule);
    send_command_and_wait_for_ack(
        client,
        &GetModuleInfo {
            process_id: ProcessId(pid),
            path: PathBuf::from(image),
            module_base: Some(ModuleBase(base)),
            load_imports: false,
            load: true,
        },
    )
    .await
    .unwrap();
    send_command_and_wait_for_ack(client, &FinishedLazyLoadingModules {})
        .await
        .unwrap();
    let _: EnableModuleFinished = recv_command(client).await.unwrap();
    send_command_and_wait_for_ack(client, &EnableModuleBatchEnd {})
        .await
        .unwrap();
}

async fn disable_module(client: &MemoryChannel, pid: u32, image: &str, base: u64) {
    send_command_and_wait_for_ack(client, &DisableModuleBatchBegin {})
        .await
        .unwrap();
    send_command_and_wait_for_ack(
        client,
        &DisableModule {
            process_id: ProcessId(pid),
            path: PathBuf::from(image),
        },
    )
    .await
    .unwrap();
    let request = read_frame(client).await.unwrap();
    assert_eq!(request.id, CommandId::GetModule);
    send_command_and_wait_for_ack(
        client,
        &GetModuleInfo {
            process_id: ProcessId(pid),
            path: PathBuf::from(image),
            module_base: Some(ModuleBase(base)),
            load_imports: false,
            load: false,
        },
    )
    .await
    .unwrap();
    send_command_and_wait_for_ack(client, &FinishedLazyLoadingModules {})
        .await
        .unwrap();
    let _: DisableModuleFinished = recv_command(client).await.unwrap();
    send_command_and_wait_for_ack(client, &DisableModuleBatchEnd {})
        .await
        .unwrap();
}

/// Module file names with their sorted member pids, sorted by name.
async fn final_state(fx: &Fixture) -> Vec<(String, Vec<u32>)> {
    let shared = fx.server.shared();
    let reg = shared.registries.lock().await;
    let mut state: Vec<(String, Vec<u32>)> = reg
        .modules()
        .map(|module| {
            let mut pids: Vec<u32> = module.members().iter().map(|(pid, _)| pid.0).collect();
            pids.sort_unstable();
            (module.path().file_name(), pids)
        })
        .collect();
    state.sort();
    state
}

/// Play the client's side of one quiesce: wait for the starting push,
/// report ready, wait for the finishing push.
async fn quiesce_cycle(client: &MemoryChannel) {
    loop {
        let frame = read_frame(client).await.unwrap();
        if frame.id == CommandId::CompilationStarting {
            break;
        }
    }
    send_command_and_wait_for_ack(client, &ReadyForCompilation {})
        .await
        .unwrap();
    loop {
        let frame = read_frame(client).await.unwrap();
        if frame.id == CommandId::CompilationFinished {
            break;
        }
    }
}

// ============================================================
// Registration
// ============================================================

#[tokio::test]
async fn register_and_disconnect() {
    let fx = fixture();
    let client = connect(&fx.server).await;
    assert!(register(&client, 100).await);

    let shared = fx.server.shared();
    assert_eq!(shared.connection_count(), 1);
    {
        let reg = shared.registries.lock().await;
        assert!(reg.process(ProcessId(100)).is_some());
    }

    send_command_and_wait_for_ack(&client, &DisconnectClient {})
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(shared.connection_count(), 0);
    // The process table entry survives until the next pass prunes it.
    let reg = shared.registries.lock().await;
    assert!(reg.process(ProcessId(100)).is_some());
}

#[tokio::test]
async fn joining_a_patched_group_gets_a_logical_rejection() {
    let fx = fixture();
    let shared = fx.server.shared();
    shared.with_settings_mut(|s| s.install_patches_multi_process = false);

    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("a.cpp");
    std::fs::write(&src, "int x;").unwrap();
    fx.symbols
        .add_image("/bin/engine.so", 0xfeed, vec![record(&src, "/out/a.o")]);

    let first = connect(&fx.server).await;
    assert!(register(&first, 1).await);
    enable_module(&first, 1, "/bin/engine.so", 0x1000).await;

    {
        let mut reg = shared.registries.lock().await;
        let id = reg.find_module_by_name("engine.so").unwrap();
        reg.module_mut(id).unwrap().record_patch(PatchImage {
            path: PathBuf::from("/out/patch0.so"),
            patch_index: 0,
        });
    }

    let second = connect(&fx.server).await;
    assert!(!register(&second, 2).await);
    let reg = shared.registries.lock().await;
    assert!(reg.process(ProcessId(2)).is_none());
}

#[tokio::test]
async fn a_desynced_connection_does_not_disturb_others() {
    let fx = fixture();
    let healthy = connect(&fx.server).await;
    assert!(register(&healthy, 1).await);

    let broken = connect(&fx.server).await;
    // A server-to-client command arriving at the server is a desync.
    send_command(&broken, &RegisterProcessFinished { success: true })
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let shared = fx.server.shared();
    assert_eq!(shared.connection_count(), 1);
    // The healthy connection still answers.
    send_command_and_wait_for_ack(&healthy, &TriggerRecompile {})
        .await
        .unwrap();
}

// ============================================================
// Module enable / dedup
// ============================================================

#[tokio::test]
async fn two_processes_enabling_the_same_image_share_one_module() {
    let fx = fixture();
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("a.cpp");
    std::fs::write(&src, "int x;").unwrap();
    fx.symbols
        .add_image("/bin/engine.so", 0xfeed, vec![record(&src, "/out/a.o")]);

    let first = connect(&fx.server).await;
    assert!(register(&first, 1).await);
    enable_module(&first, 1, "/bin/engine.so", 0x1000).await;

    let second = connect(&fx.server).await;
    assert!(register(&second, 2).await);
    enable_module(&second, 2, "/bin/engine.so", 0x2000).await;

    // One symbol load, one module, two memberships at different bases.
    assert_eq!(fx.symbols.open_count(), 1);
    let shared = fx.server.shared();
    let reg = shared.registries.lock().await;
    let id = reg.find_module_by_name("engine.so").unwrap();
    let module = reg.module(id).unwrap();
    assert_eq!(module.members().len(), 2);
    assert_eq!(module.base_in(ProcessId(1)), Some(ModuleBase(0x1000)));
    assert_eq!(module.base_in(ProcessId(2)), Some(ModuleBase(0x2000)));
}

#[tokio::test]
async fn disabling_the_last_member_destroys_the_module() {
    let fx = fixture();
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("a.cpp");
    std::fs::write(&src, "int x;").unwrap();
    fx.symbols
        .add_image("/bin/engine.so", 0xfeed, vec![record(&src, "/out/a.o")]);

    let client = connect(&fx.server).await;
    assert!(register(&client, 1).await);
    enable_module(&client, 1, "/bin/engine.so", 0x1000).await;
    disable_module(&client, 1, "/bin/engine.so", 0x1000).await;

    let shared = fx.server.shared();
    let reg = shared.registries.lock().await;
    assert!(reg.find_module_by_name("engine.so").is_none());
    assert_eq!(reg.pools().compilands.stats().live, 0);
}

#[tokio::test]
async fn interleaving_does_not_change_the_final_registry_state() {
    let mut states = Vec::new();
    for order in 0..2 {
        let fx = fixture();
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("a.cpp");
        std::fs::write(&src, "int x;").unwrap();
        fx.symbols
            .add_image("/bin/engine.so", 0xfeed, vec![record(&src, "/out/a.o")]);
        fx.symbols
            .add_image("/bin/util.so", 0xcafe, vec![record(&src, "/out/u.o")]);

        let first = connect(&fx.server).await;
        assert!(register(&first, 1).await);
        let second = connect(&fx.server).await;
        assert!(register(&second, 2).await);

        // Same calls, two interleavings.
        if order == 0 {
            enable_module(&first, 1, "/bin/engine.so", 0x1000).await;
            enable_module(&second, 2, "/bin/engine.so", 0x2000).await;
            enable_module(&first, 1, "/bin/util.so", 0x3000).await;
            disable_module(&second, 2, "/bin/engine.so", 0x2000).await;
        } else {
            enable_module(&second, 2, "/bin/engine.so", 0x2000).await;
            enable_module(&first, 1, "/bin/util.so", 0x3000).await;
            disable_module(&second, 2, "/bin/engine.so", 0x2000).await;
            enable_module(&first, 1, "/bin/engine.so", 0x1000).await;
        }
        states.push(final_state(&fx).await);
    }

    assert_eq!(states[0], states[1]);
    assert_eq!(
        states[0],
        vec![
            ("engine.so".to_string(), vec![1]),
            ("util.so".to_string(), vec![1]),
        ]
    );
}

#[tokio::test]
async fn enable_all_modules_pulls_in_import_dependencies() {
    let fx = fixture();
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("a.cpp");
    std::fs::write(&src, "int x;").unwrap();
    fx.symbols
        .add_image("/bin/game.so", 0xfeed, vec![record(&src, "/out/a.o")]);
    fx.symbols
        .add_image("/bin/plugin.so", 0xbead, vec![record(&src, "/out/p.o")]);
    fx.symbols.add_import("/bin/game.so", "/bin/plugin.so");

    let client = connect(&fx.server).await;
    assert!(register(&client, 1).await);

    send_command_and_wait_for_ack(&client, &EnableModuleBatchBegin {})
        .await
        .unwrap();
    send_command_and_wait_for_ack(
        &client,
        &EnableAllModules {
            process_id: ProcessId(1),
            path: PathBuf::from("/bin/game.so"),
        },
    )
    .await
    .unwrap();

    // One GetModule round per module in the dependency closure.
    for (image, base) in [("/bin/game.so", 0x1000), ("/bin/plugin.so", 0x2000)] {
        let request = read_frame(&client).await.unwrap();
        assert_eq!(request.id, CommandId::GetModule);
        let asked: GetModule = serde_json::from_value(request.payload).unwrap();
        assert_eq!(asked.path, PathBuf::from(image));
        assert!(asked.load_imports);
        send_command_and_wait_for_ack(
            &client,
            &GetModuleInfo {
                process_id: ProcessId(1),
                path: PathBuf::from(image),
                module_base: Some(ModuleBase(base)),
                load_imports: true,
                load: true,
            },
        )
        .await
        .unwrap();
        send_command_and_wait_for_ack(&client, &FinishedLazyLoadingModules {})
            .await
            .unwrap();
    }
    let _: EnableAllModulesFinished = recv_command(&client).await.unwrap();
    send_command_and_wait_for_ack(&client, &EnableModuleBatchEnd {})
        .await
        .unwrap();

    assert_eq!(fx.symbols.open_count(), 2);
    assert_eq!(
        final_state(&fx).await,
        vec![
            ("game.so".to_string(), vec![1]),
            ("plugin.so".to_string(), vec![1]),
        ]
    );
    let shared = fx.server.shared();
    let reg = shared.registries.lock().await;
    let id = reg.find_module_by_name("plugin.so").unwrap();
    assert_eq!(
        reg.module(id).unwrap().base_in(ProcessId(1)),
        Some(ModuleBase(0x2000))
    );
}

// ============================================================
// Batch atomicity
// ============================================================

#[tokio::test]
async fn a_batch_holds_the_orchestration_lock_until_batch_end() {
    let fx = fixture();
    let client = connect(&fx.server).await;
    assert!(register(&client, 1).await);
    let shared = fx.server.shared();

    send_command_and_wait_for_ack(&client, &EnableModuleBatchBegin {})
        .await
        .unwrap();
    // Fence: the ack of the next command proves the begin handler ran.
    send_command_and_wait_for_ack(&client, &TriggerRecompile {})
        .await
        .unwrap();
    assert!(shared.registries.try_lock().is_err());

    send_command_and_wait_for_ack(&client, &EnableModuleBatchEnd {})
        .await
        .unwrap();
    send_command_and_wait_for_ack(&client, &TriggerRecompile {})
        .await
        .unwrap();
    assert!(shared.registries.try_lock().is_ok());
}

// ============================================================
// Compile passes
// ============================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn changed_header_produces_one_patch_in_every_member() {
    let fx = fixture();
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("a.cpp");
    std::fs::write(&src, "int x;").unwrap();
    let header = tmp.path().join("a.h");
    let mut rec = record(&src, "/out/a.o");
    rec.dependencies.push(header.clone());
    fx.symbols.add_image("/bin/engine.so", 0xfeed, vec![rec]);

    let first = connect(&fx.server).await;
    assert!(register(&first, 1).await);
    enable_module(&first, 1, "/bin/engine.so", 0x1000).await;
    let second = connect(&fx.server).await;
    assert!(register(&second, 2).await);
    enable_module(&second, 2, "/bin/engine.so", 0x2000).await;

    // The change: a dependency that did not exist at load time appears.
    std::fs::write(&header, "#pragma once").unwrap();
    fx.watch_tx.send(header.clone()).unwrap();

    let clients = tokio::spawn(async move {
        tokio::join!(quiesce_cycle(&first), quiesce_cycle(&second));
        (first, second)
    });

    let (_trigger_tx, trigger_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut driver = CompileDriver::new(fx.server.shared(), Arc::new(NullTrigger), trigger_rx);
    let outcome = driver
        .compile_pass(PassReason::FileChange, HashMap::new())
        .await;
    clients.await.unwrap();

    assert_eq!(outcome, PatchOutcome::Success);
    assert_eq!(fx.delegate.compiles.load(Ordering::SeqCst), 1);
    assert_eq!(fx.delegate.links.load(Ordering::SeqCst), 1);
    let installs = fx.control.installed.lock().unwrap().clone();
    assert_eq!(installs.len(), 2);
    assert!(installs.contains(&(ProcessId(1), 0)));
    assert!(installs.contains(&(ProcessId(2), 0)));

    // Same edit, next pass: nothing to do.
    let shared = fx.server.shared();
    let reg = shared.registries.lock().await;
    let id = reg.find_module_by_name("engine.so").unwrap();
    assert!(reg.module(id).unwrap().has_installed_patches());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manifest_with_unknown_module_installs_nothing() {
    let fx = fixture();
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("a.cpp");
    std::fs::write(&src, "int x;").unwrap();
    fx.symbols
        .add_image("/bin/engine.so", 0xfeed, vec![record(&src, "/out/a.o")]);

    let client = connect(&fx.server).await;
    assert!(register(&client, 1).await);
    enable_module(&client, 1, "/bin/engine.so", 0x1000).await;

    let mut manifest = HashMap::new();
    manifest.insert("engine.so".to_string(), vec![PathBuf::from("/out/a.o")]);
    manifest.insert("ghost.so".to_string(), vec![PathBuf::from("/out/g.o")]);

    let clients = tokio::spawn(async move {
        quiesce_cycle(&client).await;
        client
    });
    let (_trigger_tx, trigger_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut driver = CompileDriver::new(fx.server.shared(), Arc::new(NullTrigger), trigger_rx);
    let outcome = driver.compile_pass(PassReason::Manual, manifest).await;
    clients.await.unwrap();

    // Fail-fast: the known module was not built either, and the offending
    // module is named.
    match outcome {
        PatchOutcome::CompileError(message) => assert!(message.contains("ghost.so")),
        other => panic!("expected a compile error, got {:?}", other),
    }
    assert_eq!(fx.delegate.compiles.load(Ordering::SeqCst), 0);
    assert!(fx.control.installed.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn a_stalled_heartbeat_caves_every_member_for_the_pass() {
    let fx = fixture();
    let first = connect(&fx.server).await;
    assert!(register(&first, 1).await);
    let second = connect(&fx.server).await;
    assert!(register(&second, 2).await);

    let (_trigger_tx, trigger_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut driver = CompileDriver::new(fx.server.shared(), Arc::new(NullTrigger), trigger_rx);

    // Heartbeats moving: the pass runs without touching any process.
    let clients = tokio::spawn(async move {
        tokio::join!(quiesce_cycle(&first), quiesce_cycle(&second));
        (first, second)
    });
    driver
        .compile_pass(PassReason::FileChange, HashMap::new())
        .await;
    let (first, second) = clients.await.unwrap();
    assert!(fx.control.caves.lock().unwrap().is_empty());

    // One held process: caves go into both before the build and come out
    // of both afterwards.
    fx.control.stalled.store(true, Ordering::SeqCst);
    let clients = tokio::spawn(async move {
        tokio::join!(quiesce_cycle(&first), quiesce_cycle(&second));
    });
    let outcome = driver
        .compile_pass(PassReason::FileChange, HashMap::new())
        .await;
    clients.await.unwrap();

    assert_eq!(outcome, PatchOutcome::NoChange);
    let caves = fx.control.caves.lock().unwrap().clone();
    assert_eq!(caves.len(), 4);
    let (installed, removed) = caves.split_at(2);
    assert!(installed.iter().all(|(_, on)| *on));
    assert!(removed.iter().all(|(_, on)| !*on));
    for half in [installed, removed] {
        let mut pids: Vec<u32> = half.iter().map(|(pid, _)| pid.0).collect();
        pids.sort_unstable();
        assert_eq!(pids, [1, 2]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_member_contributes_its_build_arguments() {
    let fx = fixture();
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("a.cpp");
    std::fs::write(&src, "int x;").unwrap();
    let header = tmp.path().join("a.h");
    let mut rec = record(&src, "/out/a.o");
    rec.dependencies.push(header.clone());
    fx.symbols.add_image("/bin/engine.so", 0xfeed, vec![rec]);

    let first = connect(&fx.server).await;
    assert!(register(&first, 1).await);
    enable_module(&first, 1, "/bin/engine.so", 0x1000).await;
    let second = connect(&fx.server).await;
    assert!(register(&second, 2).await);
    enable_module(&second, 2, "/bin/engine.so", 0x2000).await;

    send_command_and_wait_for_ack(
        &first,
        &SetBuildArguments {
            process_id: ProcessId(1),
            arguments: "-DFIRST".to_string(),
        },
    )
    .await
    .unwrap();
    send_command_and_wait_for_ack(
        &second,
        &SetBuildArguments {
            process_id: ProcessId(2),
            arguments: "-DSECOND".to_string(),
        },
    )
    .await
    .unwrap();

    std::fs::write(&header, "#pragma once").unwrap();
    fx.watch_tx.send(header.clone()).unwrap();

    let clients = tokio::spawn(async move {
        tokio::join!(quiesce_cycle(&first), quiesce_cycle(&second));
    });
    let (_trigger_tx, trigger_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut driver = CompileDriver::new(fx.server.shared(), Arc::new(NullTrigger), trigger_rx);
    let outcome = driver
        .compile_pass(PassReason::FileChange, HashMap::new())
        .await;
    clients.await.unwrap();

    assert_eq!(outcome, PatchOutcome::Success);
    let calls = fx.delegate.compile_args.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    let mut args = calls[0].clone();
    args.sort();
    assert_eq!(args, ["-DFIRST", "-DSECOND"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn a_file_change_pass_clears_the_log_when_configured() {
    let fx = fixture();
    let shared = fx.server.shared();
    shared.with_settings_mut(|s| s.clear_log_on_recompile = true);

    let (_trigger_tx, trigger_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut driver = CompileDriver::new(shared, Arc::new(NullTrigger), trigger_rx);
    let outcome = driver
        .compile_pass(PassReason::FileChange, HashMap::new())
        .await;

    assert_eq!(outcome, PatchOutcome::NoChange);
    assert_eq!(fx.events.clears.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn compile_failure_still_releases_the_quiesce() {
    let fx = fixture();
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("a.cpp");
    std::fs::write(&src, "int x;").unwrap();
    let header = tmp.path().join("a.h");
    let mut rec = record(&src, "/out/a.o");
    rec.dependencies.push(header.clone());
    fx.symbols.add_image("/bin/engine.so", 0xfeed, vec![rec]);
    fx.delegate.fail_compile.store(true, Ordering::SeqCst);

    let client = connect(&fx.server).await;
    assert!(register(&client, 1).await);
    enable_module(&client, 1, "/bin/engine.so", 0x1000).await;

    std::fs::write(&header, "#pragma once").unwrap();
    fx.watch_tx.send(header.clone()).unwrap();

    let clients = tokio::spawn(async move {
        quiesce_cycle(&client).await;
        client
    });
    let (_trigger_tx, trigger_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut driver = CompileDriver::new(fx.server.shared(), Arc::new(NullTrigger), trigger_rx);
    let outcome = driver
        .compile_pass(PassReason::FileChange, HashMap::new())
        .await;
    let client = clients.await.unwrap();

    assert!(matches!(outcome, PatchOutcome::CompileError(_)));
    assert!(fx.control.installed.lock().unwrap().is_empty());
    // The gate dropped and the orchestration lock is free again.
    let shared = fx.server.shared();
    assert!(shared.registries.try_lock().is_ok());
    // The connection is dispatching again after the pass.
    send_command_and_wait_for_ack(&client, &TriggerRecompile {})
        .await
        .unwrap();
}

// ============================================================
// Lazy-load proxy
// ============================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manifest_naming_a_lazy_module_loads_it_through_the_proxy() {
    let fx = fixture();
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("plugin.cpp");
    std::fs::write(&src, "int x;").unwrap();
    fx.symbols
        .add_image("/bin/plugin.so", 0xbead, vec![record(&src, "/out/plugin.o")]);

    let shared = fx.server.shared();
    {
        let mut reg = shared.registries.lock().await;
        reg.register_process(
            LiveProcess::new(ProcessId(7), 1, ModulePath::normalize("/bin/game")),
            true,
        )
        .unwrap();
        reg.process_mut(ProcessId(7))
            .unwrap()
            .add_lazy_module(ModulePath::normalize("/bin/plugin.so"), ModuleBase(0x7000));
    }

    let mut manifest = HashMap::new();
    manifest.insert(
        "plugin.so".to_string(),
        vec![PathBuf::from("/out/plugin.o")],
    );

    let (_trigger_tx, trigger_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut driver = CompileDriver::new(fx.server.shared(), Arc::new(NullTrigger), trigger_rx);
    let outcome = driver.compile_pass(PassReason::Manual, manifest).await;

    assert_eq!(outcome, PatchOutcome::Success);
    assert_eq!(fx.symbols.open_count(), 1);
    let reg = shared.registries.lock().await;
    let id = reg.find_module_by_name("plugin.so").unwrap();
    let module = reg.module(id).unwrap();
    assert_eq!(module.base_in(ProcessId(7)), Some(ModuleBase(0x7000)));
    assert!(module.has_installed_patches());
    // The lazy declaration is consumed.
    assert!(reg
        .process(ProcessId(7))
        .unwrap()
        .pending_lazy_modules()
        .is_empty());
}
