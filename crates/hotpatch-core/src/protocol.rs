//! Wire protocol between the server and attached client processes
//!
//! Every message is a frame: a 32-bit command id plus a JSON payload for that
//! id. Every command is answered by exactly one Ack frame before the next
//! command is read from the channel. The Ack is a transport-level "received"
//! signal; logical success travels in the `*Finished` payloads.
//!
//! Server -> Client pushes (`CompilationStarting`, `CompilationFinished`) are
//! the only frames a client does not ack: they can arrive while the client's
//! own command is in flight.

use crate::types::{ModuleBase, ModulePath, ProcessId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Command identifiers. The wire representation is the raw u32.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
#[repr(u32)]
pub enum CommandId {
    Ack = 1,

    RegisterProcess = 10,
    RegisterProcessFinished = 11,

    EnableModuleBatchBegin = 20,
    EnableModuleBatchEnd = 21,
    DisableModuleBatchBegin = 22,
    DisableModuleBatchEnd = 23,
    EnableModule = 24,
    EnableModuleFinished = 25,
    EnableAllModules = 26,
    EnableAllModulesFinished = 27,
    DisableModule = 28,
    DisableModuleFinished = 29,
    DisableAllModules = 30,
    DisableAllModulesFinished = 31,

    GetModule = 40,
    GetModuleInfo = 41,
    EnableLazyLoadedModule = 42,
    FinishedLazyLoadingModules = 43,

    TriggerRecompile = 50,
    BuildPatch = 51,
    BuildPatchPacket = 52,
    ReadyForCompilation = 53,
    CompilationStarting = 54,
    CompilationFinished = 55,

    SetBuildArguments = 60,
    DisconnectClient = 61,
    ApplySettingBool = 62,
    ApplySettingInt = 63,
    ApplySettingString = 64,

    HandleException = 70,
    HandleExceptionFinished = 71,
}

impl From<CommandId> for u32 {
    fn from(id: CommandId) -> u32 {
        id as u32
    }
}

impl TryFrom<u32> for CommandId {
    type Error = String;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        use CommandId::*;
        let id = match raw {
            1 => Ack,
            10 => RegisterProcess,
            11 => RegisterProcessFinished,
            20 => EnableModuleBatchBegin,
            21 => EnableModuleBatchEnd,
            22 => DisableModuleBatchBegin,
            23 => DisableModuleBatchEnd,
            24 => EnableModule,
            25 => EnableModuleFinished,
            26 => EnableAllModules,
            27 => EnableAllModulesFinished,
            28 => DisableModule,
            29 => DisableModuleFinished,
            30 => DisableAllModules,
            31 => DisableAllModulesFinished,
            40 => GetModule,
            41 => GetModuleInfo,
            42 => EnableLazyLoadedModule,
            43 => FinishedLazyLoadingModules,
            50 => TriggerRecompile,
            51 => BuildPatch,
            52 => BuildPatchPacket,
            53 => ReadyForCompilation,
            54 => CompilationStarting,
            55 => CompilationFinished,
            60 => SetBuildArguments,
            61 => DisconnectClient,
            62 => ApplySettingBool,
            63 => ApplySettingInt,
            64 => ApplySettingString,
            70 => HandleException,
            71 => HandleExceptionFinished,
            other => return Err(format!("unknown command id {}", other)),
        };
        Ok(id)
    }
}

/// One wire message: command id plus its payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Frame {
    pub id: CommandId,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Frame {
    pub fn ack() -> Self {
        Self {
            id: CommandId::Ack,
            payload: serde_json::Value::Null,
        }
    }
}

/// A typed command payload with its fixed wire id.
pub trait CommandPayload: Serialize + for<'de> Deserialize<'de> {
    const ID: CommandId;
}

macro_rules! command_payload {
    ($ty:ty, $id:ident) => {
        impl CommandPayload for $ty {
            const ID: CommandId = CommandId::$id;
        }
    };
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterProcess {
    pub process_id: ProcessId,
    pub thread_id: u32,
    pub image_path: PathBuf,
}
command_payload!(RegisterProcess, RegisterProcess);

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterProcessFinished {
    pub success: bool,
}
command_payload!(RegisterProcessFinished, RegisterProcessFinished);

// ---------------------------------------------------------------------------
// Module enable/disable
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EnableModuleBatchBegin {}
command_payload!(EnableModuleBatchBegin, EnableModuleBatchBegin);

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EnableModuleBatchEnd {}
command_payload!(EnableModuleBatchEnd, EnableModuleBatchEnd);

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DisableModuleBatchBegin {}
command_payload!(DisableModuleBatchBegin, DisableModuleBatchBegin);

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DisableModuleBatchEnd {}
command_payload!(DisableModuleBatchEnd, DisableModuleBatchEnd);

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnableModule {
    pub process_id: ProcessId,
    pub path: PathBuf,
}
command_payload!(EnableModule, EnableModule);

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EnableModuleFinished {}
command_payload!(EnableModuleFinished, EnableModuleFinished);

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnableAllModules {
    pub process_id: ProcessId,
    pub path: PathBuf,
}
command_payload!(EnableAllModules, EnableAllModules);

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EnableAllModulesFinished {}
command_payload!(EnableAllModulesFinished, EnableAllModulesFinished);

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DisableModule {
    pub process_id: ProcessId,
    pub path: PathBuf,
}
command_payload!(DisableModule, DisableModule);

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DisableModuleFinished {}
command_payload!(DisableModuleFinished, DisableModuleFinished);

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DisableAllModules {
    pub process_id: ProcessId,
    pub path: PathBuf,
}
command_payload!(DisableAllModules, DisableAllModules);

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DisableAllModulesFinished {}
command_payload!(DisableAllModulesFinished, DisableAllModulesFinished);

// ---------------------------------------------------------------------------
// Module info round-trip (server asks the client where an image is based)
// ---------------------------------------------------------------------------

/// Server -> client: report where this module is mapped. When `load_imports`
/// is set the reply is expected to recurse into import dependencies too.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetModule {
    pub path: PathBuf,
    pub load_imports: bool,
    /// True while enabling, false while disabling.
    pub load: bool,
}
command_payload!(GetModule, GetModule);

/// Client -> server: the base address of a mapped module.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetModuleInfo {
    pub process_id: ProcessId,
    pub path: PathBuf,
    pub module_base: Option<ModuleBase>,
    pub load_imports: bool,
    pub load: bool,
}
command_payload!(GetModuleInfo, GetModuleInfo);

/// Client declares a module it will only map on demand.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnableLazyLoadedModule {
    pub process_id: ProcessId,
    pub path: PathBuf,
    pub module_base: ModuleBase,
}
command_payload!(EnableLazyLoadedModule, EnableLazyLoadedModule);

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FinishedLazyLoadingModules {}
command_payload!(FinishedLazyLoadingModules, FinishedLazyLoadingModules);

// ---------------------------------------------------------------------------
// Compilation
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TriggerRecompile {}
command_payload!(TriggerRecompile, TriggerRecompile);

/// Announces `count` BuildPatchPacket frames to follow on the same channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildPatch {
    pub count: u32,
}
command_payload!(BuildPatch, BuildPatch);

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildPatchPacket {
    pub module: ModulePath,
    pub object_path: PathBuf,
}
command_payload!(BuildPatchPacket, BuildPatchPacket);

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ReadyForCompilation {}
command_payload!(ReadyForCompilation, ReadyForCompilation);

/// Server push, unacknowledged: stop issuing commands and report ready.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CompilationStarting {}
command_payload!(CompilationStarting, CompilationStarting);

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CompilationFinished {}
command_payload!(CompilationFinished, CompilationFinished);

// ---------------------------------------------------------------------------
// Housekeeping
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetBuildArguments {
    pub process_id: ProcessId,
    pub arguments: String,
}
command_payload!(SetBuildArguments, SetBuildArguments);

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DisconnectClient {}
command_payload!(DisconnectClient, DisconnectClient);

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApplySettingBool {
    pub name: String,
    pub value: bool,
}
command_payload!(ApplySettingBool, ApplySettingBool);

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApplySettingInt {
    pub name: String,
    pub value: i64,
}
command_payload!(ApplySettingInt, ApplySettingInt);

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApplySettingString {
    pub name: String,
    pub value: String,
}
command_payload!(ApplySettingString, ApplySettingString);

// ---------------------------------------------------------------------------
// Exception channel
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandleException {
    pub process_id: ProcessId,
    pub thread_id: u32,
    pub description: String,
}
command_payload!(HandleException, HandleException);

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandleExceptionFinished {
    pub handled: bool,
}
command_payload!(HandleExceptionFinished, HandleExceptionFinished);

// ---------------------------------------------------------------------------
// Endpoint naming
// ---------------------------------------------------------------------------

/// Port range used for deterministic endpoint naming.
const ENDPOINT_PORT_BASE: u16 = 49500;
const ENDPOINT_PORT_SPAN: u16 = 15000;

fn group_hash(group: &str) -> u16 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    group.hash(&mut hasher);
    (hasher.finish() % u64::from(ENDPOINT_PORT_SPAN)) as u16
}

/// Loopback port for the command channel of a process group. A client and a
/// server derive the same endpoint from the shared group string without any
/// prior coordination.
pub fn command_port(group: &str) -> u16 {
    ENDPOINT_PORT_BASE + group_hash(group)
}

/// The exception channel lives right next to the command channel.
pub fn exception_port(group: &str) -> u16 {
    command_port(group).wrapping_add(1)
}
