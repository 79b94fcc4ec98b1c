//! Ports to everything outside the server's control
//!
//! Symbol databases, target-process manipulation, the build toolchain, and
//! drive aliasing all live behind narrow traits. The binary wires in real
//! implementations; tests wire in recording fakes. Nothing inside the
//! registries or the compile driver touches a platform API directly.

use async_trait::async_trait;
use hotpatch_core::{ImageFingerprint, ModuleBase, ModulePath, ProcessId, Result};
use std::path::{Path, PathBuf};

/// One translation unit as recorded in a module's symbol database.
#[derive(Clone, Debug)]
pub struct CompilandRecord {
    pub object_path: PathBuf,
    pub source_path: PathBuf,
    pub compiler_path: PathBuf,
    pub command_line: String,
    /// Files this unit depends on besides its own source (headers, PCH).
    pub dependencies: Vec<PathBuf>,
    /// Ranges this unit contributed to the linked image.
    pub contributions: Vec<Contribution>,
}

/// A contiguous range a compiland contributed to the image.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Contribution {
    pub offset: u64,
    pub size: u64,
}

/// Opens symbol databases for binary images.
pub trait SymbolProvider: Send + Sync {
    /// Relocation-independent header fingerprint; `ImageFingerprint::INVALID`
    /// when the image cannot be read.
    fn image_fingerprint(&self, image: &Path) -> ImageFingerprint;

    fn open(&self, image: &Path) -> Result<Box<dyn SymbolSession>>;
}

/// One opened symbol database. Loading compilands is the expensive part of
/// enabling a module; it runs on its own task.
pub trait SymbolSession: Send + Sync {
    fn gather_compilands(&self) -> Result<Vec<CompilandRecord>>;

    /// Linker that produced this image, for patch links.
    fn linker_path(&self) -> Result<PathBuf>;

    /// Images this one imports, for `EnableAllModules` recursion.
    fn import_modules(&self) -> Result<Vec<PathBuf>>;
}

impl std::fmt::Debug for dyn SymbolSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn SymbolSession")
    }
}

/// A patch binary produced by one module update.
#[derive(Clone, Debug)]
pub struct PatchImage {
    pub path: PathBuf,
    /// Ordinal within its module, starting at 0.
    pub patch_index: u32,
}

/// Manipulates attached target processes.
pub trait ProcessControl: Send + Sync {
    fn is_active(&self, pid: ProcessId) -> bool;

    /// Monotonic liveness counter the client increments while scheduled. No
    /// movement between two samples means the process is held (debugger,
    /// breakpoint) and cannot answer pipe commands.
    fn read_heartbeat(&self, pid: ProcessId) -> u64;

    fn install_code_cave(&self, pid: ProcessId) -> Result<()>;
    fn uninstall_code_cave(&self, pid: ProcessId) -> Result<()>;

    fn disable_control_flow_guard(&self, pid: ProcessId, base: ModuleBase) -> Result<()>;

    /// Load and activate one patch inside the process.
    fn install_patch(&self, pid: ProcessId, patch: &PatchImage) -> Result<()>;
}

/// One changed translation unit handed to the compiler.
#[derive(Clone, Debug)]
pub struct CompileUnit {
    pub source_path: PathBuf,
    pub object_path: PathBuf,
    pub compiler_path: PathBuf,
    pub command_line: String,
}

#[derive(Clone, Debug)]
pub struct LinkRequest {
    pub module: ModulePath,
    pub linker_path: PathBuf,
    pub objects: Vec<PathBuf>,
    pub patch_index: u32,
}

/// Drives the compiler and linker for one module update.
///
/// Errors carry the tool's log text; they become `CompileError` /
/// `LinkError` outcomes, not connection failures. `arguments` carries one
/// entry per distinct build-argument string the module's member processes
/// registered, global arguments first.
#[async_trait]
pub trait CompileDelegate: Send + Sync {
    async fn compile(&self, units: &[CompileUnit], arguments: &[String])
        -> std::result::Result<(), String>;

    async fn link_patch(
        &self,
        request: &LinkRequest,
        arguments: &[String],
    ) -> std::result::Result<PatchImage, String>;

    /// Warm whatever per-toolchain state makes the first real compile fast.
    /// Called once per unique compiler/linker path, off the critical path.
    async fn prewarm(&self, tool_path: &Path) {
        let _ = tool_path;
    }
}

/// Maps a drive alias for the duration of a batch or pass, so recorded
/// command lines referencing the alias resolve.
pub trait DriveMapper: Send + Sync {
    fn map(&self, letter: &str, target: &Path) -> Result<()>;
    fn unmap(&self, letter: &str) -> Result<()>;
}

/// Used when no virtual drive is configured.
pub struct NoopDriveMapper;

impl DriveMapper for NoopDriveMapper {
    fn map(&self, _letter: &str, _target: &Path) -> Result<()> {
        Ok(())
    }
    fn unmap(&self, _letter: &str) -> Result<()> {
        Ok(())
    }
}
