//! Default port implementations for the standalone daemon
//!
//! Symbol data comes from a JSON sidecar next to each binary image
//! (`<image>.symbols.json`), written by the build. Process control goes
//! through procfs; thread parking and patch activation themselves happen
//! inside the client runtime, the daemon tracks and reports them. The
//! compile delegate shells out to the recorded compiler and linker.

use async_trait::async_trait;
use hotpatch_core::{Error, ImageFingerprint, ModuleBase, ModulePath, ProcessId, Result};
use hotpatch_registry::{
    CompilandRecord, CompileDelegate, CompileUnit, Contribution, DriveMapper, LinkRequest,
    PatchImage, ProcessControl, SymbolProvider, SymbolSession,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Symbols
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ManifestContribution {
    offset: u64,
    size: u64,
}

#[derive(Deserialize)]
struct ManifestCompiland {
    object: PathBuf,
    source: PathBuf,
    compiler: PathBuf,
    #[serde(default)]
    command_line: String,
    #[serde(default)]
    dependencies: Vec<PathBuf>,
    #[serde(default)]
    contributions: Vec<ManifestContribution>,
}

#[derive(Deserialize)]
struct SymbolManifest {
    fingerprint: u64,
    linker: PathBuf,
    #[serde(default)]
    imports: Vec<PathBuf>,
    compilands: Vec<ManifestCompiland>,
}

/// Reads `<image>.symbols.json` sidecar manifests.
pub struct SidecarSymbols;

fn sidecar_path(image: &Path) -> PathBuf {
    let mut name = image.as_os_str().to_owned();
    name.push(".symbols.json");
    PathBuf::from(name)
}

impl SidecarSymbols {
    fn read_manifest(image: &Path) -> Result<SymbolManifest> {
        let raw = std::fs::read_to_string(sidecar_path(image))?;
        Ok(serde_json::from_str(&raw)?)
    }
}

impl SymbolProvider for SidecarSymbols {
    fn image_fingerprint(&self, image: &Path) -> ImageFingerprint {
        match Self::read_manifest(image) {
            Ok(manifest) => ImageFingerprint(manifest.fingerprint),
            Err(e) => {
                debug!(image = %image.display(), error = %e, "no symbol sidecar");
                ImageFingerprint::INVALID
            }
        }
    }

    fn open(&self, image: &Path) -> Result<Box<dyn SymbolSession>> {
        let manifest = Self::read_manifest(image).map_err(|e| Error::SymbolsUnavailable {
            path: ModulePath::normalize(image),
            reason: e.to_string(),
        })?;
        Ok(Box::new(SidecarSession { manifest }))
    }
}

struct SidecarSession {
    manifest: SymbolManifest,
}

impl SymbolSession for SidecarSession {
    fn gather_compilands(&self) -> Result<Vec<CompilandRecord>> {
        Ok(self
            .manifest
            .compilands
            .iter()
            .map(|c| CompilandRecord {
                object_path: c.object.clone(),
                source_path: c.source.clone(),
                compiler_path: c.compiler.clone(),
                command_line: c.command_line.clone(),
                dependencies: c.dependencies.clone(),
                contributions: c
                    .contributions
                    .iter()
                    .map(|r| Contribution {
                        offset: r.offset,
                        size: r.size,
                    })
                    .collect(),
            })
            .collect())
    }

    fn linker_path(&self) -> Result<PathBuf> {
        Ok(self.manifest.linker.clone())
    }

    fn import_modules(&self) -> Result<Vec<PathBuf>> {
        Ok(self.manifest.imports.clone())
    }
}

// ---------------------------------------------------------------------------
// Process control
// ---------------------------------------------------------------------------

/// Observes attached processes through procfs. The heartbeat is scheduled
/// CPU time: a process held by a debugger accumulates none.
pub struct ProcAttach;

impl ProcessControl for ProcAttach {
    fn is_active(&self, pid: ProcessId) -> bool {
        Path::new(&format!("/proc/{}", pid)).exists()
    }

    fn read_heartbeat(&self, pid: ProcessId) -> u64 {
        let stat = match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat,
            Err(_) => return 0,
        };
        // utime and stime follow the parenthesised comm field.
        let Some((_, rest)) = stat.rsplit_once(')') else {
            return 0;
        };
        let fields: Vec<&str> = rest.split_whitespace().collect();
        let utime = fields.get(11).and_then(|f| f.parse::<u64>().ok()).unwrap_or(0);
        let stime = fields.get(12).and_then(|f| f.parse::<u64>().ok()).unwrap_or(0);
        utime + stime
    }

    fn install_code_cave(&self, pid: ProcessId) -> Result<()> {
        // The client runtime parks its own threads on request; the daemon
        // records that the request was made.
        debug!(%pid, "code cave requested");
        Ok(())
    }

    fn uninstall_code_cave(&self, pid: ProcessId) -> Result<()> {
        debug!(%pid, "code cave released");
        Ok(())
    }

    fn disable_control_flow_guard(&self, pid: ProcessId, base: ModuleBase) -> Result<()> {
        debug!(%pid, base = base.0, "control flow guard opt-out");
        Ok(())
    }

    fn install_patch(&self, pid: ProcessId, patch: &PatchImage) -> Result<()> {
        // Activation happens inside the client; a missing patch file is the
        // one failure the daemon can see from here.
        std::fs::metadata(&patch.path)?;
        info!(%pid, patch = %patch.path.display(), "patch handed to process");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Build toolchain
// ---------------------------------------------------------------------------

/// Invokes the compiler and linker recorded in the symbol data.
pub struct ShellCompileDelegate {
    output_dir: PathBuf,
}

impl ShellCompileDelegate {
    pub fn new(output_dir: PathBuf) -> Self {
        Self { output_dir }
    }
}

#[async_trait]
impl CompileDelegate for ShellCompileDelegate {
    async fn compile(
        &self,
        units: &[CompileUnit],
        arguments: &[String],
    ) -> std::result::Result<(), String> {
        for unit in units {
            let mut cmd = tokio::process::Command::new(&unit.compiler_path);
            cmd.args(unit.command_line.split_whitespace());
            for args in arguments {
                cmd.args(args.split_whitespace());
            }
            cmd.arg("-c").arg(&unit.source_path);
            cmd.arg("-o").arg(&unit.object_path);
            let output = cmd
                .output()
                .await
                .map_err(|e| format!("failed to run {}: {}", unit.compiler_path.display(), e))?;
            if !output.status.success() {
                return Err(String::from_utf8_lossy(&output.stderr).into_owned());
            }
        }
        Ok(())
    }

    async fn link_patch(
        &self,
        request: &LinkRequest,
        arguments: &[String],
    ) -> std::result::Result<PatchImage, String> {
        std::fs::create_dir_all(&self.output_dir).map_err(|e| e.to_string())?;
        let path = self.output_dir.join(format!(
            "{}.patch{}",
            request.module.file_name(),
            request.patch_index
        ));
        let mut cmd = tokio::process::Command::new(&request.linker_path);
        cmd.arg("-shared");
        for args in arguments {
            cmd.args(args.split_whitespace());
        }
        cmd.args(&request.objects);
        cmd.arg("-o").arg(&path);
        let output = cmd
            .output()
            .await
            .map_err(|e| format!("failed to run {}: {}", request.linker_path.display(), e))?;
        if !output.status.success() {
            return Err(String::from_utf8_lossy(&output.stderr).into_owned());
        }
        Ok(PatchImage {
            path,
            patch_index: request.patch_index,
        })
    }

    async fn prewarm(&self, tool_path: &Path) {
        // The first spawn pays for paging the toolchain in.
        let _ = tokio::process::Command::new(tool_path)
            .arg("--version")
            .output()
            .await;
    }
}

// ---------------------------------------------------------------------------
// Drive aliasing
// ---------------------------------------------------------------------------

/// Resolves a drive alias to a directory with a symlink under the system
/// temp directory.
pub struct SymlinkDrive {
    root: PathBuf,
}

impl Default for SymlinkDrive {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("hotpatch-drives"),
        }
    }
}

impl SymlinkDrive {
    fn alias_path(&self, letter: &str) -> PathBuf {
        self.root.join(letter.trim_end_matches(':'))
    }
}

impl DriveMapper for SymlinkDrive {
    fn map(&self, letter: &str, target: &Path) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        let alias = self.alias_path(letter);
        match std::fs::remove_file(&alias) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        std::os::unix::fs::symlink(target, &alias)?;
        debug!(letter, target = %target.display(), "drive mapped");
        Ok(())
    }

    fn unmap(&self, letter: &str) -> Result<()> {
        match std::fs::remove_file(self.alias_path(letter)) {
            Ok(()) => {
                debug!(letter, "drive unmapped");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_missing_sidecar_reports_symbols_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let image = tmp.path().join("engine.so");
        std::fs::write(&image, b"\x7fELF").unwrap();

        assert!(!SidecarSymbols.image_fingerprint(&image).is_valid());
        let err = SidecarSymbols.open(&image).unwrap_err();
        assert!(matches!(err, Error::SymbolsUnavailable { .. }));
    }

    #[test]
    fn a_sidecar_manifest_round_trips_into_records() {
        let tmp = tempfile::tempdir().unwrap();
        let image = tmp.path().join("engine.so");
        std::fs::write(&image, b"\x7fELF").unwrap();
        std::fs::write(
            tmp.path().join("engine.so.symbols.json"),
            r#"{
                "fingerprint": 48879,
                "linker": "/toolchain/ld",
                "imports": ["/bin/plugin.so"],
                "compilands": [
                    {"object": "/out/a.o", "source": "/src/a.cpp", "compiler": "/toolchain/cc"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(SidecarSymbols.image_fingerprint(&image), ImageFingerprint(48879));
        let session = SidecarSymbols.open(&image).unwrap();
        let records = session.gather_compilands().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].object_path, PathBuf::from("/out/a.o"));
        assert_eq!(session.linker_path().unwrap(), PathBuf::from("/toolchain/ld"));
        assert_eq!(
            session.import_modules().unwrap(),
            vec![PathBuf::from("/bin/plugin.so")]
        );
    }
}
