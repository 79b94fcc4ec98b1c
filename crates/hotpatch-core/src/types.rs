//! Core identifiers shared across the server

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

/// OS process identifier of an attached client.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ProcessId(pub u32);

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ProcessId {
    fn from(pid: u32) -> Self {
        Self(pid)
    }
}

/// Relocation-independent signature of a binary image's header.
///
/// Two processes that load the same binary produce the same fingerprint, no
/// matter where the image was based. Computed by the symbol provider; opaque
/// to everything else.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ImageFingerprint(pub u64);

impl ImageFingerprint {
    /// Fingerprint of an image that could not be opened.
    pub const INVALID: Self = Self(0);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for ImageFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Base address a module is mapped at inside one particular process.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ModuleBase(pub u64);

/// Normalized path of a loaded binary image.
///
/// Paths coming back from clients are not necessarily normalized, depending
/// on how the executable was launched. Normalizing before any registry lookup
/// keeps one image from being tracked under two spellings.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModulePath(PathBuf);

impl ModulePath {
    pub fn normalize(path: impl AsRef<Path>) -> Self {
        let mut out = PathBuf::new();
        for component in path.as_ref().components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    if !out.pop() {
                        out.push(Component::ParentDir);
                    }
                }
                other => out.push(other),
            }
        }
        Self(out)
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// File name portion, for user-facing messages.
    pub fn file_name(&self) -> String {
        self.0
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.0.display().to_string())
    }
}

impl std::fmt::Display for ModulePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl AsRef<Path> for ModulePath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}
