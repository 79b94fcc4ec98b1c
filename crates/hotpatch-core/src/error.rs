//! Error types shared across the server crates

use crate::types::{ModulePath, ProcessId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The peer closed the channel or the transport died underneath us.
    #[error("channel closed by peer")]
    ConnectionBroken,

    /// A frame arrived with a command id the current state cannot accept.
    #[error("protocol desync: unexpected command {0:?}")]
    ProtocolDesync(crate::protocol::CommandId),

    #[error("process {0} rejected: group already owns installed patches")]
    RejectedGroupConflict(ProcessId),

    #[error("process {0} is already registered")]
    DuplicateProcess(ProcessId),

    #[error("unknown module {0}")]
    UnknownModule(ModulePath),

    /// A pool handle outlived the allocation it pointed at.
    #[error("stale pool handle")]
    StaleHandle,

    #[error("symbols unavailable for {path}: {reason}")]
    SymbolsUnavailable { path: ModulePath, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True when the connection is unusable and should be torn down.
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(self, Self::ConnectionBroken | Self::ProtocolDesync(_) | Self::Io(_))
    }
}

/// Terminal classification of one compile pass.
///
/// Outcomes from several modules merge with first-non-`NoChange`-wins
/// semantics: `NoChange` is overridden by anything else, and once any other
/// outcome is recorded, later outcomes do not replace it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PatchOutcome {
    /// No translation unit changed; nothing was built.
    NoChange,
    Success,
    CompileError(String),
    LinkError(String),
    /// The patch built but no process could load it.
    LoadPatchError(String),
    /// The patch loaded somewhere but activation failed in at least one
    /// process.
    ActivatePatchError(String),
}

impl PatchOutcome {
    pub fn is_error(&self) -> bool {
        !matches!(self, Self::NoChange | Self::Success)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Merge the outcome of one more module into the running pass outcome.
    pub fn merge(self, next: PatchOutcome) -> PatchOutcome {
        match self {
            Self::NoChange => next,
            other => other,
        }
    }

    /// Short user-facing description.
    pub fn message(&self) -> String {
        match self {
            Self::NoChange => "no source changes detected".to_string(),
            Self::Success => "patch applied".to_string(),
            Self::CompileError(msg) => format!("compile failed: {}", msg),
            Self::LinkError(msg) => format!("link failed: {}", msg),
            Self::LoadPatchError(msg) => format!("patch could not be loaded: {}", msg),
            Self::ActivatePatchError(msg) => format!("patch could not be activated: {}", msg),
        }
    }
}
