//! Hotpatch Core - ids, wire protocol, errors, settings, and pool allocators

pub mod config;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod types;

pub use config::{FocusPolicy, Settings};
pub use error::{Error, PatchOutcome, Result};
pub use pool::{Handle, Pool, PoolStats};
pub use protocol::*;
pub use types::*;
