//! Hotpatch Registry - live process/module state and external-collaborator ports

pub mod file_cache;
pub mod module;
pub mod pools;
pub mod ports;
pub mod process;
pub mod registry;

pub use file_cache::FileAttributeCache;
pub use module::{Compiland, Dependency, LiveModule, ModuleId};
pub use pools::PoolSet;
pub use ports::{
    CompilandRecord, CompileDelegate, CompileUnit, Contribution, DriveMapper, LinkRequest,
    NoopDriveMapper, PatchImage, ProcessControl, SymbolProvider, SymbolSession,
};
pub use process::LiveProcess;
pub use registry::Registries;
