//! Hotpatch Server - orchestrator, command handlers, compile driver, proxy

pub mod driver;
pub mod events;
pub mod handlers;
pub mod proxy;
pub mod server;

pub use driver::{CompileDriver, NullTrigger, PassReason, TriggerSource};
pub use events::{LogEvents, NullEvents, ServerEvents};
pub use server::{ConnCtx, Server, ServerPorts, Shared};
