//! Command dispatch
//!
//! A `CommandMap` binds command ids to handlers and drives one end of a
//! channel: read a frame, ack it, run the handler. A handler may read further
//! frames from the same channel (multi-frame commands like BuildPatch), and
//! signals end-of-dispatch by returning `Ok(false)`.

use crate::channel::DuplexChannel;
use async_trait::async_trait;
use hotpatch_core::{Error, Frame, Result};
use std::collections::HashMap;
use tracing::trace;

/// Handler for one command id.
///
/// Returns `Ok(true)` to keep dispatching, `Ok(false)` to end the dispatch
/// loop cleanly.
#[async_trait]
pub trait Action<Ctx: Send>: Send + Sync {
    async fn run(
        &self,
        payload: serde_json::Value,
        ctx: &mut Ctx,
        chan: &dyn DuplexChannel,
    ) -> Result<bool>;
}

pub struct CommandMap<Ctx> {
    actions: HashMap<hotpatch_core::CommandId, Box<dyn Action<Ctx>>>,
}

impl<Ctx: Send> Default for CommandMap<Ctx> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Ctx: Send> CommandMap<Ctx> {
    pub fn new() -> Self {
        Self {
            actions: HashMap::new(),
        }
    }

    pub fn register(mut self, id: hotpatch_core::CommandId, action: impl Action<Ctx> + 'static) -> Self {
        self.actions.insert(id, Box::new(action));
        self
    }

    /// Dispatch commands from `chan` until a handler ends the loop or the
    /// channel breaks.
    ///
    /// A frame whose id has no registered handler is a desync: the peer and
    /// we disagree about what phase the conversation is in, and nothing after
    /// that point can be trusted.
    pub async fn handle_commands(&self, chan: &dyn DuplexChannel, ctx: &mut Ctx) -> Result<()> {
        loop {
            let frame = chan.recv().await?;
            let action = self
                .actions
                .get(&frame.id)
                .ok_or(Error::ProtocolDesync(frame.id))?;
            trace!(id = ?frame.id, "dispatch");
            chan.send(Frame::ack()).await?;
            if !action.run(frame.payload, ctx, chan).await? {
                return Ok(());
            }
        }
    }
}
