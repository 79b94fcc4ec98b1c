//! Duplex channel abstraction and frame helpers
//!
//! A channel carries whole frames in both directions. The acknowledgement
//! discipline lives in the helpers, not the transport: `recv_command` acks
//! what it reads, `send_command_and_wait_for_ack` blocks until the peer's
//! ack arrives, and `send_push` sends without expecting one.

use async_trait::async_trait;
use hotpatch_core::{CommandId, CommandPayload, Error, Frame, Result};

/// Bidirectional, frame-oriented transport.
///
/// `recv` is cancel-safe for the in-memory transport; concurrent receivers
/// on one channel are serialized, never interleaved mid-frame.
#[async_trait]
pub trait DuplexChannel: Send + Sync {
    async fn send(&self, frame: Frame) -> Result<()>;
    async fn recv(&self) -> Result<Frame>;
}

/// Read the next frame, whatever it is.
pub async fn read_frame(chan: &dyn DuplexChannel) -> Result<Frame> {
    chan.recv().await
}

/// Read the next frame, require it to be `P`, and ack it.
pub async fn recv_command<P: CommandPayload>(chan: &dyn DuplexChannel) -> Result<P> {
    let frame = chan.recv().await?;
    if frame.id != P::ID {
        return Err(Error::ProtocolDesync(frame.id));
    }
    let payload: P = serde_json::from_value(frame.payload)?;
    chan.send(Frame::ack()).await?;
    Ok(payload)
}

/// Send a command without waiting for anything back.
pub async fn send_command<P: CommandPayload>(chan: &dyn DuplexChannel, payload: &P) -> Result<()> {
    chan.send(Frame {
        id: P::ID,
        payload: serde_json::to_value(payload)?,
    })
    .await
}

/// Send a command and block until the peer acks it.
pub async fn send_command_and_wait_for_ack<P: CommandPayload>(
    chan: &dyn DuplexChannel,
    payload: &P,
) -> Result<()> {
    send_command(chan, payload).await?;
    let frame = chan.recv().await?;
    if frame.id != CommandId::Ack {
        return Err(Error::ProtocolDesync(frame.id));
    }
    Ok(())
}

/// Send an unacknowledged server push. Identical to `send_command` on the
/// wire; the separate name keeps call sites honest about which frames the
/// peer will not answer.
pub async fn send_push<P: CommandPayload>(chan: &dyn DuplexChannel, payload: &P) -> Result<()> {
    send_command(chan, payload).await
}
