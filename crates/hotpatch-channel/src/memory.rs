//! In-memory duplex channel for tests and the lazy-load proxy

use crate::channel::DuplexChannel;
use async_trait::async_trait;
use hotpatch_core::{Error, Frame, Result};
use tokio::sync::mpsc;
use tokio::sync::Mutex;

/// One end of an in-process duplex channel.
pub struct MemoryChannel {
    tx: mpsc::UnboundedSender<Frame>,
    rx: Mutex<mpsc::UnboundedReceiver<Frame>>,
}

/// Create both ends of a connected channel.
pub fn pair() -> (MemoryChannel, MemoryChannel) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        MemoryChannel {
            tx: a_tx,
            rx: Mutex::new(b_rx),
        },
        MemoryChannel {
            tx: b_tx,
            rx: Mutex::new(a_rx),
        },
    )
}

#[async_trait]
impl DuplexChannel for MemoryChannel {
    async fn send(&self, frame: Frame) -> Result<()> {
        self.tx.send(frame).map_err(|_| Error::ConnectionBroken)
    }

    async fn recv(&self) -> Result<Frame> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(Error::ConnectionBroken)
    }
}
