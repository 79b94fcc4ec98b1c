//! Length-prefixed JSON framing over a TCP stream
//!
//! Each frame is a little-endian u32 length followed by that many bytes of
//! JSON. Frames are small (command metadata, never file contents), so an
//! upper bound keeps a corrupt length prefix from allocating the moon.

use crate::channel::DuplexChannel;
use async_trait::async_trait;
use hotpatch_core::{Error, Frame, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

pub struct TcpChannel {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
}

impl TcpChannel {
    pub fn new(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }

    pub async fn connect(addr: &str) -> Result<Self> {
        Ok(Self::new(TcpStream::connect(addr).await?))
    }
}

#[async_trait]
impl DuplexChannel for TcpChannel {
    async fn send(&self, frame: Frame) -> Result<()> {
        let bytes = serde_json::to_vec(&frame)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Frame> {
        let mut reader = self.reader.lock().await;
        let mut len_bytes = [0u8; 4];
        if let Err(e) = reader.read_exact(&mut len_bytes).await {
            return match e.kind() {
                std::io::ErrorKind::UnexpectedEof => Err(Error::ConnectionBroken),
                _ => Err(e.into()),
            };
        }
        let len = u32::from_le_bytes(len_bytes);
        if len > MAX_FRAME_LEN {
            return Err(Error::internal(format!("oversized frame: {} bytes", len)));
        }
        let mut buf = vec![0u8; len as usize];
        reader
            .read_exact(&mut buf)
            .await
            .map_err(|_| Error::ConnectionBroken)?;
        Ok(serde_json::from_slice(&buf)?)
    }
}
