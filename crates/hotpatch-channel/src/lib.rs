//! Hotpatch Channel - duplex framing, in-memory and TCP transports, dispatch

pub mod channel;
pub mod dispatch;
pub mod memory;
pub mod tcp;

pub use channel::{
    read_frame, recv_command, send_command, send_command_and_wait_for_ack, send_push, DuplexChannel,
};
pub use dispatch::{Action, CommandMap};
pub use memory::{pair, MemoryChannel};
pub use tcp::TcpChannel;
