//! Channel layer - logical streams multiplexed over one session
//!
//! Provides:
//! - Message encoding/decoding
//! - Flow control windows
//! - Open/close completion futures
//! - The direct-tcpip channel state machine

mod direct;
mod future;
mod message;
mod pipe;
mod window;

pub use direct::{ChannelState, DirectChannel, Endpoint, ForwardTarget};
pub use future::{CloseFuture, CompletionFuture, OpenFuture};
pub use message::ChannelMessage;
pub use pipe::{pipe, PipeReader, PipeWriter};
pub use window::Window;

pub(crate) use direct::ChannelCore;

use crate::protocol::ProtocolError;
use crate::session::SessionError;
use thiserror::Error;

/// Channel layer errors
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Invalid channel configuration: {0}")]
    Configuration(String),

    #[error("Invalid channel state: {0}")]
    InvalidState(String),

    #[error("Window exceeded: {requested} bytes received, {available} bytes of credit left")]
    WindowExceeded { requested: u32, available: u32 },

    #[error("Channel open failed (reason {reason}): {description}")]
    OpenFailed { reason: u32, description: String },

    #[error("Channel closed")]
    Closed,

    #[error("Channel not found: {0}")]
    NotFound(u32),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Default initial window size (2 MB)
pub const DEFAULT_WINDOW_SIZE: u32 = 0x20_0000;

/// Default maximum packet payload (32 KB)
pub const DEFAULT_PACKET_SIZE: u32 = 0x8000;

/// Default capacity of the in-process pipe used when no forward target is set
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;
