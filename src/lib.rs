//! # direct-tcpip
//!
//! Channel multiplexing and local port forwarding over a secure session,
//! following the SSH connection protocol's `direct-tcpip` channel type.
//!
//! ## Features
//!
//! - **Flow-controlled channels** with per-direction credit windows
//! - **Open/close futures** observable by any number of tasks
//! - **Local port forwarding** with one relay task per connection
//! - **Tunnel transport**: a channel usable where a socket is expected
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Application Layer                   │
//! │      (ForwardingListener, TunnelTransport)          │
//! ├─────────────────────────────────────────────────────┤
//! │                   Channel Layer                      │
//! │    (DirectChannel, windows, open/close futures)     │
//! ├─────────────────────────────────────────────────────┤
//! │                 Multiplexing Layer                   │
//! │      (channel ids, inbound message routing)         │
//! ├─────────────────────────────────────────────────────┤
//! │                   Session Layer                      │
//! │   (encryption, packet framing; loopback in-process) │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod channel;
pub mod config;
pub mod forward;
pub mod protocol;
pub mod session;
pub mod transport;

pub use channel::{DirectChannel, Endpoint};
pub use config::Config;
pub use forward::ForwardingListener;
pub use session::{Multiplexer, Session};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Channel error: {0}")]
    Channel(#[from] channel::ChannelError),

    #[error("Session error: {0}")]
    Session(#[from] session::SessionError),

    #[error("Forward error: {0}")]
    Forward(#[from] forward::ForwardError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Configuration error: {0}")]
    Config(String),
}
