//! Transport layer implementations
//!
//! A [`Transport`] is a connecting byte stream. Two variants exist:
//! - [`TcpTransport`]: a real TCP socket
//! - [`TunnelTransport`]: a direct-tcpip channel presented as a socket
//!
//! Operations that only make sense for real sockets (bind, listen, accept,
//! urgent data, socket options) fail with [`TransportError::Unsupported`]
//! unless a variant implements them.

mod tcp;
mod tunnel;

pub use tcp::TcpTransport;
pub use tunnel::TunnelTransport;

use crate::channel::ChannelError;
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed")]
    Closed,

    #[error("Timeout")]
    Timeout,

    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

/// Socket option values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    NoDelay(bool),
    Ttl(u32),
}

/// Socket option names for [`Transport::get_option`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOptionKind {
    NoDelay,
    Ttl,
}

/// Trait for transport implementations
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to a remote endpoint
    async fn connect(&mut self, addr: &str) -> Result<(), TransportError>;

    /// Send data
    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Receive data
    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Close the connection
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Check if connected
    fn is_connected(&self) -> bool;

    async fn bind(&mut self, _addr: &str) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("bind"))
    }

    async fn listen(&mut self, _backlog: u32) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("listen"))
    }

    async fn accept(&mut self) -> Result<Box<dyn Transport>, TransportError> {
        Err(TransportError::Unsupported("accept"))
    }

    async fn send_urgent_data(&mut self, _byte: u8) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("send_urgent_data"))
    }

    fn set_option(&mut self, _option: SocketOption) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("set_option"))
    }

    fn get_option(&self, _kind: SocketOptionKind) -> Result<SocketOption, TransportError> {
        Err(TransportError::Unsupported("get_option"))
    }

    /// Bytes readable without blocking
    fn available(&self) -> Result<usize, TransportError> {
        Err(TransportError::Unsupported("available"))
    }
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Read timeout
    pub read_timeout: Duration,
    /// Write timeout
    pub write_timeout: Duration,
    /// Disable Nagle's algorithm on connect
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(60),
            nodelay: true,
        }
    }
}
