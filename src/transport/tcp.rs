//! Plain TCP transport

use super::{SocketOption, SocketOptionKind, Transport, TransportConfig, TransportError};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Transport over a real TCP socket
pub struct TcpTransport {
    stream: Option<TcpStream>,
    config: TransportConfig,
}

impl TcpTransport {
    /// Create a new TCP transport
    pub fn new(config: TransportConfig) -> Self {
        Self {
            stream: None,
            config,
        }
    }

    /// Create with default configuration
    pub fn new_default() -> Self {
        Self::new(TransportConfig::default())
    }

    fn stream(&self) -> Result<&TcpStream, TransportError> {
        self.stream.as_ref().ok_or(TransportError::Closed)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&mut self, addr: &str) -> Result<(), TransportError> {
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", addr, e)))?;

        stream.set_nodelay(self.config.nodelay).ok();
        debug!("TCP transport connected to {}", addr);

        self.stream = Some(stream);
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;

        tokio::time::timeout(self.config.write_timeout, stream.write_all(data))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(TransportError::Io)?;

        Ok(())
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;

        let n = tokio::time::timeout(self.config.read_timeout, stream.read(buf))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(TransportError::Io)?;

        if n == 0 {
            return Err(TransportError::Closed);
        }

        Ok(n)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await.ok();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn set_option(&mut self, option: SocketOption) -> Result<(), TransportError> {
        let stream = self.stream()?;
        match option {
            SocketOption::NoDelay(on) => stream.set_nodelay(on)?,
            SocketOption::Ttl(ttl) => stream.set_ttl(ttl)?,
        }
        Ok(())
    }

    fn get_option(&self, kind: SocketOptionKind) -> Result<SocketOption, TransportError> {
        let stream = self.stream()?;
        Ok(match kind {
            SocketOptionKind::NoDelay => SocketOption::NoDelay(stream.nodelay()?),
            SocketOptionKind::Ttl => SocketOption::Ttl(stream.ttl()?),
        })
    }
}
