//! Channel-backed transport
//!
//! Looks like a connecting socket but has no local port: `connect` opens a
//! direct-tcpip channel to the address, reads come from the channel's pipe
//! and writes go straight to the channel.

use super::{Transport, TransportError};
use crate::channel::{DirectChannel, Endpoint, PipeReader};
use crate::config::TunnelConfig;
use crate::session::Multiplexer;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

/// Transport tunnelled through a direct-tcpip channel
pub struct TunnelTransport {
    mux: Arc<Multiplexer>,
    originator: Endpoint,
    connect_timeout: Duration,
    channel: Option<DirectChannel>,
    reader: Option<PipeReader>,
}

impl TunnelTransport {
    /// Create an unconnected transport reporting `originator` in open requests
    pub fn new(mux: Arc<Multiplexer>, originator: Endpoint) -> Self {
        Self {
            mux,
            originator,
            connect_timeout: Duration::ZERO,
            channel: None,
            reader: None,
        }
    }

    /// Create from the `[tunnel]` section
    pub fn from_config(mux: Arc<Multiplexer>, config: &TunnelConfig) -> crate::Result<Self> {
        Ok(Self::new(mux, config.originator_endpoint()?)
            .with_connect_timeout(config.connect_timeout()))
    }

    /// Timeout used by [`Transport::connect`]; zero waits indefinitely
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Underlying channel, once connected
    pub fn channel(&self) -> Option<&DirectChannel> {
        self.channel.as_ref()
    }

    /// Open a channel to `addr` and wait up to `timeout` for the peer.
    ///
    /// An open still pending when the timeout elapses is reported as a
    /// failure and the channel is closed.
    pub async fn connect_with_timeout(
        &mut self,
        addr: &str,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        if self.channel.is_some() {
            return Err(TransportError::ConnectionFailed(format!(
                "already connected, cannot connect to {}",
                addr
            )));
        }

        let remote = Endpoint::parse(addr)?;
        let channel = self
            .mux
            .create_direct_channel(remote, self.originator.clone())?;
        let open = channel.open().await?;
        open.wait_for(timeout).await;

        if let Some(e) = open.error() {
            return Err(TransportError::ConnectionFailed(format!(
                "channel open to {} failed: {}",
                addr, e
            )));
        }
        if !open.is_done() {
            channel.close(true).await;
            return Err(TransportError::ConnectionFailed(format!(
                "channel open to {} not yet complete",
                addr
            )));
        }

        info!("Tunnel transport connected to {} on channel {}", addr, channel.id());
        self.reader = channel.take_reader();
        self.channel = Some(channel);
        Ok(())
    }
}

#[async_trait]
impl Transport for TunnelTransport {
    async fn connect(&mut self, addr: &str) -> Result<(), TransportError> {
        self.connect_with_timeout(addr, self.connect_timeout).await
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let channel = self.channel.as_ref().ok_or(TransportError::Closed)?;
        channel.write(data).await?;
        Ok(())
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let reader = self.reader.as_mut().ok_or(TransportError::Closed)?;
        let n = reader.read(buf).await?;
        if n == 0 {
            return Err(TransportError::Closed);
        }
        Ok(n)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.reader = None;
        let Some(channel) = self.channel.take() else {
            return Ok(());
        };

        debug!("Closing tunnel transport channel {}", channel.id());
        let close = channel.close(false).await;
        close.wait().await.map_err(|e| {
            TransportError::ConnectionFailed(format!(
                "close of channel {} failed: {}",
                channel.id(),
                e
            ))
        })
    }

    fn is_connected(&self) -> bool {
        self.channel.as_ref().is_some_and(|c| !c.is_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;
    use crate::session::spawn_loopback;

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let (mux, _session) = spawn_loopback(ChannelConfig::default());
        let mut transport = TunnelTransport::new(mux, Endpoint::new("127.0.0.1", 30000));

        assert!(!transport.is_connected());
        assert!(matches!(
            transport.send(b"x").await,
            Err(TransportError::Closed)
        ));
        let mut buf = [0u8; 4];
        assert!(matches!(
            transport.recv(&mut buf).await,
            Err(TransportError::Closed)
        ));
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_address_fails_fast() {
        let (mux, _session) = spawn_loopback(ChannelConfig::default());
        let mut transport = TunnelTransport::new(mux, Endpoint::new("127.0.0.1", 30000));

        assert!(matches!(
            transport.connect("no-port").await,
            Err(TransportError::Channel(_))
        ));
        assert!(transport.channel().is_none());
    }

    #[tokio::test]
    async fn test_from_config() {
        let (mux, _session) = spawn_loopback(ChannelConfig::default());
        let config = TunnelConfig {
            connect_timeout_ms: 250,
            originator: "[::1]:4000".to_string(),
        };

        let transport = TunnelTransport::from_config(mux, &config).unwrap();
        assert_eq!(transport.connect_timeout, Duration::from_millis(250));
        assert_eq!(transport.originator.host(), "::1");
    }
}
