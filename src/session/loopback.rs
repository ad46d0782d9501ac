//! In-process loopback session
//!
//! [`LoopbackSession`] hands packets to a [`LoopbackPeer`] running in the
//! same process instead of an encrypted connection. The peer plays the
//! server side of direct-tcpip: it dials the requested target, honours the
//! client's window and acknowledges consumed data with WINDOW_ADJUST.
//! Useful for tests and for running forwards without a remote server.

use super::{Multiplexer, Session, SessionError};
use crate::channel::{ChannelMessage, Window};
use crate::config::ChannelConfig;
use crate::protocol::{OpenFailureReason, DIRECT_TCPIP};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Timeout for the peer's outbound connections
const PEER_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client side of the loopback pair
pub struct LoopbackSession {
    outbound: mpsc::UnboundedSender<Bytes>,
    next_id: AtomicU32,
    closed: AtomicBool,
}

impl LoopbackSession {
    /// Create a session writing packets to `outbound`
    pub fn new(outbound: mpsc::UnboundedSender<Bytes>) -> Self {
        Self {
            outbound,
            next_id: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Mark the session closed; later opens and writes fail
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Session for LoopbackSession {
    async fn write_packet(&self, buffer: BytesMut) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        self.outbound
            .send(buffer.freeze())
            .map_err(|_| SessionError::Closed)
    }

    fn next_channel_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.outbound.is_closed()
    }
}

/// Peer state for one channel
struct PeerChannel {
    client_id: u32,
    /// Bytes for the target; dropped on EOF
    data_tx: Option<mpsc::UnboundedSender<Bytes>>,
    /// Credit the client granted us
    window: Arc<Window>,
    close_sent: Arc<AtomicBool>,
}

/// Server side of direct-tcpip, driven by packets from a [`LoopbackSession`]
pub struct LoopbackPeer {
    to_client: mpsc::UnboundedSender<Bytes>,
    channels: HashMap<u32, PeerChannel>,
    next_id: u32,
    window_size: u32,
    packet_size: u32,
}

fn send(to_client: &mpsc::UnboundedSender<Bytes>, message: ChannelMessage) -> bool {
    to_client.send(message.encode().freeze()).is_ok()
}

impl LoopbackPeer {
    /// Create a peer answering through `to_client`
    pub fn new(to_client: mpsc::UnboundedSender<Bytes>, config: &ChannelConfig) -> Self {
        Self {
            to_client,
            channels: HashMap::new(),
            next_id: 100,
            window_size: config.window_size,
            packet_size: config.max_packet_size,
        }
    }

    /// Process client packets until the client side goes away.
    ///
    /// Target connections are dialed inline, so a slow connect holds up
    /// other channels of this peer.
    pub async fn run(mut self, mut from_client: mpsc::UnboundedReceiver<Bytes>) {
        while let Some(packet) = from_client.recv().await {
            match ChannelMessage::decode(packet) {
                Ok(message) => self.handle_message(message).await,
                Err(e) => warn!("Loopback peer: undecodable packet: {}", e),
            }
        }

        debug!("Loopback peer stopped, releasing {} channels", self.channels.len());
        for channel in self.channels.values() {
            channel.window.close();
        }
    }

    async fn handle_message(&mut self, message: ChannelMessage) {
        match message {
            ChannelMessage::Open {
                channel_type,
                sender_channel,
                initial_window_size,
                max_packet_size,
                remote_host,
                remote_port,
                ..
            } => {
                self.handle_open(
                    &channel_type,
                    sender_channel,
                    initial_window_size,
                    max_packet_size,
                    &remote_host,
                    remote_port,
                )
                .await;
            }
            ChannelMessage::Data {
                recipient_channel,
                payload,
            } => {
                if let Some(tx) = self
                    .channels
                    .get(&recipient_channel)
                    .and_then(|c| c.data_tx.as_ref())
                {
                    let _ = tx.send(payload);
                }
            }
            ChannelMessage::WindowAdjust {
                recipient_channel,
                bytes_to_add,
            } => {
                if let Some(channel) = self.channels.get(&recipient_channel) {
                    channel.window.expand(bytes_to_add);
                }
            }
            ChannelMessage::Eof { recipient_channel } => {
                if let Some(channel) = self.channels.get_mut(&recipient_channel) {
                    channel.data_tx = None;
                }
            }
            ChannelMessage::Close { recipient_channel } => {
                if let Some(channel) = self.channels.remove(&recipient_channel) {
                    channel.window.close();
                    if !channel.close_sent.swap(true, Ordering::SeqCst) {
                        send(
                            &self.to_client,
                            ChannelMessage::Close {
                                recipient_channel: channel.client_id,
                            },
                        );
                    }
                    debug!("Loopback peer closed channel {}", recipient_channel);
                }
            }
            other => {
                debug!("Loopback peer ignoring {:?}", other.message_type());
            }
        }
    }

    fn reject(&self, client_id: u32, reason: OpenFailureReason, description: String) {
        send(
            &self.to_client,
            ChannelMessage::OpenFailure {
                recipient_channel: client_id,
                reason: reason as u32,
                description,
                language: String::new(),
            },
        );
    }

    async fn handle_open(
        &mut self,
        channel_type: &str,
        client_id: u32,
        initial_window_size: u32,
        max_packet_size: u32,
        host: &str,
        port: u32,
    ) {
        if channel_type != DIRECT_TCPIP {
            self.reject(
                client_id,
                OpenFailureReason::UnknownChannelType,
                format!("unknown channel type {}", channel_type),
            );
            return;
        }
        let Ok(port) = u16::try_from(port) else {
            self.reject(
                client_id,
                OpenFailureReason::ConnectFailed,
                format!("invalid port {}", port),
            );
            return;
        };

        let stream = match tokio::time::timeout(PEER_CONNECT_TIMEOUT, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.reject(client_id, OpenFailureReason::ConnectFailed, e.to_string());
                return;
            }
            Err(_) => {
                self.reject(
                    client_id,
                    OpenFailureReason::ConnectFailed,
                    "connect timed out".to_string(),
                );
                return;
            }
        };
        stream.set_nodelay(true).ok();

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        info!("Loopback peer connected channel {} to {}:{}", id, host, port);

        let (read_half, write_half) = stream.into_split();
        let window = Arc::new(Window::new("peer", initial_window_size, max_packet_size));
        let close_sent = Arc::new(AtomicBool::new(false));
        let (data_tx, data_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_target(
            write_half,
            data_rx,
            self.to_client.clone(),
            client_id,
        ));

        // Confirmation goes out before the reader can produce any data
        send(
            &self.to_client,
            ChannelMessage::OpenConfirmation {
                recipient_channel: client_id,
                sender_channel: id,
                initial_window_size: self.window_size,
                max_packet_size: self.packet_size,
            },
        );

        tokio::spawn(read_target(
            read_half,
            Arc::clone(&window),
            self.to_client.clone(),
            client_id,
            Arc::clone(&close_sent),
        ));

        self.channels.insert(
            id,
            PeerChannel {
                client_id,
                data_tx: Some(data_tx),
                window,
                close_sent,
            },
        );
    }
}

/// Write client data to the target, acknowledging each chunk
async fn write_target(
    mut write_half: OwnedWriteHalf,
    mut data_rx: mpsc::UnboundedReceiver<Bytes>,
    to_client: mpsc::UnboundedSender<Bytes>,
    client_id: u32,
) {
    while let Some(payload) = data_rx.recv().await {
        if let Err(e) = write_half.write_all(&payload).await {
            debug!("Loopback peer: target write failed: {}", e);
            break;
        }
        send(
            &to_client,
            ChannelMessage::WindowAdjust {
                recipient_channel: client_id,
                bytes_to_add: payload.len() as u32,
            },
        );
    }
    let _ = write_half.shutdown().await;
}

/// Read from the target and send it to the client within its window
async fn read_target(
    mut read_half: OwnedReadHalf,
    window: Arc<Window>,
    to_client: mpsc::UnboundedSender<Bytes>,
    client_id: u32,
    close_sent: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("Loopback peer: target read failed: {}", e);
                break;
            }
        };

        let mut offset = 0;
        while offset < n {
            let Ok(chunk) = window.wait_for_space((n - offset) as u32).await else {
                return;
            };
            let chunk = chunk as usize;
            trace!("Loopback peer: {} bytes to channel {}", chunk, client_id);
            let payload = Bytes::copy_from_slice(&buf[offset..offset + chunk]);
            if !send(
                &to_client,
                ChannelMessage::Data {
                    recipient_channel: client_id,
                    payload,
                },
            ) {
                return;
            }
            offset += chunk;
        }
    }

    if window.is_closed() {
        return;
    }
    send(
        &to_client,
        ChannelMessage::Eof {
            recipient_channel: client_id,
        },
    );
    if !close_sent.swap(true, Ordering::SeqCst) {
        send(
            &to_client,
            ChannelMessage::Close {
                recipient_channel: client_id,
            },
        );
    }
}

/// Wire a [`Multiplexer`] to an in-process [`LoopbackPeer`].
///
/// Spawns the peer and a dispatcher feeding peer packets to the
/// multiplexer in arrival order. Both stop once the multiplexer, its
/// channels and the session are dropped.
pub fn spawn_loopback(config: ChannelConfig) -> (Arc<Multiplexer>, Arc<LoopbackSession>) {
    let (to_peer, from_client) = mpsc::unbounded_channel();
    let (to_client, mut from_peer) = mpsc::unbounded_channel::<Bytes>();

    let session = Arc::new(LoopbackSession::new(to_peer));
    let peer = LoopbackPeer::new(to_client, &config);
    let mux = Arc::new(Multiplexer::new(
        Arc::clone(&session) as Arc<dyn Session>,
        config,
    ));

    tokio::spawn(peer.run(from_client));

    let dispatcher = Arc::downgrade(&mux);
    tokio::spawn(async move {
        while let Some(packet) = from_peer.recv().await {
            let Some(mux) = dispatcher.upgrade() else {
                break;
            };
            if let Err(e) = mux.handle_packet(packet).await {
                debug!("Inbound packet not delivered: {}", e);
            }
        }
        trace!("Loopback dispatcher stopped");
    });

    (mux, session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelError, Endpoint};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_unknown_target_is_rejected() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (mux, _session) = spawn_loopback(ChannelConfig::default());
        let channel = mux
            .create_direct_channel(Endpoint::from(addr), Endpoint::new("127.0.0.1", 30000))
            .unwrap();

        let open = channel.open().await.unwrap();
        let err = open.wait().await.unwrap_err();
        assert!(matches!(
            *err,
            ChannelError::OpenFailed { reason, .. } if reason == OpenFailureReason::ConnectFailed as u32
        ));
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn test_closed_session_rejects_open() {
        let (mux, session) = spawn_loopback(ChannelConfig::default());
        session.close();

        let channel = mux
            .create_direct_channel(Endpoint::new("127.0.0.1", 9), Endpoint::new("127.0.0.1", 1))
            .unwrap();
        assert!(matches!(
            channel.open().await,
            Err(ChannelError::InvalidState(_))
        ));
    }
}
