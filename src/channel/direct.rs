//! direct-tcpip channel
//!
//! State machine:
//! ```text
//! Created --open()--> Opening --confirmation--> Open --close()/peer CLOSE--> Closing --both closed--> Closed
//!                        |                                                                          ^
//!                        +------------------------------open failure-------------------------------+
//! ```

use super::{
    pipe, ChannelError, ChannelMessage, CloseFuture, CompletionFuture, OpenFuture, PipeReader,
    Window,
};
use crate::config::ChannelConfig;
use crate::protocol::{ProtocolError, DIRECT_TCPIP};
use crate::session::Session;
use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, trace, warn};

/// Consumer of inbound channel data
pub type ForwardTarget = Box<dyn AsyncWrite + Send + Unpin>;

/// Channel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Constructed, open not yet requested
    Created,
    /// Open request sent, waiting for the peer
    Opening,
    /// Confirmed by the peer, data may flow
    Open,
    /// Close started by either side
    Closing,
    /// Both sides closed
    Closed,
}

/// Host and port carried in open requests
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Create an endpoint from a host name or address literal
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port` or `[v6]:port`
    pub fn parse(s: &str) -> Result<Self, ChannelError> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ChannelError::Configuration(format!("missing port in {}", s)))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| ChannelError::Configuration(format!("invalid port in {}: {}", s, e)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(ChannelError::Configuration(format!("missing host in {}", s)));
        }
        Ok(Self::new(host, port))
    }

    /// Host part
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port part
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl FromStr for Endpoint {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// A direct-tcpip channel, owned by whoever opened it.
///
/// The multiplexer only keeps a weak reference for routing; dropping the
/// `DirectChannel` makes it unreachable.
pub struct DirectChannel {
    core: Arc<ChannelCore>,
}

/// Shared channel state reached both by the owner and by inbound routing
pub(crate) struct ChannelCore {
    id: u32,
    session: Arc<dyn Session>,
    remote: Endpoint,
    local: Endpoint,
    state: Mutex<ChannelState>,
    /// Peer's id for this channel, known once the open is confirmed
    recipient: OnceLock<u32>,
    /// Credit we granted the peer
    local_window: Window,
    /// Credit the peer granted us
    remote_window: Window,
    open_future: OpenFuture,
    close_future: CloseFuture,
    forward: tokio::sync::Mutex<Option<ForwardTarget>>,
    reader: Mutex<Option<PipeReader>>,
    pipe_capacity: usize,
    /// Serializes outbound data so packets leave in call order
    write_lock: tokio::sync::Mutex<()>,
    close_sent: AtomicBool,
    /// Close was requested before the peer answered the open
    close_pending: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DirectChannel {
    /// Create a channel towards `remote`, reporting `local` as the originator
    pub fn new(
        id: u32,
        session: Arc<dyn Session>,
        remote: Endpoint,
        local: Endpoint,
        config: &ChannelConfig,
    ) -> Result<Self, ChannelError> {
        if remote.host().is_empty() || remote.port() == 0 {
            return Err(ChannelError::Configuration(
                "remote must not be empty".to_string(),
            ));
        }
        if local.host().is_empty() {
            return Err(ChannelError::Configuration(
                "local must not be empty".to_string(),
            ));
        }
        if config.window_size == 0 || config.max_packet_size == 0 {
            return Err(ChannelError::Configuration(
                "window and packet size must be positive".to_string(),
            ));
        }

        let core = ChannelCore {
            id,
            session,
            remote,
            local,
            state: Mutex::new(ChannelState::Created),
            recipient: OnceLock::new(),
            local_window: Window::new("local", config.window_size, config.max_packet_size),
            remote_window: Window::new("remote", 0, 0),
            open_future: CompletionFuture::new("open"),
            close_future: CompletionFuture::new("close"),
            forward: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
            pipe_capacity: config.pipe_capacity,
            write_lock: tokio::sync::Mutex::new(()),
            close_sent: AtomicBool::new(false),
            close_pending: AtomicBool::new(false),
        };

        Ok(Self {
            core: Arc::new(core),
        })
    }

    /// Session-unique channel id
    pub fn id(&self) -> u32 {
        self.core.id
    }

    /// Channel type sent in the open request
    pub fn channel_type(&self) -> &'static str {
        DIRECT_TCPIP
    }

    /// Current state
    pub fn state(&self) -> ChannelState {
        self.core.state()
    }

    /// Target the peer connects to
    pub fn remote(&self) -> &Endpoint {
        &self.core.remote
    }

    /// Originator reported to the peer
    pub fn local(&self) -> &Endpoint {
        &self.core.local
    }

    /// Credit granted to the peer
    pub fn local_window(&self) -> &Window {
        &self.core.local_window
    }

    /// Credit granted by the peer
    pub fn remote_window(&self) -> &Window {
        &self.core.remote_window
    }

    pub fn open_future(&self) -> OpenFuture {
        self.core.open_future.clone()
    }

    pub fn close_future(&self) -> CloseFuture {
        self.core.close_future.clone()
    }

    /// Check if the channel is fully closed
    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Route inbound data to `target` instead of the in-process pipe.
    ///
    /// Only valid before [`open`](Self::open).
    pub fn set_forward_target<W>(&self, target: W) -> Result<(), ChannelError>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let state = self.core.state();
        if state != ChannelState::Created {
            return Err(ChannelError::InvalidState(format!(
                "cannot set forward target on channel {} in state {:?}",
                self.core.id, state
            )));
        }

        let mut forward = self.core.forward.try_lock().map_err(|_| {
            ChannelError::InvalidState(format!("channel {} is delivering data", self.core.id))
        })?;
        *forward = Some(Box::new(target));
        Ok(())
    }

    /// Reading end of the in-process pipe.
    ///
    /// Available once the open is confirmed, and only if no forward target
    /// was set. Can be taken once.
    pub fn take_reader(&self) -> Option<PipeReader> {
        lock(&self.core.reader).take()
    }

    /// Send the open request.
    ///
    /// Fails without sending anything if the session is already closed or
    /// the channel was opened before.
    pub async fn open(&self) -> Result<OpenFuture, ChannelError> {
        let core = &self.core;
        if core.session.is_closed() {
            return Err(ChannelError::InvalidState(
                "session has been closed".to_string(),
            ));
        }
        core.transition(ChannelState::Created, ChannelState::Opening, "open")?;

        info!("Send SSH_MSG_CHANNEL_OPEN on channel {} to {}", core.id, core.remote);
        let request = ChannelMessage::direct_tcpip_open(
            core.id,
            core.local_window.size(),
            core.local_window.packet_size(),
            core.remote.host(),
            u32::from(core.remote.port()),
            core.local.host(),
            u32::from(core.local.port()),
        );

        if let Err(e) = core.send(&request).await {
            warn!("Failed to send open request for channel {}: {}", core.id, e);
            core.finish().await;
            return Err(e);
        }

        Ok(core.open_future.clone())
    }

    /// Send `data` to the peer, blocking while the remote window is exhausted.
    ///
    /// Data is split into messages no larger than the peer's packet size.
    pub async fn write(&self, data: &[u8]) -> Result<(), ChannelError> {
        self.core.write(data).await
    }

    /// Start closing the channel.
    ///
    /// A graceful close sends CLOSE once in-flight writes are out and
    /// completes when the peer answers; an immediate close finishes locally
    /// right away. Either way a pending open fails and blocked writers wake.
    pub async fn close(&self, immediately: bool) -> CloseFuture {
        self.core.close(immediately).await
    }

    pub(crate) fn downgrade(&self) -> Weak<ChannelCore> {
        Arc::downgrade(&self.core)
    }
}

impl fmt::Debug for DirectChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectChannel")
            .field("id", &self.core.id)
            .field("state", &self.core.state())
            .field("remote", &self.core.remote)
            .field("local", &self.core.local)
            .finish()
    }
}

impl ChannelCore {
    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn state(&self) -> ChannelState {
        *lock(&self.state)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    fn transition(
        &self,
        from: ChannelState,
        to: ChannelState,
        operation: &str,
    ) -> Result<(), ChannelError> {
        let mut state = lock(&self.state);
        if *state != from {
            return Err(ChannelError::InvalidState(format!(
                "cannot {} channel {} in state {:?}",
                operation, self.id, *state
            )));
        }
        *state = to;
        Ok(())
    }

    fn recipient(&self) -> Result<u32, ChannelError> {
        self.recipient.get().copied().ok_or_else(|| {
            ChannelError::InvalidState(format!("channel {} has no peer id yet", self.id))
        })
    }

    async fn send(&self, message: &ChannelMessage) -> Result<(), ChannelError> {
        let mut buf = self
            .session
            .create_buffer(message.message_type(), message.body_size_hint());
        message.encode_body(&mut buf);
        self.session.write_packet(buf).await?;
        Ok(())
    }

    async fn send_close(&self) -> Result<(), ChannelError> {
        let Some(&recipient) = self.recipient.get() else {
            return Ok(());
        };
        if self.close_sent.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("Send SSH_MSG_CHANNEL_CLOSE on channel {}", self.id);
        self.send(&ChannelMessage::Close {
            recipient_channel: recipient,
        })
        .await
    }

    async fn write(&self, data: &[u8]) -> Result<(), ChannelError> {
        let _guard = self.write_lock.lock().await;
        let mut remaining = data;

        while !remaining.is_empty() {
            let state = self.state();
            if state != ChannelState::Open {
                return Err(ChannelError::InvalidState(format!(
                    "cannot write to channel {} in state {:?}",
                    self.id, state
                )));
            }

            let wanted = u32::try_from(remaining.len()).unwrap_or(u32::MAX);
            let chunk = self.remote_window.wait_for_space(wanted).await? as usize;
            let (head, tail) = remaining.split_at(chunk);

            trace!("Channel {}: sending {} bytes", self.id, chunk);
            self.send(&ChannelMessage::Data {
                recipient_channel: self.recipient()?,
                payload: Bytes::copy_from_slice(head),
            })
            .await?;
            remaining = tail;
        }

        Ok(())
    }

    /// Install the in-process pipe unless a forward target was configured
    async fn do_open(&self) {
        let mut forward = self.forward.lock().await;
        if forward.is_none() {
            let (writer, reader) = pipe(self.pipe_capacity);
            *forward = Some(Box::new(writer));
            *lock(&self.reader) = Some(reader);
        }
    }

    pub(crate) async fn handle_open_confirmation(
        &self,
        sender_channel: u32,
        initial_window_size: u32,
        max_packet_size: u32,
    ) -> Result<(), ChannelError> {
        let state = self.state();
        if state == ChannelState::Closed && self.recipient.set(sender_channel).is_ok() {
            // Closed before the peer answered; release the peer's side
            debug!(
                "Channel {} confirmed after it was closed, closing peer channel {}",
                self.id, sender_channel
            );
            return self.send_close().await;
        }
        if !matches!(state, ChannelState::Opening | ChannelState::Closing) {
            return Err(ChannelError::InvalidState(format!(
                "unexpected open confirmation for channel {} in state {:?}",
                self.id, state
            )));
        }
        if self.recipient.set(sender_channel).is_err() {
            return Err(ChannelError::InvalidState(format!(
                "duplicate open confirmation for channel {}",
                self.id
            )));
        }

        self.remote_window.init(initial_window_size, max_packet_size);
        self.do_open().await;

        if self
            .transition(ChannelState::Opening, ChannelState::Open, "confirm")
            .is_ok()
        {
            info!(
                "Channel {} opened (peer id {}, window {}, packet {})",
                self.id, sender_channel, initial_window_size, max_packet_size
            );
            self.open_future.complete(Ok(()));
            return Ok(());
        }

        if self.close_pending.load(Ordering::SeqCst) {
            debug!("Channel {} confirmed after close was requested", self.id);
            if let Err(e) = self.send_close().await {
                self.finish().await;
                return Err(e);
            }
        }
        Ok(())
    }

    pub(crate) async fn handle_open_failure(&self, reason: u32, description: String) {
        warn!(
            "Channel {} open rejected by peer (reason {}): {}",
            self.id, reason, description
        );
        self.open_future
            .complete(Err(ChannelError::OpenFailed { reason, description }));
        self.finish().await;
    }

    pub(crate) fn handle_window_adjust(&self, bytes_to_add: u32) {
        trace!("Channel {}: remote window +{}", self.id, bytes_to_add);
        self.remote_window.expand(bytes_to_add);
    }

    /// Deliver inbound payload to the consumer.
    ///
    /// The local window is charged first; a peer overrunning it closes the
    /// channel. Returns only after the consumer has accepted and flushed
    /// the bytes, then replenishes the window if needed.
    pub(crate) async fn handle_data(&self, payload: Bytes) -> Result<(), ChannelError> {
        let state = self.state();
        if !matches!(state, ChannelState::Open | ChannelState::Closing) {
            return Err(ChannelError::InvalidState(format!(
                "data received on channel {} in state {:?}",
                self.id, state
            )));
        }

        let len = u32::try_from(payload.len())
            .map_err(|_| ProtocolError::MessageTooLarge(payload.len()))?;
        if let Err(e) = self.local_window.consume_and_check(len) {
            warn!("Channel {}: peer exceeded window, closing: {}", self.id, e);
            self.close(true).await;
            return Err(e);
        }

        let mut forward = self.forward.lock().await;
        let Some(target) = forward.as_mut() else {
            trace!("Channel {}: dropping {} bytes, no consumer", self.id, len);
            return Ok(());
        };

        let delivered = match target.write_all(&payload).await {
            Ok(()) => target.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = delivered {
            forward.take();
            drop(forward);
            warn!("Channel {}: consumer failed, closing: {}", self.id, e);
            self.close(false).await;
            return Err(e.into());
        }
        if self.is_closed() {
            // finish() could not reach the target while we held it
            if let Some(mut target) = forward.take() {
                if let Err(e) = target.shutdown().await {
                    debug!("Channel {}: shutting down consumer failed: {}", self.id, e);
                }
            }
            return Ok(());
        }
        drop(forward);

        self.replenish_local_window().await
    }

    async fn replenish_local_window(&self) -> Result<(), ChannelError> {
        let Some(increment) = self.local_window.replenish_amount() else {
            return Ok(());
        };
        let Some(&recipient) = self.recipient.get() else {
            return Ok(());
        };
        if self.close_sent.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.local_window.expand(increment);
        trace!("Channel {}: local window +{}", self.id, increment);
        self.send(&ChannelMessage::WindowAdjust {
            recipient_channel: recipient,
            bytes_to_add: increment,
        })
        .await
    }

    pub(crate) async fn handle_eof(&self) {
        debug!("Received SSH_MSG_CHANNEL_EOF on channel {}", self.id);
        let target = self.forward.lock().await.take();
        if let Some(mut target) = target {
            if let Err(e) = target.shutdown().await {
                debug!("Channel {}: shutting down consumer failed: {}", self.id, e);
            }
        }
    }

    pub(crate) async fn handle_close(&self) {
        debug!("Received SSH_MSG_CHANNEL_CLOSE on channel {}", self.id);
        {
            let mut state = lock(&self.state);
            if *state != ChannelState::Closed {
                *state = ChannelState::Closing;
            }
        }
        if let Err(e) = self.send_close().await {
            debug!("Channel {}: failed to answer close: {}", self.id, e);
        }
        self.finish().await;
    }

    pub(crate) async fn close(&self, immediately: bool) -> CloseFuture {
        let previous = {
            let mut state = lock(&self.state);
            let previous = *state;
            match previous {
                ChannelState::Created => *state = ChannelState::Closed,
                ChannelState::Opening | ChannelState::Open => *state = ChannelState::Closing,
                ChannelState::Closing | ChannelState::Closed => {}
            }
            previous
        };

        if previous == ChannelState::Closed {
            return self.close_future.clone();
        }

        debug!(
            "Closing channel {} ({})",
            self.id,
            if immediately { "immediately" } else { "gracefully" }
        );

        // Waiters on the open and on remote credit must not outlive the close
        self.open_future.complete(Err(ChannelError::Closed));
        self.remote_window.close();

        if immediately {
            if let Err(e) = self.send_close().await {
                debug!("Channel {}: close not delivered: {}", self.id, e);
            }
            self.finish().await;
            return self.close_future.clone();
        }

        match previous {
            ChannelState::Created => self.finish().await,
            ChannelState::Opening => {
                // The peer may still confirm; CLOSE goes out then
                self.close_pending.store(true, Ordering::SeqCst);
            }
            ChannelState::Open => {
                let _guard = self.write_lock.lock().await;
                if let Err(e) = self.send_close().await {
                    debug!("Channel {}: close not delivered: {}", self.id, e);
                    self.finish().await;
                }
            }
            ChannelState::Closing | ChannelState::Closed => {}
        }

        self.close_future.clone()
    }

    /// Final transition: release every waiter and the consumer
    pub(crate) async fn finish(&self) {
        {
            let mut state = lock(&self.state);
            *state = ChannelState::Closed;
        }
        self.remote_window.close();
        self.local_window.close();
        self.open_future.complete(Err(ChannelError::Closed));

        // A delivery stuck on a wedged consumer keeps the lock; it drops the
        // target itself once it notices the channel is closed.
        if let Ok(mut forward) = self.forward.try_lock() {
            if let Some(mut target) = forward.take() {
                if let Err(e) = target.shutdown().await {
                    debug!("Channel {}: shutting down consumer failed: {}", self.id, e);
                }
            }
        }

        if self.close_future.complete(Ok(())) {
            info!("Channel {} closed", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::RecordingSession;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    fn config() -> ChannelConfig {
        ChannelConfig {
            window_size: 1024,
            max_packet_size: 256,
            pipe_capacity: 4096,
        }
    }

    fn channel(session: &Arc<RecordingSession>) -> DirectChannel {
        DirectChannel::new(
            7,
            Arc::clone(session) as Arc<dyn Session>,
            Endpoint::new("10.0.0.5", 80),
            Endpoint::new("127.0.0.1", 4000),
            &config(),
        )
        .unwrap()
    }

    async fn opened(session: &Arc<RecordingSession>) -> DirectChannel {
        let channel = channel(session);
        channel.open().await.unwrap();
        channel
            .core
            .handle_open_confirmation(99, 1000, 100)
            .await
            .unwrap();
        channel
    }

    #[test]
    fn test_empty_addresses_rejected() {
        let session: Arc<dyn Session> = Arc::new(RecordingSession::default());
        let cases = [
            (Endpoint::new("", 80), Endpoint::new("127.0.0.1", 1)),
            (Endpoint::new("host", 0), Endpoint::new("127.0.0.1", 1)),
            (Endpoint::new("host", 80), Endpoint::new("", 1)),
            (Endpoint::new("", 0), Endpoint::new("", 0)),
        ];

        for (remote, local) in cases {
            let result = DirectChannel::new(1, Arc::clone(&session), remote, local, &config());
            assert!(matches!(result, Err(ChannelError::Configuration(_))));
        }
    }

    #[test]
    fn test_endpoint_parse() {
        let endpoint = Endpoint::parse("example.com:22").unwrap();
        assert_eq!(endpoint.host(), "example.com");
        assert_eq!(endpoint.port(), 22);

        let v6 = Endpoint::parse("[::1]:8080").unwrap();
        assert_eq!(v6.host(), "::1");
        assert_eq!(v6.to_string(), "[::1]:8080");

        assert!(Endpoint::parse("no-port").is_err());
        assert!(Endpoint::parse(":22").is_err());
        assert!(Endpoint::parse("host:99999").is_err());
    }

    #[tokio::test]
    async fn test_open_on_closed_session_sends_nothing() {
        let session = Arc::new(RecordingSession::default());
        session.close();
        let channel = channel(&session);

        let result = channel.open().await;
        assert!(matches!(result, Err(ChannelError::InvalidState(_))));
        assert_eq!(channel.state(), ChannelState::Created);
        assert!(session.sent().is_empty());
    }

    #[tokio::test]
    async fn test_open_sends_request_once() {
        let session = Arc::new(RecordingSession::default());
        let channel = channel(&session);

        let future = channel.open().await.unwrap();
        assert!(!future.is_done());
        assert_eq!(channel.state(), ChannelState::Opening);
        assert!(matches!(
            channel.open().await,
            Err(ChannelError::InvalidState(_))
        ));

        let sent = session.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0],
            ChannelMessage::direct_tcpip_open(7, 1024, 256, "10.0.0.5", 80, "127.0.0.1", 4000)
        );
    }

    #[tokio::test]
    async fn test_confirmation_opens_and_creates_pipe() {
        let session = Arc::new(RecordingSession::default());
        let channel = opened(&session).await;

        assert_eq!(channel.state(), ChannelState::Open);
        assert!(channel.open_future().is_success());
        assert_eq!(channel.remote_window().size(), 1000);

        let mut reader = channel.take_reader().expect("pipe reader");
        channel
            .core
            .handle_data(Bytes::from_static(b"inbound"))
            .await
            .unwrap();

        let mut buf = [0u8; 7];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"inbound");
        assert_eq!(channel.local_window().size(), 1024 - 7);
    }

    #[tokio::test]
    async fn test_open_failure_carries_reason() {
        let session = Arc::new(RecordingSession::default());
        let channel = channel(&session);
        let future = channel.open().await.unwrap();

        channel
            .core
            .handle_open_failure(2, "connection refused".to_string())
            .await;

        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(matches!(
            future.error().as_deref(),
            Some(ChannelError::OpenFailed { reason: 2, .. })
        ));
        assert!(channel.close_future().is_done());
    }

    #[tokio::test]
    async fn test_forward_target_only_before_open() {
        let session = Arc::new(RecordingSession::default());
        let channel = channel(&session);
        let (writer, _reader) = pipe(64);
        channel.set_forward_target(writer).unwrap();

        channel.open().await.unwrap();
        let (late, _late_reader) = pipe(64);
        assert!(matches!(
            channel.set_forward_target(late),
            Err(ChannelError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_write_requires_open() {
        let session = Arc::new(RecordingSession::default());
        let channel = channel(&session);
        assert!(matches!(
            channel.write(b"early").await,
            Err(ChannelError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_write_fragments_by_packet_size() {
        let session = Arc::new(RecordingSession::default());
        let channel = opened(&session).await;

        channel.write(&[7u8; 250]).await.unwrap();

        let data: Vec<usize> = session
            .sent()
            .into_iter()
            .filter_map(|m| match m {
                ChannelMessage::Data {
                    recipient_channel: 99,
                    payload,
                } => Some(payload.len()),
                _ => None,
            })
            .collect();
        assert_eq!(data, vec![100, 100, 50]);
        assert_eq!(channel.remote_window().size(), 750);
    }

    #[tokio::test]
    async fn test_write_blocks_until_window_adjust() {
        let session = Arc::new(RecordingSession::default());
        let channel = Arc::new(opened(&session).await);

        channel.write(&[1u8; 1000]).await.unwrap();
        assert_eq!(channel.remote_window().size(), 0);

        let writer = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.write(b"more").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());

        channel.core.handle_window_adjust(4);
        writer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_writer() {
        let session = Arc::new(RecordingSession::default());
        let channel = Arc::new(opened(&session).await);
        channel.write(&[1u8; 1000]).await.unwrap();

        let writer = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.write(b"stuck").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        channel.close(true).await;
        assert!(writer.await.unwrap().is_err());
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_window_overrun_fails_channel() {
        let session = Arc::new(RecordingSession::default());
        let channel = opened(&session).await;
        let _reader = channel.take_reader();

        channel
            .core
            .handle_data(Bytes::from(vec![0u8; 500]))
            .await
            .unwrap();
        let err = channel
            .core
            .handle_data(Bytes::from(vec![0u8; 525]))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ChannelError::WindowExceeded {
                requested: 525,
                available: 524
            }
        ));
        assert_eq!(channel.local_window().size(), 524);
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(session
            .sent()
            .contains(&ChannelMessage::Close { recipient_channel: 99 }));
    }

    #[tokio::test]
    async fn test_sequential_deliveries_charge_window() {
        let session = Arc::new(RecordingSession::default());
        let channel = opened(&session).await;
        let _reader = channel.take_reader();

        channel.core.handle_data(Bytes::from(vec![0u8; 100])).await.unwrap();
        channel.core.handle_data(Bytes::from(vec![0u8; 200])).await.unwrap();
        assert_eq!(channel.local_window().size(), 1024 - 300);
    }

    #[tokio::test]
    async fn test_replenish_after_half_window() {
        let session = Arc::new(RecordingSession::default());
        let channel = opened(&session).await;
        let _reader = channel.take_reader();

        channel.core.handle_data(Bytes::from(vec![0u8; 600])).await.unwrap();

        assert_eq!(channel.local_window().size(), 1024);
        assert!(session.sent().contains(&ChannelMessage::WindowAdjust {
            recipient_channel: 99,
            bytes_to_add: 600
        }));
    }

    #[tokio::test]
    async fn test_graceful_close_waits_for_peer() {
        let session = Arc::new(RecordingSession::default());
        let channel = opened(&session).await;

        let future = channel.close(false).await;
        assert_eq!(channel.state(), ChannelState::Closing);
        assert!(!future.is_done());
        assert!(session
            .sent()
            .contains(&ChannelMessage::Close { recipient_channel: 99 }));

        channel.core.handle_close().await;
        assert!(future.is_success());
        assert_eq!(channel.state(), ChannelState::Closed);

        let closes = session
            .sent()
            .into_iter()
            .filter(|m| matches!(m, ChannelMessage::Close { .. }))
            .count();
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn test_peer_close_is_answered() {
        let session = Arc::new(RecordingSession::default());
        let channel = opened(&session).await;

        channel.core.handle_close().await;
        assert!(channel.is_closed());
        assert!(channel.close_future().is_success());
        assert!(session
            .sent()
            .contains(&ChannelMessage::Close { recipient_channel: 99 }));
    }

    #[tokio::test]
    async fn test_close_while_opening_fails_open_and_closes_on_confirm() {
        let session = Arc::new(RecordingSession::default());
        let channel = channel(&session);
        let open = channel.open().await.unwrap();

        let close = channel.close(false).await;
        assert!(matches!(open.error().as_deref(), Some(ChannelError::Closed)));
        assert!(!close.is_done());

        channel
            .core
            .handle_open_confirmation(99, 1000, 100)
            .await
            .unwrap();
        assert!(session
            .sent()
            .contains(&ChannelMessage::Close { recipient_channel: 99 }));

        channel.core.handle_close().await;
        assert!(close.is_success());
    }

    #[tokio::test]
    async fn test_immediate_close_while_opening_closes_late_confirmation() {
        let session = Arc::new(RecordingSession::default());
        let channel = channel(&session);
        let open = channel.open().await.unwrap();

        let close = channel.close(true).await;
        assert!(close.is_success());
        assert!(open.error().is_some());
        assert_eq!(channel.state(), ChannelState::Closed);

        channel
            .core
            .handle_open_confirmation(99, 1000, 100)
            .await
            .unwrap();
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(channel.take_reader().is_none());

        // The peer's CLOSE answer finds nothing left to do
        channel.core.handle_close().await;

        let closes: Vec<_> = session
            .sent()
            .into_iter()
            .filter(|m| matches!(m, ChannelMessage::Close { .. }))
            .collect();
        assert_eq!(closes, vec![ChannelMessage::Close { recipient_channel: 99 }]);
    }

    #[tokio::test]
    async fn test_eof_ends_pipe_stream() {
        let session = Arc::new(RecordingSession::default());
        let channel = opened(&session).await;
        let mut reader = channel.take_reader().unwrap();

        channel.core.handle_data(Bytes::from_static(b"last")).await.unwrap();
        channel.core.handle_eof().await;

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"last");
    }
}
