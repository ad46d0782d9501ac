//! Channel multiplexer for a session
//!
//! Creates direct-tcpip channels on top of a [`Session`] and routes
//! inbound channel messages to them. The routing table only holds weak
//! references: a channel belongs to whoever opened it and disappears from
//! routing once it is dropped or closed.

use super::Session;
use crate::channel::{ChannelCore, ChannelError, ChannelMessage, DirectChannel, Endpoint};
use crate::config::ChannelConfig;
use crate::protocol::{MessageType, ProtocolError};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, trace, warn};

/// Channel registry and factory for one session
pub struct Multiplexer {
    session: Arc<dyn Session>,
    config: ChannelConfig,
    /// Non-owning routing table, keyed by local channel id
    channels: Mutex<HashMap<u32, Weak<ChannelCore>>>,
}

impl Multiplexer {
    /// Create a multiplexer over `session`
    pub fn new(session: Arc<dyn Session>, config: ChannelConfig) -> Self {
        Self {
            session,
            config,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Underlying session
    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    /// Channel settings applied to new channels
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<u32, Weak<ChannelCore>>> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Allocate a direct-tcpip channel bound to (`remote`, `local`).
    ///
    /// The channel is registered for inbound routing but not opened.
    pub fn create_direct_channel(
        &self,
        remote: Endpoint,
        local: Endpoint,
    ) -> Result<DirectChannel, ChannelError> {
        let id = self.session.next_channel_id();
        let channel = DirectChannel::new(id, Arc::clone(&self.session), remote, local, &self.config)?;

        let mut channels = self.channels();
        channels.retain(|_, core| core.upgrade().is_some_and(|core| !core.is_closed()));
        if channels.insert(id, channel.downgrade()).is_some() {
            warn!("Channel id {} reused while still registered", id);
        }
        trace!("Registered channel {} ({} live)", id, channels.len());

        Ok(channel)
    }

    /// Decode and route one inbound packet payload
    pub async fn handle_packet(&self, packet: Bytes) -> Result<(), ChannelError> {
        let message = ChannelMessage::decode(packet)?;
        self.handle_message(message).await
    }

    /// Route one inbound message to its channel.
    ///
    /// Callers must feed messages in arrival order and wait for each call
    /// to return; data delivery relies on it.
    pub async fn handle_message(&self, message: ChannelMessage) -> Result<(), ChannelError> {
        let Some(id) = message.recipient_channel() else {
            // Inbound opens are not accepted on this side
            return Err(ProtocolError::UnexpectedMessage(MessageType::ChannelOpen).into());
        };
        let channel = match self.lookup(id) {
            Ok(channel) => channel,
            Err(e) => {
                if let ChannelMessage::OpenConfirmation { sender_channel, .. } = message {
                    // Nobody will ever close the peer's side otherwise
                    return self.reject_confirmation(id, sender_channel).await;
                }
                return Err(e);
            }
        };

        match message {
            ChannelMessage::OpenConfirmation {
                sender_channel,
                initial_window_size,
                max_packet_size,
                ..
            } => {
                channel
                    .handle_open_confirmation(sender_channel, initial_window_size, max_packet_size)
                    .await
            }
            ChannelMessage::OpenFailure {
                reason,
                description,
                ..
            } => {
                channel.handle_open_failure(reason, description).await;
                self.unregister(id);
                Ok(())
            }
            ChannelMessage::WindowAdjust { bytes_to_add, .. } => {
                channel.handle_window_adjust(bytes_to_add);
                Ok(())
            }
            ChannelMessage::Data { payload, .. } => channel.handle_data(payload).await,
            ChannelMessage::Eof { .. } => {
                channel.handle_eof().await;
                Ok(())
            }
            ChannelMessage::Close { .. } => {
                channel.handle_close().await;
                self.unregister(id);
                Ok(())
            }
            ChannelMessage::Open { .. } => {
                Err(ProtocolError::UnexpectedMessage(MessageType::ChannelOpen).into())
            }
        }
    }

    fn lookup(&self, id: u32) -> Result<Arc<ChannelCore>, ChannelError> {
        let mut channels = self.channels();
        match channels.get(&id).and_then(Weak::upgrade) {
            Some(channel) => Ok(channel),
            None => {
                if channels.remove(&id).is_some() {
                    debug!("Dropped routing entry for released channel {}", id);
                }
                Err(ChannelError::NotFound(id))
            }
        }
    }

    async fn reject_confirmation(&self, id: u32, sender_channel: u32) -> Result<(), ChannelError> {
        debug!(
            "Open confirmed for released channel {}, closing peer channel {}",
            id, sender_channel
        );
        let close = ChannelMessage::Close {
            recipient_channel: sender_channel,
        };
        let mut buf = self
            .session
            .create_buffer(close.message_type(), close.body_size_hint());
        close.encode_body(&mut buf);
        self.session.write_packet(buf).await?;
        Ok(())
    }

    fn unregister(&self, id: u32) {
        self.channels().remove(&id);
    }

    /// Number of channels still reachable and not closed
    pub fn channel_count(&self) -> usize {
        self.channels()
            .values()
            .filter(|core| core.upgrade().is_some_and(|core| !core.is_closed()))
            .count()
    }

    /// Close every live channel immediately, e.g. when the session ends
    pub async fn shutdown(&self) {
        let live: Vec<Arc<ChannelCore>> = {
            let mut channels = self.channels();
            let live = channels.values().filter_map(Weak::upgrade).collect();
            channels.clear();
            live
        };

        debug!("Closing {} channels on session shutdown", live.len());
        for channel in live {
            trace!("Closing channel {} on shutdown", channel.id());
            channel.close(true).await;
        }
    }
}
