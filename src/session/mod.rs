//! Session layer seam
//!
//! The encrypted transport, key exchange and packet framing belong to the
//! session. Channels only need the narrow capability described by
//! [`Session`]: build a packet buffer, write it, hand out channel ids and
//! report whether the session is gone.

mod loopback;
mod multiplexer;

pub use loopback::{spawn_loopback, LoopbackPeer, LoopbackSession};
pub use multiplexer::Multiplexer;

use crate::protocol::MessageType;
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use thiserror::Error;

/// Session errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session has been closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Capability a session provides to its channels
#[async_trait]
pub trait Session: Send + Sync {
    /// Allocate a packet buffer with the message number already written
    fn create_buffer(&self, message: MessageType, size_hint: usize) -> BytesMut {
        let mut buf = BytesMut::with_capacity(1 + size_hint);
        buf.put_u8(message as u8);
        buf
    }

    /// Queue a packet for transmission, in call order
    async fn write_packet(&self, buffer: BytesMut) -> Result<(), SessionError>;

    /// Allocate a session-unique channel id
    fn next_channel_id(&self) -> u32;

    /// Check if the session has been closed
    fn is_closed(&self) -> bool;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Session double recording every packet it is asked to send

    use super::{Session, SessionError};
    use crate::channel::ChannelMessage;
    use async_trait::async_trait;
    use bytes::BytesMut;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct RecordingSession {
        packets: Mutex<Vec<BytesMut>>,
        next_id: AtomicU32,
        closed: AtomicBool,
    }

    impl RecordingSession {
        pub(crate) fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        pub(crate) fn sent(&self) -> Vec<ChannelMessage> {
            self.packets
                .lock()
                .unwrap()
                .iter()
                .map(|p| ChannelMessage::decode(p.clone().freeze()).unwrap())
                .collect()
        }
    }

    #[async_trait]
    impl Session for RecordingSession {
        async fn write_packet(&self, buffer: BytesMut) -> Result<(), SessionError> {
            if self.is_closed() {
                return Err(SessionError::Closed);
            }
            self.packets.lock().unwrap().push(buffer);
            Ok(())
        }

        fn next_channel_id(&self) -> u32 {
            self.next_id.fetch_add(1, Ordering::SeqCst)
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }
}
