//! Channel message encoding/decoding
//!
//! Field order follows the connection protocol:
//! ```text
//! CHANNEL_OPEN          byte 90, string type, u32 sender, u32 window, u32 max packet,
//!                       string host, u32 port, string originator host, u32 originator port
//! OPEN_CONFIRMATION     byte 91, u32 recipient, u32 sender, u32 window, u32 max packet
//! OPEN_FAILURE          byte 92, u32 recipient, u32 reason, string description, string language
//! WINDOW_ADJUST         byte 93, u32 recipient, u32 bytes to add
//! DATA                  byte 94, u32 recipient, string payload
//! EOF / CLOSE           byte 96 / 97, u32 recipient
//! ```

use crate::protocol::{
    get_payload, get_string, get_u32, put_string, MessageType, ProtocolError, DIRECT_TCPIP,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// A decoded connection layer message addressed to a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Open {
        channel_type: String,
        sender_channel: u32,
        initial_window_size: u32,
        max_packet_size: u32,
        remote_host: String,
        remote_port: u32,
        originator_host: String,
        originator_port: u32,
    },
    OpenConfirmation {
        recipient_channel: u32,
        sender_channel: u32,
        initial_window_size: u32,
        max_packet_size: u32,
    },
    OpenFailure {
        recipient_channel: u32,
        reason: u32,
        description: String,
        language: String,
    },
    WindowAdjust {
        recipient_channel: u32,
        bytes_to_add: u32,
    },
    Data {
        recipient_channel: u32,
        payload: Bytes,
    },
    Eof {
        recipient_channel: u32,
    },
    Close {
        recipient_channel: u32,
    },
}

impl ChannelMessage {
    /// Build a direct-tcpip open request
    #[allow(clippy::too_many_arguments)]
    pub fn direct_tcpip_open(
        sender_channel: u32,
        initial_window_size: u32,
        max_packet_size: u32,
        remote_host: &str,
        remote_port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Self {
        ChannelMessage::Open {
            channel_type: DIRECT_TCPIP.to_string(),
            sender_channel,
            initial_window_size,
            max_packet_size,
            remote_host: remote_host.to_string(),
            remote_port,
            originator_host: originator_host.to_string(),
            originator_port,
        }
    }

    /// Message number of this message
    pub fn message_type(&self) -> MessageType {
        match self {
            ChannelMessage::Open { .. } => MessageType::ChannelOpen,
            ChannelMessage::OpenConfirmation { .. } => MessageType::ChannelOpenConfirmation,
            ChannelMessage::OpenFailure { .. } => MessageType::ChannelOpenFailure,
            ChannelMessage::WindowAdjust { .. } => MessageType::ChannelWindowAdjust,
            ChannelMessage::Data { .. } => MessageType::ChannelData,
            ChannelMessage::Eof { .. } => MessageType::ChannelEof,
            ChannelMessage::Close { .. } => MessageType::ChannelClose,
        }
    }

    /// Channel id on the receiving side (None for open requests)
    pub fn recipient_channel(&self) -> Option<u32> {
        match self {
            ChannelMessage::Open { .. } => None,
            ChannelMessage::OpenConfirmation {
                recipient_channel, ..
            }
            | ChannelMessage::OpenFailure {
                recipient_channel, ..
            }
            | ChannelMessage::WindowAdjust {
                recipient_channel, ..
            }
            | ChannelMessage::Data {
                recipient_channel, ..
            }
            | ChannelMessage::Eof { recipient_channel }
            | ChannelMessage::Close { recipient_channel } => Some(*recipient_channel),
        }
    }

    /// Rough encoded body size, used as a buffer size hint
    pub fn body_size_hint(&self) -> usize {
        match self {
            ChannelMessage::Open {
                channel_type,
                remote_host,
                originator_host,
                ..
            } => 36 + channel_type.len() + remote_host.len() + originator_host.len(),
            ChannelMessage::OpenFailure {
                description,
                language,
                ..
            } => 16 + description.len() + language.len(),
            ChannelMessage::Data { payload, .. } => 8 + payload.len(),
            _ => 16,
        }
    }

    /// Append the message body (everything after the message number)
    pub fn encode_body(&self, buf: &mut BytesMut) {
        match self {
            ChannelMessage::Open {
                channel_type,
                sender_channel,
                initial_window_size,
                max_packet_size,
                remote_host,
                remote_port,
                originator_host,
                originator_port,
            } => {
                put_string(buf, channel_type.as_bytes());
                buf.put_u32(*sender_channel);
                buf.put_u32(*initial_window_size);
                buf.put_u32(*max_packet_size);
                put_string(buf, remote_host.as_bytes());
                buf.put_u32(*remote_port);
                put_string(buf, originator_host.as_bytes());
                buf.put_u32(*originator_port);
            }
            ChannelMessage::OpenConfirmation {
                recipient_channel,
                sender_channel,
                initial_window_size,
                max_packet_size,
            } => {
                buf.put_u32(*recipient_channel);
                buf.put_u32(*sender_channel);
                buf.put_u32(*initial_window_size);
                buf.put_u32(*max_packet_size);
            }
            ChannelMessage::OpenFailure {
                recipient_channel,
                reason,
                description,
                language,
            } => {
                buf.put_u32(*recipient_channel);
                buf.put_u32(*reason);
                put_string(buf, description.as_bytes());
                put_string(buf, language.as_bytes());
            }
            ChannelMessage::WindowAdjust {
                recipient_channel,
                bytes_to_add,
            } => {
                buf.put_u32(*recipient_channel);
                buf.put_u32(*bytes_to_add);
            }
            ChannelMessage::Data {
                recipient_channel,
                payload,
            } => {
                buf.put_u32(*recipient_channel);
                put_string(buf, payload);
            }
            ChannelMessage::Eof { recipient_channel }
            | ChannelMessage::Close { recipient_channel } => {
                buf.put_u32(*recipient_channel);
            }
        }
    }

    /// Encode a full packet payload: message number followed by the body
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(1 + self.body_size_hint());
        buf.put_u8(self.message_type() as u8);
        self.encode_body(&mut buf);
        buf
    }

    /// Decode a packet payload starting with the message number
    pub fn decode(mut buf: Bytes) -> Result<Self, ProtocolError> {
        if !buf.has_remaining() {
            return Err(ProtocolError::EmptyPacket);
        }

        let message_type = MessageType::try_from(buf.get_u8())?;
        let message = match message_type {
            MessageType::ChannelOpen => ChannelMessage::Open {
                channel_type: get_string(&mut buf)?,
                sender_channel: get_u32(&mut buf)?,
                initial_window_size: get_u32(&mut buf)?,
                max_packet_size: get_u32(&mut buf)?,
                remote_host: get_string(&mut buf)?,
                remote_port: get_u32(&mut buf)?,
                originator_host: get_string(&mut buf)?,
                originator_port: get_u32(&mut buf)?,
            },
            MessageType::ChannelOpenConfirmation => ChannelMessage::OpenConfirmation {
                recipient_channel: get_u32(&mut buf)?,
                sender_channel: get_u32(&mut buf)?,
                initial_window_size: get_u32(&mut buf)?,
                max_packet_size: get_u32(&mut buf)?,
            },
            MessageType::ChannelOpenFailure => {
                let recipient_channel = get_u32(&mut buf)?;
                let reason = get_u32(&mut buf)?;
                let description = get_string(&mut buf)?;
                // Some peers omit the language tag
                let language = if buf.has_remaining() {
                    get_string(&mut buf)?
                } else {
                    String::new()
                };
                ChannelMessage::OpenFailure {
                    recipient_channel,
                    reason,
                    description,
                    language,
                }
            }
            MessageType::ChannelWindowAdjust => ChannelMessage::WindowAdjust {
                recipient_channel: get_u32(&mut buf)?,
                bytes_to_add: get_u32(&mut buf)?,
            },
            MessageType::ChannelData => ChannelMessage::Data {
                recipient_channel: get_u32(&mut buf)?,
                payload: get_payload(&mut buf)?,
            },
            MessageType::ChannelEof => ChannelMessage::Eof {
                recipient_channel: get_u32(&mut buf)?,
            },
            MessageType::ChannelClose => ChannelMessage::Close {
                recipient_channel: get_u32(&mut buf)?,
            },
            MessageType::ChannelExtendedData => {
                return Err(ProtocolError::UnexpectedMessage(message_type))
            }
        };

        Ok(message)
    }
}
