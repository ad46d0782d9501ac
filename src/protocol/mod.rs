//! Protocol definitions and constants
//!
//! Message numbers and wire helpers for the connection layer of the
//! secure shell protocol. Packet framing, encryption and MAC live in the
//! session transport and are not handled here.

use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("Unexpected message: {0:?}")]
    UnexpectedMessage(MessageType),

    #[error("Truncated message: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("Empty packet")]
    EmptyPacket,

    #[error("Invalid string field: {0}")]
    InvalidString(String),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),
}

/// Connection layer message numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    ChannelOpen = 90,
    ChannelOpenConfirmation = 91,
    ChannelOpenFailure = 92,
    ChannelWindowAdjust = 93,
    ChannelData = 94,
    ChannelExtendedData = 95,
    ChannelEof = 96,
    ChannelClose = 97,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            90 => Ok(MessageType::ChannelOpen),
            91 => Ok(MessageType::ChannelOpenConfirmation),
            92 => Ok(MessageType::ChannelOpenFailure),
            93 => Ok(MessageType::ChannelWindowAdjust),
            94 => Ok(MessageType::ChannelData),
            95 => Ok(MessageType::ChannelExtendedData),
            96 => Ok(MessageType::ChannelEof),
            97 => Ok(MessageType::ChannelClose),
            _ => Err(ProtocolError::InvalidMessageType(value)),
        }
    }
}

/// Reason codes carried by SSH_MSG_CHANNEL_OPEN_FAILURE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum OpenFailureReason {
    AdministrativelyProhibited = 1,
    ConnectFailed = 2,
    UnknownChannelType = 3,
    ResourceShortage = 4,
}

impl OpenFailureReason {
    /// Map a wire code to a known reason, if any
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::AdministrativelyProhibited),
            2 => Some(Self::ConnectFailed),
            3 => Some(Self::UnknownChannelType),
            4 => Some(Self::ResourceShortage),
            _ => None,
        }
    }
}

/// Channel type used to tunnel a TCP connection
pub const DIRECT_TCPIP: &str = "direct-tcpip";

/// Upper bound on any single string field we are willing to decode
pub const MAX_STRING_LEN: usize = 256 * 1024;

/// Append an SSH `string` (u32 length followed by the bytes)
pub fn put_string<B: BufMut>(buf: &mut B, value: &[u8]) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

/// Read a big-endian u32, failing instead of panicking on short input
pub fn get_u32(buf: &mut Bytes) -> Result<u32, ProtocolError> {
    ensure_remaining(buf, 4)?;
    Ok(buf.get_u32())
}

/// Read an SSH `string` as raw bytes
pub fn get_bytes(buf: &mut Bytes) -> Result<Bytes, ProtocolError> {
    let len = get_u32(buf)? as usize;
    if len > MAX_STRING_LEN {
        return Err(ProtocolError::MessageTooLarge(len));
    }
    ensure_remaining(buf, len)?;
    Ok(buf.split_to(len))
}

/// Read a length-prefixed data payload.
///
/// Only bounded by the packet it came in; channel data is limited by the
/// negotiated packet size, not by [`MAX_STRING_LEN`].
pub fn get_payload(buf: &mut Bytes) -> Result<Bytes, ProtocolError> {
    let len = get_u32(buf)? as usize;
    ensure_remaining(buf, len)?;
    Ok(buf.split_to(len))
}

/// Read an SSH `string` that must be valid UTF-8
pub fn get_string(buf: &mut Bytes) -> Result<String, ProtocolError> {
    let raw = get_bytes(buf)?;
    String::from_utf8(raw.to_vec()).map_err(|e| ProtocolError::InvalidString(e.to_string()))
}

fn ensure_remaining(buf: &Bytes, needed: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < needed {
        return Err(ProtocolError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_string_helpers() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, b"direct-tcpip");
        buf.put_u32(7);

        let mut bytes = buf.freeze();
        assert_eq!(get_string(&mut bytes).unwrap(), "direct-tcpip");
        assert_eq!(get_u32(&mut bytes).unwrap(), 7);
        assert!(matches!(
            get_u32(&mut bytes),
            Err(ProtocolError::Truncated { needed: 4, remaining: 0 })
        ));
    }

    #[test]
    fn test_truncated_string() {
        let mut buf = BytesMut::new();
        buf.put_u32(10);
        buf.put_slice(b"abc");

        let mut bytes = buf.freeze();
        assert!(matches!(
            get_string(&mut bytes),
            Err(ProtocolError::Truncated { needed: 10, remaining: 3 })
        ));
    }

    #[test]
    fn test_payload_not_capped_like_strings() {
        let data = vec![0xabu8; MAX_STRING_LEN + 1];
        let mut buf = BytesMut::new();
        put_string(&mut buf, &data);
        let frozen = buf.freeze();

        let mut bytes = frozen.clone();
        assert!(matches!(
            get_bytes(&mut bytes),
            Err(ProtocolError::MessageTooLarge(_))
        ));

        let mut bytes = frozen;
        assert_eq!(get_payload(&mut bytes).unwrap().len(), MAX_STRING_LEN + 1);
        assert!(!bytes.has_remaining());
    }

    #[test]
    fn test_message_type_codes() {
        assert_eq!(MessageType::try_from(94).unwrap(), MessageType::ChannelData);
        assert!(matches!(
            MessageType::try_from(20),
            Err(ProtocolError::InvalidMessageType(20))
        ));
        assert_eq!(
            OpenFailureReason::from_code(2),
            Some(OpenFailureReason::ConnectFailed)
        );
        assert_eq!(OpenFailureReason::from_code(42), None);
    }
}
