//! The notification-channel wire frame (spec §6, "Notification wire
//! frame"; §4.7).
//!
//! `{type: u8, size: u32 LE, fds: u32 LE}` followed by `size` payload
//! bytes; file descriptors ride ancillary and are represented here only
//! as a count, never decoded — the core treats both the condition and
//! notification payloads as opaque bytes belonging to the filter-bytecode
//! IR and viewer protocol layers (out of scope, §1).

use crate::error::{RelayError, Result};

pub const HEADER_LEN: usize = 1 + 4 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Handshake,
    Subscribe,
    Unsubscribe,
    CommandReply,
    Notification,
    NotificationDropped,
}

impl MessageType {
    fn to_u8(self) -> u8 {
        match self {
            MessageType::Handshake => 0,
            MessageType::Subscribe => 1,
            MessageType::Unsubscribe => 2,
            MessageType::CommandReply => 3,
            MessageType::Notification => 4,
            MessageType::NotificationDropped => 5,
        }
    }

    fn from_u8(byte: u8) -> Result<Self> {
        Ok(match byte {
            0 => MessageType::Handshake,
            1 => MessageType::Subscribe,
            2 => MessageType::Unsubscribe,
            3 => MessageType::CommandReply,
            4 => MessageType::Notification,
            5 => MessageType::NotificationDropped,
            other => {
                return Err(RelayError::ProtocolViolation(format!(
                    "unknown message type {other}"
                )))
            }
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MessageHeader {
    pub msg_type: MessageType,
    pub size: u32,
    pub fds: u32,
}

/// Header size this channel will accept; a larger declared `size` is a
/// protocol violation rather than an allocation attempt (spec §7,
/// "oversize header").
pub const MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

impl MessageHeader {
    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = self.msg_type.to_u8();
        buf[1..5].copy_from_slice(&self.size.to_le_bytes());
        buf[5..9].copy_from_slice(&self.fds.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: [u8; HEADER_LEN]) -> Result<Self> {
        let msg_type = MessageType::from_u8(buf[0])?;
        let size = u32::from_le_bytes(buf[1..5].try_into().expect("slice is 4 bytes"));
        let fds = u32::from_le_bytes(buf[5..9].try_into().expect("slice is 4 bytes"));
        if size > MAX_PAYLOAD_LEN {
            return Err(RelayError::ProtocolViolation(format!(
                "oversize payload: {size} bytes"
            )));
        }
        Ok(Self { msg_type, size, fds })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let header = MessageHeader {
            msg_type: MessageType::Notification,
            size: 42,
            fds: 0,
        };
        let decoded = MessageHeader::from_bytes(header.to_bytes()).unwrap();
        assert_eq!(decoded.msg_type, MessageType::Notification);
        assert_eq!(decoded.size, 42);
    }

    #[test]
    fn oversize_declared_payload_is_a_protocol_violation() {
        let mut buf = MessageHeader {
            msg_type: MessageType::Subscribe,
            size: 0,
            fds: 0,
        }
        .to_bytes();
        buf[1..5].copy_from_slice(&(MAX_PAYLOAD_LEN + 1).to_le_bytes());
        assert!(matches!(
            MessageHeader::from_bytes(buf),
            Err(RelayError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn unknown_message_type_is_a_protocol_violation() {
        let mut buf = MessageHeader {
            msg_type: MessageType::Handshake,
            size: 0,
            fds: 0,
        }
        .to_bytes();
        buf[0] = 200;
        assert!(matches!(
            MessageHeader::from_bytes(buf),
            Err(RelayError::ProtocolViolation(_))
        ));
    }
}
