//! BitTorrent protocol messages
//!
//! Defines all message types used in the BitTorrent protocol and their
//! wire encoding: a big-endian u32 length prefix, a one-byte id and the
//! payload. A zero-length frame is a keep-alive.

use anyhow::Result;
use bytes::{Buf, BufMut, BytesMut};
use tracing::{debug, trace};

use crate::error::TorrentError;

/// BitTorrent message IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    /// BEP10 extension protocol message
    Extended = 20,
}

/// BitTorrent protocol message
///
/// Frames with an id outside the known set decode to `Invalid`; the
/// dispatcher logs and drops them instead of tearing the connection down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bitfield: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Extended { ext_id: u8, payload: Vec<u8> },
    Invalid { id: u8 },
}

impl Message {
    /// Get the message ID (returns None for KeepAlive and Invalid)
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield { .. } => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
            Message::Extended { .. } => Some(MessageId::Extended),
            Message::KeepAlive | Message::Invalid { .. } => None,
        }
    }

    /// Get the message length (excluding the length prefix)
    pub fn length(&self) -> u32 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested
            | Message::Invalid { .. } => 1,
            Message::Have { .. } => 5,
            Message::Bitfield { bitfield } => 1 + bitfield.len() as u32,
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { block, .. } => 9 + block.len() as u32,
            Message::Extended { payload, .. } => 2 + payload.len() as u32,
        }
    }

    /// Serialize the message to bytes (including length prefix)
    pub fn serialize(&self) -> Vec<u8> {
        trace!("Serializing message: {:?}", self.message_id());
        let mut buf = BytesMut::with_capacity(4 + self.length() as usize);

        buf.put_u32(self.length());

        match self {
            Message::KeepAlive => {}
            Message::Choke => buf.put_u8(MessageId::Choke as u8),
            Message::Unchoke => buf.put_u8(MessageId::Unchoke as u8),
            Message::Interested => buf.put_u8(MessageId::Interested as u8),
            Message::NotInterested => buf.put_u8(MessageId::NotInterested as u8),
            Message::Have { piece_index } => {
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(*piece_index);
            }
            Message::Bitfield { bitfield } => {
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(bitfield);
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Extended { ext_id, payload } => {
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(*ext_id);
                buf.put_slice(payload);
            }
            Message::Invalid { id } => buf.put_u8(*id),
        }

        buf.to_vec()
    }

    /// Deserialize a message from bytes (including length prefix)
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut buf = BytesMut::from(data);

        if buf.len() < 4 {
            return Err(TorrentError::protocol_error("Message shorter than length prefix").into());
        }

        let length = buf.get_u32() as usize;

        if length == 0 {
            return Ok(Message::KeepAlive);
        }

        if buf.remaining() < length {
            return Err(TorrentError::protocol_error_with_source(
                "Truncated message payload",
                format!("expected {} bytes, got {}", length, buf.remaining()),
            )
            .into());
        }

        let id = buf.get_u8();

        match id {
            0 => Ok(Message::Choke),
            1 => Ok(Message::Unchoke),
            2 => Ok(Message::Interested),
            3 => Ok(Message::NotInterested),
            4 => {
                if buf.remaining() < 4 {
                    return Err(TorrentError::protocol_error_with_source(
                        "Have message too short",
                        format!("expected 4 bytes, got {}", buf.remaining()),
                    )
                    .into());
                }
                Ok(Message::Have {
                    piece_index: buf.get_u32(),
                })
            }
            5 => Ok(Message::Bitfield {
                bitfield: buf.to_vec(),
            }),
            6 => {
                if buf.remaining() < 12 {
                    return Err(TorrentError::protocol_error_with_source(
                        "Request message too short",
                        format!("expected 12 bytes, got {}", buf.remaining()),
                    )
                    .into());
                }
                Ok(Message::Request {
                    index: buf.get_u32(),
                    begin: buf.get_u32(),
                    length: buf.get_u32(),
                })
            }
            7 => {
                if buf.remaining() < 8 {
                    return Err(TorrentError::protocol_error_with_source(
                        "Piece message too short",
                        format!("expected at least 8 bytes, got {}", buf.remaining()),
                    )
                    .into());
                }
                Ok(Message::Piece {
                    index: buf.get_u32(),
                    begin: buf.get_u32(),
                    block: buf.to_vec(),
                })
            }
            8 => {
                if buf.remaining() < 12 {
                    return Err(TorrentError::protocol_error_with_source(
                        "Cancel message too short",
                        format!("expected 12 bytes, got {}", buf.remaining()),
                    )
                    .into());
                }
                Ok(Message::Cancel {
                    index: buf.get_u32(),
                    begin: buf.get_u32(),
                    length: buf.get_u32(),
                })
            }
            20 => {
                if buf.remaining() < 1 {
                    return Err(TorrentError::protocol_error("Extended message too short").into());
                }
                Ok(Message::Extended {
                    ext_id: buf.get_u8(),
                    payload: buf.to_vec(),
                })
            }
            other => {
                debug!("Unknown message id {}, mapping to Invalid", other);
                Ok(Message::Invalid { id: other })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_flag_messages() {
        for message in [
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
        ] {
            let serialized = message.serialize();
            assert_eq!(serialized.len(), 5);
            assert_eq!(Message::deserialize(&serialized).unwrap(), message);
        }
    }

    #[test]
    fn test_round_trip_keepalive() {
        let serialized = Message::KeepAlive.serialize();
        assert_eq!(serialized, vec![0, 0, 0, 0]);
        assert_eq!(
            Message::deserialize(&serialized).unwrap(),
            Message::KeepAlive
        );
    }

    #[test]
    fn test_round_trip_have() {
        let message = Message::Have { piece_index: 42 };
        assert_eq!(
            Message::deserialize(&message.serialize()).unwrap(),
            message
        );
    }

    #[test]
    fn test_round_trip_bitfield() {
        let message = Message::Bitfield {
            bitfield: vec![0b1010_0000, 0xFF],
        };
        assert_eq!(
            Message::deserialize(&message.serialize()).unwrap(),
            message
        );
    }

    #[test]
    fn test_round_trip_request_piece_cancel() {
        let messages = [
            Message::Request {
                index: 1,
                begin: 2,
                length: 3,
            },
            Message::Piece {
                index: 10,
                begin: 16384,
                block: vec![1, 2, 3, 4, 5],
            },
            Message::Cancel {
                index: 1,
                begin: 2,
                length: 3,
            },
        ];
        for message in messages {
            assert_eq!(
                Message::deserialize(&message.serialize()).unwrap(),
                message
            );
        }
    }

    #[test]
    fn test_round_trip_extended() {
        let message = Message::Extended {
            ext_id: 0,
            payload: b"d1:md11:ut_metadatai1eee".to_vec(),
        };
        assert_eq!(
            Message::deserialize(&message.serialize()).unwrap(),
            message
        );
    }

    #[test]
    fn test_unknown_id_maps_to_invalid() {
        // length 1, id 13 (not a known message)
        let data = [0, 0, 0, 1, 13];
        assert_eq!(
            Message::deserialize(&data).unwrap(),
            Message::Invalid { id: 13 }
        );
    }

    #[test]
    fn test_truncated_payload_rejected() {
        // Claims 12 payload bytes, carries 4.
        let data = [0, 0, 0, 13, 6, 0, 0, 0, 1];
        assert!(Message::deserialize(&data).is_err());
    }

    #[test]
    fn test_message_length() {
        assert_eq!(Message::KeepAlive.length(), 0);
        assert_eq!(Message::Choke.length(), 1);
        assert_eq!(Message::Have { piece_index: 0 }.length(), 5);
        assert_eq!(
            Message::Request {
                index: 0,
                begin: 0,
                length: 0
            }
            .length(),
            13
        );
        assert_eq!(
            Message::Piece {
                index: 0,
                begin: 0,
                block: vec![1, 2, 3]
            }
            .length(),
            12
        );
    }

    #[test]
    fn test_message_id() {
        assert_eq!(Message::Choke.message_id(), Some(MessageId::Choke));
        assert_eq!(
            Message::Extended {
                ext_id: 0,
                payload: vec![]
            }
            .message_id(),
            Some(MessageId::Extended)
        );
        assert_eq!(Message::KeepAlive.message_id(), None);
        assert_eq!(Message::Invalid { id: 99 }.message_id(), None);
    }
}
