/*
    This file is part of tensorpc.

    tensorpc is free software: you can redistribute it and/or modify
    it under the terms of the GNU General Public License as published by
    the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.
*/

//! Wire framing: the byte-level shape of the five message types sockets
//! exchange, independent of transport.

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;

/// An 8-byte big-endian request id, unique per [`crate::client_socket::ClientSocket`]
/// lifetime.
pub type RequestId = u64;

pub(crate) fn encode_rid(rid: RequestId) -> Bytes {
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, rid);
    Bytes::copy_from_slice(&buf)
}

pub(crate) fn decode_rid(frame: &[u8]) -> Option<RequestId> {
    if frame.len() != 8 {
        return None;
    }
    Some(BigEndian::read_u64(frame))
}

/// The one-byte message type tag that is always `frame[0]` on the wire.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Type {
    /// `[rid]`
    Ping = 0x01,
    /// `[rid]`
    Pong = 0x02,
    /// `[rid, name, payload...]`
    Call = 0x03,
    /// `[rid, payload...]`
    Result = 0x04,
    /// `[rid, text]`
    Error = 0x05,
}

impl Type {
    pub(crate) fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Type::Ping),
            0x02 => Some(Type::Pong),
            0x03 => Some(Type::Call),
            0x04 => Some(Type::Result),
            0x05 => Some(Type::Error),
            _ => None,
        }
    }

    pub(crate) fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A decoded protocol message, independent of which socket role received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Liveness probe.
    Ping { rid: RequestId },
    /// Reply to a `Ping`.
    Pong { rid: RequestId },
    /// A method invocation.
    Call { rid: RequestId, name: String, payload: Vec<Bytes> },
    /// A successful reply.
    Result { rid: RequestId, payload: Vec<Bytes> },
    /// A failed reply.
    Error { rid: RequestId, text: String },
}

impl Message {
    /// `rid` is present on every message variant.
    pub fn rid(&self) -> RequestId {
        match self {
            Message::Ping { rid }
            | Message::Pong { rid }
            | Message::Call { rid, .. }
            | Message::Result { rid, .. }
            | Message::Error { rid, .. } => *rid,
        }
    }

    /// Encode to the frame sequence `[type, rid, ...]` this message
    /// represents on the wire (before any peer-identity frame the transport
    /// fabric prepends).
    pub fn to_frames(&self) -> Vec<Bytes> {
        match self {
            Message::Ping { rid } => vec![Bytes::from_static(&[Type::Ping.as_byte()]), encode_rid(*rid)],
            Message::Pong { rid } => vec![Bytes::from_static(&[Type::Pong.as_byte()]), encode_rid(*rid)],
            Message::Call { rid, name, payload } => {
                let mut frames = vec![
                    Bytes::from_static(&[Type::Call.as_byte()]),
                    encode_rid(*rid),
                    Bytes::from(name.clone().into_bytes()),
                ];
                frames.extend(payload.iter().cloned());
                frames
            }
            Message::Result { rid, payload } => {
                let mut frames = vec![Bytes::from_static(&[Type::Result.as_byte()]), encode_rid(*rid)];
                frames.extend(payload.iter().cloned());
                frames
            }
            Message::Error { rid, text } => vec![
                Bytes::from_static(&[Type::Error.as_byte()]),
                encode_rid(*rid),
                Bytes::from(text.clone().into_bytes()),
            ],
        }
    }

    /// Decode a frame sequence (without the leading peer-identity frame, if
    /// any) into a [`Message`]. Returns `None` on an unrecognized type byte
    /// or malformed rid, which callers surface as `ProtocolError`.
    pub fn from_frames(frames: &[Bytes]) -> Option<Message> {
        let (type_frame, rest) = frames.split_first()?;
        if type_frame.len() != 1 {
            return None;
        }
        let ty = Type::from_byte(type_frame[0])?;
        let (rid_frame, rest) = rest.split_first()?;
        let rid = decode_rid(rid_frame)?;

        match ty {
            Type::Ping if rest.is_empty() => Some(Message::Ping { rid }),
            Type::Pong if rest.is_empty() => Some(Message::Pong { rid }),
            Type::Call => {
                let (name_frame, payload) = rest.split_first()?;
                let name = String::from_utf8(name_frame.to_vec()).ok()?;
                Some(Message::Call { rid, name, payload: payload.to_vec() })
            }
            Type::Result => Some(Message::Result { rid, payload: rest.to_vec() }),
            Type::Error => {
                let text_frame = rest.first()?;
                let text = String::from_utf8(text_frame.to_vec()).ok()?;
                Some(Message::Error { rid, text })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rid_is_big_endian_and_roundtrips() {
        let rid: RequestId = 0x0102_0304_0506_0708;
        let encoded = encode_rid(rid);
        assert_eq!(&encoded[..], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(decode_rid(&encoded), Some(rid));
    }

    #[test]
    fn call_roundtrips_through_frames() {
        let msg = Message::Call {
            rid: 42,
            name: "echo".into(),
            payload: vec![Bytes::from_static(b"meta"), Bytes::from_static(b"buf")],
        };
        let frames = msg.to_frames();
        assert_eq!(Message::from_frames(&frames), Some(msg));
    }

    #[test]
    fn ping_with_trailing_frames_is_rejected() {
        let frames = vec![
            Bytes::from_static(&[Type::Ping.as_byte()]),
            encode_rid(1),
            Bytes::from_static(b"unexpected"),
        ];
        assert_eq!(Message::from_frames(&frames), None);
    }

    #[test]
    fn unknown_type_byte_is_rejected() {
        let frames = vec![Bytes::from_static(&[0xFF]), encode_rid(1)];
        assert_eq!(Message::from_frames(&frames), None);
    }
}
