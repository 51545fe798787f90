/*
    This file is part of tensorpc.

    tensorpc is free software: you can redistribute it and/or modify
    it under the terms of the GNU General Public License as published by
    the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.
*/

//! A length-prefixed byte-stream framing mode, independent of the
//! multi-frame wire protocol the rest of the crate uses. This is a separate,
//! optional mode for a hypothetical non-message-oriented transport and has
//! no dependents in the core.

use std::collections::VecDeque;
use std::io::{self, IoSlice, Read, Write};

use bytes::Bytes;

/// Incrementally writes one or more buffers to a stream as a single frame:
/// a 4-byte little-endian length prefix followed by the buffers
/// concatenated. Supports partial writes (e.g. a non-blocking socket)
/// across repeated [`SendBuffer::send`] calls.
pub struct SendBuffer {
    buffers: VecDeque<Bytes>,
    pos: usize,
}

impl SendBuffer {
    /// Frame `buffers` for sending. Panics if `buffers` is empty or any
    /// element is empty — these are caller bugs, not recoverable conditions.
    pub fn new(buffers: Vec<Bytes>) -> Self {
        assert!(!buffers.is_empty(), "SendBuffer requires at least one buffer");
        assert!(buffers.iter().all(|b| !b.is_empty()), "SendBuffer buffers must be non-empty");
        let length: usize = buffers.iter().map(Bytes::len).sum();

        let mut framed = VecDeque::with_capacity(buffers.len() + 1);
        framed.push_back(Bytes::copy_from_slice(&(length as u32).to_le_bytes()));
        framed.extend(buffers);
        SendBuffer { buffers: framed, pos: 0 }
    }

    /// Write as much as `writer` accepts in one vectored write, advancing
    /// past fully-written buffers. Returns the number of bytes written.
    pub fn send(&mut self, writer: &mut impl Write) -> io::Result<usize> {
        let Some(first) = self.buffers.front() else { return Ok(0) };
        let mut slices = Vec::with_capacity(self.buffers.len());
        slices.push(IoSlice::new(&first[self.pos..]));
        slices.extend(self.buffers.iter().skip(1).map(|b| IoSlice::new(b)));

        let written = writer.write_vectored(&slices)?;
        self.advance(written);
        Ok(written)
    }

    fn advance(&mut self, written: usize) {
        self.pos += written;
        while let Some(front) = self.buffers.front() {
            if self.pos >= front.len() {
                self.pos -= front.len();
                self.buffers.pop_front();
            } else {
                break;
            }
        }
    }

    /// Whether every buffer (including the length prefix) has been sent.
    pub fn done(&self) -> bool {
        self.buffers.is_empty()
    }
}

/// Incrementally reads one length-prefixed frame from a stream: a 4-byte
/// little-endian length, then that many bytes. `maxsize` bounds the
/// accepted length to guard against a corrupt or hostile prefix.
pub struct RecvBuffer {
    maxsize: usize,
    lenbuf: [u8; 4],
    lenpos: usize,
    buffer: Option<Vec<u8>>,
    pos: usize,
}

impl RecvBuffer {
    /// Start a new frame, rejecting any declared length over `maxsize`.
    pub fn new(maxsize: usize) -> Self {
        RecvBuffer { maxsize, lenbuf: [0u8; 4], lenpos: 0, buffer: None, pos: 0 }
    }

    /// Read as much as `reader` has available in one call, transitioning
    /// from reading the length prefix to reading the body once the prefix
    /// completes. Returns the number of bytes read.
    pub fn recv(&mut self, reader: &mut impl Read) -> io::Result<usize> {
        match &mut self.buffer {
            None => {
                let n = reader.read(&mut self.lenbuf[self.lenpos..])?;
                self.lenpos += n;
                if self.lenpos == 4 {
                    let length = u32::from_le_bytes(self.lenbuf) as usize;
                    if length == 0 || length > self.maxsize {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("frame length {length} outside (0, {}]", self.maxsize),
                        ));
                    }
                    self.buffer = Some(vec![0u8; length]);
                    self.pos = 0;
                }
                Ok(n)
            }
            Some(buffer) => {
                let n = reader.read(&mut buffer[self.pos..])?;
                self.pos += n;
                Ok(n)
            }
        }
    }

    /// Whether a full frame body has been read.
    pub fn done(&self) -> bool {
        self.buffer.as_ref().is_some_and(|b| self.pos == b.len())
    }

    /// The completed frame, if [`RecvBuffer::done`].
    pub fn result(&self) -> Option<&[u8]> {
        self.done().then(|| self.buffer.as_deref()).flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn send_then_recv_round_trips_a_single_buffer() {
        let mut send = SendBuffer::new(vec![Bytes::from_static(b"hello world")]);
        let mut wire = Vec::new();
        while !send.done() {
            send.send(&mut wire).unwrap();
        }

        let mut recv = RecvBuffer::new(1024);
        let mut cursor = Cursor::new(wire);
        while !recv.done() {
            recv.recv(&mut cursor).unwrap();
        }
        assert_eq!(recv.result(), Some(b"hello world".as_slice()));
    }

    #[test]
    fn send_concatenates_multiple_buffers_under_one_length_prefix() {
        let mut send = SendBuffer::new(vec![Bytes::from_static(b"abc"), Bytes::from_static(b"defgh")]);
        let mut wire = Vec::new();
        while !send.done() {
            send.send(&mut wire).unwrap();
        }
        assert_eq!(&wire[0..4], &8u32.to_le_bytes());
        assert_eq!(&wire[4..], b"abcdefgh");
    }

    #[test]
    fn recv_rejects_a_length_over_maxsize() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&100u32.to_le_bytes());
        let mut recv = RecvBuffer::new(10);
        let mut cursor = Cursor::new(wire);
        let err = recv.recv(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    #[should_panic]
    fn send_buffer_rejects_empty_input() {
        SendBuffer::new(vec![]);
    }
}
