/*
    This file is part of tensorpc.

    tensorpc is free software: you can redistribute it and/or modify
    it under the terms of the GNU General Public License as published by
    the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.
*/

//! Address parsing and the thin `zmq` wrappers `client_socket` and
//! `server_socket` build on. The DEALER/ROUTER fabric itself (reliable
//! delivery, per-peer FIFO, peer-identity framing) is someone else's
//! problem; this module is the narrow interface the core needs from it.

use bytes::Bytes;

use crate::error::RpcError;

/// A parsed `tcp://host:port` or `ipc:///path` address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Address {
    /// `tcp://host:port`.
    Tcp(String),
    /// `ipc:///path`.
    Ipc(String),
}

impl Address {
    /// Parse a `tcp://` or `ipc://` address string.
    pub fn parse(addr: &str) -> Result<Self, RpcError> {
        if let Some(rest) = addr.strip_prefix("tcp://") {
            Ok(Address::Tcp(rest.to_string()))
        } else if let Some(rest) = addr.strip_prefix("ipc://") {
            Ok(Address::Ipc(rest.to_string()))
        } else {
            Err(RpcError::Protocol(format!("unrecognized address scheme: {addr}")))
        }
    }

    /// The address a server should bind: `tcp://host:port` is rewritten to
    /// `tcp://*:port` so the ROUTER socket listens on all interfaces.
    pub fn as_bind_string(&self) -> String {
        match self {
            Address::Tcp(hostport) => {
                let port = hostport.rsplit(':').next().unwrap_or(hostport);
                format!("tcp://*:{port}")
            }
            Address::Ipc(path) => format!("ipc://{path}"),
        }
    }

    /// The address a client should connect to, as given.
    pub fn as_connect_string(&self) -> String {
        match self {
            Address::Tcp(hostport) => format!("tcp://{hostport}"),
            Address::Ipc(path) => format!("ipc://{path}"),
        }
    }
}

/// Opaque transport-level identity of a connected client, as seen by the
/// server: the raw ROUTER-prepended identity frame.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PeerId(pub Bytes);

/// Encode a client's 32-bit identity as a 16-byte big-endian frame:
/// `identity.to_be_bytes()` zero-padded on the left out to 16 bytes.
pub fn encode_identity(identity: u32) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf[12..].copy_from_slice(&identity.to_be_bytes());
    buf
}

pub(crate) fn zmq_context() -> zmq::Context {
    zmq::Context::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_address() {
        assert_eq!(Address::parse("tcp://localhost:5555").unwrap(), Address::Tcp("localhost:5555".into()));
    }

    #[test]
    fn parses_ipc_address() {
        assert_eq!(Address::parse("ipc:///tmp/sock").unwrap(), Address::Ipc("/tmp/sock".into()));
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(Address::parse("udp://localhost:1").is_err());
    }

    #[test]
    fn bind_string_rewrites_tcp_host_to_wildcard() {
        let addr = Address::parse("tcp://localhost:5555").unwrap();
        assert_eq!(addr.as_bind_string(), "tcp://*:5555");
    }

    #[test]
    fn identity_is_left_zero_padded_to_16_bytes() {
        let encoded = encode_identity(0x0102_0304);
        assert_eq!(encoded, [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 2, 3, 4]);
    }
}
