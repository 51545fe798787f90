/*
    This file is part of tensorpc.

    tensorpc is free software: you can redistribute it and/or modify
    it under the terms of the GNU General Public License as published by
    the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.
*/

//! The server-side binding: a ROUTER socket fanning in calls from many
//! peers, plus per-peer liveness tracking.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, ReentrantMutex};

use crate::error::RpcError;
use crate::transport::{Address, PeerId};
use crate::wire::{Message, RequestId};

struct PeerState {
    last_seen: Instant,
    last_ping_ts: Option<Instant>,
}

/// A request pulled off the wire together with the peer it came from.
pub enum Incoming {
    /// A method invocation.
    Call { peer: PeerId, rid: RequestId, name: String, payload: Vec<Bytes> },
    /// A peer's reply to a ping the server sent it.
    Pong { peer: PeerId, rid: RequestId },
}

/// Binding side of the DEALER/ROUTER fabric: one ROUTER socket fanning in
/// calls from many clients. Tracks per-peer `last_seen` so dead peers can be
/// dropped from the liveness map without the caller threading timers
/// through every call site.
pub struct ServerSocket {
    socket: ReentrantMutex<RefCell<zmq::Socket>>,
    peers: Mutex<HashMap<PeerId, PeerState>>,
    rid_counter: AtomicU64,
}

impl ServerSocket {
    /// Bind a ROUTER socket at `addr`.
    pub fn bind(addr: &Address, ipv6: bool) -> Result<Self, RpcError> {
        let ctx = crate::transport::zmq_context();
        let socket = ctx.socket(zmq::ROUTER)?;
        socket.set_ipv6(ipv6)?;
        socket.set_linger(0)?;
        socket.set_rcvhwm(0)?;
        socket.set_sndhwm(0)?;
        socket.bind(&addr.as_bind_string())?;

        Ok(ServerSocket {
            socket: ReentrantMutex::new(RefCell::new(socket)),
            peers: Mutex::new(HashMap::new()),
            rid_counter: AtomicU64::new(0),
        })
    }

    fn touch(&self, peer: &PeerId) {
        self.peers
            .lock()
            .entry(peer.clone())
            .or_insert_with(|| PeerState { last_seen: Instant::now(), last_ping_ts: None })
            .last_seen = Instant::now();
    }

    /// Non-blocking receive. `PING`s are answered inline (so the calling
    /// worker loop never has to special-case them) and do not surface to the
    /// caller; `CALL`s and `PONG`s are returned for dispatch.
    pub fn receive(&self) -> Result<Option<Incoming>, RpcError> {
        let guard = self.socket.lock();
        let raw = match guard.borrow().recv_multipart(zmq::DONTWAIT) {
            Ok(raw) => raw,
            Err(zmq::Error::EAGAIN) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let (peer_frame, rest) = raw.split_first().ok_or_else(|| RpcError::Protocol("missing peer frame".into()))?;
        let peer = PeerId(Bytes::from(peer_frame.clone()));
        self.touch(&peer);

        let frames: Vec<Bytes> = rest.iter().cloned().map(Bytes::from).collect();
        match Message::from_frames(&frames) {
            Some(Message::Ping { rid }) => {
                self.send_frames(&peer, Message::Pong { rid }.to_frames())?;
                Ok(None)
            }
            Some(Message::Pong { rid }) => Ok(Some(Incoming::Pong { peer, rid })),
            Some(Message::Call { rid, name, payload }) => Ok(Some(Incoming::Call { peer, rid, name, payload })),
            Some(Message::Result { rid, .. }) | Some(Message::Error { rid, .. }) => {
                self.send_error(&peer, rid, "unexpected type")?;
                Ok(None)
            }
            None => match frames.get(1).and_then(|rid_frame| crate::wire::decode_rid(rid_frame)) {
                Some(rid) => {
                    self.send_error(&peer, rid, "unexpected type")?;
                    Ok(None)
                }
                None => Err(RpcError::Protocol("undecodable message on server socket".into())),
            },
        }
    }

    fn send_frames(&self, peer: &PeerId, mut frames: Vec<Bytes>) -> Result<(), RpcError> {
        frames.insert(0, peer.0.clone());
        let guard = self.socket.lock();
        guard.borrow().send_multipart(frames.iter().map(|b| b.to_vec()), 0)?;
        Ok(())
    }

    /// Reply to `rid` with a successful result.
    pub fn send_result(&self, peer: &PeerId, rid: RequestId, payload: Vec<Bytes>) -> Result<(), RpcError> {
        self.send_frames(peer, Message::Result { rid, payload }.to_frames())
    }

    /// Reply to `rid` with a failure.
    pub fn send_error(&self, peer: &PeerId, rid: RequestId, text: impl Into<String>) -> Result<(), RpcError> {
        self.send_frames(peer, Message::Error { rid, text: text.into() }.to_frames())
    }

    /// Send a keepalive `PING` to `peer`, returning its request id.
    pub fn send_ping(&self, peer: &PeerId) -> Result<RequestId, RpcError> {
        let rid = self.rid_counter.fetch_add(1, Ordering::SeqCst);
        if let Some(state) = self.peers.lock().get_mut(peer) {
            state.last_ping_ts = Some(Instant::now());
        }
        self.send_frames(peer, Message::Ping { rid }.to_frames())?;
        Ok(rid)
    }

    /// Peers whose `last_seen` is older than `maxage`. The caller is
    /// expected to ping or drop these; the socket itself never evicts a peer.
    pub fn stale_peers(&self, maxage: Duration) -> Vec<PeerId> {
        let now = Instant::now();
        self.peers
            .lock()
            .iter()
            .filter(|(_, state)| now.saturating_duration_since(state.last_seen) >= maxage)
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    /// Peers that have not been pinged in `pings` time (or never).
    pub fn peers_due_for_ping(&self, pings: Duration) -> Vec<PeerId> {
        let now = Instant::now();
        self.peers
            .lock()
            .iter()
            .filter(|(_, state)| {
                state.last_ping_ts.map(|t| now.saturating_duration_since(t) >= pings).unwrap_or(true)
            })
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    /// Forget a peer, e.g. after it is declared dead.
    pub fn forget(&self, peer: &PeerId) {
        self.peers.lock().remove(peer);
    }

    /// Currently tracked peers.
    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_peers_starts_empty() {
        let socket = ServerSocket::bind(&Address::Tcp("127.0.0.1:0".into()), false).unwrap();
        assert!(socket.stale_peers(Duration::from_secs(0)).is_empty());
        assert!(socket.peers().is_empty());
    }

    #[test]
    fn touch_registers_a_new_peer() {
        let socket = ServerSocket::bind(&Address::Tcp("127.0.0.1:0".into()), false).unwrap();
        let peer = PeerId(Bytes::from_static(b"peer-a"));
        socket.touch(&peer);
        assert_eq!(socket.peers(), vec![peer]);
    }

    #[test]
    fn forget_removes_a_peer() {
        let socket = ServerSocket::bind(&Address::Tcp("127.0.0.1:0".into()), false).unwrap();
        let peer = PeerId(Bytes::from_static(b"peer-a"));
        socket.touch(&peer);
        socket.forget(&peer);
        assert!(socket.peers().is_empty());
    }
}
