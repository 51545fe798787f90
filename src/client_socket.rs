/*
    This file is part of tensorpc.

    tensorpc is free software: you can redistribute it and/or modify
    it under the terms of the GNU General Public License as published by
    the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.
*/

//! The client-side connection state machine: connect/disconnect, call
//! dispatch, and keepalive.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, ReentrantMutex};

use crate::error::RpcError;
use crate::transport::{encode_identity, Address};
use crate::wire::{Message, RequestId};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

struct State {
    addr: Option<Address>,
    connected: bool,
    last_call_ts: Option<Instant>,
    last_ping_ts: Option<Instant>,
    last_response_ts: Option<Instant>,
}

/// Connection state machine for a single outgoing DEALER socket: connect
/// handshake, call/ping framing, keepalive, and receive demultiplex. All
/// sends and receives are mutually excluded on a per-socket reentrant lock
/// so that `receive()` can reply to a `PING` inline.
pub struct ClientSocket {
    socket: ReentrantMutex<RefCell<zmq::Socket>>,
    state: Mutex<State>,
    rid_counter: AtomicU64,
    /// Seconds between keepalive pings; `0` disables pinging.
    pings: Duration,
    /// Seconds of silence since the last call before the link is declared
    /// dead; `0` disables the liveness timeout.
    maxage: Duration,
}

fn elapsed_since(at: Option<Instant>, now: Instant) -> Duration {
    at.map(|t| now.saturating_duration_since(t)).unwrap_or(Duration::MAX)
}

impl ClientSocket {
    /// Create a disconnected client socket identified on the wire by the
    /// 16-byte big-endian encoding of `identity`.
    pub fn new(identity: u32, ipv6: bool, pings_secs: u64, maxage_secs: u64) -> Result<Self, RpcError> {
        let ctx = crate::transport::zmq_context();
        let socket = ctx.socket(zmq::DEALER)?;
        socket.set_identity(&encode_identity(identity))?;
        socket.set_ipv6(ipv6)?;
        socket.set_linger(0)?;
        socket.set_rcvhwm(0)?;
        socket.set_sndhwm(0)?;

        Ok(ClientSocket {
            socket: ReentrantMutex::new(RefCell::new(socket)),
            state: Mutex::new(State {
                addr: None,
                connected: false,
                last_call_ts: None,
                last_ping_ts: None,
                last_response_ts: None,
            }),
            rid_counter: AtomicU64::new(0),
            pings: Duration::from_secs(pings_secs),
            maxage: Duration::from_secs(maxage_secs),
        })
    }

    fn next_rid(&self) -> RequestId {
        self.rid_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Whether the socket has completed a handshake and not since
    /// disconnected.
    pub fn connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Connect to `addr`, disconnecting first if already connected. Blocks
    /// sending a `PING` and waiting for the matching `PONG` until `timeout`
    /// elapses.
    pub fn connect(&self, addr: &Address, timeout: Option<Duration>) -> Result<(), RpcError> {
        self.disconnect();

        let guard = self.socket.lock();
        guard.borrow().connect(&addr.as_connect_string())?;
        self.state.lock().addr = Some(addr.clone());

        let rid = self.next_rid();
        guard.borrow().send_multipart(Message::Ping { rid }.to_frames().iter().map(|b| b.to_vec()), 0)?;
        drop(guard);

        let start = Instant::now();
        loop {
            let guard = self.socket.lock();
            match guard.borrow().recv_multipart(zmq::DONTWAIT) {
                Ok(raw) => {
                    drop(guard);
                    let frames: Vec<Bytes> = raw.into_iter().map(Bytes::from).collect();
                    self.state.lock().last_response_ts = Some(Instant::now());
                    match Message::from_frames(&frames) {
                        Some(Message::Pong { rid: got }) if got == rid => {
                            self.state.lock().connected = true;
                            return Ok(());
                        }
                        Some(other) => return Err(RpcError::Protocol(format!("{other:?}"))),
                        None => return Err(RpcError::Protocol("undecodable message".into())),
                    }
                }
                Err(zmq::Error::EAGAIN) => drop(guard),
                Err(e) => return Err(e.into()),
            }
            if let Some(timeout) = timeout {
                if start.elapsed() >= timeout {
                    return Err(RpcError::Connect);
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Best-effort drop of the current address; clears `connected`.
    pub fn disconnect(&self) {
        let addr = self.state.lock().addr.take();
        if let Some(addr) = addr {
            let guard = self.socket.lock();
            let _ = guard.borrow().disconnect(&addr.as_connect_string());
        }
        self.state.lock().connected = false;
    }

    /// Send a `CALL` for `name` with the given payload frames, returning
    /// the request id assigned.
    pub fn send_call(&self, name: &str, payload: Vec<Bytes>) -> Result<RequestId, RpcError> {
        if !self.connected() {
            return Err(RpcError::NotConnected);
        }
        let rid = self.next_rid();
        let msg = Message::Call { rid, name: name.to_string(), payload };
        let guard = self.socket.lock();
        guard.borrow().send_multipart(msg.to_frames().iter().map(|b| b.to_vec()), 0)?;
        drop(guard);
        self.state.lock().last_call_ts = Some(Instant::now());
        Ok(rid)
    }

    /// Send a standalone `PING`, returning its request id.
    pub fn send_ping(&self) -> Result<RequestId, RpcError> {
        if !self.connected() {
            return Err(RpcError::NotConnected);
        }
        let rid = self.next_rid();
        let guard = self.socket.lock();
        guard.borrow().send_multipart(Message::Ping { rid }.to_frames().iter().map(|b| b.to_vec()), 0)?;
        drop(guard);
        self.state.lock().last_ping_ts = Some(Instant::now());
        Ok(rid)
    }

    /// Non-blocking receive. Returns `Ok(Some((rid, payload)))` for a
    /// `RESULT`; `Ok(None)` if nothing was ready or the frame was handled
    /// internally (`PING`/`PONG`); `Err` for protocol violations, remote
    /// errors and liveness timeouts.
    pub fn receive(&self) -> Result<Option<(RequestId, Vec<Bytes>)>, RpcError> {
        let guard = self.socket.lock();
        let raw = match guard.borrow().recv_multipart(zmq::DONTWAIT) {
            Ok(raw) => raw,
            Err(zmq::Error::EAGAIN) => {
                drop(guard);
                return self.poll_keepalive();
            }
            Err(e) => return Err(e.into()),
        };
        let now = Instant::now();
        self.state.lock().last_response_ts = Some(now);

        let frames: Vec<Bytes> = raw.into_iter().map(Bytes::from).collect();
        match Message::from_frames(&frames) {
            Some(Message::Ping { rid }) => {
                guard.borrow().send_multipart(Message::Pong { rid }.to_frames().iter().map(|b| b.to_vec()), 0)?;
                Ok(None)
            }
            Some(Message::Pong { .. }) => Ok(None),
            Some(Message::Result { rid, payload }) => Ok(Some((rid, payload))),
            Some(Message::Error { rid, text }) => Err(RpcError::Remote { rid, text }),
            Some(Message::Call { .. }) | None => Err(RpcError::Protocol("unexpected message on client socket".into())),
        }
    }

    fn poll_keepalive(&self) -> Result<Option<(RequestId, Vec<Bytes>)>, RpcError> {
        let now = Instant::now();
        let (last_call_ts, last_ping_ts, last_response_ts) = {
            let state = self.state.lock();
            (state.last_call_ts, state.last_ping_ts, state.last_response_ts)
        };

        if !self.pings.is_zero() {
            let since_ping_or_resp = elapsed_since(last_ping_ts, now).min(elapsed_since(last_response_ts, now));
            if since_ping_or_resp >= self.pings {
                self.send_ping()?;
            }
        }

        if !self.maxage.is_zero() {
            let since_call_or_resp = elapsed_since(last_call_ts, now).min(elapsed_since(last_response_ts, now));
            if since_call_or_resp >= self.maxage {
                return Err(RpcError::NotAlive {
                    since_call: elapsed_since(last_call_ts, now),
                    since_response: elapsed_since(last_response_ts, now),
                    since_ping: elapsed_since(last_ping_ts, now),
                });
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rid_counter_is_strictly_increasing() {
        let socket = ClientSocket::new(1, false, 0, 0).unwrap();
        let a = socket.next_rid();
        let b = socket.next_rid();
        let c = socket.next_rid();
        assert!(a < b && b < c);
    }

    #[test]
    fn not_connected_rejects_calls_and_pings() {
        let socket = ClientSocket::new(1, false, 0, 0).unwrap();
        assert!(matches!(socket.send_call("echo", vec![]), Err(RpcError::NotConnected)));
        assert!(matches!(socket.send_ping(), Err(RpcError::NotConnected)));
    }
}
