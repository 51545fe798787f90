/*
    This file is part of tensorpc.

    tensorpc is free software: you can redistribute it and/or modify
    it under the terms of the GNU General Public License as published by
    the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.
*/

//! The high-level `Client`: futures, a bounded in-flight window, FIFO error
//! draining, and pluggable address resolvers.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::codec::{self, Tree};
use crate::client_socket::ClientSocket;
use crate::error::{RpcError, SharedError};
use crate::transport::Address;
use crate::wire::RequestId;

/// A single predicate/rewrite pair applied to a connect address, in order;
/// first match wins.
pub type Resolver = (Box<dyn Fn(&str) -> bool + Send + Sync>, Box<dyn Fn(&str) -> String + Send + Sync>);

const INFLIGHT_POLL: Duration = Duration::from_millis(1);
const RESULT_POLL: Duration = Duration::from_millis(1);
const MAX_OUTSTANDING: usize = 1000;

/// Construction options for [`Client`].
pub struct ClientConfig {
    /// Human-readable name used in log lines.
    pub name: String,
    /// Whether to use IPv6 for the underlying socket.
    pub ipv6: bool,
    /// Wire identity; a random `u32` is chosen if `None`.
    pub identity: Option<u32>,
    /// Seconds between keepalive pings; `0` disables pinging.
    pub pings: u64,
    /// Seconds of silence before the link is declared dead; `0` disables.
    pub maxage: u64,
    /// Bound on concurrent unresolved calls; `0` disables the window.
    pub maxinflight: usize,
    /// Whether to surface worker errors via FIFO queue draining.
    pub errors: bool,
    /// Whether to connect immediately in [`Client::new`].
    pub connect: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            name: "Client".to_string(),
            ipv6: false,
            identity: None,
            pings: 10,
            maxage: 120,
            maxinflight: 16,
            errors: true,
            connect: false,
        }
    }
}

enum Status {
    Pending,
    Ok(Tree),
    Err(SharedError),
}

struct FutureInner {
    state: Mutex<Status>,
}

impl FutureInner {
    fn is_done(&self) -> bool {
        !matches!(*self.state.lock(), Status::Pending)
    }

    fn try_take(&self) -> Option<Result<Tree, SharedError>> {
        match &*self.state.lock() {
            Status::Pending => None,
            Status::Ok(tree) => Some(Ok(tree.clone())),
            Status::Err(err) => Some(Err(err.clone())),
        }
    }

    fn resolve(&self, result: Result<Tree, SharedError>) {
        let mut state = self.state.lock();
        if matches!(*state, Status::Pending) {
            *state = match result {
                Ok(tree) => Status::Ok(tree),
                Err(err) => Status::Err(err),
            };
        }
    }
}

/// A pending call's outcome. Polled explicitly ([`Future::check`]) or
/// blocked on ([`Future::result`]); both drive the client's receive loop,
/// so any in-flight `Future` can end up resolving others as a side effect.
pub struct Future {
    rid: RequestId,
    inner: Arc<FutureInner>,
    client: Arc<ClientInner>,
}

impl Future {
    /// The request id this future is waiting on.
    pub fn rid(&self) -> RequestId {
        self.rid
    }

    /// Non-blocking: poll the socket once if still pending.
    pub fn check(&self) -> bool {
        if !self.inner.is_done() {
            self.client.poll_once();
        }
        self.inner.is_done()
    }

    /// Whether this future has reached a terminal state.
    pub fn done(&self) -> bool {
        self.inner.is_done()
    }

    /// Block, polling the socket, until this future resolves.
    pub fn result(&self) -> Result<Tree, SharedError> {
        loop {
            if let Some(result) = self.inner.try_take() {
                return result;
            }
            self.client.poll_once();
            if let Some(result) = self.inner.try_take() {
                return result;
            }
            std::thread::sleep(RESULT_POLL);
        }
    }
}

/// Point-in-time counters surfaced by [`Client::stats`]; no rendering, just
/// the bookkeeping a caller might want to export elsewhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientStats {
    /// Futures still tracked in the weak registry.
    pub futures: usize,
    /// Futures held strongly in the in-flight queue.
    pub inflight: usize,
    /// Total `CALL`s sent over the lifetime of this client.
    pub calls_sent: u64,
    /// Total `RESULT`/`ERROR` frames received.
    pub results_received: u64,
}

struct ClientInner {
    socket: ClientSocket,
    name: String,
    maxinflight: usize,
    errors: bool,
    resolvers: Vec<Resolver>,
    futures: Mutex<HashMap<RequestId, Weak<FutureInner>>>,
    queue: Mutex<VecDeque<(RequestId, Arc<FutureInner>)>>,
    calls_sent: AtomicU64,
    results_received: AtomicU64,
}

impl ClientInner {
    fn resolve_address(&self, address: &str) -> String {
        for (check, rewrite) in &self.resolvers {
            if check(address) {
                return rewrite(address);
            }
        }
        address.to_string()
    }

    fn prune_futures(&self) {
        self.futures.lock().retain(|_, weak| weak.strong_count() > 0);
    }

    fn wait_for_window(&self) {
        if self.maxinflight == 0 {
            return;
        }
        loop {
            let not_done = self.queue.lock().iter().filter(|(_, f)| !f.is_done()).count();
            if not_done < self.maxinflight {
                return;
            }
            let front = self.queue.lock().front().map(|(_, f)| f.clone());
            if let Some(front) = front {
                if !front.is_done() {
                    self.poll_once();
                }
            }
            std::thread::sleep(INFLIGHT_POLL);
        }
    }

    fn drain_errors(&self) -> Result<(), SharedError> {
        if !self.errors {
            return Ok(());
        }
        loop {
            let front = self.queue.lock().front().map(|(_, f)| f.clone());
            match front {
                None => return Ok(()),
                Some(front) if !front.is_done() => return Ok(()),
                Some(_) => {
                    let (_, front) = self.queue.lock().pop_front().expect("front checked above");
                    if let Some(result) = front.try_take() {
                        if let Err(err) = result {
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    fn poll_once(&self) {
        match self.socket.receive() {
            Ok(Some((rid, payload))) => {
                self.results_received.fetch_add(1, Ordering::Relaxed);
                let outcome = codec::unpack(&payload).map_err(|e| SharedError::new(RpcError::from(e)));
                self.settle(rid, outcome);
            }
            Ok(None) => {}
            Err(RpcError::Remote { rid, text }) => {
                log::warn!("[{}] received error response: {text}", self.name);
                self.settle(rid, Err(SharedError::new(RpcError::Remote { rid, text })));
            }
            Err(RpcError::Protocol(msg)) => {
                log::warn!("[{}] ignoring unexpected message: {msg}", self.name);
            }
            Err(fatal @ (RpcError::NotAlive { .. } | RpcError::Disconnected(_) | RpcError::Transport(_))) => {
                log::error!("[{}] connection lost: {fatal}", self.name);
                self.fan_out(SharedError::new(fatal));
            }
            Err(other) => {
                log::warn!("[{}] client socket error: {other}", self.name);
            }
        }
    }

    fn settle(&self, rid: RequestId, result: Result<Tree, SharedError>) {
        if let Some(future) = self.futures.lock().get(&rid).and_then(Weak::upgrade) {
            future.resolve(result);
        }
    }

    fn fan_out(&self, err: SharedError) {
        for weak in self.futures.lock().values() {
            if let Some(future) = weak.upgrade() {
                future.resolve(Err(err.clone()));
            }
        }
    }
}

/// High-level RPC client: wraps a [`ClientSocket`] with futures, a bounded
/// in-flight window and FIFO error propagation.
pub struct Client {
    address: String,
    inner: Arc<ClientInner>,
}

impl Client {
    /// Build a client bound to `address` (not yet connected unless
    /// `config.connect` is set).
    pub fn new(address: impl Into<String>, config: ClientConfig) -> Result<Self, RpcError> {
        let identity = config.identity.unwrap_or_else(rand::random);
        let socket = ClientSocket::new(identity, config.ipv6, config.pings, config.maxage)?;
        let client = Client {
            address: address.into(),
            inner: Arc::new(ClientInner {
                socket,
                name: config.name,
                maxinflight: config.maxinflight,
                errors: config.errors,
                resolvers: Vec::new(),
                futures: Mutex::new(HashMap::new()),
                queue: Mutex::new(VecDeque::new()),
                calls_sent: AtomicU64::new(0),
                results_received: AtomicU64::new(0),
            }),
        };
        if config.connect {
            client.connect(true, Duration::from_secs(10))?;
        }
        Ok(client)
    }

    /// Register a resolver pair; first-registered, first-checked.
    pub fn add_resolver(
        &mut self,
        check: impl Fn(&str) -> bool + Send + Sync + 'static,
        rewrite: impl Fn(&str) -> String + Send + Sync + 'static,
    ) {
        Arc::get_mut(&mut self.inner)
            .expect("add_resolver must run before the client is shared")
            .resolvers
            .push((Box::new(check), Box::new(rewrite)));
    }

    /// Resolve the configured address, then connect, retrying on
    /// `ConnectError` if `retry` is set. On `ProtocolError` (a stray
    /// non-`PONG` reply) this logs and retries regardless of `retry`, since
    /// that case represents a confused peer rather than an absent one.
    pub fn connect(&self, retry: bool, timeout: Duration) -> Result<(), RpcError> {
        let mut logged_connecting = false;
        let mut logged_retrying = false;
        loop {
            let resolved = self.inner.resolve_address(&self.address);
            if !logged_connecting {
                logged_connecting = true;
                log::info!("[{}] connecting to {resolved}", self.inner.name);
            }
            let addr = Address::parse(&resolved)?;
            match self.inner.socket.connect(&addr, Some(timeout)) {
                Ok(()) => {
                    log::info!("[{}] connection established", self.inner.name);
                    return Ok(());
                }
                Err(RpcError::Protocol(msg)) => {
                    log::warn!("[{}] ignoring unexpected message: {msg}", self.inner.name);
                }
                Err(RpcError::Connect) => {
                    if !retry {
                        return Err(RpcError::Connect);
                    }
                    if !logged_retrying {
                        logged_retrying = true;
                        log::warn!("[{}] could not connect yet, retrying", self.inner.name);
                    }
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Best-effort disconnect.
    pub fn close(&self) {
        self.inner.socket.disconnect();
    }

    /// Pack `tree`, send a `CALL` for `method`, and return a [`Future`] for
    /// the reply. Blocks (polling) while the in-flight window is full, then
    /// drains any already-resolved front-of-queue errors before sending.
    pub fn call(&self, method: &str, tree: &Tree) -> Result<Future, SharedError> {
        self.inner.prune_futures();
        let outstanding = self.inner.futures.lock().len();
        assert!(
            outstanding < MAX_OUTSTANDING,
            "too many unresolved requests in client {}: {outstanding}",
            self.inner.name
        );

        self.inner.wait_for_window();
        self.inner.drain_errors()?;

        let payload = codec::pack(tree).map_err(|e| SharedError::new(RpcError::from(e)))?;
        let rid = self
            .inner
            .socket
            .send_call(method, payload)
            .map_err(SharedError::new)?;
        self.inner.calls_sent.fetch_add(1, Ordering::Relaxed);

        let future_inner = Arc::new(FutureInner { state: Mutex::new(Status::Pending) });
        self.inner.futures.lock().insert(rid, Arc::downgrade(&future_inner));
        if self.inner.errors || self.inner.maxinflight > 0 {
            self.inner.queue.lock().push_back((rid, future_inner.clone()));
        }

        Ok(Future { rid, inner: future_inner, client: self.inner.clone() })
    }

    /// Snapshot of outstanding work and lifetime counters.
    pub fn stats(&self) -> ClientStats {
        ClientStats {
            futures: self.inner.futures.lock().len(),
            inflight: self.inner.queue.lock().len(),
            calls_sent: self.inner.calls_sent.load(Ordering::Relaxed),
            results_received: self.inner.results_received.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Array;
    use bytes::Bytes;

    fn tree_i32(values: &[i32]) -> Tree {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Tree::Leaf(Array::new("<i4", vec![values.len()], Bytes::from(bytes)).unwrap())
    }

    #[test]
    fn call_before_connect_surfaces_not_connected() {
        let client = Client::new("tcp://127.0.0.1:0", ClientConfig::default()).unwrap();
        let err = client.call("echo", &tree_i32(&[1, 2, 3])).unwrap_err();
        assert!(matches!(*err, RpcError::NotConnected));
    }

    #[test]
    fn stats_reports_zero_before_any_call() {
        let client = Client::new("tcp://127.0.0.1:0", ClientConfig::default()).unwrap();
        let stats = client.stats();
        assert_eq!(stats.futures, 0);
        assert_eq!(stats.inflight, 0);
        assert_eq!(stats.calls_sent, 0);
    }

    #[test]
    fn resolver_rewrites_address_before_connect_is_attempted() {
        let mut client = Client::new("alias", ClientConfig::default()).unwrap();
        client.add_resolver(|addr| addr == "alias", |_| "tcp://127.0.0.1:1".to_string());
        assert_eq!(client.inner.resolve_address("alias"), "tcp://127.0.0.1:1");
        assert_eq!(client.inner.resolve_address("other"), "other");
    }
}
