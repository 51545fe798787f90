/*
    This file is part of tensorpc.

    tensorpc is free software: you can redistribute it and/or modify
    it under the terms of the GNU General Public License as published by
    the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.
*/

//! Method registry and worker-pool dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::codec::{self, Tree};
use crate::error::RpcError;
use crate::server_socket::{Incoming, ServerSocket};
use crate::transport::{Address, PeerId};
use crate::wire::RequestId;

/// A bound method's work function: takes the unpacked call payload, returns
/// the unpacked reply or an error message to serialize into an `ERROR`
/// frame.
pub type WorkFn = dyn Fn(Tree) -> Result<Tree, String> + Send + Sync;
/// An optional per-call logging hook, given the method name and an outcome
/// description.
pub type LogFn = dyn Fn(&str, &str) + Send + Sync;

struct Job {
    peer: PeerId,
    rid: RequestId,
    payload: Vec<Bytes>,
}

struct MethodEntry {
    workfn: Arc<WorkFn>,
    logfn: Option<Arc<LogFn>>,
    /// `0` means "informational only, not yet stacked": from the Server's
    /// own perspective batching is transparent, it always receives a plain
    /// payload. A `BatchProxy` fronting this server registers its methods
    /// with `batch=0` regardless of the outward batch size.
    #[allow(dead_code)]
    batch: usize,
    sender: Option<mpsc::Sender<Job>>,
}

/// Construction options for [`Server`].
pub struct ServerConfig {
    /// Human-readable name used in log lines.
    pub name: String,
    /// Whether to use IPv6 for the underlying socket.
    pub ipv6: bool,
    /// If `true`, a `workfn` error is serialized into an `ERROR` reply and
    /// the server continues; if `false`, it is fatal: an inline (`workers=0`)
    /// method surfaces it through `serve_once`'s return value directly, a
    /// pooled worker thread instead signals shutdown and `serve()` returns
    /// it once the dispatch loop unwinds.
    pub errors: bool,
    /// Seconds between proactive pings the server sends idle peers; `0`
    /// disables server-initiated pings.
    pub pings: u64,
    /// Seconds after which a silent peer is forgotten from the liveness map.
    pub maxage: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig { name: "Server".to_string(), ipv6: false, errors: true, pings: 30, maxage: 120 }
    }
}

/// Method registry, worker pool and dispatch loop fronting a
/// [`ServerSocket`].
pub struct Server {
    socket: Arc<ServerSocket>,
    name: String,
    errors: bool,
    pings: Duration,
    maxage: Duration,
    methods: Mutex<HashMap<String, MethodEntry>>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
    /// Set by a worker thread that hit a fatal (`errors=false`) workfn
    /// failure, so `serve()` can surface it after the shutdown it triggers
    /// unwinds the dispatch loop.
    fatal: Arc<Mutex<Option<String>>>,
}

impl Server {
    /// Bind a ROUTER socket at `addr`.
    pub fn bind(addr: &str, config: ServerConfig) -> Result<Self, RpcError> {
        let address = Address::parse(addr)?;
        let socket = Arc::new(ServerSocket::bind(&address, config.ipv6)?);
        Ok(Server {
            socket,
            name: config.name,
            errors: config.errors,
            pings: Duration::from_secs(config.pings),
            maxage: Duration::from_secs(config.maxage),
            methods: Mutex::new(HashMap::new()),
            worker_handles: Mutex::new(Vec::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            fatal: Arc::new(Mutex::new(None)),
        })
    }

    /// Register `name`, spawning `workers` threads to execute it (or none,
    /// if `workers == 0`, in which case calls run inline on the dispatch
    /// loop). `batch` is carried as metadata only (see [`MethodEntry`]).
    pub fn method(
        &self,
        name: impl Into<String>,
        workfn: impl Fn(Tree) -> Result<Tree, String> + Send + Sync + 'static,
        logfn: Option<Arc<LogFn>>,
        workers: usize,
        batch: usize,
    ) {
        let name = name.into();
        let workfn: Arc<WorkFn> = Arc::new(workfn);

        let sender = if workers > 0 {
            let (tx, rx) = mpsc::channel::<Job>();
            let rx = Arc::new(Mutex::new(rx));
            for worker_idx in 0..workers {
                let rx = rx.clone();
                let socket = self.socket.clone();
                let workfn = workfn.clone();
                let logfn = logfn.clone();
                let errors = self.errors;
                let name = name.clone();
                let server_name = self.name.clone();
                let shutdown = self.shutdown.clone();
                let fatal = self.fatal.clone();
                let handle = std::thread::Builder::new()
                    .name(format!("{server_name}-{name}-worker-{worker_idx}"))
                    .spawn(move || {
                        worker_loop(&rx, &socket, &workfn, logfn.as_deref(), &name, errors, &shutdown, &fatal)
                    })
                    .expect("failed to spawn worker thread");
                self.worker_handles.lock().push(handle);
            }
            Some(tx)
        } else {
            None
        };

        self.methods.lock().insert(name, MethodEntry { workfn, logfn, batch, sender });
    }

    /// Run the dispatch loop until [`Server::close`] is called from another
    /// thread, processing at most one frame per iteration and sleeping
    /// briefly when idle.
    pub fn serve(&self) -> Result<(), RpcError> {
        while !self.shutdown.load(Ordering::SeqCst) {
            self.serve_once()?;
        }
        if let Some(message) = self.fatal.lock().take() {
            return Err(RpcError::WorkerFailure(message));
        }
        Ok(())
    }

    /// Process exactly one pending frame, if any; returns immediately if
    /// there is none. Exposed separately from [`Server::serve`] so callers
    /// can interleave dispatch with their own loop (e.g. [`crate::batch::BatchProxy`]).
    pub fn serve_once(&self) -> Result<(), RpcError> {
        self.maintain_liveness();

        match self.socket.receive()? {
            None => {
                std::thread::sleep(Duration::from_millis(1));
                Ok(())
            }
            Some(Incoming::Pong { .. }) => Ok(()),
            Some(Incoming::Call { peer, rid, name, payload }) => self.dispatch(peer, rid, name, payload),
        }
    }

    fn maintain_liveness(&self) {
        if !self.pings.is_zero() {
            for peer in self.socket.peers_due_for_ping(self.pings) {
                let _ = self.socket.send_ping(&peer);
            }
        }
        if !self.maxage.is_zero() {
            for peer in self.socket.stale_peers(self.maxage) {
                self.socket.forget(&peer);
            }
        }
    }

    fn dispatch(&self, peer: PeerId, rid: RequestId, name: String, payload: Vec<Bytes>) -> Result<(), RpcError> {
        let entry = self.methods.lock().get(&name).map(|e| {
            (e.workfn.clone(), e.logfn.clone(), e.sender.clone())
        });

        let Some((workfn, logfn, sender)) = entry else {
            self.socket.send_error(&peer, rid, format!("Unknown method {name}"))?;
            return Ok(());
        };

        match sender {
            Some(sender) => {
                let _ = sender.send(Job { peer, rid, payload });
                Ok(())
            }
            None => run_job(&self.socket, &workfn, logfn.as_deref(), &name, self.errors, peer, rid, payload),
        }
    }

    /// Signal all worker threads to stop after finishing their current job,
    /// join them, and release the socket.
    pub fn close(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let handles = std::mem::take(&mut *self.worker_handles.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Currently connected peers seen within the last `maxage` seconds.
    pub fn clients(&self, maxage: Duration) -> Vec<PeerId> {
        let stale: std::collections::HashSet<_> = self.socket.stale_peers(maxage).into_iter().collect();
        self.socket.peers().into_iter().filter(|peer| !stale.contains(peer)).collect()
    }
}

fn worker_loop(
    rx: &Arc<Mutex<mpsc::Receiver<Job>>>,
    socket: &Arc<ServerSocket>,
    workfn: &Arc<WorkFn>,
    logfn: Option<&LogFn>,
    name: &str,
    errors: bool,
    shutdown: &AtomicBool,
    fatal: &Mutex<Option<String>>,
) {
    loop {
        let job = {
            let guard = rx.lock();
            guard.recv_timeout(Duration::from_millis(50))
        };
        match job {
            Ok(Job { peer, rid, payload }) => {
                if let Err(err) = run_job(socket, workfn, logfn, name, errors, peer, rid, payload) {
                    log::error!("worker for {name} terminating on fatal error: {err}");
                    fatal.lock().get_or_insert_with(|| err.to_string());
                    shutdown.store(true, Ordering::SeqCst);
                    return;
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::SeqCst) {
                    return;
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn run_job(
    socket: &ServerSocket,
    workfn: &WorkFn,
    logfn: Option<&LogFn>,
    name: &str,
    errors: bool,
    peer: PeerId,
    rid: RequestId,
    payload: Vec<Bytes>,
) -> Result<(), RpcError> {
    let tree = match codec::unpack(&payload) {
        Ok(tree) => tree,
        Err(e) => return fail(socket, logfn, name, errors, &peer, rid, e.to_string()),
    };

    match workfn(tree) {
        Ok(result) => {
            let packed = match codec::pack(&result) {
                Ok(packed) => packed,
                Err(e) => return fail(socket, logfn, name, errors, &peer, rid, e.to_string()),
            };
            if let Some(logfn) = logfn {
                logfn(name, "ok");
            }
            socket.send_result(&peer, rid, packed)
        }
        Err(message) => fail(socket, logfn, name, errors, &peer, rid, message),
    }
}

fn fail(
    socket: &ServerSocket,
    logfn: Option<&LogFn>,
    name: &str,
    errors: bool,
    peer: &PeerId,
    rid: RequestId,
    message: String,
) -> Result<(), RpcError> {
    if let Some(logfn) = logfn {
        logfn(name, &message);
    }
    if errors {
        socket.send_error(peer, rid, message)
    } else {
        Err(RpcError::WorkerFailure(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Array;

    fn tree_i32(values: &[i32]) -> Tree {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Tree::Leaf(Array::new("<i4", vec![values.len()], Bytes::from(bytes)).unwrap())
    }

    #[test]
    fn unknown_method_emits_error_frame() {
        let server = Server::bind("tcp://127.0.0.1:0", ServerConfig::default()).unwrap();
        let peer = PeerId(Bytes::from_static(b"peer"));
        server.dispatch(peer, 7, "nope".to_string(), codec::pack(&tree_i32(&[1])).unwrap()).unwrap();
    }

    #[test]
    fn inline_method_runs_without_workers() {
        let server = Server::bind("tcp://127.0.0.1:0", ServerConfig::default()).unwrap();
        server.method("echo", |tree| Ok(tree), None, 0, 0);
        let peer = PeerId(Bytes::from_static(b"peer"));
        let payload = codec::pack(&tree_i32(&[1, 2, 3])).unwrap();
        server.dispatch(peer, 1, "echo".to_string(), payload).unwrap();
    }
}
