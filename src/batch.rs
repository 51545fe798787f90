/*
    This file is part of tensorpc.

    tensorpc is free software: you can redistribute it and/or modify
    it under the terms of the GNU General Public License as published by
    the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.
*/

//! `BatchProxy`: fronts a private inner [`Server`] on an `ipc://` channel,
//! collating `B` same-method calls into one tensor-stacked inner call and
//! splitting the reply back into `B` outer replies.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::client_socket::ClientSocket;
use crate::codec::{self, Array, Tree};
use crate::error::{CodecError, RpcError};
use crate::server::{LogFn, Server, ServerConfig};
use crate::server_socket::{Incoming, ServerSocket};
use crate::transport::{Address, PeerId};
use crate::wire::RequestId;

const IDLE_SLEEP: Duration = Duration::from_millis(1);

enum PendingEntry {
    Single { peer: PeerId, rid: RequestId },
    Batch { peers: Vec<PeerId>, rids: Vec<RequestId> },
}

/// Construction options for [`BatchProxy`]: the same shape as [`ServerConfig`]
/// plus per-method batch sizes, registered separately via [`BatchProxy::method`].
pub struct BatchConfig {
    /// Human-readable name used in log lines and the generated inner
    /// channel's thread names.
    pub name: String,
    /// Whether the outward-facing socket uses IPv6.
    pub ipv6: bool,
    /// Whether the inner server serializes worker failures into `ERROR`
    /// replies (`true`) or treats them as fatal (`false`).
    pub errors: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig { name: "BatchProxy".to_string(), ipv6: false, errors: true }
    }
}

/// A stateful relay that stacks `B` same-method requests into one inner
/// call and fans the reply back out.
pub struct BatchProxy {
    name: String,
    outward: ServerSocket,
    inner_client: ClientSocket,
    inner_server: Arc<Server>,
    inner_addr: String,
    batchsizes: Mutex<HashMap<String, usize>>,
    queues: Mutex<HashMap<String, Vec<(PeerId, RequestId, Vec<Bytes>)>>>,
    pending: Mutex<HashMap<RequestId, PendingEntry>>,
    scratch: Mutex<HashMap<String, Vec<BytesMut>>>,
    shutdown: Arc<AtomicBool>,
    inner_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl BatchProxy {
    /// Bind the outward ROUTER socket at `addr` and the private inner
    /// server on a freshly generated `ipc:///tmp/tensorpc-inner{random}`
    /// path.
    pub fn bind(addr: &str, config: BatchConfig) -> Result<Self, RpcError> {
        let outward = ServerSocket::bind(&Address::parse(addr)?, config.ipv6)?;
        let inner_addr = format!("ipc:///tmp/tensorpc-inner-{:08x}", rand::random::<u32>());
        let inner_server = Arc::new(Server::bind(
            &inner_addr,
            ServerConfig { name: format!("{}-inner", config.name), ipv6: false, errors: config.errors, pings: 0, maxage: 0 },
        )?);
        let inner_client = ClientSocket::new(0, false, 0, 0)?;

        Ok(BatchProxy {
            name: config.name,
            outward,
            inner_client,
            inner_server,
            inner_addr,
            batchsizes: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            scratch: Mutex::new(HashMap::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            inner_handle: StdMutex::new(None),
        })
    }

    /// Register `name` with outward batch size `batch`. The inner server
    /// always sees `batch=0`, since by the time a call reaches it the proxy
    /// has already done the stacking.
    pub fn method(
        &self,
        name: impl Into<String>,
        workfn: impl Fn(Tree) -> Result<Tree, String> + Send + Sync + 'static,
        logfn: Option<Arc<LogFn>>,
        workers: usize,
        batch: usize,
    ) {
        let name = name.into();
        self.batchsizes.lock().insert(name.clone(), batch);
        self.inner_server.method(name, workfn, logfn, workers, 0);
    }

    /// Start the inner server's dispatch loop on a background thread, then
    /// connect the proxy's inner client to it. The dispatch loop must already
    /// be polling before `connect` sends its handshake `PING`, or nothing
    /// answers it until the blocking connect times out.
    pub fn start(&self, timeout: Duration) -> Result<(), RpcError> {
        let inner_server = self.inner_server.clone();
        let handle = std::thread::Builder::new()
            .name(format!("{}-inner-dispatch", self.name))
            .spawn(move || {
                if let Err(err) = inner_server.serve() {
                    log::error!("inner server stopped: {err}");
                }
            })
            .expect("failed to spawn inner dispatch thread");
        *self.inner_handle.lock().unwrap() = Some(handle);

        let inner_addr = Address::parse(&self.inner_addr)?;
        self.inner_client.connect(&inner_addr, Some(timeout))?;
        Ok(())
    }

    /// Run the proxy's single-threaded cooperative loop until [`BatchProxy::close`].
    pub fn serve(&self) -> Result<(), RpcError> {
        while !self.shutdown.load(Ordering::SeqCst) {
            if !self.serve_once()? {
                std::thread::sleep(IDLE_SLEEP);
            }
        }
        Ok(())
    }

    /// Run one outward poll and one inner poll. Returns whether either
    /// poll did anything, so [`BatchProxy::serve`] only sleeps when both
    /// are empty.
    pub fn serve_once(&self) -> Result<bool, RpcError> {
        let mut did_work = false;

        if let Some(incoming) = self.outward.receive()? {
            did_work = true;
            if let Incoming::Call { peer, rid, name, payload } = incoming {
                self.handle_outward_call(peer, rid, name, payload)?;
            }
        }

        match self.inner_client.receive() {
            Ok(Some((inner_rid, payload))) => {
                did_work = true;
                self.handle_inner_result(inner_rid, payload)?;
            }
            Ok(None) => {}
            Err(RpcError::Remote { rid, text }) => {
                did_work = true;
                self.handle_inner_error(rid, text);
            }
            Err(e) => return Err(e),
        }

        Ok(did_work)
    }

    fn handle_outward_call(&self, peer: PeerId, rid: RequestId, name: String, payload: Vec<Bytes>) -> Result<(), RpcError> {
        let batch = match self.batchsizes.lock().get(&name).copied() {
            Some(b) => b,
            None => {
                self.outward.send_error(&peer, rid, format!("Unknown method {name}"))?;
                return Ok(());
            }
        };

        if batch == 0 {
            let inner_rid = self.inner_client.send_call(&name, payload)?;
            self.pending.lock().insert(inner_rid, PendingEntry::Single { peer, rid });
            return Ok(());
        }

        let committed = {
            let mut queues = self.queues.lock();
            let queue = queues.entry(name.clone()).or_insert_with(Vec::new);
            queue.push((peer, rid, payload));
            if queue.len() == batch {
                Some(queue.drain(..).collect::<Vec<_>>())
            } else {
                None
            }
        };

        let Some(entries) = committed else { return Ok(()) };

        let mut peers = Vec::with_capacity(entries.len());
        let mut rids = Vec::with_capacity(entries.len());
        let mut trees = Vec::with_capacity(entries.len());
        for (peer, rid, payload) in entries {
            trees.push(codec::unpack(&payload)?);
            peers.push(peer);
            rids.push(rid);
        }

        let mut scratch = self.scratch.lock();
        let buffers = scratch.entry(name.clone()).or_insert_with(Vec::new);
        let stacked = stack_trees(&trees, buffers, &mut 0)?;
        drop(scratch);

        let packed = codec::pack(&stacked)?;
        let inner_rid = self.inner_client.send_call(&name, packed)?;
        self.pending.lock().insert(inner_rid, PendingEntry::Batch { peers, rids });
        Ok(())
    }

    fn handle_inner_result(&self, inner_rid: RequestId, payload: Vec<Bytes>) -> Result<(), RpcError> {
        let Some(entry) = self.pending.lock().remove(&inner_rid) else { return Ok(()) };
        match entry {
            PendingEntry::Single { peer, rid } => self.outward.send_result(&peer, rid, payload),
            PendingEntry::Batch { peers, rids } => {
                let tree = codec::unpack(&payload)?;
                let split = split_tree(&tree, peers.len())?;
                for ((peer, rid), item) in peers.into_iter().zip(rids).zip(split) {
                    let packed = codec::pack(&item)?;
                    self.outward.send_result(&peer, rid, packed)?;
                }
                Ok(())
            }
        }
    }

    fn handle_inner_error(&self, inner_rid: RequestId, text: String) {
        let Some(entry) = self.pending.lock().remove(&inner_rid) else { return };
        match entry {
            PendingEntry::Single { peer, rid } => {
                let _ = self.outward.send_error(&peer, rid, text);
            }
            PendingEntry::Batch { peers, rids } => {
                for (peer, rid) in peers.into_iter().zip(rids) {
                    let _ = self.outward.send_error(&peer, rid, text.clone());
                }
            }
        }
    }

    /// Signal the inner dispatch loop and this loop to stop, joining the
    /// inner thread.
    pub fn close(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.inner_server.close();
        if let Some(handle) = self.inner_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn as_leaf(tree: &Tree) -> Result<&Array, CodecError> {
    match tree {
        Tree::Leaf(array) => Ok(array),
        _ => Err(CodecError::StructureMismatch("expected a leaf".to_string())),
    }
}

/// Stack `B` trees of identical structure along a new leading axis, writing
/// each leaf's concatenated buffer into a reusable scratch `BytesMut` keyed
/// by depth-first leaf index, so the output buffer is reused across batches
/// instead of reallocated each time.
fn stack_trees(trees: &[Tree], scratch: &mut Vec<BytesMut>, leaf_idx: &mut usize) -> Result<Tree, CodecError> {
    match &trees[0] {
        Tree::Leaf(_) => {
            let arrays: Vec<&Array> = trees.iter().map(as_leaf).collect::<Result<_, _>>()?;
            if *leaf_idx >= scratch.len() {
                scratch.push(BytesMut::new());
            }
            let buf = &mut scratch[*leaf_idx];
            *leaf_idx += 1;
            Ok(Tree::Leaf(stack_arrays(&arrays, buf)?))
        }
        Tree::List(first_items) => {
            let n = first_items.len();
            let mut columns = Vec::with_capacity(n);
            for i in 0..n {
                let column: Vec<Tree> = trees
                    .iter()
                    .map(|t| match t {
                        Tree::List(items) if items.len() == n => Ok(items[i].clone()),
                        _ => Err(CodecError::StructureMismatch("list length mismatch across batch".to_string())),
                    })
                    .collect::<Result<_, _>>()?;
                columns.push(stack_trees(&column, scratch, leaf_idx)?);
            }
            Ok(Tree::List(columns))
        }
        Tree::Map(first_fields) => {
            let mut out = BTreeMap::new();
            for key in first_fields.keys() {
                let column: Vec<Tree> = trees
                    .iter()
                    .map(|t| match t {
                        Tree::Map(fields) => fields
                            .get(key)
                            .cloned()
                            .ok_or_else(|| CodecError::StructureMismatch(format!("missing key {key} across batch"))),
                        _ => Err(CodecError::StructureMismatch("map/non-map mismatch across batch".to_string())),
                    })
                    .collect::<Result<_, _>>()?;
                out.insert(key.clone(), stack_trees(&column, scratch, leaf_idx)?);
            }
            Ok(Tree::Map(out))
        }
    }
}

fn stack_arrays(arrays: &[&Array], scratch: &mut BytesMut) -> Result<Array, CodecError> {
    let first = arrays[0];
    for array in arrays {
        if array.dtype != first.dtype || array.shape != first.shape {
            return Err(CodecError::StructureMismatch(format!(
                "leaf dtype/shape mismatch across batch: {:?}/{:?} vs {:?}/{:?}",
                array.dtype, array.shape, first.dtype, first.shape
            )));
        }
    }
    let mut shape = Vec::with_capacity(first.shape.len() + 1);
    shape.push(arrays.len());
    shape.extend(first.shape.iter().copied());

    scratch.clear();
    for array in arrays {
        scratch.extend_from_slice(&array.data);
    }
    let data = scratch.split().freeze();
    Array::new(first.dtype.clone(), shape, data)
}

/// Split a tree whose leaves carry a leading axis of size `count` back into
/// `count` trees, each a zero-copy [`Bytes`] slice of the original leaf.
fn split_tree(tree: &Tree, count: usize) -> Result<Vec<Tree>, CodecError> {
    match tree {
        Tree::Leaf(array) => Ok(split_array(array, count)?.into_iter().map(Tree::Leaf).collect()),
        Tree::List(items) => {
            let mut per_item = Vec::with_capacity(items.len());
            for item in items {
                per_item.push(split_tree(item, count)?);
            }
            let mut out: Vec<Vec<Tree>> = (0..count).map(|_| Vec::with_capacity(items.len())).collect();
            for column in per_item {
                for (i, tree) in column.into_iter().enumerate() {
                    out[i].push(tree);
                }
            }
            Ok(out.into_iter().map(Tree::List).collect())
        }
        Tree::Map(fields) => {
            let mut per_key = Vec::with_capacity(fields.len());
            for (key, value) in fields {
                per_key.push((key.clone(), split_tree(value, count)?));
            }
            let mut out: Vec<BTreeMap<String, Tree>> = (0..count).map(|_| BTreeMap::new()).collect();
            for (key, column) in per_key {
                for (i, tree) in column.into_iter().enumerate() {
                    out[i].insert(key.clone(), tree);
                }
            }
            Ok(out.into_iter().map(Tree::Map).collect())
        }
    }
}

fn split_array(array: &Array, count: usize) -> Result<Vec<Array>, CodecError> {
    if array.shape.first().copied() != Some(count) {
        return Err(CodecError::StructureMismatch(format!(
            "expected leading axis {count}, got shape {:?}",
            array.shape
        )));
    }
    let rest_shape = array.shape[1..].to_vec();
    let rest_elems: usize = rest_shape.iter().product::<usize>().max(1);
    let itemsize = array.data.len() / (rest_elems * count);
    let chunk = rest_elems * itemsize;

    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let start = i * chunk;
        out.push(Array::new(array.dtype.clone(), rest_shape.clone(), array.data.slice(start..start + chunk))?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_i32(values: &[i32]) -> Tree {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Tree::Leaf(Array::new("<i4", vec![values.len()], Bytes::from(bytes)).unwrap())
    }

    #[test]
    fn stack_then_split_round_trips_single_leaves() {
        let trees = vec![leaf_i32(&[1]), leaf_i32(&[2]), leaf_i32(&[3]), leaf_i32(&[4])];
        let mut scratch = Vec::new();
        let stacked = stack_trees(&trees, &mut scratch, &mut 0).unwrap();
        match &stacked {
            Tree::Leaf(array) => assert_eq!(array.shape, vec![4, 1]),
            _ => panic!("expected a leaf"),
        }
        let split = split_tree(&stacked, 4).unwrap();
        assert_eq!(split, trees);
    }

    #[test]
    fn stack_reuses_the_same_scratch_slot_across_batches() {
        let mut scratch = Vec::new();
        let first = vec![leaf_i32(&[1]), leaf_i32(&[2])];
        let stacked_first = stack_trees(&first, &mut scratch, &mut 0).unwrap();
        assert_eq!(scratch.len(), 1);
        assert_eq!(stacked_first, Tree::Leaf(Array::new("<i4", vec![2, 1], Bytes::from(vec![1, 0, 0, 0, 2, 0, 0, 0])).unwrap()));

        let second = vec![leaf_i32(&[3]), leaf_i32(&[4])];
        let stacked_second = stack_trees(&second, &mut scratch, &mut 0).unwrap();
        assert_eq!(scratch.len(), 1);
        assert_eq!(stacked_second, Tree::Leaf(Array::new("<i4", vec![2, 1], Bytes::from(vec![3, 0, 0, 0, 4, 0, 0, 0])).unwrap()));
    }

    #[test]
    fn stack_rejects_mismatched_shapes() {
        let trees = vec![leaf_i32(&[1, 2]), leaf_i32(&[3])];
        let mut scratch = Vec::new();
        let err = stack_trees(&trees, &mut scratch, &mut 0).unwrap_err();
        assert!(matches!(err, CodecError::StructureMismatch(_)));
    }

    #[test]
    fn nested_map_stacks_and_splits_per_leaf() {
        let mut a = BTreeMap::new();
        a.insert("x".to_string(), leaf_i32(&[10]));
        let mut b = BTreeMap::new();
        b.insert("x".to_string(), leaf_i32(&[20]));
        let trees = vec![Tree::Map(a), Tree::Map(b)];

        let mut scratch = Vec::new();
        let stacked = stack_trees(&trees, &mut scratch, &mut 0).unwrap();
        let split = split_tree(&stacked, 2).unwrap();
        assert_eq!(split, trees);
    }
}
