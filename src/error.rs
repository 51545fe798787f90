/*
    This file is part of tensorpc.

    tensorpc is free software: you can redistribute it and/or modify
    it under the terms of the GNU General Public License as published by
    the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.
*/

//! Error kinds shared by the codec, sockets and the RPC layer.

use crate::wire::RequestId;

/// Failure modes of [`crate::codec::pack`] and [`crate::codec::unpack`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// A leaf carried an object/opaque dtype, which cannot be flattened into
    /// a raw buffer.
    #[error("array has unsupported dtype {0:?}")]
    ObjectDtype(String),
    /// A leaf's buffer length did not match `dtype` and `shape`.
    #[error("buffer of {data_len} bytes does not match shape {shape:?} and dtype {dtype:?}")]
    LengthMismatch {
        /// Declared dtype.
        dtype: String,
        /// Declared shape.
        shape: Vec<usize>,
        /// Actual buffer length in bytes.
        data_len: usize,
    },
    /// A payload carried zero frames; at least one is required.
    #[error("payload must carry at least one frame")]
    EmptyPayload,
    /// The meta frame failed to decode as msgpack.
    #[error("invalid payload metadata: {0}")]
    InvalidMeta(#[from] rmp_serde::decode::Error),
    /// The meta frame failed to encode as msgpack.
    #[error("failed to encode payload metadata: {0}")]
    EncodeMeta(#[from] rmp_serde::encode::Error),
    /// [`crate::batch`] tried to stack or split a set of trees whose shapes
    /// disagree (different List length, Map keys, or Leaf dtype/shape).
    #[error("batch structure mismatch: {0}")]
    StructureMismatch(String),
}

/// Failure modes of [`crate::client_socket::ClientSocket`],
/// [`crate::server_socket::ServerSocket`], [`crate::client::Client`] and
/// [`crate::server::Server`].
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// `connect` did not complete before the configured timeout.
    #[error("could not connect before timeout")]
    Connect,
    /// An unexpected message type was seen on the wire.
    #[error("protocol error: unexpected message type {0:?}")]
    Protocol(String),
    /// `maxage` elapsed with no response from the peer.
    #[error("peer not alive: last call {since_call:?} ago, last response {since_response:?} ago, last ping {since_ping:?} ago")]
    NotAlive {
        /// Time since the last call was sent.
        since_call: std::time::Duration,
        /// Time since the last response was received.
        since_response: std::time::Duration,
        /// Time since the last ping was sent.
        since_ping: std::time::Duration,
    },
    /// The remote peer returned an `ERROR` frame for a specific request id.
    #[error("remote error for request {rid}: {text}")]
    Remote {
        /// The request id the error is for.
        rid: RequestId,
        /// The error text sent by the peer.
        text: String,
    },
    /// The codec could not pack or unpack a payload.
    #[error(transparent)]
    InvalidPayload(#[from] CodecError),
    /// The transport reports the peer is gone.
    #[error("disconnected: {0}")]
    Disconnected(String),
    /// Underlying transport (zmq) error.
    #[error("transport error: {0}")]
    Transport(#[from] zmq::Error),
    /// The caller tried to use a socket that is not connected.
    #[error("socket is not connected")]
    NotConnected,
    /// A bound method failed and the server is configured with
    /// `errors=false`, so the failure is fatal rather than serialized into
    /// an `ERROR` reply.
    #[error("worker failed with errors=false: {0}")]
    WorkerFailure(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RpcError>;

/// An [`RpcError`] shared between a [`crate::client::Future`] and the
/// client's error-draining queue, both of which may observe the same
/// terminal error. `Arc<RpcError>` implements [`std::error::Error`] via the
/// standard library's blanket impl, so it composes with `?` and `thiserror`
/// like an owned error everywhere except at the one seam (two readers of
/// one outcome) that actually needs sharing.
pub type SharedError = std::sync::Arc<RpcError>;
