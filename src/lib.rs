/*
    This file is part of tensorpc.

    tensorpc is free software: you can redistribute it and/or modify
    it under the terms of the GNU General Public License as published by
    the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.
*/

//! A lightweight RPC framework for distributed numerical computing.
//!
//! Processes invoke named methods on remote peers, exchanging tensor-tree
//! payloads over a DEALER/ROUTER `zmq` fabric, with automatic reconnection,
//! liveness detection, bounded in-flight request windows, and a proxy that
//! batches concurrent calls across clients into one stacked server call.
//!
//! Five pieces, leaves first:
//!
//! - [`codec`] packs and unpacks tensor trees into wire frames.
//! - [`wire`] is the byte-level shape of the five protocol messages.
//! - [`client_socket`] and [`server_socket`] are the connection state
//!   machines either side of the fabric runs.
//! - [`client::Client`] wraps a [`client_socket::ClientSocket`] with
//!   futures, an in-flight window and FIFO error draining.
//! - [`server::Server`] is a method registry and worker pool fronting a
//!   [`server_socket::ServerSocket`].
//! - [`batch::BatchProxy`] fronts a private inner `Server`, stacking `B`
//!   same-method calls into one and splitting the reply back apart.
//!
//! [`buffers`] is an unrelated, independently-usable length-prefixed
//! byte-stream framing mode for a non-message-oriented transport; nothing
//! else in the crate depends on it.

pub mod batch;
pub mod buffers;
pub mod client;
pub mod client_socket;
pub mod codec;
pub mod error;
pub mod server;
pub mod server_socket;
pub mod transport;
pub mod wire;

pub use client::{Client, ClientConfig};
pub use codec::{Array, Tree};
pub use error::{CodecError, RpcError, SharedError};
pub use server::{Server, ServerConfig};
pub use transport::Address;
