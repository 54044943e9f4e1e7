//! minirpc Transport
//!
//! This crate provides the threaded half of the minirpc transport:
//! connection sets, connections, outbound calls and the dispatch threads
//! that read, decode and handle inbound frames.
//!
//! # Overview
//!
//! - **Protocols**: an immutable command table built with
//!   [`Protocol::builder`], naming the commands this side sends and the
//!   handlers for the commands it receives
//! - **Connection sets**: a [`ConnectionSet`] binds connections to one
//!   protocol, owns the dispatch threads and carries the disconnect and
//!   protocol-error callbacks
//! - **Connections**: a [`Connection`] is a clonable handle to one peer over
//!   TCP or a Unix domain socket; any thread may call through it
//! - **Calls**: two-way calls block for their reply (optionally with a
//!   timeout or cancellation), one-way calls return once queued
//! - **Replies**: handlers answer inline, or take a [`ReplyHandle`] and
//!   answer later from any thread
//!
//! Replies are matched to calls by sequence number, so many calls may be in
//! flight on one connection and complete in any order.
//!
//! # Example
//!
//! ```no_run
//! use minirpc::{ConnectionSet, Protocol};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct CountReply {
//!     count: u32,
//! }
//!
//! let server = Protocol::<()>::builder("colors")
//!     .handles(3, |_conn, name: String| Ok(CountReply { count: name.len() as u32 }))
//!     .build()?;
//! let server = ConnectionSet::create(server, ());
//! server.start_dispatch(1)?;
//! let addr = server.listen_default("127.0.0.1:0")?;
//!
//! let client = Protocol::<()>::builder("colors")
//!     .sends::<String, CountReply>(3)
//!     .build()?;
//! let client = ConnectionSet::create(client, ());
//! client.start_dispatch(1)?;
//!
//! let conn = client.connect(addr, ())?;
//! let reply: CountReply = conn.call(3, &"teal".to_string())?;
//! assert_eq!(reply.count, 4);
//!
//! client.shutdown();
//! server.shutdown();
//! # Ok::<(), minirpc::MinirpcError>(())
//! ```

pub mod call;
pub mod config;
pub mod connection;
pub mod descriptor;
mod dispatch;
mod pending;
pub mod reply;
pub mod set;

pub use minirpc_common::codec;
pub use minirpc_common::{CodecError, MinirpcError, Result, Status, TypeDescriptor};

pub use call::{CancelHandle, PendingCall};
pub use config::{KeepaliveConfig, SetConfig};
pub use connection::{Connection, ConnectionState, DisconnectReason};
pub use descriptor::{CommandTypes, Protocol, ProtocolBuilder};
pub use reply::ReplyHandle;
pub use set::ConnectionSet;
