//! Protocol descriptors.
//!
//! A [`Protocol`] is the immutable command table shared by every connection
//! of a set. It is built once with a [`ProtocolBuilder`] and holds two
//! ordered maps:
//!
//! - **sent** commands: the request/reply types this side uses when it
//!   calls the peer
//! - **handled** commands: the request/reply types and the handler for
//!   requests the peer sends to this side
//!
//! The wire types of a command are the same in both directions; only the
//! encode/decode direction differs by role, which is why a symmetric
//! protocol simply registers a command in both maps.
//!
//! # Example
//!
//! ```
//! use minirpc::{Protocol, Status};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct CountReply {
//!     count: u32,
//! }
//!
//! let protocol = Protocol::<()>::builder("colors")
//!     .sends::<String, CountReply>(3)
//!     .handles(3, |_conn, name: String| {
//!         if name.is_empty() {
//!             return Err(Status::Application(Status::APPLICATION_BASE));
//!         }
//!         Ok(CountReply { count: name.len() as u32 })
//!     })
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(protocol.sent_commands().collect::<Vec<_>>(), vec![3]);
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use minirpc_common::codec::{self, CodecError};
use minirpc_common::{FrameHeader, MinirpcError, Result, Status, TypeDescriptor};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::connection::Connection;
use crate::reply::ReplyHandle;

/// Request and reply types bound to a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandTypes {
    pub request: TypeDescriptor,
    pub reply: TypeDescriptor,
}

impl CommandTypes {
    pub fn of<Req: 'static, Rep: 'static>() -> Self {
        Self {
            request: TypeDescriptor::of::<Req>(),
            reply: TypeDescriptor::of::<Rep>(),
        }
    }
}

/// What a handler did with a request.
pub(crate) enum Handled {
    /// The encoded reply payload.
    Reply(Vec<u8>),
    /// A [`ReplyHandle`] owns the answer now.
    Deferred,
}

type ErasedHandler<C> =
    dyn Fn(&Connection<C>, &FrameHeader, &[u8]) -> std::result::Result<Handled, Status> + Send + Sync;

pub(crate) struct SentCommand {
    pub(crate) types: CommandTypes,
    validate_reply: fn(&[u8]) -> std::result::Result<(), CodecError>,
}

impl SentCommand {
    /// Checks that a call uses the types this command was registered with.
    pub(crate) fn check<Req: 'static, Rep: 'static>(&self, command: u32) -> Result<()> {
        if self.types.request.is::<Req>() && self.types.reply.is::<Rep>() {
            return Ok(());
        }
        Err(MinirpcError::InvalidProtocol {
            command,
            detail: format!(
                "registered as {} -> {}, called with {} -> {}",
                self.types.request,
                self.types.reply,
                TypeDescriptor::of::<Req>(),
                TypeDescriptor::of::<Rep>()
            ),
        })
    }

    pub(crate) fn check_request<Req: 'static>(&self, command: u32) -> Result<()> {
        if self.types.request.is::<Req>() {
            return Ok(());
        }
        Err(MinirpcError::InvalidProtocol {
            command,
            detail: format!(
                "registered with request {}, called with {}",
                self.types.request,
                TypeDescriptor::of::<Req>()
            ),
        })
    }

    /// Decodes a reply payload only to check it, discarding the value.
    pub(crate) fn validate_reply(&self, payload: &[u8]) -> std::result::Result<(), CodecError> {
        (self.validate_reply)(payload)
    }
}

pub(crate) struct HandledCommand<C> {
    pub(crate) types: CommandTypes,
    deferred: bool,
    handler: Box<ErasedHandler<C>>,
}

impl<C> HandledCommand<C> {
    /// Decodes the request, runs the handler and encodes its reply.
    pub(crate) fn invoke(
        &self,
        conn: &Connection<C>,
        header: &FrameHeader,
        payload: &[u8],
    ) -> std::result::Result<Handled, Status> {
        (self.handler)(conn, header, payload)
    }

    /// True if the handler answers through a [`ReplyHandle`].
    pub(crate) fn is_deferred(&self) -> bool {
        self.deferred
    }
}

fn decode_request<Req: DeserializeOwned>(command: u32, payload: &[u8]) -> std::result::Result<Req, Status> {
    codec::decode(payload).map_err(|e| {
        debug!(command, error = %e, "failed to decode request");
        Status::MalformedPayload
    })
}

fn validate<T: DeserializeOwned>(payload: &[u8]) -> std::result::Result<(), CodecError> {
    codec::decode::<T>(payload).map(drop)
}

/// Immutable command table for one RPC interface.
pub struct Protocol<C> {
    name: String,
    sent: BTreeMap<u32, SentCommand>,
    handled: BTreeMap<u32, HandledCommand<C>>,
}

impl<C: Send + Sync + 'static> Protocol<C> {
    pub fn builder(name: impl Into<String>) -> ProtocolBuilder<C> {
        ProtocolBuilder::new(name)
    }
}

impl<C> Protocol<C> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Types used when this side sends `command`.
    pub fn sent_types(&self, command: u32) -> Result<CommandTypes> {
        self.sent_command(command).map(|entry| entry.types)
    }

    /// Types used when this side receives `command`.
    pub fn handled_types(&self, command: u32) -> Result<CommandTypes> {
        self.handled_command(command)
            .map(|entry| entry.types)
            .ok_or(MinirpcError::UnknownCommand(command))
    }

    pub fn sent_commands(&self) -> impl Iterator<Item = u32> + '_ {
        self.sent.keys().copied()
    }

    pub fn handled_commands(&self) -> impl Iterator<Item = u32> + '_ {
        self.handled.keys().copied()
    }

    pub(crate) fn sent_command(&self, command: u32) -> Result<&SentCommand> {
        self.sent.get(&command).ok_or(MinirpcError::UnknownCommand(command))
    }

    pub(crate) fn handled_command(&self, command: u32) -> Option<&HandledCommand<C>> {
        self.handled.get(&command)
    }
}

impl<C> std::fmt::Debug for Protocol<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("name", &self.name)
            .field("sent", &self.sent.keys().collect::<Vec<_>>())
            .field("handled", &self.handled.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Builder for [`Protocol`].
///
/// Registering the same command twice in one role is an error reported by
/// [`build`](ProtocolBuilder::build).
pub struct ProtocolBuilder<C> {
    name: String,
    sent: BTreeMap<u32, SentCommand>,
    handled: BTreeMap<u32, HandledCommand<C>>,
    duplicates: Vec<String>,
}

impl<C: Send + Sync + 'static> ProtocolBuilder<C> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sent: BTreeMap::new(),
            handled: BTreeMap::new(),
            duplicates: Vec::new(),
        }
    }

    /// Registers a command this side calls with `Req` and expects `Rep`
    /// back. One-way commands conventionally use `()` for `Rep`.
    pub fn sends<Req, Rep>(mut self, command: u32) -> Self
    where
        Req: Serialize + 'static,
        Rep: DeserializeOwned + 'static,
    {
        let entry = SentCommand {
            types: CommandTypes::of::<Req, Rep>(),
            validate_reply: validate::<Rep>,
        };
        if self.sent.insert(command, entry).is_some() {
            self.duplicates.push(format!("sent command {}", command));
        }
        self
    }

    /// Registers the handler for requests carrying `command`.
    ///
    /// The handler runs on a dispatch thread. Its `Err` status is sent back
    /// as an error reply. A handler that blocks stalls every connection
    /// served by the same dispatch thread, and one that makes a two-way call
    /// on such a connection deadlocks it. Slow work belongs in
    /// [`handles_deferred`](ProtocolBuilder::handles_deferred).
    pub fn handles<Req, Rep, F>(self, command: u32, handler: F) -> Self
    where
        Req: DeserializeOwned + 'static,
        Rep: Serialize + 'static,
        F: Fn(&Connection<C>, Req) -> std::result::Result<Rep, Status> + Send + Sync + 'static,
    {
        let erased = move |conn: &Connection<C>, _header: &FrameHeader, payload: &[u8]| {
            let request: Req = decode_request(command, payload)?;
            let reply = handler(conn, request).map_err(|status| match status {
                Status::Ok => Status::HandlerFailed,
                other => other,
            })?;
            codec::encode(&reply).map(Handled::Reply).map_err(|e| {
                debug!(command, error = %e, "failed to encode reply");
                Status::HandlerFailed
            })
        };
        self.register_handler(command, CommandTypes::of::<Req, Rep>(), false, Box::new(erased))
    }

    /// Registers a handler that answers through a [`ReplyHandle`].
    ///
    /// The handler returns as soon as it has taken the request; the reply
    /// goes out whenever the handle is used, from any thread. Meanwhile the
    /// dispatch thread goes on with other requests, so replies may leave in
    /// a different order than their requests arrived.
    ///
    /// A request that fails to decode is answered with
    /// [`Status::MalformedPayload`] without calling the handler.
    ///
    /// # Example
    ///
    /// ```
    /// use std::thread;
    /// use minirpc::{Protocol, ReplyHandle};
    ///
    /// let protocol = Protocol::<()>::builder("slow")
    ///     .handles_deferred(5, |_conn, millis: u32, reply: ReplyHandle<(), u32>| {
    ///         thread::spawn(move || {
    ///             thread::sleep(std::time::Duration::from_millis(millis as u64));
    ///             let _ = reply.reply(millis);
    ///         });
    ///     })
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(protocol.handled_commands().collect::<Vec<_>>(), vec![5]);
    /// ```
    pub fn handles_deferred<Req, Rep, F>(self, command: u32, handler: F) -> Self
    where
        Req: DeserializeOwned + 'static,
        Rep: Serialize + 'static,
        F: Fn(&Connection<C>, Req, ReplyHandle<C, Rep>) + Send + Sync + 'static,
    {
        let erased = move |conn: &Connection<C>, header: &FrameHeader, payload: &[u8]| {
            let request: Req = decode_request(command, payload)?;
            handler(conn, request, ReplyHandle::new(conn.clone(), header));
            Ok::<_, Status>(Handled::Deferred)
        };
        self.register_handler(command, CommandTypes::of::<Req, Rep>(), true, Box::new(erased))
    }

    fn register_handler(
        mut self,
        command: u32,
        types: CommandTypes,
        deferred: bool,
        handler: Box<ErasedHandler<C>>,
    ) -> Self {
        let entry = HandledCommand {
            types,
            deferred,
            handler,
        };
        if self.handled.insert(command, entry).is_some() {
            self.duplicates.push(format!("handled command {}", command));
        }
        self
    }

    /// Freezes the table.
    ///
    /// # Errors
    ///
    /// Returns [`MinirpcError::InvalidArgument`] if a command was registered
    /// twice in the same role.
    pub fn build(self) -> Result<Arc<Protocol<C>>> {
        if !self.duplicates.is_empty() {
            return Err(MinirpcError::InvalidArgument(format!(
                "protocol '{}' registers {} more than once",
                self.name,
                self.duplicates.join(", ")
            )));
        }
        Ok(Arc::new(Protocol {
            name: self.name,
            sent: self.sent,
            handled: self.handled,
        }))
    }
}
