//! Replies to inbound requests.
//!
//! Handlers registered with [`ProtocolBuilder::handles`](crate::ProtocolBuilder::handles)
//! return their reply inline. Handlers registered with
//! [`ProtocolBuilder::handles_deferred`](crate::ProtocolBuilder::handles_deferred)
//! receive a [`ReplyHandle`] instead and may answer later from any thread,
//! leaving the dispatch thread free for other requests.

use std::marker::PhantomData;

use bytes::Bytes;
use minirpc_common::{codec, write_frame, FrameHeader, MinirpcError, Result, Status};
use serde::Serialize;
use tracing::{debug, warn};

use crate::connection::Connection;

/// Encodes an error reply carrying `status`.
pub(crate) fn error_reply(command: u32, sequence: u32, status: Status) -> Bytes {
    write_frame(
        FrameHeader::error_reply(command, sequence),
        &status.code().to_be_bytes(),
    )
}

/// Encodes a successful reply, refusing payloads above the set's maximum.
pub(crate) fn reply_frame<C>(conn: &Connection<C>, command: u32, sequence: u32, payload: &[u8]) -> Result<Bytes> {
    let max = conn.config().max_payload_len;
    if payload.len() > max {
        warn!(conn = conn.id(), command, len = payload.len(), max, "reply exceeds maximum payload length");
        return Err(MinirpcError::FrameTooLarge {
            len: payload.len(),
            max,
        });
    }
    Ok(write_frame(FrameHeader::reply(command, sequence), payload))
}

/// The pending answer to one inbound request.
///
/// Consumed by [`reply`](ReplyHandle::reply) or
/// [`reply_error`](ReplyHandle::reply_error). Dropping it unanswered sends
/// [`Status::HandlerFailed`] so the caller is never left waiting. For a
/// one-way request both methods succeed without sending anything.
pub struct ReplyHandle<C, Rep> {
    conn: Connection<C>,
    command: u32,
    sequence: u32,
    expects_reply: bool,
    answered: bool,
    _reply: PhantomData<fn(Rep)>,
}

impl<C, Rep> ReplyHandle<C, Rep> {
    pub(crate) fn new(conn: Connection<C>, header: &FrameHeader) -> Self {
        Self {
            conn,
            command: header.command,
            sequence: header.sequence,
            expects_reply: header.expects_reply(),
            answered: false,
            _reply: PhantomData,
        }
    }

    pub fn command(&self) -> u32 {
        self.command
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// False for one-way requests.
    pub fn expects_reply(&self) -> bool {
        self.expects_reply
    }

    /// The connection the request arrived on.
    pub fn connection(&self) -> &Connection<C> {
        &self.conn
    }

    /// Answers the request with an error status. [`Status::Ok`] is sent as
    /// [`Status::HandlerFailed`].
    ///
    /// # Errors
    ///
    /// - [`MinirpcError::NotConnected`] once the connection is closing or
    ///   closed
    /// - [`MinirpcError::QueueFull`] if the outbound queue has no room
    pub fn reply_error(mut self, status: Status) -> Result<()> {
        self.answered = true;
        if !self.expects_reply {
            return Ok(());
        }
        let status = match status {
            Status::Ok => Status::HandlerFailed,
            other => other,
        };
        self.conn.enqueue(error_reply(self.command, self.sequence, status))
    }
}

impl<C, Rep: Serialize> ReplyHandle<C, Rep> {
    /// Answers the request.
    ///
    /// A reply above the maximum payload length is answered with
    /// [`Status::FrameTooLarge`] instead and reported as
    /// [`MinirpcError::FrameTooLarge`].
    ///
    /// # Errors
    ///
    /// - [`MinirpcError::NotConnected`] once the connection is closing or
    ///   closed
    /// - [`MinirpcError::QueueFull`] if the outbound queue has no room
    pub fn reply(mut self, reply: Rep) -> Result<()> {
        self.answered = true;
        if !self.expects_reply {
            return Ok(());
        }
        let payload = match codec::encode(&reply) {
            Ok(payload) => payload,
            Err(e) => {
                let _ = self
                    .conn
                    .enqueue(error_reply(self.command, self.sequence, Status::HandlerFailed));
                return Err(e.into());
            }
        };
        match reply_frame(&self.conn, self.command, self.sequence, &payload) {
            Ok(frame) => self.conn.enqueue(frame),
            Err(e) => {
                self.conn
                    .enqueue(error_reply(self.command, self.sequence, Status::FrameTooLarge))?;
                Err(e)
            }
        }
    }
}

impl<C, Rep> Drop for ReplyHandle<C, Rep> {
    fn drop(&mut self) {
        if self.answered || !self.expects_reply {
            return;
        }
        debug!(
            conn = self.conn.id(),
            command = self.command,
            sequence = self.sequence,
            "reply handle dropped unanswered"
        );
        let _ = self
            .conn
            .enqueue(error_reply(self.command, self.sequence, Status::HandlerFailed));
    }
}
