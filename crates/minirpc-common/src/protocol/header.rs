//! Frame header layout.
//!
//! Every frame starts with a fixed 13-byte header, all fields big-endian:
//!
//! ```text
//! +------------+-------------+-------+-------------+
//! | command u32| sequence u32| flags | payload u32 |
//! +------------+-------------+-------+-------------+
//!      0..4        4..8         8        9..13
//! ```

use bitflags::bitflags;
use bytes::BufMut;

use super::error::{MinirpcError, Result};

/// Size of the encoded header in bytes.
pub const HEADER_LEN: usize = 13;

bitflags! {
    /// Per-frame flags.
    ///
    /// A frame without [`FrameFlags::REPLY`] is a request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FrameFlags: u8 {
        /// Frame answers an earlier request with the same sequence number.
        const REPLY = 0b0000_0001;
        /// Request expects no reply.
        const NO_REPLY = 0b0000_0010;
        /// Payload is a 4-byte status code instead of a reply value.
        const ERROR = 0b0000_0100;
    }
}

/// What a frame means to the receiving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    OneWay,
    Reply,
    ErrorReply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub command: u32,
    pub sequence: u32,
    pub flags: FrameFlags,
    pub payload_len: u32,
}

impl FrameHeader {
    pub fn request(command: u32, sequence: u32) -> Self {
        Self {
            command,
            sequence,
            flags: FrameFlags::empty(),
            payload_len: 0,
        }
    }

    pub fn one_way(command: u32, sequence: u32) -> Self {
        Self {
            flags: FrameFlags::NO_REPLY,
            ..Self::request(command, sequence)
        }
    }

    pub fn reply(command: u32, sequence: u32) -> Self {
        Self {
            flags: FrameFlags::REPLY,
            ..Self::request(command, sequence)
        }
    }

    pub fn error_reply(command: u32, sequence: u32) -> Self {
        Self {
            flags: FrameFlags::REPLY | FrameFlags::ERROR,
            ..Self::request(command, sequence)
        }
    }

    pub fn kind(&self) -> FrameKind {
        if self.flags.contains(FrameFlags::REPLY) {
            if self.flags.contains(FrameFlags::ERROR) {
                FrameKind::ErrorReply
            } else {
                FrameKind::Reply
            }
        } else if self.flags.contains(FrameFlags::NO_REPLY) {
            FrameKind::OneWay
        } else {
            FrameKind::Request
        }
    }

    pub fn expects_reply(&self) -> bool {
        matches!(self.kind(), FrameKind::Request)
    }

    /// Writes the header into `dst`.
    pub fn put(&self, dst: &mut impl BufMut) {
        dst.put_u32(self.command);
        dst.put_u32(self.sequence);
        dst.put_u8(self.flags.bits());
        dst.put_u32(self.payload_len);
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        self.put(&mut &mut out[..]);
        out
    }

    /// Parses a header from the first [`HEADER_LEN`] bytes of `src`.
    ///
    /// # Errors
    ///
    /// Returns [`MinirpcError::MalformedFrame`] if `src` is short, if an
    /// undefined flag bit is set, or if a reply also claims to expect no
    /// reply. Any of these means the byte stream can no longer be trusted.
    pub fn parse(src: &[u8]) -> Result<Self> {
        if src.len() < HEADER_LEN {
            return Err(MinirpcError::MalformedFrame(format!(
                "header needs {} bytes, got {}",
                HEADER_LEN,
                src.len()
            )));
        }

        let word = |at: usize| u32::from_be_bytes([src[at], src[at + 1], src[at + 2], src[at + 3]]);

        let raw_flags = src[8];
        let flags = FrameFlags::from_bits(raw_flags).ok_or_else(|| {
            MinirpcError::MalformedFrame(format!("undefined flag bits {:#010b}", raw_flags))
        })?;
        if flags.contains(FrameFlags::REPLY | FrameFlags::NO_REPLY) {
            return Err(MinirpcError::MalformedFrame(
                "reply frame carries the no-reply flag".to_string(),
            ));
        }

        Ok(Self {
            command: word(0),
            sequence: word(4),
            flags,
            payload_len: word(9),
        })
    }
}
