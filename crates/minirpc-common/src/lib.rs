//! minirpc Common Types, Codec and Framing
//!
//! This crate holds the I/O-free half of the minirpc transport: everything
//! needed to turn typed values into frames on a byte stream and back.
//!
//! # Overview
//!
//! - **Protocol Layer**: frame header, flags, wire status codes and the
//!   crate-wide error type
//! - **Codec**: XDR encoding of any serde type
//! - **Framing**: incremental decoding of length-prefixed frames with a
//!   bounded payload size
//!
//! # Wire Format
//!
//! ```text
//! [command u32][sequence u32][flags u8][payload_len u32][payload]
//! ```
//!
//! All header fields are big-endian. Flag bit 0 marks a reply, bit 1 a
//! request that expects no reply, and bit 2 an error reply whose payload is
//! a 4-byte status code.
//!
//! # Components
//!
//! - [`protocol`] - header layout, [`Status`] codes, [`MinirpcError`]
//! - [`codec`] - [`encode`](codec::encode) / [`decode`](codec::decode)
//! - [`framing`] - [`FrameCodec`] and [`write_frame`]
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use minirpc_common::{codec, write_frame, FrameCodec, FrameHeader};
//! use tokio_util::codec::Decoder;
//!
//! let payload = codec::encode(&("teal".to_string(), 4u32)).unwrap();
//! let wire = write_frame(FrameHeader::request(3, 1), &payload);
//!
//! let mut buf = BytesMut::from(&wire[..]);
//! let frame = FrameCodec::default().decode(&mut buf).unwrap().unwrap();
//! let (name, count): (String, u32) = codec::decode(&frame.payload).unwrap();
//! assert_eq!((name.as_str(), count), ("teal", 4));
//! ```

pub mod codec;
pub mod framing;
pub mod protocol;

pub use codec::{CodecError, TypeDescriptor};
pub use framing::{write_frame, Frame, FrameCodec, DEFAULT_MAX_PAYLOAD_LEN};
pub use protocol::*;
