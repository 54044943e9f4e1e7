//! Protocol types shared by both ends of a connection.
//!
//! - [`error`] - wire status codes and the crate-wide error type
//! - [`header`] - the fixed frame header and its flags

pub mod error;
pub mod header;


pub use error::{MinirpcError, Result, Status};
pub use header::{FrameFlags, FrameHeader, FrameKind, HEADER_LEN};
