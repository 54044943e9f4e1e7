//! Binary value codec.
//!
//! Payloads use the XDR external data representation (RFC 4506) driven by
//! serde. Every item occupies a multiple of four bytes:
//!
//! | Rust type                        | Encoding                                  |
//! |----------------------------------|-------------------------------------------|
//! | `bool`                           | u32, 0 or 1                               |
//! | `i8`, `i16`, `i32`               | i32 big-endian                            |
//! | `u8`, `u16`, `u32`, `char`       | u32 big-endian                            |
//! | `i64`, `u64`, `f64`              | 8 bytes big-endian                        |
//! | `f32`                            | 4 bytes big-endian                        |
//! | `String`, `&str`, byte buffers   | u32 length, bytes, zero padding to 4      |
//! | `Vec<T>`, maps                   | u32 count, then each element              |
//! | `Option<T>`                      | u32 0 (none) or 1 followed by the value   |
//! | enums                            | u32 variant index, then variant content   |
//! | structs, tuples, `()`            | fields in declaration order, no framing   |
//!
//! Byte buffers go through the opaque encoding only when serialized as
//! bytes (for example through `serde_bytes`); a plain `Vec<u8>` is a
//! sequence of u32 items.
//!
//! Decoding never reads past the supplied buffer and must consume all of it.

mod de;
mod ser;

use std::any::{type_name, TypeId};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use de::Deserializer;
pub use ser::Serializer;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("{0}")]
    Message(String),

    #[error("buffer truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),

    #[error("invalid boolean value {0}")]
    InvalidBool(u32),

    #[error("invalid discriminant {0}")]
    InvalidDiscriminant(u32),

    #[error("invalid char {0:#x}")]
    InvalidChar(u32),

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("non-zero padding byte")]
    NonZeroPadding,

    #[error("value {value} out of range for {target}")]
    OutOfRange { value: i64, target: &'static str },

    #[error("length {0} does not fit in 32 bits")]
    LengthOverflow(usize),

    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

impl serde::ser::Error for CodecError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        CodecError::Message(msg.to_string())
    }
}

impl serde::de::Error for CodecError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        CodecError::Message(msg.to_string())
    }
}

/// Encodes `value` into a fresh buffer.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut serializer = Serializer::new();
    value.serialize(&mut serializer)?;
    Ok(serializer.into_inner())
}

/// Decodes a `T` that must span all of `bytes`.
///
/// # Errors
///
/// Fails on truncated input, trailing bytes, or values that are not valid
/// for `T`.
pub fn decode<'de, T: Deserialize<'de>>(bytes: &'de [u8]) -> Result<T, CodecError> {
    let mut deserializer = Deserializer::from_slice(bytes);
    let value = T::deserialize(&mut deserializer)?;
    deserializer.finish()?;
    Ok(value)
}

/// Identifies the Rust type bound to one side of a command.
///
/// The type itself (through its serde implementation) is the field-level
/// description of the encoding; the descriptor lets a protocol table check
/// that callers use the types it was built with.
#[derive(Clone, Copy)]
pub struct TypeDescriptor {
    name: &'static str,
    id: TypeId,
}

impl TypeDescriptor {
    pub fn of<T: 'static + ?Sized>() -> Self {
        Self {
            name: type_name::<T>(),
            id: TypeId::of::<T>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is<T: 'static + ?Sized>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }
}

impl PartialEq for TypeDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeDescriptor {}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Number of zero bytes that follow `len` bytes of opaque data.
pub(crate) fn padding(len: usize) -> usize {
    (4 - len % 4) % 4
}
