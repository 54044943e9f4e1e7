//! Length-prefixed framing.
//!
//! [`FrameCodec`] turns a byte stream into [`Frame`]s and back. It plugs
//! into `tokio_util::codec`, but the decoder is just as usable by hand: feed
//! whatever bytes the socket produced into a [`BytesMut`] and call
//! [`Decoder::decode`] until it yields `None`.
//!
//! The payload length is checked against the configured maximum as soon as
//! the header is complete, before any payload memory is reserved.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::{FrameHeader, MinirpcError, Result, HEADER_LEN};

/// Default maximum payload length (1 MiB).
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 1024 * 1024;

/// One decoded wire unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(mut header: FrameHeader, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        header.payload_len = payload.len() as u32;
        Self { header, payload }
    }

    /// Builds an error-flagged reply carrying `code`.
    pub fn error_reply(command: u32, sequence: u32, code: u32) -> Self {
        Self::new(
            FrameHeader::error_reply(command, sequence),
            Bytes::copy_from_slice(&code.to_be_bytes()),
        )
    }

    /// Reads the status code of an error-flagged reply.
    pub fn status_code(&self) -> Result<u32> {
        let bytes: [u8; 4] = self.payload.as_ref().try_into().map_err(|_| {
            MinirpcError::MalformedFrame(format!(
                "error reply payload must be 4 bytes, got {}",
                self.payload.len()
            ))
        })?;
        Ok(u32::from_be_bytes(bytes))
    }
}

/// Concatenates `header` and `payload`, fixing up the header's length field.
pub fn write_frame(header: FrameHeader, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    FrameHeader {
        payload_len: payload.len() as u32,
        ..header
    }
    .put(&mut buf);
    buf.put_slice(payload);
    buf.freeze()
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    Header,
    Payload(FrameHeader),
}

/// Incremental frame decoder and encoder.
#[derive(Debug)]
pub struct FrameCodec {
    max_payload_len: usize,
    state: DecodeState,
}

impl FrameCodec {
    pub fn new(max_payload_len: usize) -> Self {
        Self {
            max_payload_len,
            state: DecodeState::Header,
        }
    }

    pub fn max_payload_len(&self) -> usize {
        self.max_payload_len
    }

    /// Returns true when a header has been read and its payload is still
    /// outstanding.
    pub fn is_mid_frame(&self) -> bool {
        matches!(self.state, DecodeState::Payload(_))
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len > self.max_payload_len {
            return Err(MinirpcError::FrameTooLarge {
                len,
                max: self.max_payload_len,
            });
        }
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_LEN)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = MinirpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let header = match self.state {
            DecodeState::Header => {
                if src.len() < HEADER_LEN {
                    src.reserve(HEADER_LEN - src.len());
                    return Ok(None);
                }
                let header = FrameHeader::parse(&src[..HEADER_LEN])?;
                self.check_len(header.payload_len as usize)?;
                src.advance(HEADER_LEN);
                self.state = DecodeState::Payload(header);
                header
            }
            DecodeState::Payload(header) => header,
        };

        let len = header.payload_len as usize;
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        self.state = DecodeState::Header;
        Ok(Some(Frame {
            header,
            payload: src.split_to(len).freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = MinirpcError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        self.check_len(frame.payload.len())?;
        dst.reserve(HEADER_LEN + frame.payload.len());
        FrameHeader {
            payload_len: frame.payload.len() as u32,
            ..frame.header
        }
        .put(dst);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameFlags, FrameKind};

    fn encoded(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::default().encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_write_frame_layout() {
        let bytes = write_frame(FrameHeader::request(3, 1), &[9, 9]);
        assert_eq!(bytes.len(), HEADER_LEN + 2);
        assert_eq!(&bytes[9..13], &[0, 0, 0, 2]);
        assert_eq!(&bytes[13..], &[9, 9]);
    }

    #[test]
    fn test_decode_complete_frame() {
        let frame = Frame::new(FrameHeader::reply(3, 1), vec![0, 0, 0, 4]);
        let mut buf = encoded(frame.clone());

        let mut codec = FrameCodec::default();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame));
        assert!(buf.is_empty());
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_decode_byte_at_a_time() {
        let frame = Frame::new(FrameHeader::one_way(7, 2), b"no_colors_query".to_vec());
        let wire = encoded(frame.clone());

        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        for byte in wire.iter() {
            buf.put_u8(*byte);
            if let Some(frame) = codec.decode(&mut buf).unwrap() {
                decoded.push(frame);
            }
        }
        assert_eq!(decoded, vec![frame]);
        assert!(!codec.is_mid_frame());
    }

    #[test]
    fn test_decode_back_to_back_frames() {
        let first = Frame::new(FrameHeader::request(1, 1), vec![1, 2, 3, 4]);
        let second = Frame::new(FrameHeader::request(2, 2), Bytes::new());
        let mut buf = encoded(first.clone());
        buf.extend_from_slice(&encoded(second.clone()));

        let mut codec = FrameCodec::default();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(first));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(second));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_oversized_header_rejected_before_payload() {
        let header = FrameHeader {
            payload_len: u32::MAX,
            ..FrameHeader::request(1, 1)
        };
        let mut buf = BytesMut::from(&header.to_bytes()[..]);
        let mut codec = FrameCodec::new(64);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            MinirpcError::FrameTooLarge { len, max: 64 } if len == u32::MAX as usize
        ));
        assert!(buf.capacity() < 1024);
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let mut codec = FrameCodec::new(4);
        let mut buf = BytesMut::new();
        let err = codec
            .encode(Frame::new(FrameHeader::request(1, 1), vec![0; 5]), &mut buf)
            .unwrap_err();
        assert!(matches!(err, MinirpcError::FrameTooLarge { len: 5, max: 4 }));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_corrupt_flags_are_fatal() {
        let mut bytes = FrameHeader::request(1, 1).to_bytes();
        bytes[8] = 0xf0;
        let mut buf = BytesMut::from(&bytes[..]);
        assert!(matches!(
            FrameCodec::default().decode(&mut buf),
            Err(MinirpcError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_error_reply_status() {
        let frame = Frame::error_reply(5, 9, 1);
        assert_eq!(frame.header.kind(), FrameKind::ErrorReply);
        assert!(frame.header.flags.contains(FrameFlags::ERROR));
        assert_eq!(frame.status_code().unwrap(), 1);

        let bad = Frame::new(FrameHeader::error_reply(5, 9), vec![0, 1]);
        assert!(bad.status_code().is_err());
    }
}
