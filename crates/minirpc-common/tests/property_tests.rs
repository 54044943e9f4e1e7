//! Property-based tests for the codec and framing layers.

use bytes::BytesMut;
use minirpc_common::{codec, Frame, FrameCodec, FrameHeader, MinirpcError};
use proptest::prelude::*;
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Shade {
    Light,
    Dark(u8),
    Mixed { a: i16, b: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Palette {
    id: u64,
    name: String,
    weights: Vec<i32>,
    enabled: bool,
    ratio: f64,
    shades: Vec<Shade>,
    parent: Option<u32>,
}

fn shade() -> impl Strategy<Value = Shade> {
    prop_oneof![
        Just(Shade::Light),
        any::<u8>().prop_map(Shade::Dark),
        (any::<i16>(), proptest::option::of(".{0,12}")).prop_map(|(a, b)| Shade::Mixed { a, b }),
    ]
}

fn palette() -> impl Strategy<Value = Palette> {
    (
        any::<u64>(),
        ".{0,24}",
        proptest::collection::vec(any::<i32>(), 0..16),
        any::<bool>(),
        -1.0e9f64..1.0e9,
        proptest::collection::vec(shade(), 0..8),
        proptest::option::of(any::<u32>()),
    )
        .prop_map(|(id, name, weights, enabled, ratio, shades, parent)| Palette {
            id,
            name,
            weights,
            enabled,
            ratio,
            shades,
            parent,
        })
}

proptest! {
    #[test]
    fn prop_codec_round_trip(value in palette()) {
        let bytes = codec::encode(&value).unwrap();
        prop_assert_eq!(bytes.len() % 4, 0);
        let decoded: Palette = codec::decode(&bytes).unwrap();
        prop_assert_eq!(decoded, value);
    }

    #[test]
    fn prop_truncated_payload_never_decodes(value in palette(), cut in 1usize..64) {
        let bytes = codec::encode(&value).unwrap();
        let keep = bytes.len().saturating_sub(cut);
        prop_assert!(codec::decode::<Palette>(&bytes[..keep]).is_err());
    }

    #[test]
    fn prop_arbitrary_bytes_do_not_panic(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
        let _ = codec::decode::<Palette>(&bytes);
    }

    #[test]
    fn prop_frames_survive_any_chunking(
        payloads in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 1..8),
        chunk in 1usize..32,
    ) {
        let mut encoder = FrameCodec::new(64);
        let mut wire = BytesMut::new();
        let frames: Vec<Frame> = payloads
            .into_iter()
            .enumerate()
            .map(|(i, p)| Frame::new(FrameHeader::request(i as u32, i as u32 + 1), p))
            .collect();
        for frame in &frames {
            encoder.encode(frame.clone(), &mut wire).unwrap();
        }

        let mut decoder = FrameCodec::new(64);
        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        for piece in wire.chunks(chunk) {
            buf.extend_from_slice(piece);
            while let Some(frame) = decoder.decode(&mut buf).unwrap() {
                decoded.push(frame);
            }
        }
        prop_assert_eq!(decoded, frames);
    }

    #[test]
    fn prop_declared_length_over_limit_is_fatal(len in 65u32..=u32::MAX) {
        let header = FrameHeader { payload_len: len, ..FrameHeader::request(1, 1) };
        let mut buf = BytesMut::from(&header.to_bytes()[..]);
        let result = FrameCodec::new(64).decode(&mut buf);
        let is_too_large = matches!(result, Err(MinirpcError::FrameTooLarge { .. }));
        prop_assert!(is_too_large);
    }
}
