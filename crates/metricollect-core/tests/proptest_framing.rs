//! Property-based tests for the framing module.
//!
//! Covers encode/decode identity over the whole payload range, prefix
//! shape, rejection of oversized payloads, and decoder robustness on
//! arbitrary input.

use proptest::prelude::*;

use metricollect_core::error::FrameError;
use metricollect_core::framing::{MAX_PAYLOAD, PREFIX_LEN, decode_frame, encode_frame};

// =============================================================================
// Strategies
// =============================================================================

/// Payload of any length the prefix can describe.
fn arb_payload() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        6 => prop::collection::vec(any::<u8>(), 0..64),
        3 => prop::collection::vec(any::<u8>(), 64..2048),
        1 => prop::collection::vec(any::<u8>(), (MAX_PAYLOAD - 16)..=MAX_PAYLOAD),
    ]
}

/// Metric-id shaped strings.
fn arb_metric_id() -> impl Strategy<Value = String> {
    "[A-Za-z][A-Za-z0-9_]{0,20}(/[A-Za-z0-9_]{1,20}){1,4}"
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// decode(encode(p)) == p for every length in [0, 9999].
    #[test]
    fn encode_decode_identity(payload in arb_payload()) {
        let frame = encode_frame(&payload).unwrap();
        let mut reader = frame.as_slice();
        let decoded = decode_frame(&mut reader).unwrap();
        prop_assert_eq!(decoded, payload);
        prop_assert!(reader.is_empty());
    }

    /// The prefix is exactly four ASCII digits naming the payload length.
    #[test]
    fn prefix_is_zero_padded_length(len in 0usize..=MAX_PAYLOAD) {
        let payload = vec![b'a'; len];
        let frame = encode_frame(&payload).unwrap();
        let prefix = std::str::from_utf8(&frame[..PREFIX_LEN]).unwrap();
        prop_assert_eq!(prefix, format!("{len:04}"));
        prop_assert_eq!(frame.len(), PREFIX_LEN + len);
    }

    /// Anything beyond 9999 bytes is rejected, never truncated.
    #[test]
    fn oversized_payload_rejected(extra in 1usize..512) {
        let payload = vec![0u8; MAX_PAYLOAD + extra];
        let rejected = matches!(
            encode_frame(&payload),
            Err(FrameError::PayloadTooLarge { len }) if len == MAX_PAYLOAD + extra
        );
        prop_assert!(rejected);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Back-to-back frames decode in order with nothing left over.
    #[test]
    fn concatenated_frames_decode_in_order(ids in prop::collection::vec(arb_metric_id(), 1..16)) {
        let mut stream = Vec::new();
        for id in &ids {
            stream.extend(encode_frame(id.as_bytes()).unwrap());
        }
        let mut reader = stream.as_slice();
        for id in &ids {
            let decoded = decode_frame(&mut reader).unwrap();
            prop_assert_eq!(decoded, id.as_bytes());
        }
        prop_assert!(matches!(decode_frame(&mut reader), Err(FrameError::Closed)));
    }

    /// Arbitrary bytes never panic the decoder; success consumes a whole frame.
    #[test]
    fn decoder_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let mut reader = bytes.as_slice();
        if let Ok(payload) = decode_frame(&mut reader) {
            let reencoded = encode_frame(&payload).unwrap();
            prop_assert_eq!(&bytes[..reencoded.len()], reencoded.as_slice());
        }
    }

    /// Truncating a frame anywhere yields Closed.
    #[test]
    fn truncated_frame_is_closed(id in arb_metric_id(), cut in 0usize..100) {
        let frame = encode_frame(id.as_bytes()).unwrap();
        let cut = cut % frame.len();
        let mut reader = &frame[..cut];
        prop_assert!(matches!(decode_frame(&mut reader), Err(FrameError::Closed)));
    }
}
