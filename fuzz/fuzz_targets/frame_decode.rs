#![no_main]

use libfuzzer_sys::fuzz_target;
use metricollect_core::error::FrameError;
use metricollect_core::framing::{MAX_PAYLOAD, PREFIX_LEN, decode_frame, encode_frame};

// Arbitrary pipe contents: decode frames until the stream runs dry or a
// frame is rejected. Every decoded frame must re-encode to the bytes it
// was read from.
fuzz_target!(|data: &[u8]| {
    let mut reader = data;
    loop {
        let before = reader;
        match decode_frame(&mut reader) {
            Ok(payload) => {
                assert!(payload.len() <= MAX_PAYLOAD);
                let consumed = before.len() - reader.len();
                assert_eq!(consumed, PREFIX_LEN + payload.len());
                let encoded = encode_frame(&payload).expect("decoded payload re-encodes");
                assert_eq!(encoded.as_slice(), &before[..consumed]);
            }
            Err(FrameError::Closed | FrameError::InvalidLength(_) | FrameError::PayloadTooLarge { .. }) => {
                break;
            }
            Err(err) => panic!("unexpected decode error on in-memory input: {err}"),
        }
    }
});
