use proptest::prelude::*;
use rpctap_http::{EnvelopeFrame, EnvelopeParser};

fn encode(compressed: bool, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + payload.len());
    out.push(u8::from(compressed));
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

proptest! {
    #[test]
    fn frame_round_trips_under_arbitrary_split(
        payload in proptest::collection::vec(any::<u8>(), 0..512),
        split in 0_usize..1024,
    ) {
        let encoded = encode(false, &payload);
        let split_at = split.min(encoded.len());

        let mut parser = EnvelopeParser::new();
        let mut frames = Vec::new();
        frames.extend(parser.push(&encoded[..split_at]).expect("first push"));
        frames.extend(parser.push(&encoded[split_at..]).expect("second push"));

        prop_assert_eq!(frames.len(), 1);
        prop_assert!(!frames[0].compressed);
        prop_assert_eq!(&frames[0].payload, &payload);
        prop_assert!(parser.finish().is_ok());
    }

    #[test]
    fn parse_then_reencode_reproduces_the_stream(
        payloads in proptest::collection::vec(
            (any::<bool>(), proptest::collection::vec(any::<u8>(), 0..128)),
            0..8,
        ),
        chunk_len in 1_usize..64,
    ) {
        let mut stream = Vec::new();
        for (compressed, payload) in &payloads {
            stream.extend(encode(*compressed, payload));
        }

        let mut parser = EnvelopeParser::new();
        let mut frames: Vec<EnvelopeFrame> = Vec::new();
        for chunk in stream.chunks(chunk_len.max(1)) {
            frames.extend(parser.push(chunk).expect("push"));
        }
        prop_assert!(parser.finish().is_ok());
        prop_assert_eq!(frames.len(), payloads.len());

        let mut reencoded = Vec::new();
        for frame in &frames {
            reencoded.extend(encode(frame.compressed, &frame.payload));
        }
        prop_assert_eq!(reencoded, stream);
    }

    #[test]
    fn arbitrary_bytes_never_panic(
        chunks in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..64),
            0..8,
        ),
    ) {
        let mut parser = EnvelopeParser::new();
        for chunk in &chunks {
            let _ = parser.push(chunk);
        }
        let _ = parser.finish();
    }
}
