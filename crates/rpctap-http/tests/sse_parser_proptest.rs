use proptest::prelude::*;
use rpctap_http::SseParser;

proptest! {
    #[test]
    fn arbitrary_bytes_never_panic(
        chunks in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..128),
            0..8,
        ),
    ) {
        let mut parser = SseParser::new();
        for chunk in &chunks {
            let _ = parser.push(chunk);
        }
        let _ = parser.finish();
    }

    #[test]
    fn chunking_does_not_change_parsed_events(
        data_lines in proptest::collection::vec("[a-z0-9 ]{0,32}", 1..4),
        event_name in proptest::option::of("[a-z]{1,12}"),
        split in 1_usize..256,
    ) {
        let mut stream = Vec::new();
        if let Some(name) = &event_name {
            stream.extend_from_slice(format!("event: {name}\n").as_bytes());
        }
        for line in &data_lines {
            stream.extend_from_slice(format!("data: {line}\n").as_bytes());
        }
        stream.push(b'\n');

        let mut whole = SseParser::new();
        let expected = whole.push(&stream);

        let split_at = split.min(stream.len());
        let mut chunked = SseParser::new();
        let mut actual = chunked.push(&stream[..split_at]);
        actual.extend(chunked.push(&stream[split_at..]));

        prop_assert_eq!(actual, expected);
    }
}
