#![no_main]

use libfuzzer_sys::fuzz_target;
use rpctap_http::EnvelopeParser;

fuzz_target!(|data: &[u8]| {
    let max_payload_len = data
        .first()
        .map(|byte| ((*byte as usize) + 1) * 64)
        .unwrap_or(1024);
    let mut parser = EnvelopeParser::with_max_payload_len(max_payload_len);

    for chunk in data.chunks(7) {
        if parser.push(chunk).is_err() {
            break;
        }
    }
    let _ = parser.finish();
});
