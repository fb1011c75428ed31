#![no_main]

use libfuzzer_sys::fuzz_target;
use rpctap_proxy::{parse_connect_authority, request_line};

fuzz_target!(|data: &[u8]| {
    let _ = request_line(data);
    if let Ok(text) = std::str::from_utf8(data) {
        let _ = parse_connect_authority(text);
    }
});
