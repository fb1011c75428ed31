#![no_main]

use libfuzzer_sys::fuzz_target;
use rpctap_http::{H1Role, MessageAssembler};

fuzz_target!(|data: &[u8]| {
    let role = if data.first().map(|byte| byte & 1 == 0).unwrap_or(true) {
        H1Role::Request
    } else {
        H1Role::Response
    };
    let mut assembler = MessageAssembler::with_max_head_bytes(role, 8 * 1024);

    for chunk in data.chunks(11) {
        if assembler.push(chunk).is_err() {
            break;
        }
    }
    let _ = assembler.finish();
});
