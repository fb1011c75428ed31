#![no_main]

use libfuzzer_sys::fuzz_target;
use rpctap_tls::{client_hello_record_len, extract_sni, is_tls_client_hello};

fuzz_target!(|data: &[u8]| {
    let _ = is_tls_client_hello(data);
    let _ = client_hello_record_len(data);
    let _ = extract_sni(data);
});
