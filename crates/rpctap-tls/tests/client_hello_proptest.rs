use proptest::prelude::*;
use rpctap_tls::{client_hello_record_len, extract_sni, is_tls_client_hello};

proptest! {
    #[test]
    fn arbitrary_bytes_never_panic(data in proptest::collection::vec(any::<u8>(), 0..2048)) {
        let _ = is_tls_client_hello(&data);
        let _ = client_hello_record_len(&data);
        let _ = extract_sni(&data);
    }

    #[test]
    fn plaintext_ascii_is_never_classified_as_tls(
        data in proptest::collection::vec(0x20_u8..0x7f, 6..512),
    ) {
        prop_assert!(!is_tls_client_hello(&data));
    }

    #[test]
    fn truncation_of_a_hello_never_yields_a_different_hostname(cut in 0_usize..4096) {
        // A fixed well-formed hello, cut at an arbitrary point: the extractor
        // must either find the exact hostname or nothing at all.
        let hello = sample_hello();
        let cut = cut.min(hello.len());
        match extract_sni(&hello[..cut]) {
            Some(host) => prop_assert_eq!(host, "stream.example.dev"),
            None => {}
        }
    }
}

fn sample_hello() -> Vec<u8> {
    let host = b"stream.example.dev";

    let mut server_name_list = Vec::new();
    server_name_list.push(0x00);
    server_name_list.extend_from_slice(&(host.len() as u16).to_be_bytes());
    server_name_list.extend_from_slice(host);

    let mut extensions = Vec::new();
    extensions.extend_from_slice(&[0x00, 0x00]);
    extensions.extend_from_slice(&((server_name_list.len() + 2) as u16).to_be_bytes());
    extensions.extend_from_slice(&(server_name_list.len() as u16).to_be_bytes());
    extensions.extend_from_slice(&server_name_list);

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]);
    body.extend_from_slice(&[0x42; 32]);
    body.push(0);
    body.extend_from_slice(&[0x00, 0x02, 0x13, 0x02]);
    body.extend_from_slice(&[0x01, 0x00]);
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = vec![0x01];
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}
