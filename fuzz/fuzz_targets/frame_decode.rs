#![no_main]

use libfuzzer_sys::fuzz_target;
use stager_link::protocol::{decode_inbound, decode_outbound, encode_inbound};

fuzz_target!(|data: &[u8]| {
    if let Ok(msg) = decode_inbound(data)
        && let Ok(line) = encode_inbound(&msg)
    {
        assert_eq!(decode_inbound(&line).ok(), Some(msg));
    }
    let _ = decode_outbound(data);
});
