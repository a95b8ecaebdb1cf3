#![no_main]

use cancellable_sql::pg::protocol::decode::decode_message;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Several backend messages may share one read.
    let mut offset = 0;
    while offset < data.len() {
        match decode_message(&data[offset..]) {
            Ok(Some((_, used))) => {
                assert!(used > 0 && offset + used <= data.len());
                offset += used;
            }
            Ok(None) | Err(_) => break,
        }
    }
});
