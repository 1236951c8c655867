#![no_main]

//! Fuzz target for TLV parsing.
//!
//! Walks arbitrary bytes as nested TLV records. Reading must end in a value
//! or an error, never a panic or an out-of-bounds slice.

use libfuzzer_sys::fuzz_target;
use logsig_core::{Tlv, TlvReader};

const MAX_DEPTH: usize = 8;

fuzz_target!(|data: &[u8]| {
    walk(TlvReader::new(data), 0);
});

fn walk(reader: TlvReader<'_>, depth: usize) {
    for tlv in reader {
        let Ok(tlv) = tlv else { break };
        inspect(&tlv);
        if depth < MAX_DEPTH {
            walk(tlv.children(), depth + 1);
        }
    }
}

fn inspect(tlv: &Tlv<'_>) {
    assert!(tlv.encoded_len() >= tlv.value().len());
    let _ = tlv.as_uint();
    let _ = tlv.child(tlv.tag());
}
