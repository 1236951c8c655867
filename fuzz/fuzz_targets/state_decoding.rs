#![no_main]

//! Fuzz target for chain state decoding.
//!
//! A state file that decodes must start with the encoding of its hash.

use libfuzzer_sys::fuzz_target;
use logsig_tree::state;

fuzz_target!(|data: &[u8]| {
    if let Some(imprint) = state::decode(data) {
        assert!(data.starts_with(&state::encode(&imprint)));
    }
});
