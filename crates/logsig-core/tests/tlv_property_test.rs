//! Property tests for TLV framing.
//!
//! Checks that the header form is chosen from the tag and value length and
//! that integer encoding stays minimal.

#![allow(clippy::unwrap_used)]

use logsig_core::tlv::{self, TlvReader};
use proptest::prelude::*;

fn proptest_config() -> ProptestConfig {
    ProptestConfig {
        cases: 64,
        failure_persistence: None,
        ..ProptestConfig::default()
    }
}

fn element() -> impl Strategy<Value = (u16, Vec<u8>)> {
    (0u16..=tlv::MAX_TAG, prop::collection::vec(any::<u8>(), 0..600))
}

proptest! {
    #![proptest_config(proptest_config())]

    #[test]
    fn header_form_follows_tag_and_length((tag, value) in element()) {
        let mut out = Vec::new();
        tlv::write_octets(&mut out, tag, &value).unwrap();

        let expected_header = if tag <= 0x1F && value.len() <= 0xFF { 2 } else { 4 };
        prop_assert_eq!(out.len(), expected_header + value.len());
        prop_assert_eq!(out[0] & tlv::FLAG_TLV16 != 0, expected_header == 4);
    }

    #[test]
    fn integers_are_minimal(value in any::<u64>()) {
        let encoded = tlv::encode_uint(value);

        prop_assert!(encoded.first().map_or(true, |b| *b != 0));

        let mut out = Vec::new();
        tlv::write_uint(&mut out, 0x01, value).unwrap();
        let decoded = TlvReader::new(&out).read_next().unwrap().unwrap().as_uint().unwrap();
        prop_assert_eq!(decoded, value);
    }
}
