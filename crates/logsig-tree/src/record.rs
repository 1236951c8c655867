//! Byte layouts of block headers, hash records and block signatures.
//!
//! ```text
//! 0x0901 block header   { 0x01 algorithm id, 0x02 IV, 0x03 previous chain hash }
//! 0x0902 record hash    imprint
//! 0x0903 tree hash      imprint
//! 0x0904 signature      { 0x01 record count, 0x0905 signature bytes }
//! 0x0904 no signature   { 0x01 record count, 0x02 { 0x01 root, 0x02 error text } }
//! ```

use logsig_core::{
    tlv::{self, tags},
    HashAlgorithm, Imprint, Result,
};

/// Header opening every block.
pub fn block_header(algorithm: HashAlgorithm, iv: &[u8], last_hash: &Imprint) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    tlv::write_nested(&mut out, tags::BLOCK_HEADER, |inner| {
        tlv::write_octets(inner, tags::HEADER_ALGORITHM, &[algorithm.id()])?;
        tlv::write_octets(inner, tags::HEADER_IV, iv)?;
        tlv::write_octets(inner, tags::HEADER_LAST_HASH, last_hash.as_bytes())
    })?;
    Ok(out)
}

/// Record or tree hash element.
pub fn hash_record(tag: u16, imprint: &Imprint) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(imprint.len() + 4);
    tlv::write_octets(&mut out, tag, imprint.as_bytes())?;
    Ok(out)
}

/// Block signature record carrying serialized signature bytes.
pub fn signature_record(record_count: u64, signature: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(signature.len() + 16);
    tlv::write_nested(&mut out, tags::BLOCK_SIGNATURE, |inner| {
        tlv::write_uint(inner, tags::RECORD_COUNT, record_count)?;
        tlv::write_octets(inner, tags::SIGNATURE_DATA, signature)
    })?;
    Ok(out)
}

/// Placeholder written where a block has no signature.
///
/// Asynchronous mode writes it without error text as soon as a block is
/// finished; a failed signing attempt writes it with the error description.
pub fn no_signature_record(record_count: u64, root: &Imprint, error: Option<&str>) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    tlv::write_nested(&mut out, tags::BLOCK_SIGNATURE, |inner| {
        tlv::write_uint(inner, tags::RECORD_COUNT, record_count)?;
        tlv::write_nested(inner, tags::NO_SIGNATURE, |placeholder| {
            tlv::write_octets(placeholder, tags::NO_SIGNATURE_ROOT, root.as_bytes())?;
            match error {
                Some(text) => tlv::write_cstring(placeholder, tags::NO_SIGNATURE_ERROR, text),
                None => Ok(()),
            }
        })
    })?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use logsig_core::TlvReader;

    use super::*;

    #[test]
    fn block_header_layout() {
        let iv = [0xA5u8; 32];
        let last = Imprint::zero(HashAlgorithm::Sha256);
        let bytes = block_header(HashAlgorithm::Sha256, &iv, &last).unwrap();

        // 3 + 34 + 35 bytes of children behind a 4-byte header
        assert_eq!(&bytes[..4], &[0x89, 0x01, 0x00, 72]);
        assert_eq!(&bytes[4..7], &[0x01, 0x01, 0x01]);
        assert_eq!(&bytes[7..9], &[0x02, 32]);
        assert_eq!(&bytes[41..43], &[0x03, 33]);
        assert_eq!(bytes.len(), 76);
    }

    #[test]
    fn signature_record_layout() {
        let bytes = signature_record(4, b"der").unwrap();
        assert_eq!(bytes, vec![
            0x89, 0x04, 0x00, 0x0A, 0x01, 0x01, 0x04, 0x89, 0x05, 0x00, 0x03, b'd', b'e', b'r'
        ]);
    }

    #[test]
    fn placeholder_without_error_text() {
        let root = HashAlgorithm::Sha256.digest(b"root");
        let bytes = no_signature_record(2, &root, None).unwrap();

        let record = TlvReader::new(&bytes).read_next().unwrap().unwrap();
        let placeholder = record.child(tags::NO_SIGNATURE).unwrap().unwrap();
        assert_eq!(placeholder.value().len(), 35);
        assert_eq!(
            placeholder.child(tags::NO_SIGNATURE_ROOT).unwrap().unwrap().value(),
            root.as_bytes()
        );
        assert!(placeholder.child(tags::NO_SIGNATURE_ERROR).unwrap().is_none());
    }

    #[test]
    fn placeholder_with_error_text() {
        let root = HashAlgorithm::Sha256.digest(b"root");
        let bytes = no_signature_record(0, &root, Some("network error")).unwrap();

        let record = TlvReader::new(&bytes).read_next().unwrap().unwrap();
        let count = record.child(tags::RECORD_COUNT).unwrap().unwrap();
        assert!(count.value().is_empty());

        let placeholder = record.child(tags::NO_SIGNATURE).unwrap().unwrap();
        let error = placeholder.child(tags::NO_SIGNATURE_ERROR).unwrap().unwrap();
        assert_eq!(error.value(), b"network error\0");
    }

    #[test]
    fn oversized_signature_is_rejected() {
        let signature = vec![0u8; 70_000];
        assert!(signature_record(1, &signature).is_err());
    }
}
