//! Tag/length/value framing for block, signature and metadata records.
//!
//! Two header forms exist. Tags up to `0x1F` whose value fits in 255 bytes
//! use the short form: one byte of tag, one byte of length. Everything else
//! uses the long form: a 16-bit big-endian word with the `0x80` flag and a
//! 13-bit tag, followed by a 16-bit big-endian length.
//!
//! ```text
//! short:  [ 0 0 0 t t t t t ][ len ]
//! long:   [ 1 0 0 t t t t t ][ t t t t t t t t ][ len hi ][ len lo ]
//! ```
//!
//! Unsigned integers are stored as their minimal big-endian representation;
//! zero is stored as an empty value.

use crate::error::{CoreError, Result};

/// Flag bit marking the long header form.
pub const FLAG_TLV16: u8 = 0x80;

/// Mask selecting the tag bits of the first header byte.
pub const TYPE_MASK: u8 = 0x1F;

/// Largest tag representable in the long header form.
pub const MAX_TAG: u16 = 0x1FFF;

/// Largest value length representable in the long header form.
pub const MAX_VALUE_LEN: usize = u16::MAX as usize;

/// Tags used by the log signature formats.
pub mod tags {
    /// Block header: algorithm, IV and previous chain hash.
    pub const BLOCK_HEADER: u16 = 0x0901;
    /// Per-record hash, written when record hashes are kept.
    pub const RECORD_HASH: u16 = 0x0902;
    /// Intermediate tree node, written when tree hashes are kept.
    pub const TREE_HASH: u16 = 0x0903;
    /// Block signature or its placeholder.
    pub const BLOCK_SIGNATURE: u16 = 0x0904;
    /// Serialized signature inside a block signature record.
    pub const SIGNATURE_DATA: u16 = 0x0905;
    /// Metadata record.
    pub const METADATA: u16 = 0x0911;

    /// Header: hash algorithm identifier.
    pub const HEADER_ALGORITHM: u16 = 0x01;
    /// Header: initialization vector.
    pub const HEADER_IV: u16 = 0x02;
    /// Header: chain hash carried over from the previous block.
    pub const HEADER_LAST_HASH: u16 = 0x03;

    /// Signature record: number of records in the block.
    pub const RECORD_COUNT: u16 = 0x01;
    /// Signature record: placeholder for a missing signature.
    pub const NO_SIGNATURE: u16 = 0x02;
    /// Placeholder: root hash of the unsigned block.
    pub const NO_SIGNATURE_ROOT: u16 = 0x01;
    /// Placeholder: NUL-terminated error text.
    pub const NO_SIGNATURE_ERROR: u16 = 0x02;

    /// Metadata: index of the record the metadata precedes.
    pub const METADATA_RECORD_INDEX: u16 = 0x01;
    /// Metadata: key/value pair.
    pub const METADATA_PAIR: u16 = 0x02;
    /// Metadata pair: NUL-terminated key.
    pub const METADATA_KEY: u16 = 0x01;
    /// Metadata pair: NUL-terminated value.
    pub const METADATA_VALUE: u16 = 0x02;
}

/// Length of the header that would frame a value of `len` bytes.
pub fn header_len(tag: u16, len: usize) -> usize {
    if tag <= u16::from(TYPE_MASK) && len <= 0xFF {
        2
    } else {
        4
    }
}

/// Appends a header for a value of `len` bytes.
pub fn write_header(out: &mut Vec<u8>, tag: u16, len: usize) -> Result<()> {
    if tag > MAX_TAG {
        return Err(CoreError::TagOutOfRange { tag });
    }
    if len > MAX_VALUE_LEN {
        return Err(CoreError::ValueTooLong { tag, len });
    }

    if header_len(tag, len) == 2 {
        out.extend_from_slice(&[tag as u8, len as u8]);
    } else {
        let typ = (u16::from(FLAG_TLV16) << 8) | tag;
        out.extend_from_slice(&typ.to_be_bytes());
        out.extend_from_slice(&(len as u16).to_be_bytes());
    }
    Ok(())
}

/// Minimal big-endian encoding of `value`; empty for zero.
pub fn encode_uint(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

/// Appends an octet-string element.
pub fn write_octets(out: &mut Vec<u8>, tag: u16, value: &[u8]) -> Result<()> {
    write_header(out, tag, value.len())?;
    out.extend_from_slice(value);
    Ok(())
}

/// Appends an unsigned integer element.
pub fn write_uint(out: &mut Vec<u8>, tag: u16, value: u64) -> Result<()> {
    write_octets(out, tag, &encode_uint(value))
}

/// Appends a string element terminated with NUL.
pub fn write_cstring(out: &mut Vec<u8>, tag: u16, value: &str) -> Result<()> {
    write_header(out, tag, value.len() + 1)?;
    out.extend_from_slice(value.as_bytes());
    out.push(0);
    Ok(())
}

/// Appends a nested element whose children are produced by `build`.
///
/// The header is sized from the children actually written, so the short or
/// long form is always chosen from the real value length.
pub fn write_nested<F>(out: &mut Vec<u8>, tag: u16, build: F) -> Result<()>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut inner = Vec::new();
    build(&mut inner)?;
    write_octets(out, tag, &inner)
}

/// A decoded element borrowing from the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    tag: u16,
    value: &'a [u8],
    offset: usize,
    encoded_len: usize,
}

impl<'a> Tlv<'a> {
    /// Element tag with flag bits removed.
    pub fn tag(&self) -> u16 {
        self.tag
    }

    /// Raw value bytes.
    pub fn value(&self) -> &'a [u8] {
        self.value
    }

    /// Offset of the header within the buffer the reader was created on.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Header plus value length.
    pub fn encoded_len(&self) -> usize {
        self.encoded_len
    }

    /// Interprets the value as a big-endian unsigned integer.
    pub fn as_uint(&self) -> Result<u64> {
        if self.value.len() > 8 {
            return Err(CoreError::IntegerOverflow { len: self.value.len() });
        }
        Ok(self.value.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }

    /// Reader over the nested elements of this value.
    pub fn children(&self) -> TlvReader<'a> {
        TlvReader::new(self.value)
    }

    /// First direct child with the given tag.
    pub fn child(&self, tag: u16) -> Result<Option<Tlv<'a>>> {
        for child in self.children() {
            let child = child?;
            if child.tag == tag {
                return Ok(Some(child));
            }
        }
        Ok(None)
    }
}

/// Sequential decoder over a buffer of concatenated elements.
///
/// Iteration yields at most one error and then stops.
#[derive(Debug, Clone)]
pub struct TlvReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> TlvReader<'a> {
    /// Creates a reader positioned at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not consumed yet.
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    /// Reads the next element, or `None` at end of input.
    pub fn read_next(&mut self) -> Result<Option<Tlv<'a>>> {
        let rest = self.remaining();
        if rest.is_empty() {
            return Ok(None);
        }

        let offset = self.pos;
        let (tag, len, header) = if rest[0] & FLAG_TLV16 != 0 {
            if rest.len() < 4 {
                return Err(CoreError::truncated(offset, 4 - rest.len()));
            }
            let tag = u16::from_be_bytes([rest[0] & TYPE_MASK, rest[1]]);
            let len = usize::from(u16::from_be_bytes([rest[2], rest[3]]));
            (tag, len, 4)
        } else {
            if rest.len() < 2 {
                return Err(CoreError::truncated(offset, 2 - rest.len()));
            }
            (u16::from(rest[0] & TYPE_MASK), usize::from(rest[1]), 2)
        };

        let available = rest.len() - header;
        if available < len {
            return Err(CoreError::truncated(offset, len - available));
        }

        let value = &rest[header..header + len];
        self.pos += header + len;
        Ok(Some(Tlv { tag, value, offset, encoded_len: header + len }))
    }
}

impl<'a> Iterator for TlvReader<'a> {
    type Item = Result<Tlv<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_next() {
            Ok(Some(tlv)) => Some(Ok(tlv)),
            Ok(None) => None,
            Err(e) => {
                self.pos = self.data.len();
                Some(Err(e))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_header_for_small_tag_and_value() {
        let mut out = Vec::new();
        write_octets(&mut out, 0x01, &[0xAA, 0xBB]).unwrap();
        assert_eq!(out, vec![0x01, 0x02, 0xAA, 0xBB]);
    }

    #[test]
    fn long_header_for_large_tag() {
        let mut out = Vec::new();
        write_octets(&mut out, tags::RECORD_HASH, &[0x01]).unwrap();
        assert_eq!(out, vec![0x89, 0x02, 0x00, 0x01, 0x01]);
    }

    #[test]
    fn long_header_for_small_tag_with_long_value() {
        let mut out = Vec::new();
        let value = vec![7u8; 300];
        write_octets(&mut out, 0x02, &value).unwrap();

        assert_eq!(&out[..4], &[0x80, 0x02, 0x01, 0x2C]);
        assert_eq!(out.len(), 304);

        let tlv = TlvReader::new(&out).read_next().unwrap().unwrap();
        assert_eq!(tlv.tag(), 0x02);
        assert_eq!(tlv.value().len(), 300);
    }

    #[test]
    fn rejects_unrepresentable_elements() {
        let mut out = Vec::new();
        assert_eq!(write_header(&mut out, 0x2000, 1), Err(CoreError::TagOutOfRange { tag: 0x2000 }));
        assert_eq!(
            write_header(&mut out, 0x01, 70_000),
            Err(CoreError::ValueTooLong { tag: 0x01, len: 70_000 })
        );
        assert!(out.is_empty());
    }

    #[test]
    fn integers_use_minimal_big_endian_bytes() {
        assert!(encode_uint(0).is_empty());
        assert_eq!(encode_uint(4), vec![0x04]);
        assert_eq!(encode_uint(255), vec![0xFF]);
        assert_eq!(encode_uint(256), vec![0x01, 0x00]);
        assert_eq!(encode_uint(u64::MAX), vec![0xFF; 8]);

        let mut out = Vec::new();
        write_uint(&mut out, 0x01, 0).unwrap();
        assert_eq!(out, vec![0x01, 0x00]);

        let tlv = TlvReader::new(&out).read_next().unwrap().unwrap();
        assert_eq!(tlv.as_uint().unwrap(), 0);
    }

    #[test]
    fn cstrings_are_nul_terminated() {
        let mut out = Vec::new();
        write_cstring(&mut out, 0x02, "abc").unwrap();
        assert_eq!(out, vec![0x02, 0x04, b'a', b'b', b'c', 0x00]);
    }

    #[test]
    fn nested_elements_are_sized_from_children() {
        let mut out = Vec::new();
        write_nested(&mut out, tags::BLOCK_SIGNATURE, |inner| {
            write_uint(inner, tags::RECORD_COUNT, 3)?;
            write_octets(inner, tags::SIGNATURE_DATA, b"sig")
        })
        .unwrap();

        assert_eq!(out, vec![
            0x89, 0x04, 0x00, 0x0A, // block signature, 10 bytes
            0x01, 0x01, 0x03, // record count
            0x89, 0x05, 0x00, 0x03, b's', b'i', b'g',
        ]);

        let record = TlvReader::new(&out).read_next().unwrap().unwrap();
        assert_eq!(record.tag(), tags::BLOCK_SIGNATURE);
        assert_eq!(record.child(tags::RECORD_COUNT).unwrap().unwrap().as_uint().unwrap(), 3);
        assert_eq!(record.child(tags::SIGNATURE_DATA).unwrap().unwrap().value(), b"sig");
        assert!(record.child(tags::NO_SIGNATURE).unwrap().is_none());
    }

    #[test]
    fn reader_reports_truncation_once() {
        let data = [0x01, 0x05, 0xAA];
        let mut reader = TlvReader::new(&data);

        assert_eq!(reader.next(), Some(Err(CoreError::truncated(0, 4))));
        assert_eq!(reader.next(), None);
    }

    #[test]
    fn reader_walks_concatenated_elements() {
        let mut out = Vec::new();
        write_octets(&mut out, 0x01, b"a").unwrap();
        write_octets(&mut out, tags::TREE_HASH, b"bc").unwrap();

        let items: Vec<_> = TlvReader::new(&out).collect::<Result<_>>().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].tag(), tags::TREE_HASH);
        assert_eq!(items[1].offset(), 3);
        assert_eq!(items[1].encoded_len(), 6);
    }

    #[test]
    fn oversized_integers_are_rejected() {
        let mut out = Vec::new();
        write_octets(&mut out, 0x01, &[1u8; 9]).unwrap();
        let tlv = TlvReader::new(&out).read_next().unwrap().unwrap();
        assert_eq!(tlv.as_uint(), Err(CoreError::IntegerOverflow { len: 9 }));
    }
}
