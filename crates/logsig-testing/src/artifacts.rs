//! Readers for block, signature and state artifacts.
//!
//! These parse just enough of the format to let tests check what was
//! written, and fail loudly on anything unexpected.

use std::{fs, path::Path};

use anyhow::{anyhow, bail, Context, Result};
use logsig_core::{tlv::tags, Imprint, Tlv, TlvReader};
use logsig_tree::FileKind;

/// Signature record closing a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureRecord {
    /// Signed block.
    Signed {
        /// Leaves in the block
        record_count: u64,
        /// Serialized signature
        signature: Vec<u8>,
    },
    /// Placeholder for a block without a signature.
    Unsigned {
        /// Leaves in the block
        record_count: u64,
        /// Block root
        root: Imprint,
        /// Failure text, absent for asynchronous placeholders
        error: Option<String>,
    },
}

impl SignatureRecord {
    /// Leaves in the block.
    pub fn record_count(&self) -> u64 {
        match self {
            Self::Signed { record_count, .. } | Self::Unsigned { record_count, .. } => *record_count,
        }
    }

    /// Whether the record carries a signature.
    pub fn is_signed(&self) -> bool {
        matches!(self, Self::Signed { .. })
    }
}

/// Block header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    /// Hash algorithm id
    pub algorithm: u8,
    /// Block IV
    pub iv: Vec<u8>,
    /// Chain hash the block continues from
    pub last_hash: Imprint,
}

/// Metadata record fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRecord {
    /// Record index within its block
    pub record_index: u64,
    /// Key
    pub key: String,
    /// Value
    pub value: String,
}

/// Reads an artifact, checks its magic and returns the body after it.
pub fn read_body(path: &Path, kind: FileKind) -> Result<Vec<u8>> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let magic = kind.magic();
    if bytes.len() < magic.len() || &bytes[..magic.len()] != magic {
        bail!("{} does not start with {:?}", path.display(), String::from_utf8_lossy(magic));
    }
    Ok(bytes[magic.len()..].to_vec())
}

/// Top-level record tags in file order.
pub fn record_tags(path: &Path, kind: FileKind) -> Result<Vec<u16>> {
    let body = read_body(path, kind)?;
    TlvReader::new(&body).map(|tlv| -> Result<u16> { Ok(tlv?.tag()) }).collect()
}

/// Signature records in file order.
pub fn signature_records(path: &Path, kind: FileKind) -> Result<Vec<SignatureRecord>> {
    let body = read_body(path, kind)?;
    let mut records = Vec::new();
    for tlv in TlvReader::new(&body) {
        let tlv = tlv?;
        if tlv.tag() == tags::BLOCK_SIGNATURE {
            records.push(parse_signature(&tlv)?);
        }
    }
    Ok(records)
}

/// Block headers in file order.
pub fn block_headers(path: &Path, kind: FileKind) -> Result<Vec<BlockHeader>> {
    let body = read_body(path, kind)?;
    let mut headers = Vec::new();
    for tlv in TlvReader::new(&body) {
        let tlv = tlv?;
        if tlv.tag() == tags::BLOCK_HEADER {
            let algorithm = required(&tlv, tags::HEADER_ALGORITHM)?.value();
            headers.push(BlockHeader {
                algorithm: *algorithm.first().ok_or_else(|| anyhow!("empty algorithm id"))?,
                iv: required(&tlv, tags::HEADER_IV)?.value().to_vec(),
                last_hash: Imprint::from_bytes(required(&tlv, tags::HEADER_LAST_HASH)?.value())?,
            });
        }
    }
    Ok(headers)
}

/// Metadata records in file order.
pub fn metadata_records(path: &Path, kind: FileKind) -> Result<Vec<MetadataRecord>> {
    let body = read_body(path, kind)?;
    let mut records = Vec::new();
    for tlv in TlvReader::new(&body) {
        let tlv = tlv?;
        if tlv.tag() == tags::METADATA {
            let pair = required(&tlv, tags::METADATA_PAIR)?;
            records.push(MetadataRecord {
                record_index: required(&tlv, tags::METADATA_RECORD_INDEX)?.as_uint()?,
                key: cstring(&required(&pair, tags::METADATA_KEY)?)?,
                value: cstring(&required(&pair, tags::METADATA_VALUE)?)?,
            });
        }
    }
    Ok(records)
}

fn parse_signature(tlv: &Tlv<'_>) -> Result<SignatureRecord> {
    let record_count = required(tlv, tags::RECORD_COUNT)?.as_uint()?;

    if let Some(signature) = tlv.child(tags::SIGNATURE_DATA)? {
        return Ok(SignatureRecord::Signed { record_count, signature: signature.value().to_vec() });
    }

    let placeholder = required(tlv, tags::NO_SIGNATURE)?;
    let root = Imprint::from_bytes(required(&placeholder, tags::NO_SIGNATURE_ROOT)?.value())?;
    let error = placeholder.child(tags::NO_SIGNATURE_ERROR)?.map(|text| cstring(&text)).transpose()?;
    Ok(SignatureRecord::Unsigned { record_count, root, error })
}

fn required<'a>(tlv: &Tlv<'a>, tag: u16) -> Result<Tlv<'a>> {
    tlv.child(tag)?.ok_or_else(|| anyhow!("record {:#06x} lacks element {:#04x}", tlv.tag(), tag))
}

fn cstring(tlv: &Tlv<'_>) -> Result<String> {
    let value = tlv.value();
    let text = value.strip_suffix(&[0]).ok_or_else(|| anyhow!("string is not NUL-terminated"))?;
    Ok(String::from_utf8(text.to_vec())?)
}
