//! Metadata records embedded in the hash tree.
//!
//! A metadata record is a key/value pair hashed into the tree as a leaf in
//! its own right and also written verbatim to the block file.

use logsig_core::{
    tlv::{self, tags},
    Result,
};

/// Key under which the reason for closing a block is recorded.
pub const BLOCK_CLOSE_REASON: &str = "com.guardtime.blockCloseReason";

/// Close reason recorded when the log file is closed.
pub const CLOSED_ON_FILE_CLOSE: &str = "Block closed due to file closure.";

/// Close reason recorded when a block reaches its time limit.
pub fn closed_on_time_limit(limit_secs: u64) -> String {
    format!("Block closed due to reaching time limit {limit_secs}")
}

/// Encodes a metadata record preceding the record at `record_index`.
pub fn encode(record_index: u64, key: &str, value: &str) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    tlv::write_nested(&mut out, tags::METADATA, |record| {
        tlv::write_uint(record, tags::METADATA_RECORD_INDEX, record_index)?;
        tlv::write_nested(record, tags::METADATA_PAIR, |pair| {
            tlv::write_cstring(pair, tags::METADATA_KEY, key)?;
            tlv::write_cstring(pair, tags::METADATA_VALUE, value)
        })
    })?;
    Ok(out)
}
