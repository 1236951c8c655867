//! Error types for encoding and hashing primitives.

use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Failures raised while encoding, decoding or hashing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Tag does not fit into the 13 bits available in a 16-bit header.
    #[error("TLV tag {tag:#06x} is out of range")]
    TagOutOfRange {
        /// Offending tag
        tag: u16,
    },

    /// Value exceeds the 16-bit length field.
    #[error("TLV value for tag {tag:#06x} is too long: {len} bytes")]
    ValueTooLong {
        /// Tag being encoded
        tag: u16,
        /// Length of the value in bytes
        len: usize,
    },

    /// Input ended before a complete element was read.
    #[error("truncated TLV at offset {offset}: need {needed} more bytes")]
    Truncated {
        /// Offset of the element that could not be read
        offset: usize,
        /// Number of bytes missing
        needed: usize,
    },

    /// Integer value wider than 64 bits.
    #[error("integer of {len} bytes does not fit into 64 bits")]
    IntegerOverflow {
        /// Encoded length of the integer
        len: usize,
    },

    /// Algorithm identifier not known to this implementation.
    #[error("unsupported hash algorithm id {id:#04x}")]
    UnsupportedAlgorithm {
        /// Algorithm identifier byte
        id: u8,
    },

    /// Digest length does not match the algorithm.
    #[error("digest length {actual} does not match {expected} expected for algorithm {algorithm}")]
    DigestLength {
        /// Algorithm name
        algorithm: &'static str,
        /// Expected digest length
        expected: usize,
        /// Actual digest length
        actual: usize,
    },
}

impl CoreError {
    /// Creates a truncation error.
    pub fn truncated(offset: usize, needed: usize) -> Self {
        Self::Truncated { offset, needed }
    }

    /// Returns true if the error was raised while decoding input data.
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            Self::Truncated { .. }
                | Self::IntegerOverflow { .. }
                | Self::UnsupportedAlgorithm { .. }
                | Self::DigestLength { .. }
        )
    }
}
