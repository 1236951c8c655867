//! Error types for tree construction and artifact persistence.

use std::{io, path::PathBuf};

use logsig_core::CoreError;
use thiserror::Error;

/// Result type alias for tree operations.
pub type Result<T> = std::result::Result<T, TreeError>;

/// Failures raised by the block tree and its artifact files.
#[derive(Debug, Error)]
pub enum TreeError {
    /// Writing to an artifact failed.
    #[error("artifact write failed: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: io::Error,
    },

    /// Artifact could not be created or opened.
    #[error("cannot open artifact {}: {source}", path.display())]
    ArtifactOpen {
        /// Path of the artifact
        path: PathBuf,
        /// Underlying I/O error
        source: io::Error,
    },

    /// No initialization vector could be drawn for a new block.
    #[error("entropy source unavailable: {message}")]
    EntropyUnavailable {
        /// Description of the failure
        message: String,
    },

    /// Record could not be encoded.
    #[error(transparent)]
    Encoding(#[from] CoreError),

    /// Leaf added or finish requested without an open block.
    #[error("no block is open")]
    NoOpenBlock,

    /// Block start requested while a block is open.
    #[error("a block is already open")]
    BlockAlreadyOpen,

    /// Leaf added to a block that already holds its maximum record count.
    #[error("block already holds {limit} records")]
    BlockFull {
        /// Configured block size
        limit: u64,
    },

    /// Block level limit outside the supported range.
    #[error("block level limit {level} outside supported range {min}..={max}")]
    LevelOutOfRange {
        /// Requested level
        level: u8,
        /// Smallest supported level
        min: u8,
        /// Largest supported level
        max: u8,
    },
}

impl TreeError {
    /// Creates an entropy error.
    pub fn entropy(message: impl Into<String>) -> Self {
        Self::EntropyUnavailable { message: message.into() }
    }

    /// Creates an artifact open error.
    pub fn artifact_open(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::ArtifactOpen { path: path.into(), source }
    }

    /// Returns true when the stream can no longer produce a consistent tree.
    ///
    /// Entropy failures leave no block open, and a misconfigured level can
    /// never produce one, so both take the stream out of service. I/O and
    /// encoding failures only fail the current operation.
    pub fn disables_stream(&self) -> bool {
        matches!(self, Self::EntropyUnavailable { .. } | Self::LevelOutOfRange { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_disabling_errors_identified_correctly() {
        assert!(TreeError::entropy("device missing").disables_stream());
        assert!(TreeError::LevelOutOfRange { level: 1, min: 2, max: 32 }.disables_stream());

        assert!(!TreeError::from(io::Error::other("disk full")).disables_stream());
        assert!(!TreeError::NoOpenBlock.disables_stream());
        assert!(!TreeError::from(CoreError::TagOutOfRange { tag: 0x2000 }).disables_stream());
    }

    #[test]
    fn artifact_errors_name_the_path() {
        let err = TreeError::artifact_open("/var/log/x.logsig", io::Error::other("denied"));
        assert_eq!(err.to_string(), "cannot open artifact /var/log/x.logsig: denied");
    }
}
