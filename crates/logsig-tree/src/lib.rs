//! Block tree engine and artifact persistence for block-signed logs.
//!
//! Records are folded into one blinded hash tree per block. Each block is
//! seeded with the last leaf of the previous block, so consecutive blocks
//! form a hash chain that survives restarts through a small state file.
//! The modules here are synchronous and free of any signing concerns; the
//! signer crate decides what happens to a finished block's root.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod entropy;
pub mod error;
pub mod metadata;
pub mod record;
pub mod state;
pub mod tree;
pub mod writer;

pub use entropy::{DeviceEntropy, EntropySource, SystemEntropy};
pub use error::{Result, TreeError};
pub use tree::{signature_level, BlockTree, FinishedBlock, LeafKind, TreeOptions};
pub use writer::{ArtifactFile, ArtifactPaths, FileKind};
