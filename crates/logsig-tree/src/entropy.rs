//! Entropy sources for per-block initialization vectors.
//!
//! A block cannot start without a full IV. When the configured source fails
//! the error is returned to the caller; there is no low-entropy fallback.

use std::{
    fmt,
    fs::File,
    io::Read,
    path::{Path, PathBuf},
    sync::Arc,
};

use rand::{rngs::OsRng, TryRngCore};

use crate::error::{Result, TreeError};

/// Byte source used to draw block IVs.
pub trait EntropySource: Send + Sync + fmt::Debug {
    /// Fills `buf` completely or fails.
    fn fill(&self, buf: &mut [u8]) -> Result<()>;
}

/// Operating system randomness.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEntropy;

impl EntropySource for SystemEntropy {
    fn fill(&self, buf: &mut [u8]) -> Result<()> {
        OsRng.try_fill_bytes(buf).map_err(|e| TreeError::entropy(e.to_string()))
    }
}

/// Randomness read from a device or file, such as `/dev/urandom`.
#[derive(Debug, Clone)]
pub struct DeviceEntropy {
    path: PathBuf,
}

impl DeviceEntropy {
    /// Reads from the given path on every fill.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Device path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EntropySource for DeviceEntropy {
    fn fill(&self, buf: &mut [u8]) -> Result<()> {
        File::open(&self.path)
            .and_then(|mut device| device.read_exact(buf))
            .map_err(|e| TreeError::entropy(format!("{}: {e}", self.path.display())))
    }
}

/// Builds the source named by configuration, defaulting to system randomness.
pub fn entropy_source(random_source: Option<&Path>) -> Arc<dyn EntropySource> {
    match random_source {
        Some(path) => Arc::new(DeviceEntropy::new(path)),
        None => Arc::new(SystemEntropy),
    }
}
