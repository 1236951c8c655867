//! Temporary log locations and signer configurations for tests.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use logsig_signer::{LogSigner, SignerConfig, SyncMode};
use logsig_tree::ArtifactPaths;
use tempfile::TempDir;

use crate::{entropy::FixedEntropy, mock::MockAggregator, time::TestClock};

/// Endpoint used by [`test_config`].
pub const TEST_ENDPOINT: &str = "ksi+tcp://aggregator.test:3332";

/// Signer configuration for tests.
///
/// Small blocks (level 3, four records), a 10 ms worker poll interval and
/// one mock endpoint.
pub fn test_config(mode: SyncMode) -> SignerConfig {
    SignerConfig {
        block_level_limit: 3,
        sync_mode: mode,
        aggregator_uri: TEST_ENDPOINT.to_string(),
        poll_interval_ms: 10,
        shutdown_timeout_secs: 5,
        ..SignerConfig::default()
    }
}

/// Signer over a mock aggregator with counting IVs and a test clock.
pub fn test_signer(
    config: SignerConfig,
    aggregator: &MockAggregator,
    clock: &TestClock,
) -> logsig_signer::Result<LogSigner> {
    LogSigner::new(
        config,
        Arc::new(aggregator.clone()),
        Arc::new(FixedEntropy::counting()),
        Arc::new(clock.clone()),
    )
}

/// Polls `condition` every 10 ms for up to five seconds.
///
/// Returns whether the condition became true.
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Log file path inside a temporary directory removed on drop.
#[derive(Debug)]
pub struct TestLog {
    dir: TempDir,
    path: PathBuf,
}

impl TestLog {
    /// Creates `app.log` in a fresh temporary directory.
    pub fn new() -> Result<Self> {
        Self::named("app.log")
    }

    /// Creates a log with the given file name in a fresh temporary directory.
    pub fn named(name: &str) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(name);
        Ok(Self { dir, path })
    }

    /// Log file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Temporary directory holding the log and its artifacts.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Artifact locations for the given mode.
    pub fn artifacts(&self, mode: SyncMode) -> ArtifactPaths {
        match mode {
            SyncMode::Synchronous => ArtifactPaths::single_file(&self.path),
            SyncMode::Asynchronous => ArtifactPaths::split(&self.path),
        }
    }
}
