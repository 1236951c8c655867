//! Signer configuration with defaults, file, and environment overrides.

use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use logsig_core::HashAlgorithm;
use logsig_tree::{tree::check_level_limit, ArtifactPaths, TreeOptions};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    aggregator::Endpoint,
    error::{Result, SignerError},
};

const CONFIG_FILE: &str = "logsig.toml";
const ENV_PREFIX: &str = "LOGSIG_";

/// Most aggregation endpoints used for high availability.
pub const MAX_ENDPOINTS: usize = 3;

/// How finished blocks are signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// The writer waits for each signature; one `.logsig` file.
    #[default]
    #[serde(alias = "sync")]
    Synchronous,
    /// A worker signs in the background; split block and signature files.
    #[serde(alias = "async")]
    Asynchronous,
}

/// Complete signer configuration.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables prefixed with `LOGSIG_` (highest priority)
/// 2. Configuration file (`logsig.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// # Example
///
/// ```no_run
/// use logsig_signer::SignerConfig;
///
/// let config = SignerConfig::load().expect("Failed to load configuration");
/// println!("signing blocks of up to 2^{} leaves", config.block_level_limit - 1);
/// ```
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerConfig {
    // Hashing
    /// Hash algorithm for records and tree nodes.
    ///
    /// Environment variable: `LOGSIG_HASH_ALGORITHM`
    #[serde(default = "default_algorithm")]
    pub hash_algorithm: String,
    /// HMAC algorithm for authenticating aggregation requests.
    ///
    /// Environment variable: `LOGSIG_HMAC_ALGORITHM`
    #[serde(default = "default_algorithm")]
    pub hmac_algorithm: String,

    // Blocks
    /// Maximum tree level of a block; a block holds `2^(level - 1)` records.
    ///
    /// Environment variable: `LOGSIG_BLOCK_LEVEL_LIMIT`
    #[serde(default = "default_block_level_limit")]
    pub block_level_limit: u8,
    /// Seconds after which an open block is closed; zero disables the limit.
    ///
    /// Environment variable: `LOGSIG_BLOCK_TIME_LIMIT_SECS`
    #[serde(default)]
    pub block_time_limit_secs: u64,
    /// Write each record hash to the block file.
    ///
    /// Environment variable: `LOGSIG_KEEP_RECORD_HASHES`
    #[serde(default = "default_true")]
    pub keep_record_hashes: bool,
    /// Write each tree node to the block file.
    ///
    /// Environment variable: `LOGSIG_KEEP_TREE_HASHES`
    #[serde(default)]
    pub keep_tree_hashes: bool,
    /// Device or file supplying block IVs instead of system randomness.
    ///
    /// Environment variable: `LOGSIG_RANDOM_SOURCE`
    #[serde(default)]
    pub random_source: Option<PathBuf>,

    // Signing
    /// Synchronous or asynchronous signing.
    ///
    /// Environment variable: `LOGSIG_SYNC_MODE`
    #[serde(default)]
    pub sync_mode: SyncMode,
    /// Maximum in-flight aggregation requests.
    ///
    /// Environment variable: `LOGSIG_MAX_REQUESTS`
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,
    /// Aggregator endpoints separated by `|`.
    ///
    /// Environment variable: `LOGSIG_AGGREGATOR_URI`
    #[serde(default)]
    pub aggregator_uri: String,
    /// Aggregator login identifier.
    ///
    /// Environment variable: `LOGSIG_AGGREGATOR_LOGIN_ID`
    #[serde(default)]
    pub aggregator_login_id: Option<String>,
    /// Aggregator HMAC key.
    ///
    /// Environment variable: `LOGSIG_AGGREGATOR_KEY`
    #[serde(default)]
    pub aggregator_key: Option<String>,

    // Worker
    /// Longest wait for new work before the worker runs its periodic checks.
    ///
    /// Environment variable: `LOGSIG_POLL_INTERVAL_MS`
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Seconds to wait for a response before a request counts as failed.
    ///
    /// Environment variable: `LOGSIG_SIGNATURE_TIMEOUT_SECS`
    #[serde(default = "default_signature_timeout_secs")]
    pub signature_timeout_secs: u64,
    /// Seconds to wait for the worker to drain on shutdown.
    ///
    /// Environment variable: `LOGSIG_SHUTDOWN_TIMEOUT_SECS`
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl SignerConfig {
    /// Loads configuration from defaults, `logsig.toml`, and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from(CONFIG_FILE)
    }

    /// Loads configuration using `path` as the configuration file.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX));

        let config: Self = figment
            .extract()
            .map_err(|e| SignerError::configuration(format!("failed to load configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates configuration values.
    pub fn validate(&self) -> Result<()> {
        check_level_limit(self.block_level_limit)
            .map_err(|e| SignerError::configuration(e.to_string()))?;

        if self.max_requests == 0 {
            return Err(SignerError::configuration("max_requests must be greater than 0"));
        }

        if self.poll_interval_ms == 0 {
            return Err(SignerError::configuration("poll_interval_ms must be greater than 0"));
        }

        if self.signature_timeout_secs == 0 {
            return Err(SignerError::configuration(
                "signature_timeout_secs must be greater than 0",
            ));
        }

        if self.sync_mode == SyncMode::Asynchronous && self.endpoint_uris().next().is_none() {
            return Err(SignerError::configuration(
                "asynchronous signing requires at least one aggregator endpoint",
            ));
        }

        Ok(())
    }

    /// Resolved record hash algorithm.
    ///
    /// Unknown or untrusted names fall back to SHA-256 with a warning.
    pub fn hash_algorithm(&self) -> HashAlgorithm {
        resolve_algorithm("hash function", &self.hash_algorithm)
    }

    /// Resolved HMAC algorithm, with the same fallback as the hash algorithm.
    pub fn hmac_algorithm(&self) -> HashAlgorithm {
        resolve_algorithm("HMAC function", &self.hmac_algorithm)
    }

    /// Tree options derived from this configuration.
    pub fn tree_options(&self) -> TreeOptions {
        TreeOptions {
            algorithm: self.hash_algorithm(),
            keep_record_hashes: self.keep_record_hashes,
            keep_tree_hashes: self.keep_tree_hashes,
        }
    }

    /// Artifact locations for a log file under the configured mode.
    pub fn artifact_paths(&self, log: &Path) -> ArtifactPaths {
        match self.sync_mode {
            SyncMode::Synchronous => ArtifactPaths::single_file(log),
            SyncMode::Asynchronous => ArtifactPaths::split(log),
        }
    }

    fn endpoint_uris(&self) -> impl Iterator<Item = &str> {
        self.aggregator_uri.split('|').map(str::trim).filter(|uri| !uri.is_empty())
    }

    /// Aggregator endpoints, capped at [`MAX_ENDPOINTS`].
    pub fn endpoints(&self) -> Vec<Endpoint> {
        let hmac_algorithm = self.hmac_algorithm();
        let mut endpoints = Vec::new();

        for uri in self.endpoint_uris() {
            if endpoints.len() >= MAX_ENDPOINTS {
                warn!(max = MAX_ENDPOINTS, endpoint = uri, "maximum number of endpoints reached, ignoring endpoint");
                continue;
            }
            endpoints.push(Endpoint {
                uri: uri.to_string(),
                login_id: non_empty(self.aggregator_login_id.as_deref()),
                key: non_empty(self.aggregator_key.as_deref()),
                hmac_algorithm,
            });
        }
        endpoints
    }

    /// Block time limit, if enabled.
    pub fn block_time_limit(&self) -> Option<Duration> {
        (self.block_time_limit_secs > 0).then(|| Duration::from_secs(self.block_time_limit_secs))
    }

    /// Worker wait interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Response timeout for aggregation requests.
    pub fn signature_timeout(&self) -> Duration {
        Duration::from_secs(self.signature_timeout_secs)
    }

    /// Worker drain timeout.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn resolve_algorithm(purpose: &str, name: &str) -> HashAlgorithm {
    if let Some(algorithm) = HashAlgorithm::from_name(name) {
        return algorithm;
    }

    if HashAlgorithm::is_untrusted_name(name) {
        warn!(algorithm = name, "{purpose} is not trusted, using default");
    } else {
        warn!(algorithm = name, "{purpose} is not supported, using default");
    }
    HashAlgorithm::default()
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}

impl fmt::Debug for SignerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignerConfig")
            .field("hash_algorithm", &self.hash_algorithm)
            .field("hmac_algorithm", &self.hmac_algorithm)
            .field("block_level_limit", &self.block_level_limit)
            .field("block_time_limit_secs", &self.block_time_limit_secs)
            .field("keep_record_hashes", &self.keep_record_hashes)
            .field("keep_tree_hashes", &self.keep_tree_hashes)
            .field("random_source", &self.random_source)
            .field("sync_mode", &self.sync_mode)
            .field("max_requests", &self.max_requests)
            .field("aggregator_uri", &self.aggregator_uri)
            .field("aggregator_login_id", &self.aggregator_login_id)
            .field("aggregator_key", &self.aggregator_key.as_ref().map(|_| "***"))
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("signature_timeout_secs", &self.signature_timeout_secs)
            .field("shutdown_timeout_secs", &self.shutdown_timeout_secs)
            .finish()
    }
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            hash_algorithm: default_algorithm(),
            hmac_algorithm: default_algorithm(),
            block_level_limit: default_block_level_limit(),
            block_time_limit_secs: 0,
            keep_record_hashes: true,
            keep_tree_hashes: false,
            random_source: None,
            sync_mode: SyncMode::default(),
            max_requests: default_max_requests(),
            aggregator_uri: String::new(),
            aggregator_login_id: None,
            aggregator_key: None,
            poll_interval_ms: default_poll_interval_ms(),
            signature_timeout_secs: default_signature_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

fn default_algorithm() -> String {
    "SHA-256".to_string()
}

fn default_block_level_limit() -> u8 {
    8
}

fn default_true() -> bool {
    true
}

fn default_max_requests() -> u64 {
    256
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_signature_timeout_secs() -> u64 {
    60
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SignerConfig::default();
        config.validate().unwrap();

        assert_eq!(config.hash_algorithm(), HashAlgorithm::Sha256);
        assert_eq!(config.sync_mode, SyncMode::Synchronous);
        assert_eq!(config.max_requests, 256);
        assert!(config.keep_record_hashes);
        assert!(!config.keep_tree_hashes);
        assert_eq!(config.block_time_limit(), None);
    }

    #[test]
    fn untrusted_algorithm_falls_back_to_default() {
        let config = SignerConfig {
            hash_algorithm: "SHA-1".to_string(),
            hmac_algorithm: "whirlpool".to_string(),
            ..SignerConfig::default()
        };

        assert_eq!(config.hash_algorithm(), HashAlgorithm::Sha256);
        assert_eq!(config.hmac_algorithm(), HashAlgorithm::Sha256);
    }

    #[test]
    fn endpoints_are_split_and_capped() {
        let config = SignerConfig {
            aggregator_uri: "ksi+tcp://a:3332| ksi+tcp://b:3332||ksi+tcp://c:3332|ksi+tcp://d:3332"
                .to_string(),
            aggregator_login_id: Some("user".to_string()),
            aggregator_key: Some(String::new()),
            ..SignerConfig::default()
        };

        let endpoints = config.endpoints();
        let uris: Vec<_> = endpoints.iter().map(|e| e.uri.as_str()).collect();
        assert_eq!(uris, ["ksi+tcp://a:3332", "ksi+tcp://b:3332", "ksi+tcp://c:3332"]);
        assert_eq!(endpoints[0].login_id.as_deref(), Some("user"));
        assert_eq!(endpoints[0].key, None);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let bad_level = SignerConfig { block_level_limit: 1, ..SignerConfig::default() };
        assert!(bad_level.validate().is_err());

        let bad_poll = SignerConfig { poll_interval_ms: 0, ..SignerConfig::default() };
        assert!(bad_poll.validate().is_err());

        let async_without_endpoint =
            SignerConfig { sync_mode: SyncMode::Asynchronous, ..SignerConfig::default() };
        assert!(matches!(
            async_without_endpoint.validate(),
            Err(SignerError::Configuration { .. })
        ));
    }

    #[test]
    fn debug_output_masks_key() {
        let config = SignerConfig {
            aggregator_key: Some("secret-hmac-key".to_string()),
            ..SignerConfig::default()
        };

        let debug = format!("{config:?}");
        assert!(!debug.contains("secret-hmac-key"));
        assert!(debug.contains("***"));
    }

    #[test]
    fn file_and_environment_override_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "signer.toml",
                r#"
                    sync_mode = "async"
                    aggregator_uri = "ksi+http://aggr.example:8080/gt-signingservice"
                    block_level_limit = 12
                "#,
            )?;
            jail.set_env("LOGSIG_BLOCK_LEVEL_LIMIT", "10");
            jail.set_env("LOGSIG_BLOCK_TIME_LIMIT_SECS", "30");

            let config = SignerConfig::load_from("signer.toml").unwrap();
            assert_eq!(config.sync_mode, SyncMode::Asynchronous);
            assert_eq!(config.block_level_limit, 10);
            assert_eq!(config.block_time_limit(), Some(Duration::from_secs(30)));
            assert_eq!(config.endpoints().len(), 1);
            Ok(())
        });
    }

    #[test]
    fn invalid_file_values_are_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("signer.toml", "block_level_limit = 40")?;

            assert!(SignerConfig::load_from("signer.toml").is_err());
            Ok(())
        });
    }
}
