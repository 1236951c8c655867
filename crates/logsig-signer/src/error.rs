//! Error types for signing operations.
//!
//! Two families are kept apart. [`ServiceError`] describes why the
//! aggregation service did not produce a signature; it is recoverable per
//! block and its description ends up in the placeholder written instead of
//! the signature. [`SignerError`] is what callers of the signer see.

use std::{fmt, time::Duration};

use logsig_core::CoreError;
use logsig_tree::TreeError;
use thiserror::Error;

/// Result type alias for signer operations.
pub type Result<T> = std::result::Result<T, SignerError>;

/// Failures reported by the aggregation service or its adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// Transport-level failure.
    #[error("network error: {message}")]
    Network {
        /// Error message describing the failure
        message: String,
    },

    /// The service answered with an error status.
    #[error("aggregation service error {code}: {message}")]
    Service {
        /// Service-specific status code
        code: u32,
        /// Message returned by the service
        message: String,
    },

    /// The connection refused more in-flight requests.
    #[error("request limit reached")]
    RequestLimit,

    /// No response arrived in time.
    #[error("no response within {timeout_secs}s")]
    Timeout {
        /// Timeout that elapsed
        timeout_secs: u64,
    },

    /// The signature could not be serialized into a block record.
    #[error("signature serialization failed: {message}")]
    Serialization {
        /// Reason for the failure
        message: String,
    },

    /// No endpoint accepted the request.
    #[error("no aggregation endpoint available")]
    NoEndpoints,

    /// Endpoint address not usable by the adapter.
    #[error("unsupported endpoint {uri}")]
    UnsupportedEndpoint {
        /// Endpoint address
        uri: String,
    },

    /// The endpoint's circuit breaker is open.
    #[error("circuit open for endpoint {endpoint}")]
    CircuitOpen {
        /// Endpoint address
        endpoint: String,
    },
}

impl ServiceError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a service status error.
    pub fn service(code: u32, message: impl Into<String>) -> Self {
        Self::Service { code, message: message.into() }
    }

    /// Creates a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into() }
    }

    /// Text recorded in a block placeholder in place of a signature.
    pub fn description(&self) -> String {
        self.to_string()
    }

    /// Stable numeric code for the error kind.
    pub fn code(&self) -> u32 {
        match self {
            Self::Network { .. } => 0x101,
            Self::Service { .. } => 0x102,
            Self::RequestLimit => 0x103,
            Self::Timeout { .. } => 0x104,
            Self::Serialization { .. } => 0x105,
            Self::NoEndpoints => 0x106,
            Self::UnsupportedEndpoint { .. } => 0x107,
            Self::CircuitOpen { .. } => 0x108,
        }
    }

    /// Whether a later request to the same endpoint could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network { .. }
            | Self::RequestLimit
            | Self::Timeout { .. }
            | Self::CircuitOpen { .. } => true,

            Self::Service { .. }
            | Self::Serialization { .. }
            | Self::NoEndpoints
            | Self::UnsupportedEndpoint { .. } => false,
        }
    }
}

/// Errors returned by the signer and its streams.
#[derive(Debug, Error)]
pub enum SignerError {
    /// Tree construction or artifact output failed.
    #[error(transparent)]
    Tree(#[from] TreeError),

    /// Record encoding failed.
    #[error(transparent)]
    Encoding(#[from] CoreError),

    /// Signing is disabled for the stream or the whole signer.
    #[error("signing disabled: {reason}")]
    Disabled {
        /// Why signing was disabled
        reason: String,
    },

    /// A stream is already open on this signer.
    #[error("a log stream is already open")]
    StreamAlreadyOpen,

    /// The stream was closed.
    #[error("log stream is closed")]
    StreamClosed,

    /// The signer has not been started.
    #[error("signer not started")]
    NotStarted,

    /// The signer was already started.
    #[error("signer already started")]
    AlreadyStarted,

    /// The signing worker no longer accepts work.
    #[error("signing queue closed")]
    QueueClosed,

    /// None of the configured endpoints could be used.
    #[error("no aggregation endpoint could be registered")]
    NoEndpoints,

    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// The worker did not stop in time.
    #[error("signing worker did not stop within {timeout:?}")]
    ShutdownTimeout {
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// The worker task panicked.
    #[error("signing worker panicked: {error}")]
    WorkerPanic {
        /// Panic description
        error: String,
    },
}

impl SignerError {
    /// Creates a disabled error.
    pub fn disabled(reason: impl Into<String>) -> Self {
        Self::Disabled { reason: reason.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Whether the stream can keep accepting records after this error.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Tree(e) => !e.disables_stream(),
            Self::Encoding(_) => true,

            Self::Disabled { .. }
            | Self::StreamAlreadyOpen
            | Self::StreamClosed
            | Self::NotStarted
            | Self::AlreadyStarted
            | Self::QueueClosed
            | Self::NoEndpoints
            | Self::Configuration { .. }
            | Self::ShutdownTimeout { .. }
            | Self::WorkerPanic { .. } => false,
        }
    }
}

/// Category of signer error for logging and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Artifact and state file I/O.
    Io,
    /// Entropy and tree invariants.
    Tree,
    /// Stream or signer lifecycle misuse.
    Lifecycle,
    /// Configuration problems.
    Configuration,
    /// Worker failures.
    Internal,
}

impl From<&SignerError> for ErrorCategory {
    fn from(error: &SignerError) -> Self {
        match error {
            SignerError::Tree(TreeError::Io { .. } | TreeError::ArtifactOpen { .. }) => Self::Io,
            SignerError::Tree(_) | SignerError::Encoding(_) => Self::Tree,
            SignerError::Disabled { .. }
            | SignerError::StreamAlreadyOpen
            | SignerError::StreamClosed
            | SignerError::NotStarted
            | SignerError::AlreadyStarted => Self::Lifecycle,
            SignerError::NoEndpoints | SignerError::Configuration { .. } => Self::Configuration,
            SignerError::QueueClosed
            | SignerError::ShutdownTimeout { .. }
            | SignerError::WorkerPanic { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io => write!(f, "io"),
            Self::Tree => write!(f, "tree"),
            Self::Lifecycle => write!(f, "lifecycle"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
