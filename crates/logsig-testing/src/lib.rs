//! Test infrastructure for deterministic block signing tests.
//!
//! Provides fixed entropy sources, a controllable clock, a scriptable
//! in-memory aggregation service, temporary log locations and readers for
//! the artifacts the signer writes.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::sync::Once;

use tracing_subscriber::EnvFilter;

pub mod artifacts;
pub mod entropy;
pub mod fixtures;
pub mod mock;
pub mod time;

pub use artifacts::{BlockHeader, MetadataRecord, SignatureRecord};
pub use entropy::{FailingEntropy, FixedEntropy};
pub use fixtures::{test_config, test_signer, wait_for, TestLog, TEST_ENDPOINT};
pub use mock::{EndpointBehavior, MockAggregator};
pub use time::TestClock;

/// Installs a test log subscriber once per test binary.
///
/// Honors `RUST_LOG`, defaulting to `info`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().try_init();
    });
}
