//! Block signing for tamper-evident log streams.
//!
//! A [`LogSigner`] folds the records of a log stream into block trees and
//! gets each block root signed by an aggregation service. In synchronous
//! mode the writer waits for every signature and the result lands in one
//! `.logsig` file. In asynchronous mode a single worker task owns the
//! service session and writes signatures to a separate file, strictly in
//! block order, while the writer moves on.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use logsig_signer::{Aggregator, LogSigner, SignerConfig};
//!
//! # async fn example(aggregator: Arc<dyn Aggregator>) -> logsig_signer::Result<()> {
//! let config = SignerConfig::load()?;
//! let mut signer = LogSigner::from_config(config, aggregator)?;
//! signer.start().await?;
//!
//! let stream = signer.open("/var/log/app.log").await?;
//! stream.add_record(b"service started").await?;
//! stream.close().await?;
//!
//! signer.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregator;
pub mod circuit;
pub mod config;
mod context;
mod engine;
pub mod error;
pub mod ha;
pub mod queue;
pub mod sync_signer;
mod worker;

pub use aggregator::{
    AggregationRequest, Aggregator, AsyncSession, Endpoint, RequestId, ServiceConfig,
    ServiceEvent, ServiceOption,
};
pub use config::{SignerConfig, SyncMode};
pub use context::{BlockOutcome, SignerStats};
pub use engine::{LogSigner, LogStream};
pub use error::{ErrorCategory, Result, ServiceError, SignerError};
pub use queue::SigningOutcome;
