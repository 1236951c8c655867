//! Signer lifecycle and log streams.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use logsig_core::{Clock, Imprint, RealClock};
use logsig_tree::{entropy::entropy_source, state, ArtifactFile, BlockTree, EntropySource, FileKind};
use tokio::{
    sync::mpsc::{self, UnboundedReceiver},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    aggregator::{Aggregator, AsyncSession},
    circuit::CircuitConfig,
    config::{SignerConfig, SyncMode},
    context::{BlockContext, BlockOutcome, SignerContext, SignerStats},
    error::{Result, SignerError},
    ha::HaSession,
    queue::WorkItem,
    worker::{configure_session, SigningWorker},
};

/// Block signer for one log stream at a time.
///
/// Create it, [`start`](Self::start) it, then [`open`](Self::open) a log
/// stream. [`shutdown`](Self::shutdown) closes the stream and waits for the
/// signing worker to write every outstanding signature.
#[derive(Debug)]
pub struct LogSigner {
    context: Arc<SignerContext>,
    aggregator: Arc<dyn Aggregator>,
    receiver: Option<UnboundedReceiver<WorkItem>>,
    worker: Option<JoinHandle<()>>,
}

impl LogSigner {
    /// Creates a signer with explicit entropy and clock.
    pub fn new(
        config: SignerConfig,
        aggregator: Arc<dyn Aggregator>,
        entropy: Arc<dyn EntropySource>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let context = Arc::new(SignerContext::new(config, Arc::clone(&aggregator), entropy, clock, sender));

        Ok(Self { context, aggregator, receiver: Some(receiver), worker: None })
    }

    /// Creates a signer using the configured random source and the real clock.
    pub fn from_config(config: SignerConfig, aggregator: Arc<dyn Aggregator>) -> Result<Self> {
        let entropy = entropy_source(config.random_source.as_deref());
        Self::new(config, aggregator, entropy, Arc::new(RealClock::new()))
    }

    /// Configuration in use.
    pub fn config(&self) -> &SignerConfig {
        &self.context.config
    }

    /// Connects the aggregation endpoints and spawns the signing worker.
    ///
    /// In asynchronous mode at least one endpoint must connect; otherwise
    /// signing is disabled and [`SignerError::NoEndpoints`] is returned.
    pub async fn start(&mut self) -> Result<()> {
        if self.receiver.is_none() {
            return Err(SignerError::AlreadyStarted);
        }

        let session = match self.context.config.sync_mode {
            SyncMode::Synchronous => None,
            SyncMode::Asynchronous => Some(self.connect()?),
        };
        let Some(receiver) = self.receiver.take() else {
            return Err(SignerError::AlreadyStarted);
        };

        let worker = SigningWorker::new(Arc::clone(&self.context), receiver, session);
        self.worker = Some(tokio::spawn(worker.run()));

        info!(
            sync_mode = ?self.context.config.sync_mode,
            level_limit = self.context.level_limit(),
            "log signer started"
        );
        Ok(())
    }

    fn connect(&self) -> Result<Box<dyn AsyncSession>> {
        let mut sessions = Vec::new();
        for endpoint in self.context.config.endpoints() {
            match self.aggregator.connect(&endpoint) {
                Ok(session) => {
                    debug!(endpoint = %endpoint.uri, "aggregation endpoint added");
                    sessions.push(session);
                },
                Err(e) => warn!(endpoint = %endpoint.uri, error = %e, "could not add aggregation endpoint"),
            }
        }

        if sessions.is_empty() {
            self.context.disable("no aggregation endpoint could be registered");
            return Err(SignerError::NoEndpoints);
        }

        let mut session: Box<dyn AsyncSession> = Box::new(HaSession::new(
            sessions,
            CircuitConfig::default(),
            Arc::clone(&self.context.clock),
        ));
        configure_session(session.as_mut(), self.context.max_requests());
        Ok(session)
    }

    /// Opens a log stream and starts its first block.
    ///
    /// The chain continues from the stream's state file when one is found.
    pub async fn open(&self, log_path: impl AsRef<Path>) -> Result<LogStream> {
        if self.worker.is_none() {
            return Err(SignerError::NotStarted);
        }
        self.context.ensure_enabled()?;

        let mut stream = self.context.stream.lock().await;
        if stream.is_some() {
            return Err(SignerError::StreamAlreadyOpen);
        }

        let log_path = log_path.as_ref();
        let paths = self.context.config.artifact_paths(log_path);
        let block_file = ArtifactFile::open(&paths.block_file, paths.block_file_kind())?;

        match &paths.signature_file {
            Some(path) => {
                let signature_file = ArtifactFile::open(path, FileKind::Signatures)?;
                self.context.send(WorkItem::NewFile(signature_file))?;
            },
            None => self.context.receive_config().await,
        }
        self.context.ensure_enabled()?;

        let options = self.context.options;
        let last_leaf = state::load(&paths.state).unwrap_or_else(|| Imprint::zero(options.algorithm));
        let mut ctx = BlockContext {
            stream_id: self.context.next_stream_id(),
            tree: BlockTree::new(options, last_leaf),
            paths,
            block_file,
        };
        self.context.start_block(&mut ctx)?;

        let stream_id = ctx.stream_id;
        *stream = Some(ctx);
        info!(stream_id, log = %log_path.display(), "log stream opened");

        Ok(LogStream { context: Arc::clone(&self.context), stream_id, log_path: log_path.to_path_buf() })
    }

    /// Whether signing was disabled.
    pub fn is_disabled(&self) -> bool {
        self.context.is_disabled()
    }

    /// Current counters.
    pub async fn stats(&self) -> SignerStats {
        self.context.stats().await
    }

    /// Closes the open stream, then stops the worker once it has written
    /// every outstanding signature.
    pub async fn shutdown(mut self) -> Result<()> {
        let open_stream = self.context.stream.lock().await.take();
        if let Some(ctx) = open_stream {
            if let Err(e) = self.context.close_stream(ctx).await {
                warn!(error = %e, "could not close log stream during shutdown");
            }
        }

        let Some(handle) = self.worker.take() else {
            return Ok(());
        };
        let timeout = self.context.config.shutdown_timeout();
        info!(timeout_seconds = timeout.as_secs(), "initiating signer shutdown");

        if self.context.send(WorkItem::Quit).is_err() {
            warn!("signing worker already gone");
        }

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => {
                info!("signer shutdown completed");
                Ok(())
            },
            Ok(Err(join_error)) => {
                error!(error = %join_error, "signing worker panicked during shutdown");
                Err(SignerError::WorkerPanic { error: format!("{join_error}") })
            },
            Err(_timeout) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "signer shutdown timed out, worker may still be running"
                );
                Err(SignerError::ShutdownTimeout { timeout })
            },
        }
    }
}

impl Drop for LogSigner {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.take() {
            debug!("signer dropped without shutdown, stopping worker");
            handle.abort();
        }
    }
}

/// Handle for appending to an open log stream.
#[derive(Debug)]
pub struct LogStream {
    context: Arc<SignerContext>,
    stream_id: u64,
    log_path: PathBuf,
}

impl LogStream {
    /// Path of the log being signed.
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Whether signing was disabled.
    pub fn is_disabled(&self) -> bool {
        self.context.is_disabled()
    }

    /// Adds a log record to the open block.
    ///
    /// A full block is finished and a new one started before returning.
    pub async fn add_record(&self, record: &[u8]) -> Result<()> {
        let mut stream = self.context.stream.lock().await;
        let ctx = self.current(stream.as_mut())?;
        self.context.add_record(ctx, record).await
    }

    /// Adds a key-value metadata record to the open block.
    pub async fn add_metadata(&self, key: &str, value: &str) -> Result<()> {
        let mut stream = self.context.stream.lock().await;
        let ctx = self.current(stream.as_mut())?;
        self.context.add_metadata(ctx, key, value).await
    }

    /// Finishes the open block now and starts the next one.
    ///
    /// Returns `None` when the block was empty.
    pub async fn finish_block(&self) -> Result<Option<BlockOutcome>> {
        let mut stream = self.context.stream.lock().await;
        let ctx = self.current(stream.as_mut())?;
        self.context.ensure_enabled()?;
        self.context.rotate_block(ctx).await
    }

    /// Closes the stream: records the close reason, finishes the block and
    /// saves the chain state.
    pub async fn close(self) -> Result<()> {
        let ctx = {
            let mut stream = self.context.stream.lock().await;
            if stream.as_ref().map(|ctx| ctx.stream_id) != Some(self.stream_id) {
                return Err(SignerError::StreamClosed);
            }
            stream.take()
        };

        match ctx {
            Some(ctx) => self.context.close_stream(ctx).await,
            None => Err(SignerError::StreamClosed),
        }
    }

    fn current<'a>(&self, ctx: Option<&'a mut BlockContext>) -> Result<&'a mut BlockContext> {
        ctx.filter(|ctx| ctx.stream_id == self.stream_id).ok_or(SignerError::StreamClosed)
    }
}
