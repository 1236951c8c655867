//! Block context shared by a signer, its stream and its worker.
//!
//! The stream's tree and block file sit behind one async mutex. The writer
//! holds it for each record and block transition; the worker takes it only
//! for the block time-limit check. Everything else the two sides share is
//! either atomic or travels through the work queue.

use std::sync::{
    atomic::{AtomicU64, AtomicU8, Ordering},
    Arc, OnceLock,
};

use chrono::{DateTime, Utc};
use logsig_core::Clock;
use logsig_tree::{
    metadata, record, state, tree::MIN_LEVEL_LIMIT, ArtifactFile, ArtifactPaths, BlockTree,
    EntropySource, LeafKind, TreeOptions,
};
use tokio::sync::{mpsc::UnboundedSender, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::{
    aggregator::{Aggregator, RequestId, ServiceConfig},
    config::{SignerConfig, SyncMode},
    error::{Result, ServiceError, SignerError},
    queue::{SignatureRequest, SigningOutcome, WorkItem},
    sync_signer::SyncSigner,
};

/// Counters kept by a signer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignerStats {
    /// Blocks finished with at least one record.
    pub blocks_finished: u64,
    /// Signature records written.
    pub signatures_written: u64,
    /// Placeholders written for failed signing attempts.
    pub placeholders_written: u64,
    /// Requests sent to the aggregation service.
    pub requests_sent: u64,
    /// Failures reported by the aggregation service.
    pub service_errors: u64,
}

/// What happened to a finished block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Signed and written.
    Signed {
        /// Leaves in the block
        record_count: u64,
        /// Tree height of the block
        level: u8,
    },
    /// Signing failed; a placeholder with the error was written.
    Unsigned {
        /// Leaves in the block
        record_count: u64,
        /// Tree height of the block
        level: u8,
        /// Why signing failed
        error: ServiceError,
    },
    /// Handed to the signing worker.
    Queued {
        /// Request identity
        id: RequestId,
        /// Leaves in the block
        record_count: u64,
        /// Tree height of the block
        level: u8,
    },
}

/// Open log stream state.
#[derive(Debug)]
pub(crate) struct BlockContext {
    pub(crate) stream_id: u64,
    pub(crate) tree: BlockTree,
    pub(crate) paths: ArtifactPaths,
    pub(crate) block_file: ArtifactFile,
}

#[derive(Debug)]
pub(crate) struct SignerContext {
    pub(crate) config: SignerConfig,
    pub(crate) options: TreeOptions,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) stream: Mutex<Option<BlockContext>>,
    entropy: Arc<dyn EntropySource>,
    sync_signer: SyncSigner,
    sender: UnboundedSender<WorkItem>,
    level_limit: AtomicU8,
    max_requests: AtomicU64,
    next_stream_id: AtomicU64,
    disabled: OnceLock<String>,
    stats: RwLock<SignerStats>,
}

impl SignerContext {
    pub(crate) fn new(
        config: SignerConfig,
        aggregator: Arc<dyn Aggregator>,
        entropy: Arc<dyn EntropySource>,
        clock: Arc<dyn Clock>,
        sender: UnboundedSender<WorkItem>,
    ) -> Self {
        let sync_signer = SyncSigner::new(aggregator, config.endpoints());
        Self {
            options: config.tree_options(),
            level_limit: AtomicU8::new(config.block_level_limit),
            max_requests: AtomicU64::new(config.max_requests),
            next_stream_id: AtomicU64::new(1),
            config,
            clock,
            stream: Mutex::new(None),
            entropy,
            sync_signer,
            sender,
            disabled: OnceLock::new(),
            stats: RwLock::new(SignerStats::default()),
        }
    }

    pub(crate) fn is_disabled(&self) -> bool {
        self.disabled.get().is_some()
    }

    pub(crate) fn ensure_enabled(&self) -> Result<()> {
        match self.disabled.get() {
            Some(reason) => Err(SignerError::disabled(reason.clone())),
            None => Ok(()),
        }
    }

    /// Disables signing for good; the first reason is kept.
    pub(crate) fn disable(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.disabled.set(reason.clone()).is_ok() {
            error!(reason = %reason, "signing disabled");
        }
    }

    pub(crate) fn level_limit(&self) -> u8 {
        self.level_limit.load(Ordering::Acquire)
    }

    pub(crate) fn max_requests(&self) -> u64 {
        self.max_requests.load(Ordering::Acquire)
    }

    pub(crate) fn next_stream_id(&self) -> u64 {
        self.next_stream_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) async fn stats(&self) -> SignerStats {
        self.stats.read().await.clone()
    }

    pub(crate) async fn update_stats(&self, update: impl FnOnce(&mut SignerStats)) {
        let mut stats = self.stats.write().await;
        update(&mut stats);
    }

    pub(crate) fn send(&self, item: WorkItem) -> Result<()> {
        self.sender.send(item).map_err(|_| SignerError::QueueClosed)
    }

    /// Applies limits reported by the aggregation service.
    ///
    /// The block level limit only ever drops to the reported maximum; a
    /// maximum below two disables signing.
    pub(crate) fn apply_service_config(&self, config: &ServiceConfig) {
        if let Some(max_requests) = config.max_requests {
            let previous = self.max_requests.swap(max_requests, Ordering::AcqRel);
            if previous != max_requests {
                info!(max_requests, "maximum in-flight requests updated by aggregator");
            }
        }

        if let Some(max_level) = config.max_level {
            let level = max_level.min(self.config.block_level_limit);
            if level < MIN_LEVEL_LIMIT {
                self.disable(format!("max level {max_level} reported by aggregator is too low"));
                return;
            }
            let previous = self.level_limit.swap(level, Ordering::AcqRel);
            if previous != level {
                info!(level, reported = max_level, "block level limit updated by aggregator");
            }
        }
    }

    /// Fetches service limits synchronously, when a stream opens.
    pub(crate) async fn receive_config(&self) {
        match self.sync_signer.receive_config().await {
            Ok(config) => self.apply_service_config(&config),
            Err(e) => warn!(error = %e, "could not fetch aggregator configuration"),
        }
    }

    pub(crate) fn start_block(&self, ctx: &mut BlockContext) -> Result<()> {
        let level = self.level_limit();
        if let Err(e) = ctx.tree.start_block(self.entropy.as_ref(), self.clock.now_system(), level) {
            if e.disables_stream() {
                self.disable(format!("could not start block: {e}"));
            }
            return Err(e.into());
        }
        debug!(level, "block started");
        Ok(())
    }

    pub(crate) async fn add_record(&self, ctx: &mut BlockContext, data: &[u8]) -> Result<()> {
        self.ensure_enabled()?;
        ctx.tree.add_leaf(&mut ctx.block_file, data, LeafKind::Record)?;
        self.finish_if_full(ctx).await
    }

    pub(crate) async fn add_metadata(&self, ctx: &mut BlockContext, key: &str, value: &str) -> Result<()> {
        self.ensure_enabled()?;
        ctx.tree.add_metadata(&mut ctx.block_file, key, value)?;
        self.finish_if_full(ctx).await
    }

    async fn finish_if_full(&self, ctx: &mut BlockContext) -> Result<()> {
        if ctx.tree.is_full() {
            self.rotate_block(ctx).await?;
        }
        Ok(())
    }

    /// Finishes the open block and starts the next one.
    ///
    /// The next block is started even if finishing failed, unless signing
    /// got disabled. The finish error is returned first.
    pub(crate) async fn rotate_block(&self, ctx: &mut BlockContext) -> Result<Option<BlockOutcome>> {
        let finished = self.finish_block(ctx).await;
        let started = if ctx.tree.is_open() || self.is_disabled() {
            Ok(())
        } else {
            self.start_block(ctx)
        };

        if let Err(e) = &finished {
            error!(error = %e, "could not finish block");
        }
        let outcome = finished?;
        started?;
        Ok(outcome)
    }

    /// Finishes the open block and signs or enqueues its root.
    pub(crate) async fn finish_block(&self, ctx: &mut BlockContext) -> Result<Option<BlockOutcome>> {
        let Some(block) = ctx.tree.finish_block(&mut ctx.block_file)? else {
            ctx.block_file.flush()?;
            return Ok(None);
        };
        let (record_count, level) = (block.record_count, block.level);
        debug!(record_count, level, "block finished");

        let outcome = match self.config.sync_mode {
            SyncMode::Synchronous => {
                let signed = self.sync_signer.sign_block(&mut ctx.block_file, &block).await?;
                let is_signed = matches!(signed, SigningOutcome::Signed(_));
                self.update_stats(|stats| {
                    stats.blocks_finished += 1;
                    stats.requests_sent += 1;
                    if is_signed {
                        stats.signatures_written += 1;
                    } else {
                        stats.placeholders_written += 1;
                        stats.service_errors += 1;
                    }
                })
                .await;
                match signed {
                    SigningOutcome::Signed(_) => BlockOutcome::Signed { record_count, level },
                    SigningOutcome::Failed(error) => BlockOutcome::Unsigned { record_count, level, error },
                }
            },
            SyncMode::Asynchronous => {
                let placeholder = record::no_signature_record(record_count, &block.root, None)?;
                ctx.block_file.append(&placeholder)?;

                let request = SignatureRequest::new(block, DateTime::<Utc>::from(self.clock.now_system()));
                let id = request.id;
                if let Err(e) = self.send(WorkItem::SignatureRequest(request)) {
                    self.disable("signing queue closed");
                    return Err(e);
                }
                self.update_stats(|stats| stats.blocks_finished += 1).await;
                BlockOutcome::Queued { id, record_count, level }
            },
        };

        ctx.block_file.flush()?;
        Ok(Some(outcome))
    }

    /// Closes the open block once it is older than the block time limit.
    pub(crate) async fn check_time_limit(&self, ctx: &mut BlockContext) -> Result<()> {
        let Some(limit) = self.config.block_time_limit() else {
            return Ok(());
        };
        if self.is_disabled() || ctx.tree.record_count() == 0 {
            return Ok(());
        }
        let Some(started) = ctx.tree.block_started() else {
            return Ok(());
        };
        if started + limit > self.clock.now_system() {
            return Ok(());
        }

        debug!(limit_secs = limit.as_secs(), "block time limit reached");
        self.add_metadata(
            ctx,
            metadata::BLOCK_CLOSE_REASON,
            &metadata::closed_on_time_limit(limit.as_secs()),
        )
        .await?;
        // the reason leaf may have filled the block already
        if ctx.tree.record_count() == 0 {
            return Ok(());
        }
        self.rotate_block(ctx).await.map(|_| ())
    }

    /// Closes a stream: final block, artifact files, chain state.
    ///
    /// Every step runs even if an earlier one fails; the first error is
    /// returned.
    pub(crate) async fn close_stream(&self, mut ctx: BlockContext) -> Result<()> {
        let mut result = Ok(());

        if !self.is_disabled() && ctx.tree.is_open() {
            if ctx.tree.record_count() > 0 {
                result = self
                    .add_metadata(&mut ctx, metadata::BLOCK_CLOSE_REASON, metadata::CLOSED_ON_FILE_CLOSE)
                    .await;
            }
            if ctx.tree.is_open() {
                let finished = self.finish_block(&mut ctx).await.map(|_| ());
                result = result.and(finished);
            }
        }

        if let Err(e) = state::save(&ctx.paths.state, ctx.tree.last_leaf()) {
            warn!(path = %ctx.paths.state.display(), error = %e, "could not save chain state");
        }

        let closed = ctx.block_file.close().map_err(SignerError::from);
        result = result.and(closed);

        if self.config.sync_mode == SyncMode::Asynchronous {
            result = result.and(self.send(WorkItem::CloseFile));
        }

        info!(stream_id = ctx.stream_id, "log stream closed");
        result
    }
}
