//! Signing worker: the only owner of the aggregation session and the
//! signature file.
//!
//! Each iteration waits up to the poll interval for work, then:
//!
//! 1. closes the open block if it outlived the block time limit
//! 2. polls the session and attaches responses, errors and limits
//! 3. expires requests that waited too long for a response
//! 4. submits waiting requests, stopping at the first refusal
//! 5. writes resolved requests from the front of the queue, in order
//! 6. handles control items once no request blocks the front, repeating
//!    5 and 6 while either makes progress
//!
//! A response that arrives early waits in the queue until every block
//! before it is written.

use std::sync::Arc;

use logsig_core::Imprint;
use tokio::{sync::mpsc::UnboundedReceiver, time::timeout};
use tracing::{debug, error, info, warn};

use crate::{
    aggregator::{AsyncSession, ServiceConfig, ServiceEvent, ServiceOption},
    context::SignerContext,
    error::ServiceError,
    queue::{RequestStatus, SigningOutcome, WorkItem, WorkQueue},
    sync_signer::encode_outcome,
};

/// Request cache size as a multiple of the in-flight limit.
const CACHE_SIZE_FACTOR: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue { handled: usize },
    Quit,
}

/// Applies an in-flight limit and the matching cache size to a session.
pub(crate) fn configure_session(session: &mut dyn AsyncSession, max_requests: u64) {
    let options = [
        ServiceOption::MaxRequestCount(max_requests),
        ServiceOption::RequestCacheSize(max_requests.saturating_mul(CACHE_SIZE_FACTOR)),
    ];
    for option in options {
        if let Err(e) = session.set_option(option) {
            warn!(?option, error = %e, "could not apply session option");
        }
    }
}

#[derive(Debug)]
pub(crate) struct SigningWorker {
    context: Arc<SignerContext>,
    receiver: UnboundedReceiver<WorkItem>,
    session: Option<Box<dyn AsyncSession>>,
    queue: WorkQueue,
    signature_file: Option<logsig_tree::ArtifactFile>,
}

impl SigningWorker {
    pub(crate) fn new(
        context: Arc<SignerContext>,
        receiver: UnboundedReceiver<WorkItem>,
        session: Option<Box<dyn AsyncSession>>,
    ) -> Self {
        Self { context, receiver, session, queue: WorkQueue::new(), signature_file: None }
    }

    pub(crate) async fn run(mut self) {
        let poll_interval = self.context.config.poll_interval();
        info!(
            poll_interval_ms = poll_interval.as_millis() as u64,
            connected = self.session.is_some(),
            "signing worker started"
        );

        'worker: loop {
            match timeout(poll_interval, self.receiver.recv()).await {
                Ok(Some(item)) => self.queue.push(item),
                Ok(None) => self.queue.push(WorkItem::Quit),
                Err(_elapsed) => {},
            }
            while let Ok(item) = self.receiver.try_recv() {
                self.queue.push(item);
            }

            Self::check_time_limit(&self.context).await;

            if self.session.is_some() {
                self.poll_service().await;
                self.expire_requests().await;
                self.submit_waiting().await;
            }

            // a control item may hold back resolved requests queued behind it
            loop {
                let written = self.write_resolved().await;
                let handled = match self.handle_control() {
                    Flow::Quit => break 'worker,
                    Flow::Continue { handled } => handled,
                };
                if written == 0 && handled == 0 {
                    break;
                }
            }
        }

        info!(pending = self.queue.len(), "signing worker stopped");
    }

    async fn check_time_limit(context: &SignerContext) {
        if context.config.block_time_limit().is_none() {
            return;
        }

        let mut stream = context.stream.lock().await;
        if let Some(ctx) = stream.as_mut() {
            if let Err(e) = context.check_time_limit(ctx).await {
                error!(error = %e, "could not close block on time limit");
            }
        }
    }

    async fn poll_service(&mut self) {
        let Some(session) = self.session.as_mut() else { return };
        let events = match session.poll() {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "aggregation session poll failed");
                return;
            },
        };

        let mut service_errors = 0u64;
        for event in events {
            match event {
                ServiceEvent::Response { id, signature } => match self.queue.request_mut(id) {
                    Some(request) if matches!(request.status, RequestStatus::Sent { .. }) => {
                        debug!(request_id = %id, "signature received");
                        request.status = RequestStatus::Done(SigningOutcome::Signed(signature));
                    },
                    _ => debug!(request_id = %id, "dropping response for unknown request"),
                },
                ServiceEvent::Error { id: Some(id), error } => {
                    service_errors += 1;
                    match self.queue.request_mut(id) {
                        Some(request) if matches!(request.status, RequestStatus::Sent { .. }) => {
                            warn!(request_id = %id, error = %error, "aggregation request failed");
                            request.status = RequestStatus::Done(SigningOutcome::Failed(error));
                        },
                        _ => debug!(request_id = %id, error = %error, "dropping error for unknown request"),
                    }
                },
                ServiceEvent::Error { id: None, error } => {
                    service_errors += 1;
                    warn!(error = %error, "aggregation session error");
                },
                ServiceEvent::ConfigPush(config) => self.apply_config(&config),
            }
        }

        if service_errors > 0 {
            self.context.update_stats(|stats| stats.service_errors += service_errors).await;
        }
    }

    fn apply_config(&mut self, config: &ServiceConfig) {
        debug!(?config, "aggregator configuration received");
        self.context.apply_service_config(config);

        if let (Some(max_requests), Some(session)) = (config.max_requests, self.session.as_mut()) {
            configure_session(session.as_mut(), max_requests);
        }
    }

    async fn expire_requests(&mut self) {
        let Some(session) = self.session.as_mut() else { return };
        let signature_timeout = self.context.config.signature_timeout();
        let now = self.context.clock.now_system();

        let mut expired = Vec::new();
        for request in self.queue.requests_mut() {
            let RequestStatus::Sent { at } = request.status else { continue };
            if now.duration_since(at).is_ok_and(|waited| waited >= signature_timeout) {
                warn!(request_id = %request.id, timeout_secs = signature_timeout.as_secs(), "aggregation request timed out");
                request.status = RequestStatus::Done(SigningOutcome::Failed(ServiceError::Timeout {
                    timeout_secs: signature_timeout.as_secs(),
                }));
                expired.push(request.id);
            }
        }

        for id in &expired {
            session.cancel(*id);
        }
        if !expired.is_empty() {
            let count = expired.len() as u64;
            self.context.update_stats(|stats| stats.service_errors += count).await;
        }
    }

    async fn submit_waiting(&mut self) {
        let Some(session) = self.session.as_mut() else { return };
        let max_requests = self.context.max_requests();
        let now = self.context.clock.now_system();

        let mut sent = 0u64;
        for request in self.queue.requests_mut() {
            if request.status != RequestStatus::Waiting {
                continue;
            }
            if session.pending_count() as u64 >= max_requests {
                debug!(max_requests, "in-flight limit reached, deferring requests");
                break;
            }

            match session.submit(&request.aggregation_request()) {
                Ok(()) => {
                    debug!(request_id = %request.id, level = request.level, "aggregation request sent");
                    request.status = RequestStatus::Sent { at: now };
                    sent += 1;
                },
                Err(e) => {
                    warn!(request_id = %request.id, error = %e, "could not send aggregation request");
                    request.status = RequestStatus::Done(SigningOutcome::Failed(e));
                    break;
                },
            }
        }

        if sent > 0 {
            self.context.update_stats(|stats| stats.requests_sent += sent).await;
        }
    }

    /// Writes resolved requests from the front of the queue; returns how
    /// many were taken off it.
    async fn write_resolved(&mut self) -> usize {
        let mut signatures = 0u64;
        let mut placeholders = 0u64;
        let mut popped = 0;

        while let Some(request) = self.queue.pop_done_request() {
            popped += 1;
            let RequestStatus::Done(outcome) = request.status else { continue };
            match self.write_outcome(request.record_count, &request.root, outcome) {
                Some(SigningOutcome::Signed(_)) => signatures += 1,
                Some(SigningOutcome::Failed(_)) => placeholders += 1,
                None => {},
            }
        }

        if popped == 0 {
            return 0;
        }

        if let Some(file) = self.signature_file.as_mut() {
            if let Err(e) = file.flush() {
                error!(path = %file.path().display(), error = %e, "could not flush signature file");
            }
        }
        if signatures + placeholders > 0 {
            self.context
                .update_stats(|stats| {
                    stats.signatures_written += signatures;
                    stats.placeholders_written += placeholders;
                })
                .await;
        }
        popped
    }

    fn write_outcome(&mut self, record_count: u64, root: &Imprint, outcome: SigningOutcome) -> Option<SigningOutcome> {
        let Some(file) = self.signature_file.as_mut() else {
            error!(record_count, "no signature file open, dropping block signature");
            return None;
        };

        let (bytes, outcome) = match encode_outcome(record_count, root, outcome) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!(record_count, error = %e, "could not encode block signature");
                return None;
            },
        };
        if let Err(e) = file.append(&bytes) {
            error!(path = %file.path().display(), error = %e, "could not write block signature");
            return None;
        }
        Some(outcome)
    }

    fn handle_control(&mut self) -> Flow {
        let mut handled = 0;
        while let Some(item) = self.queue.pop_control() {
            handled += 1;
            match item {
                WorkItem::CloseFile => self.close_signature_file(),
                WorkItem::NewFile(file) => {
                    self.close_signature_file();
                    debug!(path = %file.path().display(), "signature file installed");
                    self.signature_file = Some(file);
                    if let Some(session) = self.session.as_mut() {
                        if let Err(e) = session.request_config() {
                            warn!(error = %e, "could not request aggregator configuration");
                        }
                    }
                },
                WorkItem::Quit => {
                    self.close_signature_file();
                    return Flow::Quit;
                },
                // pop_control never yields requests
                WorkItem::SignatureRequest(_) => {},
            }
        }
        Flow::Continue { handled }
    }

    fn close_signature_file(&mut self) {
        if let Some(file) = self.signature_file.take() {
            let path = file.path().to_path_buf();
            if let Err(e) = file.close() {
                error!(path = %path.display(), error = %e, "could not close signature file");
            }
        }
    }
}
