//! Work items exchanged between log streams and the signing worker.

use std::{collections::VecDeque, time::SystemTime};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use logsig_core::Imprint;
use logsig_tree::{ArtifactFile, FinishedBlock};

use crate::{
    aggregator::{AggregationRequest, RequestId},
    error::ServiceError,
};

/// Final result of a signature request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningOutcome {
    /// The service returned a signature.
    Signed(Bytes),
    /// Signing failed; a placeholder is written instead.
    Failed(ServiceError),
}

/// Progress of a signature request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestStatus {
    /// Not yet submitted.
    Waiting,
    /// Submitted at the given time.
    Sent {
        /// Submission time
        at: SystemTime,
    },
    /// Resolved, waiting for its turn to be written.
    Done(SigningOutcome),
}

/// Finished block waiting for its signature.
///
/// The root moves into the request when the block is enqueued; the stream
/// keeps nothing but the chain hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureRequest {
    /// Request identity.
    pub id: RequestId,
    /// Block root.
    pub root: Imprint,
    /// Leaves in the block.
    pub record_count: u64,
    /// Tree height of the block.
    pub level: u8,
    /// When the block was enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// Current progress.
    pub status: RequestStatus,
}

impl SignatureRequest {
    /// Creates a waiting request for a finished block.
    pub fn new(block: FinishedBlock, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            id: RequestId::new(),
            root: block.root,
            record_count: block.record_count,
            level: block.level,
            enqueued_at,
            status: RequestStatus::Waiting,
        }
    }

    /// The aggregation request for this block.
    pub fn aggregation_request(&self) -> AggregationRequest {
        AggregationRequest { id: self.id, root: self.root.clone(), level: self.level }
    }

    /// Whether the request is resolved.
    pub fn is_done(&self) -> bool {
        matches!(self.status, RequestStatus::Done(_))
    }
}

/// Unit of work for the signing worker.
#[derive(Debug)]
pub enum WorkItem {
    /// Sign a finished block.
    SignatureRequest(SignatureRequest),
    /// Close the current signature file.
    CloseFile,
    /// Install a new signature file.
    NewFile(ArtifactFile),
    /// Stop the worker.
    Quit,
}

impl WorkItem {
    /// Signature request payload, if any.
    pub fn as_request(&self) -> Option<&SignatureRequest> {
        match self {
            Self::SignatureRequest(request) => Some(request),
            _ => None,
        }
    }

    fn as_request_mut(&mut self) -> Option<&mut SignatureRequest> {
        match self {
            Self::SignatureRequest(request) => Some(request),
            _ => None,
        }
    }
}

/// Ordered queue owned by the signing worker.
#[derive(Debug, Default)]
pub struct WorkQueue {
    items: VecDeque<WorkItem>,
}

impl WorkQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an item.
    pub fn push(&mut self, item: WorkItem) {
        self.items.push_back(item);
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Front item.
    pub fn front(&self) -> Option<&WorkItem> {
        self.items.front()
    }

    /// Removes the front item.
    pub fn pop_front(&mut self) -> Option<WorkItem> {
        self.items.pop_front()
    }

    /// Signature requests in queue order.
    pub fn requests(&self) -> impl Iterator<Item = &SignatureRequest> {
        self.items.iter().filter_map(WorkItem::as_request)
    }

    /// Mutable signature requests in queue order.
    pub fn requests_mut(&mut self) -> impl Iterator<Item = &mut SignatureRequest> {
        self.items.iter_mut().filter_map(WorkItem::as_request_mut)
    }

    /// Request with the given id.
    pub fn request_mut(&mut self, id: RequestId) -> Option<&mut SignatureRequest> {
        self.requests_mut().find(|request| request.id == id)
    }

    /// Pops the front item if it is a resolved signature request.
    ///
    /// Responses that arrive out of order stay queued until every earlier
    /// block is resolved.
    pub fn pop_done_request(&mut self) -> Option<SignatureRequest> {
        if !self.front().and_then(WorkItem::as_request).is_some_and(SignatureRequest::is_done) {
            return None;
        }
        match self.items.pop_front() {
            Some(WorkItem::SignatureRequest(request)) => Some(request),
            _ => None,
        }
    }

    /// Pops the front item if it is a control item.
    pub fn pop_control(&mut self) -> Option<WorkItem> {
        match self.front() {
            Some(WorkItem::SignatureRequest(_)) | None => None,
            Some(_) => self.items.pop_front(),
        }
    }
}

#[cfg(test)]
mod tests {
    use logsig_core::HashAlgorithm;

    use super::*;

    fn request(byte: u8) -> SignatureRequest {
        let root = HashAlgorithm::Sha256.digest(&[byte]);
        SignatureRequest::new(FinishedBlock { root, record_count: 4, level: 3 }, Utc::now())
    }

    #[test]
    fn done_requests_pop_in_queue_order() {
        let mut queue = WorkQueue::new();
        let (a, b) = (request(1), request(2));
        let (a_id, b_id) = (a.id, b.id);
        queue.push(WorkItem::SignatureRequest(a));
        queue.push(WorkItem::SignatureRequest(b));

        queue.request_mut(b_id).unwrap().status =
            RequestStatus::Done(SigningOutcome::Signed(Bytes::from_static(b"b")));
        assert!(queue.pop_done_request().is_none());

        queue.request_mut(a_id).unwrap().status =
            RequestStatus::Done(SigningOutcome::Failed(ServiceError::RequestLimit));
        assert_eq!(queue.pop_done_request().unwrap().id, a_id);
        assert_eq!(queue.pop_done_request().unwrap().id, b_id);
        assert!(queue.is_empty());
    }

    #[test]
    fn control_items_wait_behind_requests() {
        let mut queue = WorkQueue::new();
        let a = request(1);
        let a_id = a.id;
        queue.push(WorkItem::SignatureRequest(a));
        queue.push(WorkItem::Quit);

        assert!(queue.pop_control().is_none());
        queue.request_mut(a_id).unwrap().status =
            RequestStatus::Done(SigningOutcome::Signed(Bytes::new()));
        queue.pop_done_request().unwrap();
        assert!(matches!(queue.pop_control(), Some(WorkItem::Quit)));
    }

    #[test]
    fn aggregation_request_carries_root_and_level() {
        let request = request(7);
        let aggregation = request.aggregation_request();
        assert_eq!(aggregation.id, request.id);
        assert_eq!(aggregation.root, request.root);
        assert_eq!(aggregation.level, 3);
        assert_eq!(request.status, RequestStatus::Waiting);
    }
}
