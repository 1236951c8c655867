//! Aggregation service boundary.
//!
//! The signer never talks to a network itself. An [`Aggregator`] adapter
//! signs roots on request for synchronous mode and opens an
//! [`AsyncSession`] per endpoint for asynchronous mode. Sessions are polled,
//! never awaited, so the signing worker stays in control of its loop.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use logsig_core::{HashAlgorithm, Imprint};
use uuid::Uuid;

use crate::error::ServiceError;

/// Identity of one aggregation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generates a new random request id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Root hash submitted for signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationRequest {
    /// Request identity, echoed in the matching response.
    pub id: RequestId,
    /// Block root.
    pub root: Imprint,
    /// Tree height of the block below the root.
    pub level: u8,
}

impl AggregationRequest {
    /// Creates a request with a fresh id.
    pub fn new(root: Imprint, level: u8) -> Self {
        Self { id: RequestId::new(), root, level }
    }
}

/// Limits reported by the aggregation service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Maximum in-flight requests the service accepts.
    pub max_requests: Option<u64>,
    /// Maximum tree level the service accepts.
    pub max_level: Option<u8>,
}

impl ServiceConfig {
    /// Combines two reports, keeping the lower of each limit.
    pub fn merge_min(self, other: Self) -> Self {
        Self {
            max_requests: min_option(self.max_requests, other.max_requests),
            max_level: min_option(self.max_level, other.max_level),
        }
    }

    /// Applies a newer report from the same endpoint; limits it leaves out
    /// keep their previous value.
    pub fn merge_latest(self, newer: Self) -> Self {
        Self {
            max_requests: newer.max_requests.or(self.max_requests),
            max_level: newer.max_level.or(self.max_level),
        }
    }
}

fn min_option<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Something a session produced since the last poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    /// Signature for a submitted request.
    Response {
        /// Request the signature belongs to
        id: RequestId,
        /// Serialized signature
        signature: Bytes,
    },
    /// A request failed, or the connection failed when `id` is `None`.
    Error {
        /// Failed request, if the failure is tied to one
        id: Option<RequestId>,
        /// Failure reported by the service
        error: ServiceError,
    },
    /// Updated service limits.
    ConfigPush(ServiceConfig),
}

/// Tunable session options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceOption {
    /// Maximum in-flight requests.
    MaxRequestCount(u64),
    /// Size of the request cache.
    RequestCacheSize(u64),
}

/// One aggregation endpoint and its credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Endpoint address.
    pub uri: String,
    /// Login identifier.
    pub login_id: Option<String>,
    /// HMAC key.
    pub key: Option<String>,
    /// HMAC algorithm for request authentication.
    pub hmac_algorithm: HashAlgorithm,
}

impl Endpoint {
    /// Endpoint with no credentials and the default HMAC algorithm.
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into(), login_id: None, key: None, hmac_algorithm: HashAlgorithm::default() }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("uri", &self.uri)
            .field("login_id", &self.login_id)
            .field("key", &self.key.as_ref().map(|_| "***"))
            .field("hmac_algorithm", &self.hmac_algorithm)
            .finish()
    }
}

/// Adapter for an aggregation service.
#[async_trait]
pub trait Aggregator: Send + Sync + fmt::Debug {
    /// Signs a root, waiting for the response.
    async fn sign(
        &self,
        endpoint: &Endpoint,
        request: &AggregationRequest,
    ) -> Result<Bytes, ServiceError>;

    /// Fetches the service's current limits.
    async fn receive_config(&self, endpoint: &Endpoint) -> Result<ServiceConfig, ServiceError>;

    /// Opens a polled session to an endpoint.
    fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn AsyncSession>, ServiceError>;
}

/// Non-blocking request session.
pub trait AsyncSession: Send + fmt::Debug {
    /// Address of the endpoint, or endpoints, behind the session.
    fn endpoint(&self) -> &str;

    /// Sends a request. The outcome arrives later through [`poll`](Self::poll).
    fn submit(&mut self, request: &AggregationRequest) -> Result<(), ServiceError>;

    /// Drains every event available right now.
    fn poll(&mut self) -> Result<Vec<ServiceEvent>, ServiceError>;

    /// Asks the service to push its configuration.
    fn request_config(&mut self) -> Result<(), ServiceError>;

    /// Applies a session option.
    fn set_option(&mut self, option: ServiceOption) -> Result<(), ServiceError>;

    /// Forgets a request; a late response for it is dropped.
    fn cancel(&mut self, id: RequestId);

    /// Requests sent and not yet resolved.
    fn pending_count(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merged_config_keeps_lowest_limits() {
        let a = ServiceConfig { max_requests: Some(100), max_level: Some(20) };
        let b = ServiceConfig { max_requests: Some(50), max_level: None };

        let merged = a.merge_min(b);
        assert_eq!(merged.max_requests, Some(50));
        assert_eq!(merged.max_level, Some(20));
        assert_eq!(ServiceConfig::default().merge_min(ServiceConfig::default()), ServiceConfig::default());
    }

    #[test]
    fn endpoint_debug_masks_key() {
        let endpoint = Endpoint { key: Some("hunter2".to_string()), ..Endpoint::new("ksi+tcp://a:3332") };
        let debug = format!("{endpoint:?}");
        assert!(debug.contains("ksi+tcp://a:3332"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn request_ids_are_unique() {
        let root = Imprint::zero(HashAlgorithm::Sha256);
        let a = AggregationRequest::new(root.clone(), 3);
        let b = AggregationRequest::new(root, 3);
        assert_ne!(a.id, b.id);
    }
}
