//! Scriptable in-memory aggregation service.
//!
//! Every endpoint answers immediately by default. Tests switch endpoints to
//! hold requests until released, fail them, or refuse connections, and can
//! push configuration the way a real service does.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use bytes::Bytes;
use logsig_core::Imprint;
use logsig_signer::{
    AggregationRequest, Aggregator, AsyncSession, Endpoint, RequestId, ServiceConfig, ServiceError,
    ServiceEvent, ServiceOption,
};

/// How an endpoint answers submitted requests.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EndpointBehavior {
    /// Answer with a signature on the next poll.
    #[default]
    Respond,
    /// Keep requests until the test releases them.
    Hold,
    /// Answer every request with this error.
    Fail(ServiceError),
}

#[derive(Debug, Default)]
struct SessionState {
    held: Vec<AggregationRequest>,
    ready: VecDeque<ServiceEvent>,
    submitted: Vec<AggregationRequest>,
    cancelled: Vec<RequestId>,
    options: Vec<ServiceOption>,
    config_requests: usize,
}

#[derive(Debug, Default)]
struct MockState {
    default_behavior: EndpointBehavior,
    behaviors: HashMap<String, EndpointBehavior>,
    rejected: HashSet<String>,
    service_config: ServiceConfig,
    sign_failures: VecDeque<ServiceError>,
    submit_failures: VecDeque<ServiceError>,
    signed: Vec<(String, AggregationRequest)>,
    sessions: HashMap<String, SessionState>,
}

impl MockState {
    fn behavior(&self, uri: &str) -> EndpointBehavior {
        self.behaviors.get(uri).unwrap_or(&self.default_behavior).clone()
    }

    fn session(&mut self, uri: &str) -> &mut SessionState {
        self.sessions.entry(uri.to_string()).or_default()
    }
}

/// In-memory aggregator shared between a test and the signer under test.
#[derive(Debug, Clone, Default)]
pub struct MockAggregator {
    state: Arc<Mutex<MockState>>,
}

impl MockAggregator {
    /// Creates an aggregator whose endpoints all respond immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signature bytes the mock returns for a root.
    pub fn signature_for(root: &Imprint) -> Bytes {
        let mut signature = b"sig:".to_vec();
        signature.extend_from_slice(root.as_bytes());
        Bytes::from(signature)
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets the behavior of endpoints without their own.
    pub fn set_default_behavior(&self, behavior: EndpointBehavior) {
        self.lock().default_behavior = behavior;
    }

    /// Sets the behavior of one endpoint.
    pub fn set_behavior(&self, uri: &str, behavior: EndpointBehavior) {
        self.lock().behaviors.insert(uri.to_string(), behavior);
    }

    /// Refuses connections and calls to an endpoint.
    pub fn reject_endpoint(&self, uri: &str) {
        self.lock().rejected.insert(uri.to_string());
    }

    /// Limits returned by configuration requests.
    pub fn set_service_config(&self, config: ServiceConfig) {
        self.lock().service_config = config;
    }

    /// Fails the next synchronous signing call.
    pub fn fail_next_sign(&self, error: ServiceError) {
        self.lock().sign_failures.push_back(error);
    }

    /// Refuses the next asynchronous submission.
    pub fn fail_next_submit(&self, error: ServiceError) {
        self.lock().submit_failures.push_back(error);
    }

    /// Pushes a configuration update through an endpoint's session.
    pub fn push_config(&self, uri: &str, config: ServiceConfig) {
        self.lock().session(uri).ready.push_back(ServiceEvent::ConfigPush(config));
    }

    /// Requests an endpoint is holding, in submission order.
    pub fn held(&self, uri: &str) -> Vec<AggregationRequest> {
        self.lock().sessions.get(uri).map(|s| s.held.clone()).unwrap_or_default()
    }

    /// Answers a held request with its signature.
    pub fn release(&self, uri: &str, id: RequestId) -> bool {
        let mut state = self.lock();
        let session = state.session(uri);
        let Some(position) = session.held.iter().position(|r| r.id == id) else {
            return false;
        };
        let request = session.held.remove(position);
        session.ready.push_back(ServiceEvent::Response {
            id,
            signature: Self::signature_for(&request.root),
        });
        true
    }

    /// Answers a held request with an error.
    pub fn release_error(&self, uri: &str, id: RequestId, error: ServiceError) -> bool {
        let mut state = self.lock();
        let session = state.session(uri);
        let Some(position) = session.held.iter().position(|r| r.id == id) else {
            return false;
        };
        session.held.remove(position);
        session.ready.push_back(ServiceEvent::Error { id: Some(id), error });
        true
    }

    /// Requests submitted to an endpoint's session.
    pub fn submitted(&self, uri: &str) -> Vec<AggregationRequest> {
        self.lock().sessions.get(uri).map(|s| s.submitted.clone()).unwrap_or_default()
    }

    /// Requests cancelled on an endpoint's session.
    pub fn cancelled(&self, uri: &str) -> Vec<RequestId> {
        self.lock().sessions.get(uri).map(|s| s.cancelled.clone()).unwrap_or_default()
    }

    /// Options applied to an endpoint's session.
    pub fn options(&self, uri: &str) -> Vec<ServiceOption> {
        self.lock().sessions.get(uri).map(|s| s.options.clone()).unwrap_or_default()
    }

    /// Configuration requests received by an endpoint's session.
    pub fn config_requests(&self, uri: &str) -> usize {
        self.lock().sessions.get(uri).map_or(0, |s| s.config_requests)
    }

    /// Synchronous signing calls that succeeded, with their endpoint.
    pub fn signed(&self) -> Vec<(String, AggregationRequest)> {
        self.lock().signed.clone()
    }
}

#[async_trait]
impl Aggregator for MockAggregator {
    async fn sign(
        &self,
        endpoint: &Endpoint,
        request: &AggregationRequest,
    ) -> Result<Bytes, ServiceError> {
        let mut state = self.lock();
        if state.rejected.contains(&endpoint.uri) {
            return Err(ServiceError::network(format!("{}: connection refused", endpoint.uri)));
        }
        if let Some(error) = state.sign_failures.pop_front() {
            return Err(error);
        }
        if let EndpointBehavior::Fail(error) = state.behavior(&endpoint.uri) {
            return Err(error);
        }

        state.signed.push((endpoint.uri.clone(), request.clone()));
        Ok(Self::signature_for(&request.root))
    }

    async fn receive_config(&self, endpoint: &Endpoint) -> Result<ServiceConfig, ServiceError> {
        let state = self.lock();
        if state.rejected.contains(&endpoint.uri) {
            return Err(ServiceError::network(format!("{}: connection refused", endpoint.uri)));
        }
        Ok(state.service_config)
    }

    fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn AsyncSession>, ServiceError> {
        let mut state = self.lock();
        if state.rejected.contains(&endpoint.uri) {
            return Err(ServiceError::UnsupportedEndpoint { uri: endpoint.uri.clone() });
        }
        state.sessions.insert(endpoint.uri.clone(), SessionState::default());

        Ok(Box::new(MockSession { uri: endpoint.uri.clone(), state: Arc::clone(&self.state) }))
    }
}

#[derive(Debug)]
struct MockSession {
    uri: String,
    state: Arc<Mutex<MockState>>,
}

impl MockSession {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AsyncSession for MockSession {
    fn endpoint(&self) -> &str {
        &self.uri
    }

    fn submit(&mut self, request: &AggregationRequest) -> Result<(), ServiceError> {
        let mut state = self.lock();
        if let Some(error) = state.submit_failures.pop_front() {
            return Err(error);
        }

        let behavior = state.behavior(&self.uri);
        let session = state.session(&self.uri);
        session.submitted.push(request.clone());
        match behavior {
            EndpointBehavior::Respond => session.ready.push_back(ServiceEvent::Response {
                id: request.id,
                signature: MockAggregator::signature_for(&request.root),
            }),
            EndpointBehavior::Hold => session.held.push(request.clone()),
            EndpointBehavior::Fail(error) => {
                session.ready.push_back(ServiceEvent::Error { id: Some(request.id), error });
            },
        }
        Ok(())
    }

    fn poll(&mut self) -> Result<Vec<ServiceEvent>, ServiceError> {
        let mut state = self.lock();
        Ok(state.session(&self.uri).ready.drain(..).collect())
    }

    fn request_config(&mut self) -> Result<(), ServiceError> {
        let mut state = self.lock();
        let config = state.service_config;
        let session = state.session(&self.uri);
        session.config_requests += 1;
        session.ready.push_back(ServiceEvent::ConfigPush(config));
        Ok(())
    }

    fn set_option(&mut self, option: ServiceOption) -> Result<(), ServiceError> {
        self.lock().session(&self.uri).options.push(option);
        Ok(())
    }

    fn cancel(&mut self, id: RequestId) {
        let mut state = self.lock();
        let session = state.session(&self.uri);
        session.held.retain(|r| r.id != id);
        session.cancelled.push(id);
    }

    fn pending_count(&self) -> usize {
        self.lock().sessions.get(&self.uri).map_or(0, |s| s.held.len())
    }
}

#[cfg(test)]
mod tests {
    use logsig_core::HashAlgorithm;

    use super::*;

    const URI: &str = "ksi+tcp://mock:3332";

    #[test]
    fn held_requests_are_released_on_demand() {
        let aggregator = MockAggregator::new();
        aggregator.set_behavior(URI, EndpointBehavior::Hold);
        let mut session = aggregator.connect(&Endpoint::new(URI)).unwrap();

        let request = AggregationRequest::new(HashAlgorithm::Sha256.digest(b"root"), 2);
        session.submit(&request).unwrap();
        assert!(session.poll().unwrap().is_empty());
        assert_eq!(session.pending_count(), 1);

        assert!(aggregator.release(URI, request.id));
        let events = session.poll().unwrap();
        assert_eq!(events, vec![ServiceEvent::Response {
            id: request.id,
            signature: MockAggregator::signature_for(&request.root),
        }]);
    }

    #[test]
    fn rejected_endpoints_cannot_connect() {
        let aggregator = MockAggregator::new();
        aggregator.reject_endpoint(URI);
        assert!(aggregator.connect(&Endpoint::new(URI)).is_err());
    }

    #[tokio::test]
    async fn queued_sign_failure_is_used_once() {
        let aggregator = MockAggregator::new();
        let endpoint = Endpoint::new(URI);
        let request = AggregationRequest::new(HashAlgorithm::Sha256.digest(b"root"), 2);

        aggregator.fail_next_sign(ServiceError::network("timeout"));
        assert!(aggregator.sign(&endpoint, &request).await.is_err());
        assert!(aggregator.sign(&endpoint, &request).await.is_ok());
        assert_eq!(aggregator.signed().len(), 1);
    }
}
