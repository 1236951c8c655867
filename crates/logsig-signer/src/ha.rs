//! High-availability session over several endpoints.
//!
//! Every request goes to each endpoint whose circuit allows it. The first
//! response wins and the request is cancelled everywhere else; an error is
//! reported only once every endpoint the request went to has failed.
//! Configuration pushes are merged so the reported limits are the lowest of
//! any endpoint.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use logsig_core::Clock;
use tracing::{debug, warn};

use crate::{
    aggregator::{
        AggregationRequest, AsyncSession, RequestId, ServiceConfig, ServiceEvent, ServiceOption,
    },
    circuit::{CircuitBreaker, CircuitConfig},
    error::ServiceError,
};

#[derive(Debug)]
struct Member {
    session: Box<dyn AsyncSession>,
    circuit: CircuitBreaker,
    reported: ServiceConfig,
}

#[derive(Debug)]
struct Pending {
    outstanding: BTreeSet<usize>,
    last_error: Option<ServiceError>,
}

/// Session fanning requests out to up to three endpoint sessions.
#[derive(Debug)]
pub struct HaSession {
    name: String,
    members: Vec<Member>,
    pending: HashMap<RequestId, Pending>,
    clock: Arc<dyn Clock>,
}

impl HaSession {
    /// Combines connected endpoint sessions.
    pub fn new(
        sessions: Vec<Box<dyn AsyncSession>>,
        circuit: CircuitConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let name = sessions.iter().map(|s| s.endpoint()).collect::<Vec<_>>().join("|");
        let members = sessions
            .into_iter()
            .map(|session| Member {
                circuit: CircuitBreaker::new(session.endpoint(), circuit.clone()),
                session,
                reported: ServiceConfig::default(),
            })
            .collect();

        Self { name, members, pending: HashMap::new(), clock }
    }

    /// Number of endpoints.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether there are no endpoints.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn merged_config(&self) -> ServiceConfig {
        self.members
            .iter()
            .map(|m| m.reported)
            .reduce(ServiceConfig::merge_min)
            .unwrap_or_default()
    }

    fn resolve(&mut self, id: RequestId, signature: bytes::Bytes, from: usize) -> Option<ServiceEvent> {
        let pending = self.pending.remove(&id)?;
        for &other in pending.outstanding.iter().filter(|&&i| i != from) {
            if let Some(member) = self.members.get_mut(other) {
                member.session.cancel(id);
            }
        }
        Some(ServiceEvent::Response { id, signature })
    }

    fn fail(&mut self, id: RequestId, error: ServiceError, from: usize) -> Option<ServiceEvent> {
        let pending = self.pending.get_mut(&id)?;
        pending.outstanding.remove(&from);
        pending.last_error = Some(error);
        if !pending.outstanding.is_empty() {
            return None;
        }

        let pending = self.pending.remove(&id)?;
        let error = pending.last_error.unwrap_or(ServiceError::NoEndpoints);
        Some(ServiceEvent::Error { id: Some(id), error })
    }

    fn fail_member(&mut self, index: usize, error: &ServiceError, events: &mut Vec<ServiceEvent>) {
        let affected: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.outstanding.contains(&index))
            .map(|(id, _)| *id)
            .collect();
        for id in affected {
            events.extend(self.fail(id, error.clone(), index));
        }
    }
}

impl AsyncSession for HaSession {
    fn endpoint(&self) -> &str {
        &self.name
    }

    fn submit(&mut self, request: &AggregationRequest) -> Result<(), ServiceError> {
        let now = self.clock.now();
        let mut outstanding = BTreeSet::new();
        let mut last_error = None;

        for (index, member) in self.members.iter_mut().enumerate() {
            if !member.circuit.allow_request(now) {
                last_error = Some(ServiceError::CircuitOpen { endpoint: member.session.endpoint().to_string() });
                continue;
            }
            match member.session.submit(request) {
                Ok(()) => {
                    outstanding.insert(index);
                },
                Err(e) => {
                    debug!(endpoint = member.session.endpoint(), error = %e, "endpoint refused request");
                    if e != ServiceError::RequestLimit {
                        member.circuit.record_failure(now);
                    }
                    last_error = Some(e);
                },
            }
        }

        if outstanding.is_empty() {
            return Err(last_error.unwrap_or(ServiceError::NoEndpoints));
        }
        self.pending.insert(request.id, Pending { outstanding, last_error: None });
        Ok(())
    }

    fn poll(&mut self) -> Result<Vec<ServiceEvent>, ServiceError> {
        let now = self.clock.now();
        let mut events = Vec::new();

        for index in 0..self.members.len() {
            let polled = self.members[index].session.poll();
            let member_events = match polled {
                Ok(member_events) => member_events,
                Err(e) => {
                    warn!(endpoint = self.members[index].session.endpoint(), error = %e, "endpoint poll failed");
                    self.members[index].circuit.record_failure(now);
                    self.fail_member(index, &e, &mut events);
                    continue;
                },
            };

            for event in member_events {
                match event {
                    ServiceEvent::Response { id, signature } => {
                        self.members[index].circuit.record_success();
                        events.extend(self.resolve(id, signature, index));
                    },
                    ServiceEvent::Error { id: Some(id), error } => {
                        self.members[index].circuit.record_failure(now);
                        events.extend(self.fail(id, error, index));
                    },
                    ServiceEvent::Error { id: None, error } => {
                        warn!(endpoint = self.members[index].session.endpoint(), error = %error, "endpoint connection failed");
                        self.members[index].circuit.record_failure(now);
                        self.fail_member(index, &error, &mut events);
                    },
                    ServiceEvent::ConfigPush(config) => {
                        let member = &mut self.members[index];
                        member.reported = member.reported.merge_latest(config);
                        events.push(ServiceEvent::ConfigPush(self.merged_config()));
                    },
                }
            }
        }

        Ok(events)
    }

    fn request_config(&mut self) -> Result<(), ServiceError> {
        let mut last_error = None;
        let mut requested = false;
        for member in &mut self.members {
            match member.session.request_config() {
                Ok(()) => requested = true,
                Err(e) => last_error = Some(e),
            }
        }

        match (requested, last_error) {
            (true, _) => Ok(()),
            (false, Some(e)) => Err(e),
            (false, None) => Err(ServiceError::NoEndpoints),
        }
    }

    fn set_option(&mut self, option: ServiceOption) -> Result<(), ServiceError> {
        for member in &mut self.members {
            member.session.set_option(option)?;
        }
        Ok(())
    }

    fn cancel(&mut self, id: RequestId) {
        if let Some(pending) = self.pending.remove(&id) {
            for index in pending.outstanding {
                if let Some(member) = self.members.get_mut(index) {
                    member.session.cancel(id);
                }
            }
        }
    }

    fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
