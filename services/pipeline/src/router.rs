//! Subscription routing for the fan-out topic.
//!
//! Every subscription is a `{policy, endpoint}` pair. Routing is a pure
//! decision over the message attributes: each subscription whose policy
//! matches receives the message, so one message routinely reaches several
//! subscribers.

use crate::envelope::{EventEnvelope, EventKind, TopicMessage};
use crate::filter::FilterPolicy;
use crate::handler::EventHandler;
use crate::lane::LaneSender;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Where a subscription delivers
#[derive(Clone)]
pub enum Endpoint {
    /// Buffered delivery through a queue lane
    Queue(LaneSender),
    /// Direct invocation of a handler, bounded by a per-invocation timeout
    Handler {
        handler: Arc<dyn EventHandler>,
        timeout: Duration,
    },
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Queue(sender) => f.debug_tuple("Queue").field(&sender.name()).finish(),
            Endpoint::Handler { timeout, .. } => f
                .debug_struct("Handler")
                .field("timeout", timeout)
                .finish_non_exhaustive(),
        }
    }
}

/// A subscriber declared on the topic
#[derive(Debug, Clone)]
pub struct Subscription {
    pub name: String,
    pub policy: FilterPolicy,
    pub endpoint: Endpoint,
}

impl Subscription {
    /// Subscribe a queue lane
    pub fn queue(name: impl Into<String>, sender: LaneSender) -> Self {
        Self {
            name: name.into(),
            policy: FilterPolicy::match_all(),
            endpoint: Endpoint::Queue(sender),
        }
    }

    /// Subscribe a handler invoked directly
    pub fn handler(
        name: impl Into<String>,
        handler: Arc<dyn EventHandler>,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            policy: FilterPolicy::match_all(),
            endpoint: Endpoint::Handler { handler, timeout },
        }
    }

    /// Restrict the subscription with a filter policy
    pub fn with_policy(mut self, policy: FilterPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Outcome of routing one message
#[derive(Debug)]
pub struct RoutingDecision<'a> {
    /// Event kind of the first wrapped envelope, when the body decodes
    pub kind: Option<EventKind>,
    /// Resource key of the first wrapped envelope, when the body decodes
    pub resource_key: Option<String>,
    pub targets: Vec<&'a Subscription>,
}

impl RoutingDecision<'_> {
    pub fn target_names(&self) -> Vec<&str> {
        self.targets.iter().map(|s| s.name.as_str()).collect()
    }
}

/// Matches messages against the declared subscriptions
#[derive(Debug, Default)]
pub struct Router {
    subscriptions: Vec<Subscription>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a subscription
    pub fn subscribe(mut self, subscription: Subscription) -> Self {
        self.subscriptions.push(subscription);
        self
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    /// Decide which subscriptions receive a message.
    ///
    /// Classification is informational: a body that does not decode is still
    /// routed, and the subscribers that receive it report it as malformed.
    pub fn route(&self, message: &TopicMessage) -> RoutingDecision<'_> {
        let first = EventEnvelope::from_message(message)
            .ok()
            .and_then(|envelopes| envelopes.into_iter().next());

        RoutingDecision {
            kind: first.as_ref().map(|e| e.kind),
            resource_key: first.map(|e| e.resource_key),
            targets: self
                .subscriptions
                .iter()
                .filter(|s| s.policy.matches(&message.attributes))
                .collect(),
        }
    }
}
