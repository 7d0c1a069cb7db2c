//! In-process fan-out topic.
//!
//! [`Topic::publish`] routes a message and performs delivery: queue
//! subscriptions get the message enqueued on their lane, handler
//! subscriptions get a spawned invocation. Handler invocations are
//! fire-and-forget: failures and timeouts are logged and counted, never
//! retried here.

use crate::envelope::{EventEnvelope, TopicMessage};
use crate::handler::{EventHandler, PipelineError};
use crate::router::{Endpoint, Router};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Fan-out topic over a set of routed subscriptions
pub struct Topic {
    name: String,
    router: Router,
    invocations: TaskTracker,
}

impl Topic {
    pub fn new(name: impl Into<String>, router: Router) -> Self {
        Self {
            name: name.into(),
            router,
            invocations: TaskTracker::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish a message to every matching subscription. Returns the names of
    /// the subscriptions the message was handed to.
    pub fn publish(&self, message: TopicMessage) -> Vec<String> {
        let decision = self.router.route(&message);

        debug!(
            topic = %self.name,
            message_id = %message.message_id,
            kind = ?decision.kind,
            resource_key = ?decision.resource_key,
            targets = ?decision.target_names(),
            "Routing message"
        );
        metrics::counter!("topic.messages.published", "topic" => self.name.clone()).increment(1);

        let mut delivered = Vec::with_capacity(decision.targets.len());
        for subscription in decision.targets {
            match &subscription.endpoint {
                Endpoint::Queue(sender) => {
                    if let Err(e) = sender.send(message.clone()) {
                        error!(
                            subscription = %subscription.name,
                            message_id = %message.message_id,
                            error = %e,
                            "Failed to enqueue message"
                        );
                        continue;
                    }
                }
                Endpoint::Handler { handler, timeout } => {
                    self.invocations.spawn(invoke_handler(
                        subscription.name.clone(),
                        handler.clone(),
                        *timeout,
                        message.clone(),
                    ));
                }
            }
            delivered.push(subscription.name.clone());
        }

        if delivered.is_empty() {
            warn!(
                topic = %self.name,
                message_id = %message.message_id,
                "Message matched no subscription"
            );
        }

        delivered
    }

    /// Wait for in-flight handler invocations to finish. Lanes keep running
    /// until the topic itself is dropped.
    pub async fn drain(&self) {
        self.invocations.close();
        self.invocations.wait().await;
        info!(topic = %self.name, "Topic drained");
    }
}

async fn invoke_handler(
    subscription: String,
    handler: Arc<dyn EventHandler>,
    timeout: Duration,
    message: TopicMessage,
) {
    let envelopes = match EventEnvelope::from_message(&message) {
        Ok(envelopes) => envelopes,
        Err(e) => {
            warn!(
                subscription = %subscription,
                message_id = %message.message_id,
                error = %e,
                "Dropping malformed message"
            );
            metrics::counter!("subscription.messages.malformed", "subscription" => subscription)
                .increment(1);
            return;
        }
    };

    // Each envelope gets its own timeout; one failure never skips the rest
    for envelope in &envelopes {
        let error = match time::timeout(timeout, handler.handle(envelope)).await {
            Ok(Ok(())) => {
                metrics::counter!("subscription.messages.handled", "subscription" => subscription.clone())
                    .increment(1);
                continue;
            }
            Ok(Err(e)) => e,
            Err(_) => PipelineError::Timeout(timeout),
        };

        error!(
            subscription = %subscription,
            message_id = %message.message_id,
            resource_key = %envelope.resource_key,
            kind = %envelope.kind,
            error = %error,
            "Subscriber failed"
        );
        metrics::counter!("subscription.messages.failed", "subscription" => subscription.clone())
            .increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LaneConfig;
    use crate::envelope::{storage_notification, storage_notification_records};
    use crate::filter::FilterPolicy;
    use crate::lane::QueueLane;
    use crate::router::Subscription;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collect {
        keys: Mutex<Vec<String>>,
        delay: Option<Duration>,
        fail_on: Option<&'static str>,
    }

    #[async_trait::async_trait]
    impl EventHandler for Collect {
        async fn handle(&self, envelope: &EventEnvelope) -> Result<(), PipelineError> {
            if let Some(delay) = self.delay {
                time::sleep(delay).await;
            }
            if self.fail_on == Some(envelope.resource_key.as_str()) {
                return Err(PipelineError::rejected(&envelope.resource_key, "refused"));
            }
            self.keys.lock().push(envelope.resource_key.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_publish_invokes_handlers_and_enqueues() {
        let (sender, lane) = QueueLane::new("processing", LaneConfig::processing());
        let notifier = Arc::new(Collect::default());
        let filtered = Arc::new(Collect::default());

        let router = Router::new()
            .subscribe(Subscription::queue("processing", sender))
            .subscribe(Subscription::handler("notifier", notifier.clone(), Duration::from_secs(3)))
            .subscribe(
                Subscription::handler("metadata", filtered.clone(), Duration::from_secs(3))
                    .with_policy(FilterPolicy::match_all().one_of("comment_type", ["Caption"])),
            );
        let topic = Topic::new("images", router);

        let delivered = topic.publish(TopicMessage::new(storage_notification(
            "ObjectCreated:Put",
            "images",
            "cat.jpg",
        )));
        topic.drain().await;

        assert_eq!(delivered, vec!["processing", "notifier"]);
        assert_eq!(*notifier.keys.lock(), vec!["cat.jpg".to_string()]);
        assert!(filtered.keys.lock().is_empty());

        drop(topic);
        drop(lane);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_is_abandoned_after_timeout() {
        let slow = Arc::new(Collect {
            delay: Some(Duration::from_secs(10)),
            ..Default::default()
        });
        let router = Router::new().subscribe(Subscription::handler(
            "slow",
            slow.clone(),
            Duration::from_secs(3),
        ));
        let topic = Topic::new("images", router);

        topic.publish(TopicMessage::new(storage_notification(
            "ObjectRemoved:Delete",
            "images",
            "cat.jpg",
        )));
        topic.drain().await;

        assert!(slow.keys.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failed_envelope_does_not_skip_later_ones() {
        let collect = Arc::new(Collect {
            fail_on: Some("first.jpg"),
            ..Default::default()
        });
        let router = Router::new().subscribe(Subscription::handler(
            "notifier",
            collect.clone(),
            Duration::from_secs(3),
        ));
        let topic = Topic::new("images", router);

        topic.publish(TopicMessage::new(storage_notification_records(
            "ObjectCreated:Put",
            "images",
            &["first.jpg", "second.jpg"],
        )));
        topic.drain().await;

        assert_eq!(*collect.keys.lock(), vec!["second.jpg".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_applies_per_envelope() {
        let slow = Arc::new(Collect {
            delay: Some(Duration::from_secs(2)),
            ..Default::default()
        });
        let router = Router::new().subscribe(Subscription::handler(
            "notifier",
            slow.clone(),
            Duration::from_secs(3),
        ));
        let topic = Topic::new("images", router);

        topic.publish(TopicMessage::new(storage_notification_records(
            "ObjectRemoved:Delete",
            "images",
            &["a.jpg", "b.jpg"],
        )));
        topic.drain().await;

        assert_eq!(slow.keys.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_message_never_reaches_handler() {
        let collect = Arc::new(Collect::default());
        let router = Router::new().subscribe(Subscription::handler(
            "notifier",
            collect.clone(),
            Duration::from_secs(3),
        ));
        let topic = Topic::new("images", router);

        let delivered = topic.publish(TopicMessage::new("{\"Records\": []}"));
        topic.drain().await;

        assert_eq!(delivered, vec!["notifier"]);
        assert!(collect.keys.lock().is_empty());
    }

    #[tokio::test]
    async fn test_closed_lane_is_not_reported_as_delivered() {
        let (sender, lane) = QueueLane::new("processing", LaneConfig::processing());
        drop(lane);

        let topic = Topic::new(
            "images",
            Router::new().subscribe(Subscription::queue("processing", sender)),
        );
        let delivered = topic.publish(TopicMessage::new("{}"));

        assert!(delivered.is_empty());
    }
}
