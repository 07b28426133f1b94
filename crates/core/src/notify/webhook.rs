//! Webhook event subscriber.
//!
//! Envelopes are queued on an unbounded channel and POSTed as JSON by a
//! background tokio task, so emitting never waits on the network.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{EventEnvelope, EventSubscriber};
use crate::errors::NotificationError;

/// Forwards envelopes to a webhook URL.
pub struct WebhookSubscriber {
    tx: mpsc::UnboundedSender<EventEnvelope>,
}

impl WebhookSubscriber {
    /// Start the delivery task on the current tokio runtime.
    pub fn spawn(webhook_url: String) -> (Self, JoinHandle<()>) {
        info!("initializing webhook subscriber");
        let (tx, mut rx) = mpsc::unbounded_channel::<EventEnvelope>();
        let http = reqwest::Client::new();

        let handle = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if let Err(e) = post_envelope(&http, &webhook_url, &envelope).await {
                    warn!(event = envelope.event.name(), error = %e, "webhook delivery failed");
                }
            }
            debug!("webhook channel closed, delivery task exiting");
        });

        (Self { tx }, handle)
    }

    /// Wrap an existing sender; the caller owns the receiving side.
    pub fn from_sender(tx: mpsc::UnboundedSender<EventEnvelope>) -> Self {
        Self { tx }
    }
}

impl EventSubscriber for WebhookSubscriber {
    fn name(&self) -> &str {
        "webhook"
    }

    fn on_event(&self, envelope: &EventEnvelope) -> Result<(), NotificationError> {
        self.tx
            .send(envelope.clone())
            .map_err(|_| NotificationError::ChannelClosed)
    }
}

/// POST one envelope as JSON.
pub async fn post_envelope(
    http: &reqwest::Client,
    url: &str,
    envelope: &EventEnvelope,
) -> Result<(), NotificationError> {
    let resp = http.post(url).json(envelope).send().await?;
    if !resp.status().is_success() {
        return Err(NotificationError::Rejected {
            status: resp.status().as_u16(),
        });
    }
    debug!(event = envelope.event.name(), "webhook delivered");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotificationConfig;
    use crate::notify::{LifecycleEvent, Notifier};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_events_are_queued_for_delivery() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let notifier = Notifier::new(&NotificationConfig::default());
        notifier.subscribe(Arc::new(WebhookSubscriber::from_sender(tx)));

        notifier.emit(LifecycleEvent::DeploymentStarted {
            deployment_id: "deploy_1".into(),
            environment: "production".into(),
        });

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.event.name(), "deployment:started");
    }

    #[test]
    fn test_closed_channel_reports_error() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let subscriber = WebhookSubscriber::from_sender(tx);
        let notifier = Notifier::new(&NotificationConfig::default());
        let envelope = EventEnvelope {
            id: "event_1".into(),
            event: LifecycleEvent::WorkflowStarted {
                task_id: "task_1".into(),
                title: "t".into(),
            },
            source: "workflow".into(),
            timestamp: chrono::Utc::now(),
            priority: crate::notify::EventPriority::Normal,
            recipients: Vec::new(),
            channels: Vec::new(),
            metadata: Default::default(),
        };
        assert!(matches!(
            subscriber.on_event(&envelope),
            Err(NotificationError::ChannelClosed)
        ));
        // The notifier swallows the failure.
        notifier.subscribe(Arc::new(subscriber));
        notifier.emit(envelope.event.clone());
    }
}
