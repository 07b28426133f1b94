//! Lifecycle events and the subscriber fan-out.
//!
//! Every workflow, step, version, sync, deployment and rollback transition
//! is emitted as a [`LifecycleEvent`] wrapped in an [`EventEnvelope`]. The
//! [`Notifier`] hands each envelope to every registered [`EventSubscriber`]
//! and logs delivery failures without ever failing the caller.

pub mod webhook;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::NotificationConfig;
use crate::errors::NotificationError;
use crate::models::new_id;

pub use webhook::WebhookSubscriber;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Closed set of lifecycle transitions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    WorkflowStarted {
        task_id: String,
        title: String,
    },
    WorkflowCompleted {
        task_id: String,
        status: String,
    },
    WorkflowFailed {
        task_id: String,
        step_id: String,
        error: String,
    },
    StepStarted {
        task_id: String,
        step_id: String,
        step_type: String,
    },
    StepCompleted {
        task_id: String,
        step_id: String,
        step_type: String,
    },
    StepFailed {
        task_id: String,
        step_id: String,
        step_type: String,
        error: String,
    },
    VersionCreated {
        version_id: String,
        locale: String,
        namespace: String,
        version: String,
        branch: String,
        changes: usize,
    },
    SyncCompleted {
        operation_id: String,
        environment: String,
        files: usize,
        failed: usize,
        dry_run: bool,
    },
    DeploymentStarted {
        deployment_id: String,
        environment: String,
    },
    DeploymentCompleted {
        deployment_id: String,
        environment: String,
        files: usize,
    },
    DeploymentFailed {
        deployment_id: String,
        environment: String,
        rolled_back: bool,
        errors: Vec<String>,
    },
    RollbackStarted {
        rollback_id: String,
        environment: String,
        target: String,
    },
    RollbackCompleted {
        rollback_id: String,
        environment: String,
        success: bool,
        files_restored: usize,
    },
}

impl LifecycleEvent {
    /// Dotted/colon event name, e.g. `step:completed`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "workflow:started",
            Self::WorkflowCompleted { .. } => "workflow:completed",
            Self::WorkflowFailed { .. } => "workflow:failed",
            Self::StepStarted { .. } => "step:started",
            Self::StepCompleted { .. } => "step:completed",
            Self::StepFailed { .. } => "step:failed",
            Self::VersionCreated { .. } => "version:created",
            Self::SyncCompleted { .. } => "sync:completed",
            Self::DeploymentStarted { .. } => "deployment:started",
            Self::DeploymentCompleted { .. } => "deployment:completed",
            Self::DeploymentFailed { .. } => "deployment:failed",
            Self::RollbackStarted { .. } => "rollback:started",
            Self::RollbackCompleted { .. } => "rollback:completed",
        }
    }

    /// Subsystem that emits the event.
    pub fn source(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. }
            | Self::WorkflowCompleted { .. }
            | Self::WorkflowFailed { .. }
            | Self::StepStarted { .. }
            | Self::StepCompleted { .. }
            | Self::StepFailed { .. } => "workflow",
            Self::VersionCreated { .. } => "version",
            _ => "deployment",
        }
    }

    pub fn priority(&self) -> EventPriority {
        match self {
            Self::WorkflowFailed { .. } | Self::DeploymentFailed { .. } => EventPriority::Urgent,
            Self::StepFailed { .. }
            | Self::RollbackStarted { .. }
            | Self::RollbackCompleted { .. } => EventPriority::High,
            Self::StepStarted { .. } | Self::VersionCreated { .. } => EventPriority::Low,
            _ => EventPriority::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl std::fmt::Display for EventPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Urgent => write!(f, "urgent"),
        }
    }
}

/// What subscribers receive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    pub id: String,
    pub event: LifecycleEvent,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub priority: EventPriority,
    pub recipients: Vec<String>,
    pub channels: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Subscribers
// ---------------------------------------------------------------------------

/// Receives every emitted envelope.
pub trait EventSubscriber: Send + Sync {
    fn name(&self) -> &str;
    fn on_event(&self, envelope: &EventEnvelope) -> Result<(), NotificationError>;
}

/// Writes one structured log line per event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSubscriber;

impl EventSubscriber for TracingSubscriber {
    fn name(&self) -> &str {
        "tracing"
    }

    fn on_event(&self, envelope: &EventEnvelope) -> Result<(), NotificationError> {
        let data = serde_json::to_string(&envelope.event).unwrap_or_default();
        info!(
            event = envelope.event.name(),
            event_id = %envelope.id,
            priority = %envelope.priority,
            data = %data,
            "lifecycle event"
        );
        Ok(())
    }
}

/// Keeps every envelope in memory. Handy for embedding callers and tests.
#[derive(Debug, Default)]
pub struct RecordingSubscriber {
    events: Mutex<Vec<EventEnvelope>>,
}

impl RecordingSubscriber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the recorded events, in emission order.
    pub fn names(&self) -> Vec<&'static str> {
        self.snapshot().iter().map(|e| e.event.name()).collect()
    }

    pub fn snapshot(&self) -> Vec<EventEnvelope> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl EventSubscriber for RecordingSubscriber {
    fn name(&self) -> &str {
        "recording"
    }

    fn on_event(&self, envelope: &EventEnvelope) -> Result<(), NotificationError> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(envelope.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

/// Fans events out to every subscriber.
pub struct Notifier {
    subscribers: RwLock<Vec<Arc<dyn EventSubscriber>>>,
    recipients: Vec<String>,
    channels: Vec<String>,
}

impl Notifier {
    /// A notifier with no subscribers.
    pub fn new(config: &NotificationConfig) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            recipients: config.recipients.clone(),
            channels: config.channels.clone(),
        }
    }

    /// A notifier that only logs.
    pub fn with_tracing(config: &NotificationConfig) -> Self {
        let notifier = Self::new(config);
        notifier.subscribe(Arc::new(TracingSubscriber));
        notifier
    }

    /// Register a subscriber.
    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        info!(subscriber = subscriber.name(), "event subscriber registered");
        self.subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(subscriber);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Emit an event. Subscriber failures are logged and swallowed.
    pub fn emit(&self, event: LifecycleEvent) {
        self.emit_with(event, BTreeMap::new());
    }

    /// Emit an event carrying extra metadata.
    pub fn emit_with(&self, event: LifecycleEvent, metadata: BTreeMap<String, String>) {
        let envelope = EventEnvelope {
            id: new_id("event"),
            source: event.source().to_string(),
            priority: event.priority(),
            timestamp: Utc::now(),
            recipients: self.recipients.clone(),
            channels: self.channels.clone(),
            metadata,
            event,
        };
        debug!(event = envelope.event.name(), event_id = %envelope.id, "dispatching event");

        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for subscriber in subscribers {
            if let Err(e) = subscriber.on_event(&envelope) {
                warn!(
                    subscriber = subscriber.name(),
                    event = envelope.event.name(),
                    error = %e,
                    "event delivery failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSubscriber;

    impl EventSubscriber for FailingSubscriber {
        fn name(&self) -> &str {
            "failing"
        }
        fn on_event(&self, _: &EventEnvelope) -> Result<(), NotificationError> {
            Err(NotificationError::ChannelClosed)
        }
    }

    #[test]
    fn test_fan_out_survives_failing_subscriber() {
        let config = NotificationConfig {
            recipients: vec!["i18n-team".into()],
            ..Default::default()
        };
        let notifier = Notifier::new(&config);
        let recorder = Arc::new(RecordingSubscriber::new());
        notifier.subscribe(Arc::new(FailingSubscriber));
        notifier.subscribe(recorder.clone());
        assert_eq!(notifier.subscriber_count(), 2);

        notifier.emit(LifecycleEvent::StepFailed {
            task_id: "task_1".into(),
            step_id: "validation".into(),
            step_type: "validation".into(),
            error: "below threshold".into(),
        });

        let events = recorder.snapshot();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.name(), "step:failed");
        assert_eq!(events[0].priority, EventPriority::High);
        assert_eq!(events[0].source, "workflow");
        assert_eq!(events[0].recipients, vec!["i18n-team".to_string()]);
        assert!(events[0].id.starts_with("event_"));
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = LifecycleEvent::DeploymentFailed {
            deployment_id: "deploy_1".into(),
            environment: "staging".into(),
            rolled_back: false,
            errors: vec!["hash mismatch".into()],
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "deployment_failed");
        assert_eq!(event.priority(), EventPriority::Urgent);
    }
}
