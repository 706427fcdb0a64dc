use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::BrokerError;

/// Messages for whoever is watching the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    DidFinishScan { broker_name: String },
    DidFinishOptOut { broker_name: String },
    /// At least one record was confirmed removed and others remain.
    FirstRemoval,
    AllRecordsRemoved,
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Fans notifications out to any number of subscribers. Nothing is buffered
/// for subscribers that join later.
pub struct BroadcastNotifier {
    sender: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}

impl NotificationSink for BroadcastNotifier {
    fn notify(&self, notification: Notification) {
        tracing::debug!("Notification: {notification:?}");
        // No receivers is fine.
        let _ = self.sender.send(notification);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelemetryEvent {
    OptOutSubmitSuccess {
        broker: String,
        attempt_id: Uuid,
        duration_ms: i64,
    },
    OptOutConfirmed {
        broker: String,
        attempt_id: Uuid,
        duration_ms: i64,
    },
    OptOutSubmittedNotConfirmed {
        broker: String,
        attempt_id: Uuid,
        days: i64,
    },
    HttpError {
        broker: String,
        code: u16,
    },
    ActionFailed {
        broker: String,
        action_id: String,
        message: String,
    },
    OtherError {
        broker: String,
        error: String,
    },
}

impl TelemetryEvent {
    /// Classify a job failure for the per-broker error counters.
    pub fn from_error(broker: &str, error: &BrokerError) -> Self {
        let broker = broker.to_string();
        match error {
            BrokerError::HttpError { code } => Self::HttpError {
                broker,
                code: *code,
            },
            BrokerError::ActionFailed { action_id, message } => Self::ActionFailed {
                broker,
                action_id: action_id.clone(),
                message: message.clone(),
            },
            other => Self::OtherError {
                broker,
                error: other.to_string(),
            },
        }
    }
}

pub trait Telemetry: Send + Sync {
    fn fire(&self, event: TelemetryEvent);
}

/// Writes telemetry to the log instead of a remote endpoint.
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn fire(&self, event: TelemetryEvent) {
        match &event {
            TelemetryEvent::HttpError { .. }
            | TelemetryEvent::ActionFailed { .. }
            | TelemetryEvent::OtherError { .. } => tracing::warn!(?event, "telemetry"),
            _ => tracing::info!(?event, "telemetry"),
        }
    }
}
