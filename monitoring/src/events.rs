//! In-process event bus wiring the monitoring components together
//!
//! Producers publish typed events; consumers hold explicit receivers and
//! process events in their own loops. Dropping a receiver unsubscribes it.

use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::alerts::Alert;
use crate::health::HealthReport;
use crate::metrics::MetricKind;
use crate::workflow::WorkflowExecution;

/// Events exchanged between monitoring components.
///
/// Payloads are owned copies; receivers never get shared references into a
/// producer's internal state.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// A sample was recorded into the metrics registry
    MetricRecorded {
        name: String,
        kind: MetricKind,
        value: f64,
        labels: HashMap<String, String>,
    },

    /// A full health check pass completed
    HealthChecked(HealthReport),

    /// A periodic health tick failed internally
    HealthCheckError { check: String, message: String },

    /// An alert transitioned to firing
    AlertFired(Alert),

    /// An alert transitioned to resolved
    AlertResolved(Alert),

    /// A notification channel failed to deliver
    AlertDeliveryFailed {
        channel: String,
        rule: String,
        message: String,
    },

    /// A workflow execution reached a terminal status
    WorkflowFinished(WorkflowExecution),

    /// A workflow execution failed or timed out
    WorkflowError {
        execution_id: Uuid,
        name: String,
        message: String,
    },
}

impl MonitorEvent {
    /// Get the event kind as a string for logging and filtering
    pub fn kind(&self) -> &'static str {
        match self {
            MonitorEvent::MetricRecorded { .. } => "metric_recorded",
            MonitorEvent::HealthChecked(_) => "health_checked",
            MonitorEvent::HealthCheckError { .. } => "health_check_error",
            MonitorEvent::AlertFired(_) => "alert_fired",
            MonitorEvent::AlertResolved(_) => "alert_resolved",
            MonitorEvent::AlertDeliveryFailed { .. } => "alert_delivery_failed",
            MonitorEvent::WorkflowFinished(_) => "workflow_finished",
            MonitorEvent::WorkflowError { .. } => "workflow_error",
        }
    }
}

/// Broadcast bus shared by all monitoring components
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MonitorEvent>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all events; dropping the receiver unsubscribes
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to all current subscribers.
    ///
    /// Publishing with no subscribers is not an error; the event is dropped.
    pub fn publish(&self, event: MonitorEvent) {
        let kind = event.kind();
        if self.tx.send(event).is_err() {
            debug!(event = kind, "No subscribers for event");
        }
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(MonitorEvent::MetricRecorded {
            name: "quiz_submissions_total".to_string(),
            kind: MetricKind::Counter,
            value: 1.0,
            labels: HashMap::new(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), "metric_recorded");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::new(16);
        // Must not panic or error
        bus.publish(MonitorEvent::HealthCheckError {
            check: "memory".to_string(),
            message: "tick failed".to_string(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_dropping_receiver_unsubscribes() {
        let bus = EventBus::new(16);
        let rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(rx);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
