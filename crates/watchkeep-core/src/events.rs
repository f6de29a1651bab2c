//! Event bus for the presentation layer.
//!
//! The orchestrator publishes every state change here; renderers subscribe
//! instead of polling. Slow subscribers lag and skip events rather than
//! holding up the control loop.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::alerts::SystemAlert;
use crate::health::{CaptureOutcome, HealthSnapshot};
use crate::retry::ErrorClass;
use crate::schedule::EffectiveSchedule;
use crate::synthesis::SequenceReport;

/// Events that flow out of the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    /// The effective mode differs from the previous tick.
    ModeChanged {
        subject_id: String,
        schedule: EffectiveSchedule,
    },

    /// A capture cycle began.
    SequenceStarted {
        subject_id: String,
        sequence_id: u64,
        samples: u32,
    },

    /// One slot of the sequence was captured and analyzed.
    SampleCaptured {
        subject_id: String,
        sequence_id: u64,
        sequence_index: u32,
        attempts: u32,
        outcome: CaptureOutcome,
    },

    /// One slot failed after retries, or fatally.
    SampleFailed {
        subject_id: String,
        sequence_id: u64,
        sequence_index: u32,
        attempts: u32,
        error_class: ErrorClass,
        message: String,
    },

    /// Recomputed after outcomes and on each health check.
    HealthUpdated {
        subject_id: String,
        snapshot: HealthSnapshot,
    },

    AlertRaised { alert: SystemAlert },

    AlertAcknowledged { alert_id: String, by: String },

    /// A sequence completed, with or without a consensus.
    ReportReady {
        subject_id: String,
        report: SequenceReport,
    },

    SchedulingHalted {
        subject_id: String,
        consecutive_failures: u32,
    },

    SchedulingResumed { subject_id: String },
}

/// Fan-out of [`OrchestratorEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<OrchestratorEvent>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    /// Create a bus retaining up to `capacity` undelivered events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.sender.subscribe()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish to all current subscribers. Returns how many received it;
    /// publishing with nobody listening is not an error.
    pub fn publish(&self, event: OrchestratorEvent) -> usize {
        match self.sender.send(event) {
            Ok(n) => n,
            Err(broadcast::error::SendError(event)) => {
                trace!(?event, "Event dropped, no subscribers");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_type_tag() {
        let event = OrchestratorEvent::SequenceStarted {
            subject_id: "pen-1".to_string(),
            sequence_id: 3,
            samples: 10,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"sequence_started\""));
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        assert_eq!(bus.subscriber_count(), 0);
        let delivered = bus.publish(OrchestratorEvent::SchedulingResumed {
            subject_id: "pen-1".to_string(),
        });
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn subscribers_receive_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(OrchestratorEvent::SchedulingHalted {
            subject_id: "pen-1".to_string(),
            consecutive_failures: 10,
        });
        bus.publish(OrchestratorEvent::SchedulingResumed {
            subject_id: "pen-1".to_string(),
        });
        assert!(matches!(
            rx.recv().await.unwrap(),
            OrchestratorEvent::SchedulingHalted { consecutive_failures: 10, .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            OrchestratorEvent::SchedulingResumed { .. }
        ));
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_oldest() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for n in 0..4 {
            bus.publish(OrchestratorEvent::SchedulingHalted {
                subject_id: "pen-1".to_string(),
                consecutive_failures: n,
            });
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(2))
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            OrchestratorEvent::SchedulingHalted { consecutive_failures: 2, .. }
        ));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        assert_eq!(EventBus::new(0).capacity(), 1);
    }
}
