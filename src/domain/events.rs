//! Audit events for the request lifecycle.
//!
//! Every step transition, retry, decision and webhook is recorded as an
//! immutable event in an append-only log next to the request record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::request::{State, StepKind};

/// A single entry in the append-only audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The request this event belongs to
    pub request_id: Uuid,

    /// Step that produced the event (if applicable)
    pub step: Option<StepKind>,

    /// Type of event
    pub event_type: EventType,

    /// Idempotency key format: "{request_id}:{step}:{attempt}"
    pub idempotency_key: String,

    /// Human-readable summary (NO secrets)
    pub payload_summary: String,

    /// Request state after the event
    pub state: State,

    /// Time taken in milliseconds (for completed steps)
    pub duration_ms: Option<u64>,

    /// Error message if failed
    pub error: Option<String>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(
        request_id: Uuid,
        step: Option<StepKind>,
        event_type: EventType,
        idempotency_key: String,
        payload_summary: String,
        state: State,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            request_id,
            step,
            event_type,
            idempotency_key,
            payload_summary,
            state,
            duration_ms: None,
            error: None,
        }
    }

    /// Create an event with duration information
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Create an event with error information
    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }
}

/// Types of events recorded during a request's lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RequestCreated,
    /// A transition that needs no external call
    StateChanged,
    StepStarted,
    StepCompleted,
    /// A step is being retried after a transient failure
    StepRetrying,
    StepFailed,
    /// Request rejected by validation before any state change
    InputRejected,
    Escalated,
    DecisionApplied,
    DecisionDuplicate,
    AttachmentsAdded,
    ConsentRecorded,
    ConsentDeclined,
    WebhookApplied,
    WebhookDuplicate,
    CancelRequested,
    Cancelled,
    RetryRequested,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::RequestCreated => "request_created",
            EventType::StateChanged => "state_changed",
            EventType::StepStarted => "step_started",
            EventType::StepCompleted => "step_completed",
            EventType::StepRetrying => "step_retrying",
            EventType::StepFailed => "step_failed",
            EventType::InputRejected => "input_rejected",
            EventType::Escalated => "escalated",
            EventType::DecisionApplied => "decision_applied",
            EventType::DecisionDuplicate => "decision_duplicate",
            EventType::AttachmentsAdded => "attachments_added",
            EventType::ConsentRecorded => "consent_recorded",
            EventType::ConsentDeclined => "consent_declined",
            EventType::WebhookApplied => "webhook_applied",
            EventType::WebhookDuplicate => "webhook_duplicate",
            EventType::CancelRequested => "cancel_requested",
            EventType::Cancelled => "cancelled",
            EventType::RetryRequested => "retry_requested",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = Event::new(
            Uuid::new_v4(),
            Some(StepKind::Classification),
            EventType::StepStarted,
            "test-key".to_string(),
            "Starting classification".to_string(),
            State::Created,
        );

        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.event_type, EventType::StepStarted);
        assert_eq!(parsed.step, Some(StepKind::Classification));
        assert_eq!(parsed.state, State::Created);
    }

    #[test]
    fn test_event_with_duration_and_error() {
        let event = Event::new(
            Uuid::new_v4(),
            Some(StepKind::Verification),
            EventType::StepFailed,
            "test-key".to_string(),
            "OCR failed".to_string(),
            State::Failed,
        )
        .with_duration(1500)
        .with_error("Connection timeout".to_string());

        assert_eq!(event.duration_ms, Some(1500));
        assert_eq!(event.error, Some("Connection timeout".to_string()));
    }
}
