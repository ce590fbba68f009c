//! Event types for the event-sourced task log.
//!
//! All task state changes are recorded as immutable events in an append-only
//! log, one log per (task, round).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::record::{TaskIdentity, TaskStatus};

/// A single event in the append-only event log.
///
/// Events are the source of truth for task state. The current record of any
/// task round can be reconstructed by replaying its events in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// Task identifier
    pub task: String,

    /// Round within the task
    pub round: u32,

    /// Type of event
    pub event_type: EventType,

    /// Idempotency key format: "{task}:{round}:{stage}:{input_hash}"
    pub idempotency_key: String,

    /// Human-readable summary (NO secrets)
    pub payload_summary: String,

    /// Task status after this event
    pub status: TaskStatus,

    /// Stage attempt counter at the time of the event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,

    /// Time taken in milliseconds (for completed stages)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Error message if failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Structured payload (depends on event type)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(
        identity: &TaskIdentity,
        event_type: EventType,
        idempotency_key: String,
        payload_summary: String,
        status: TaskStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            task: identity.task.clone(),
            round: identity.round,
            event_type,
            idempotency_key,
            payload_summary,
            status,
            attempt: None,
            duration_ms: None,
            error: None,
            data: None,
        }
    }

    /// The identity this event belongs to
    pub fn identity(&self) -> TaskIdentity {
        TaskIdentity::new(self.task.clone(), self.round)
    }

    /// Attach the stage attempt counter
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    /// Attach duration information
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Attach error information
    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }

    /// Attach a structured payload
    pub fn with_data<T: Serialize>(mut self, data: &T) -> Self {
        self.data = serde_json::to_value(data).ok();
        self
    }

    /// Decode the structured payload
    pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
        self.data
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Types of events that can occur while processing a task round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// First admission of a (task, round)
    TaskAdmitted,

    /// A later delivery of the same (task, round) resumed the pipeline
    RedeliveryReceived,

    /// The pipeline entered a stage
    StageStarted,

    /// One generation attempt finished (with check outcomes)
    GenerationAttempt,

    /// Generation produced an artifact passing every check
    GenerationCompleted,

    /// Generation exhausted its attempts or deadline
    GenerationFailed,

    /// The site is live
    PublishCompleted,

    /// Publishing failed terminally
    PublishFailed,

    /// The outbound report was built and frozen
    ReportPrepared,

    /// The evaluator accepted the report
    NotificationDelivered,

    /// The report could not be delivered
    NotificationDeadLettered,

    /// Terminal: task succeeded
    TaskSucceeded,

    /// Terminal: task failed
    TaskFailed,

    /// Shutdown stopped the pipeline at a checkpoint
    TaskAbandoned,
}
