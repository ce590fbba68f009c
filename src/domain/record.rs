//! Task record state and reconstruction from events.
//!
//! A TaskRecord represents one (task, round). It is never stored directly:
//! the event log is the source of truth and the record is folded from it.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::artifact::Artifact;
use super::events::{Event, EventType};
use super::report::{Deployment, NotificationOutcome, Report, StageError, TaskOutcome};
use super::request::TaskRequest;

/// Logical identity of a task round
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskIdentity {
    pub task: String,
    pub round: u32,
}

impl TaskIdentity {
    pub fn new(task: impl Into<String>, round: u32) -> Self {
        Self {
            task: task.into(),
            round,
        }
    }
}

impl fmt::Display for TaskIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/round-{}", self.task, self.round)
    }
}

/// Pipeline position of a task round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Generating,
    Publishing,
    Notifying,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Generating => "generating",
            Self::Publishing => "publishing",
            Self::Notifying => "notifying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Per-stage attempt counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StageAttempts {
    pub generation: u32,
    pub publish: u32,
    pub notification: u32,
}

/// Payload of `GenerationCompleted` / `GenerationFailed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationSummary {
    /// Digest of the stored artifact (best-effort one on failure)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,

    /// Attempts made
    pub attempts: u32,

    /// Failing checks of the last attempt
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_checks: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
}

/// Payload of `PublishCompleted` / `PublishFailed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishSummary {
    pub attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<Deployment>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
}

/// State of one task round
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub identity: TaskIdentity,

    pub status: TaskStatus,

    pub attempts: StageAttempts,

    /// Generated file set (loaded from the artifact file, not the log)
    #[serde(skip)]
    pub artifact: Option<Artifact>,

    /// Digest of the artifact recorded by the generation stage
    pub artifact_digest: Option<String>,

    /// Set once publishing completes
    pub deployment: Option<Deployment>,

    /// Result of generation + publish
    pub outcome: Option<TaskOutcome>,

    /// Publish failure (may coexist with a generation failure)
    pub publish_error: Option<StageError>,

    /// Frozen outbound report
    pub report: Option<Report>,

    /// What happened to the report delivery
    pub notification: Option<NotificationOutcome>,

    /// Terminal error, present only when `Failed`
    pub last_error: Option<StageError>,

    /// Admitted request (without its secret)
    pub request: Option<TaskRequest>,

    /// Deliveries of this identity after the first
    pub redeliveries: u32,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// Fresh record for a newly admitted identity
    pub fn new(identity: TaskIdentity) -> Self {
        let now = Utc::now();
        Self {
            identity,
            status: TaskStatus::Pending,
            attempts: StageAttempts::default(),
            artifact: None,
            artifact_digest: None,
            deployment: None,
            outcome: None,
            publish_error: None,
            report: None,
            notification: None,
            last_error: None,
            request: None,
            redeliveries: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Reconstruct record state from a sequence of events
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first = events.first()?;

        let mut record = Self::new(first.identity());
        record.created_at = first.timestamp;

        for event in events {
            record.apply_event(event);
        }

        Some(record)
    }

    /// Apply a single event to update record state
    pub fn apply_event(&mut self, event: &Event) {
        self.status = event.status;
        self.updated_at = event.timestamp;

        match event.event_type {
            EventType::TaskAdmitted => {
                if let Some(request) = event.data_as::<TaskRequest>() {
                    self.request = Some(request);
                }
            }
            EventType::RedeliveryReceived => {
                self.redeliveries += 1;
            }
            EventType::StageStarted | EventType::TaskAbandoned => {}
            EventType::GenerationAttempt => {
                if let Some(attempt) = event.attempt {
                    self.attempts.generation = attempt;
                }
            }
            EventType::GenerationCompleted => {
                if let Some(summary) = event.data_as::<GenerationSummary>() {
                    self.attempts.generation = summary.attempts;
                    self.artifact_digest = summary.digest;
                }
            }
            EventType::GenerationFailed => {
                if let Some(summary) = event.data_as::<GenerationSummary>() {
                    self.attempts.generation = summary.attempts;
                    self.artifact_digest = summary.digest;
                    if let Some(error) = summary.error {
                        self.outcome = Some(TaskOutcome::GenerationFailure { error });
                    }
                }
            }
            EventType::PublishCompleted => {
                if let Some(summary) = event.data_as::<PublishSummary>() {
                    self.attempts.publish = summary.attempts;
                    if let Some(deployment) = summary.deployment {
                        if self.outcome.is_none() {
                            self.outcome = Some(TaskOutcome::Success {
                                deployment: deployment.clone(),
                            });
                        }
                        self.deployment = Some(deployment);
                    }
                }
            }
            EventType::PublishFailed => {
                if let Some(summary) = event.data_as::<PublishSummary>() {
                    self.attempts.publish = summary.attempts;
                    if let Some(error) = summary.error {
                        if self.outcome.is_none() {
                            self.outcome = Some(TaskOutcome::PublishFailure {
                                error: error.clone(),
                            });
                        }
                        self.publish_error = Some(error);
                    }
                }
            }
            EventType::ReportPrepared => {
                self.report = event.data_as::<Report>();
            }
            EventType::NotificationDelivered | EventType::NotificationDeadLettered => {
                if let Some(outcome) = event.data_as::<NotificationOutcome>() {
                    self.attempts.notification = outcome.attempts();
                    self.notification = Some(outcome);
                }
            }
            EventType::TaskSucceeded => {
                self.completed_at = Some(event.timestamp);
            }
            EventType::TaskFailed => {
                self.last_error = self.outcome.as_ref().and_then(|o| o.error().cloned());
                self.completed_at = Some(event.timestamp);
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Public URL, once publishing succeeded
    pub fn deployed_url(&self) -> Option<&str> {
        self.deployment.as_ref().map(|d| d.url.as_str())
    }

    /// Generation has not produced a result yet
    pub fn needs_generation(&self) -> bool {
        self.artifact_digest.is_none() && self.outcome.is_none()
    }

    /// Publishing is still owed for the recorded generation result
    pub fn needs_publish(&self, publish_on_failure: bool) -> bool {
        if self.deployment.is_some() || self.publish_error.is_some() {
            return false;
        }
        match &self.outcome {
            None => self.artifact_digest.is_some(),
            Some(TaskOutcome::GenerationFailure { .. }) => {
                publish_on_failure && self.artifact_digest.is_some()
            }
            Some(_) => false,
        }
    }

    /// Dead-lettered notification
    pub fn is_dead_lettered(&self) -> bool {
        matches!(
            self.notification,
            Some(NotificationOutcome::DeadLettered { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::report::{FailureCause, Stage};

    fn identity() -> TaskIdentity {
        TaskIdentity::new("calc", 1)
    }

    fn event(event_type: EventType, status: TaskStatus) -> Event {
        Event::new(
            &identity(),
            event_type,
            format!("calc:1:{:?}", event_type),
            String::new(),
            status,
        )
    }

    fn deployment() -> Deployment {
        Deployment {
            url: "https://me.github.io/calc/".to_string(),
            repo_url: "https://github.com/me/calc".to_string(),
            commit_sha: "abc".to_string(),
        }
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(identity().to_string(), "calc/round-1");
    }

    #[test]
    fn test_record_from_successful_events() {
        let events = vec![
            event(EventType::TaskAdmitted, TaskStatus::Pending),
            event(EventType::StageStarted, TaskStatus::Generating),
            event(EventType::GenerationAttempt, TaskStatus::Generating).with_attempt(1),
            event(EventType::GenerationCompleted, TaskStatus::Generating).with_data(
                &GenerationSummary {
                    digest: Some("d1".to_string()),
                    attempts: 1,
                    failed_checks: vec![],
                    error: None,
                },
            ),
            event(EventType::StageStarted, TaskStatus::Publishing),
            event(EventType::PublishCompleted, TaskStatus::Publishing).with_data(
                &PublishSummary {
                    attempts: 2,
                    deployment: Some(deployment()),
                    error: None,
                },
            ),
            event(EventType::StageStarted, TaskStatus::Notifying),
            event(EventType::NotificationDeadLettered, TaskStatus::Notifying).with_data(
                &NotificationOutcome::DeadLettered {
                    attempts: 1,
                    reason: "HTTP 400".to_string(),
                },
            ),
            event(EventType::TaskSucceeded, TaskStatus::Succeeded),
        ];

        let record = TaskRecord::from_events(&events).unwrap();

        assert_eq!(record.status, TaskStatus::Succeeded);
        assert_eq!(record.deployed_url(), Some("https://me.github.io/calc/"));
        assert_eq!(record.attempts.generation, 1);
        assert_eq!(record.attempts.publish, 2);
        assert!(record.is_dead_lettered());
        assert!(record.last_error.is_none());
        assert!(record.completed_at.is_some());
    }

    #[test]
    fn test_failed_record_carries_last_error() {
        let error = StageError {
            stage: Stage::Generation,
            cause: FailureCause::ChecksNotMet,
            detail: None,
        };
        let events = vec![
            event(EventType::TaskAdmitted, TaskStatus::Pending),
            event(EventType::GenerationFailed, TaskStatus::Generating).with_data(
                &GenerationSummary {
                    digest: Some("d3".to_string()),
                    attempts: 3,
                    failed_checks: vec!["Has input fields".to_string()],
                    error: Some(error.clone()),
                },
            ),
            event(EventType::TaskFailed, TaskStatus::Failed),
        ];

        let record = TaskRecord::from_events(&events).unwrap();

        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.last_error, Some(error));
        assert!(!record.needs_generation());
        assert!(!record.needs_publish(false));
        assert!(record.needs_publish(true));
    }

    #[test]
    fn test_abandoned_record_resumes_at_its_stage() {
        let events = vec![
            event(EventType::TaskAdmitted, TaskStatus::Pending),
            event(EventType::GenerationCompleted, TaskStatus::Generating).with_data(
                &GenerationSummary {
                    digest: Some("d1".to_string()),
                    attempts: 1,
                    failed_checks: vec![],
                    error: None,
                },
            ),
            event(EventType::TaskAbandoned, TaskStatus::Generating),
        ];

        let record = TaskRecord::from_events(&events).unwrap();

        assert!(!record.is_terminal());
        assert!(!record.needs_generation());
        assert!(record.needs_publish(false));
    }

    #[test]
    fn test_redeliveries_counted() {
        let events = vec![
            event(EventType::TaskAdmitted, TaskStatus::Pending),
            event(EventType::RedeliveryReceived, TaskStatus::Pending),
            event(EventType::RedeliveryReceived, TaskStatus::Pending),
        ];

        let record = TaskRecord::from_events(&events).unwrap();
        assert_eq!(record.redeliveries, 2);
    }

    #[test]
    fn test_empty_events() {
        assert!(TaskRecord::from_events(&[]).is_none());
    }
}
