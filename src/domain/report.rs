//! Task outcomes and the report delivered to the evaluator.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::request::TaskRequest;

/// Pipeline stage a failure is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Generation,
    Publish,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Generation => write!(f, "generation"),
            Self::Publish => write!(f, "publish"),
        }
    }
}

/// Machine-readable failure cause
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureCause {
    /// Checks still failing after the last generation attempt
    ChecksNotMet,

    /// The code generator never produced a candidate
    GeneratorError,

    /// A deadline elapsed
    Timeout,

    /// A provider rejected our credentials
    AuthRejected,

    /// A provider rejected the request itself
    Rejected,

    /// Transient failures outlasted the retry budget
    RetriesExhausted,

    /// The static host reported a failed deployment
    DeployFailed,
}

/// A terminal stage failure: `{stage, cause, detail}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageError {
    pub stage: Stage,
    pub cause: FailureCause,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl StageError {
    pub fn new(stage: Stage, cause: FailureCause, detail: impl Into<String>) -> Self {
        Self {
            stage,
            cause,
            detail: Some(detail.into()),
        }
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cause = serde_json::to_value(self.cause)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        match &self.detail {
            Some(detail) => write!(f, "{} failed ({}): {}", self.stage, cause, detail),
            None => write!(f, "{} failed ({})", self.stage, cause),
        }
    }
}

/// Where the generated app ended up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    /// Public static-site URL
    pub url: String,

    /// Repository web URL
    pub repo_url: String,

    /// Commit that holds the published files
    pub commit_sha: String,
}

/// Result of the generation and publish stages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum TaskOutcome {
    Success { deployment: Deployment },
    GenerationFailure { error: StageError },
    PublishFailure { error: StageError },
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn error(&self) -> Option<&StageError> {
        match self {
            Self::Success { .. } => None,
            Self::GenerationFailure { error } | Self::PublishFailure { error } => Some(error),
        }
    }
}

/// What happened to the report delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum NotificationOutcome {
    Delivered { attempts: u32, status_code: u16 },
    DeadLettered { attempts: u32, reason: String },
}

impl NotificationOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Delivered { attempts, .. } | Self::DeadLettered { attempts, .. } => *attempts,
        }
    }
}

/// Report status field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Success,
    Failure,
}

/// The fixed-shape report POSTed to the evaluation URL.
///
/// Built once per task round, persisted, and replayed verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub email: String,
    pub task: String,
    pub round: u32,
    pub nonce: String,
    pub status: ReportStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
}

impl Report {
    /// Build the report for a request from its outcome
    pub fn from_outcome(request: &TaskRequest, outcome: &TaskOutcome) -> Self {
        let mut report = Self {
            email: request.email.clone(),
            task: request.task.clone(),
            round: request.round,
            nonce: request.nonce.clone(),
            status: ReportStatus::Failure,
            url: None,
            repo_url: None,
            commit_sha: None,
            error: None,
        };

        match outcome {
            TaskOutcome::Success { deployment } => {
                report.status = ReportStatus::Success;
                report.url = Some(deployment.url.clone());
                report.repo_url = Some(deployment.repo_url.clone());
                report.commit_sha = Some(deployment.commit_sha.clone());
            }
            TaskOutcome::GenerationFailure { error } | TaskOutcome::PublishFailure { error } => {
                report.error = Some(error.clone());
            }
        }

        report
    }

    pub fn is_success(&self) -> bool {
        self.status == ReportStatus::Success
    }

    /// Serialized report body
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
