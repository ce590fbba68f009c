//! Domain types for the shipwright orchestrator.
//!
//! This module contains the core data structures:
//! - Request: Inbound task requests and attachments
//! - Events: Immutable records of state changes
//! - Record: Task round state folded from events
//! - Artifact: Generated file sets
//! - Report: Outcomes and the evaluator report

pub mod artifact;
pub mod events;
pub mod record;
pub mod report;
pub mod request;

// Re-export commonly used types
pub use artifact::{Artifact, FileSet, INDEX_FILE};
pub use events::{Event, EventType};
pub use record::{
    GenerationSummary, PublishSummary, StageAttempts, TaskIdentity, TaskRecord, TaskStatus,
};
pub use report::{
    Deployment, FailureCause, NotificationOutcome, Report, ReportStatus, Stage, StageError,
    TaskOutcome,
};
pub use request::{sanitize_description, sanitize_repo_name, Attachment, RequestError, TaskRequest};
