//! Core orchestration logic.
//!
//! This module contains:
//! - Idempotency: Atomic admission of deliveries
//! - EventStore: Append-only event logging per task round
//! - Retry: Backoff policy shared by external calls
//! - Safety: Artifact limits and risky-pattern scan
//! - Generation, Publish, Notify: The three pipeline stages
//! - Orchestrator: The state machine driving them

pub mod event_store;
pub mod generation;
pub mod idempotency;
pub mod notify;
pub mod orchestrator;
pub mod publish;
pub mod retry;
pub mod safety;

// Re-export commonly used types
pub use event_store::{generate_idempotency_key, hash_input, EventStore};
pub use generation::{GenerationEngine, GenerationFailed, GenerationPolicy, GenerationSuccess};
pub use idempotency::{
    Admission, AdmissionError, FileIdempotencyStore, IdempotencyEntry, IdempotencyStore,
    InMemoryIdempotencyStore,
};
pub use notify::NotificationEngine;
pub use orchestrator::{
    Capabilities, Dispatch, HealthReport, Orchestrator, OrchestratorError, OrchestratorSettings,
    Submission,
};
pub use publish::{PublishEngine, PublishError, PublishFailed, PublishPolicy, PublishStep};
pub use retry::{retry_with_backoff, RetryPolicy, Retryable};
pub use safety::{ArtifactLimits, SafetyViolation};
