//! shipwright - Event-sourced task pipeline for LLM-built static apps
//!
//! Accepts a task request describing a small web app, drives an LLM until
//! the generated files pass the request's checks, publishes them as a
//! static site, and reports the outcome to the evaluator's callback URL.
//!
//! # Architecture
//!
//! The system is built around event sourcing:
//! - Every (task, round) has its own append-only event log
//! - Current state is derived by replaying events
//! - A redelivered request resumes at the stage its round was left in,
//!   or replays the stored report once the round is terminal
//!
//! # Modules
//!
//! - `adapters`: Capability traits and their HTTP bindings (LLM, GitHub, webhook)
//! - `core`: Admission, event store, retry, and the pipeline stages
//! - `domain`: Data structures (TaskRequest, Event, TaskRecord, Report)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Process one request
//! shipwright run --request request.json
//!
//! # Inspect a round
//! shipwright status <task> <round>
//! shipwright report <task> <round>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use core::{Orchestrator, OrchestratorError};
pub use domain::{Event, EventType, Report, TaskIdentity, TaskRecord, TaskRequest, TaskStatus};
