//! Task orchestrator: the state machine from admission to terminal record.
//!
//! Pending -> Generating -> Publishing -> Notifying -> {Succeeded, Failed}
//!
//! Admission is the only synchronization point. Everything after an
//! accepted (or resumed) delivery is owned by that delivery's pipeline,
//! which is tracked in the in-flight set so a second pipeline for the same
//! (task, round) never starts while the first is running.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{
    CheckEvaluator, CodeGenerator, FallbackGenerator, GitHubClient, HeuristicCheckEvaluator,
    HuggingFaceGenerator, Notifier, OpenAiGenerator, RepoHost, SiteHost, WebhookNotifier,
};
use crate::config::{ConfigError, ResolvedConfig};
use crate::domain::{
    Artifact, Event, EventType, FailureCause, GenerationSummary, PublishSummary, Report, Stage,
    StageError, TaskIdentity, TaskRecord, TaskRequest, TaskStatus,
};

use super::event_store::{generate_idempotency_key, EventStore};
use super::generation::{
    AttemptReport, CheckFailure, GenerationEngine, GenerationInput, GenerationPolicy,
};
use super::idempotency::{
    Admission, AdmissionError, DuplicateKind, FileIdempotencyStore, IdempotencyStore,
};
use super::notify::NotificationEngine;
use super::publish::{PublishEngine, PublishError, PublishPolicy};
use super::retry::{RetryPolicy, Retryable};

/// Deadline for each dependency in a health check
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Orchestrator failures surfaced to the front door
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    /// The event log could not be read or written
    #[error("Event log error: {0:#}")]
    Ledger(anyhow::Error),

    #[error("Orchestrator is shutting down")]
    ShuttingDown,
}

impl From<anyhow::Error> for OrchestratorError {
    fn from(error: anyhow::Error) -> Self {
        Self::Ledger(error)
    }
}

impl Retryable for OrchestratorError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Admission(e) => e.is_retryable(),
            Self::Ledger(_) | Self::ShuttingDown => true,
        }
    }
}

/// External capabilities the pipeline drives
#[derive(Clone)]
pub struct Capabilities {
    pub generator: Arc<dyn CodeGenerator>,
    pub evaluator: Arc<dyn CheckEvaluator>,
    pub repo_host: Arc<dyn RepoHost>,
    pub site_host: Arc<dyn SiteHost>,
    pub notifier: Arc<dyn Notifier>,
}

/// Pipeline-wide settings
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub generation: GenerationPolicy,
    pub publish: PublishPolicy,
    pub notify_retry: RetryPolicy,
    pub notify_call_timeout: Duration,

    /// Publish the best-effort artifact when generation fails
    pub publish_on_failure: bool,

    /// Deadline for generation + publish
    pub task_timeout: Duration,

    pub shutdown_grace: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            generation: GenerationPolicy::default(),
            publish: PublishPolicy::default(),
            notify_retry: RetryPolicy::notification(),
            notify_call_timeout: Duration::from_secs(30),
            publish_on_failure: false,
            task_timeout: Duration::from_secs(570),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self {
            generation: config.generation_policy(),
            publish: config.publish_policy(),
            notify_retry: config.notify.retry.clone(),
            notify_call_timeout: Duration::from_secs(config.notify.call_timeout_seconds),
            publish_on_failure: config.generation.publish_on_failure,
            task_timeout: Duration::from_secs(config.task.timeout_seconds),
            shutdown_grace: Duration::from_secs(config.task.shutdown_grace_seconds),
        }
    }
}

/// Result of running a delivery inline
#[derive(Debug, Clone)]
pub enum Dispatch {
    /// The pipeline reached a terminal record
    Completed(TaskRecord),

    /// Shutdown stopped the pipeline at a checkpoint
    Abandoned(TaskIdentity),

    /// The round was already terminal; nothing ran
    Replayed(TaskRecord),

    /// Another delivery of the round is running in this process
    InFlight(TaskIdentity),
}

impl Dispatch {
    /// Stored report, when the round is terminal
    pub fn report(&self) -> Option<&Report> {
        match self {
            Self::Completed(record) | Self::Replayed(record) => record.report.as_ref(),
            Self::Abandoned(_) | Self::InFlight(_) => None,
        }
    }
}

/// Result of handing a delivery to a background pipeline
#[derive(Debug, Clone)]
pub enum Submission {
    Started { identity: TaskIdentity, resumed: bool },
    Replayed(TaskRecord),
    InFlight(TaskIdentity),
}

/// One checked dependency
#[derive(Debug, Clone, Serialize)]
pub struct DependencyHealth {
    pub name: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Liveness summary: healthy only when every dependency is
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub dependencies: Vec<DependencyHealth>,
}

/// Marks a (task, round) as running in this process until dropped
struct InflightClaim {
    identity: TaskIdentity,
    inflight: Arc<Mutex<HashSet<TaskIdentity>>>,
}

impl Drop for InflightClaim {
    fn drop(&mut self) {
        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.identity);
    }
}

/// One admission lock per (task, round).
///
/// Gates nobody holds or waits on are pruned on the next lookup.
#[derive(Default)]
struct AdmissionGates {
    gates: Mutex<HashMap<TaskIdentity, Arc<tokio::sync::Mutex<()>>>>,
}

impl AdmissionGates {
    fn gate(&self, identity: &TaskIdentity) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
        gates.retain(|_, gate| Arc::strong_count(gate) > 1);
        Arc::clone(gates.entry(identity.clone()).or_default())
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.gates.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// What admission handed back
enum Admitted {
    Run {
        claim: InflightClaim,
        events: EventStore,
        request: TaskRequest,
        resumed: bool,
    },
    Replay(TaskRecord),
    InFlight(TaskIdentity),
}

/// Main task orchestrator
pub struct Orchestrator {
    home: PathBuf,
    store: Arc<dyn IdempotencyStore>,
    generation: GenerationEngine,
    publish: PublishEngine,
    notify: NotificationEngine,
    publish_on_failure: bool,
    task_timeout: Duration,
    shutdown_grace: Duration,
    inflight: Arc<Mutex<HashSet<TaskIdentity>>>,
    admission_gates: AdmissionGates,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Orchestrator {
    /// Create an orchestrator persisting under `home`
    pub fn new(
        home: impl Into<PathBuf>,
        store: Arc<dyn IdempotencyStore>,
        capabilities: Capabilities,
        settings: OrchestratorSettings,
    ) -> Self {
        let Capabilities {
            generator,
            evaluator,
            repo_host,
            site_host,
            notifier,
        } = capabilities;

        Self {
            home: home.into(),
            store,
            generation: GenerationEngine::new(generator, evaluator, settings.generation),
            publish: PublishEngine::new(repo_host, site_host, settings.publish),
            notify: NotificationEngine::new(
                notifier,
                settings.notify_retry,
                settings.notify_call_timeout,
            ),
            publish_on_failure: settings.publish_on_failure,
            task_timeout: settings.task_timeout,
            shutdown_grace: settings.shutdown_grace,
            inflight: Arc::new(Mutex::new(HashSet::new())),
            admission_gates: AdmissionGates::default(),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Wire the production bindings from configuration.
    ///
    /// Fails when required configuration is missing.
    pub fn from_config(config: &ResolvedConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let github = Arc::new(GitHubClient::from_settings(&config.github)?);
        let capabilities = Capabilities {
            generator: code_generator(config)?,
            evaluator: Arc::new(HeuristicCheckEvaluator::new()),
            repo_host: github.clone(),
            site_host: github,
            notifier: Arc::new(WebhookNotifier::with_timeout(Duration::from_secs(
                config.notify.call_timeout_seconds,
            ))),
        };

        Ok(Self::new(
            config.home.clone(),
            Arc::new(FileIdempotencyStore::new(config.admissions_path())),
            capabilities,
            OrchestratorSettings::from_config(config),
        ))
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Admit a delivery and run its pipeline to the end, inline
    #[instrument(skip(self, request), fields(task = %request.task, round = request.round))]
    pub async fn process(&self, request: TaskRequest) -> Result<Dispatch, OrchestratorError> {
        match self.admit(request).await? {
            Admitted::Run {
                claim,
                events,
                request,
                ..
            } => {
                let dispatch = self.drive(&events, &request).await;
                drop(claim);
                dispatch
            }
            Admitted::Replay(record) => Ok(Dispatch::Replayed(record)),
            Admitted::InFlight(identity) => Ok(Dispatch::InFlight(identity)),
        }
    }

    /// Admit a delivery and run its pipeline in the background.
    ///
    /// Returns as soon as admission is decided.
    #[instrument(skip(self, request), fields(task = %request.task, round = request.round))]
    pub async fn submit(self: &Arc<Self>, request: TaskRequest) -> Result<Submission, OrchestratorError> {
        match self.admit(request).await? {
            Admitted::Run {
                claim,
                events,
                request,
                resumed,
            } => {
                let identity = events.identity().clone();
                let this = Arc::clone(self);
                self.tracker.spawn(async move {
                    let _claim = claim;
                    if let Err(e) = this.drive(&events, &request).await {
                        error!(task = %request.task, round = request.round, error = %e, "Pipeline aborted");
                    }
                });
                Ok(Submission::Started { identity, resumed })
            }
            Admitted::Replay(record) => Ok(Submission::Replayed(record)),
            Admitted::InFlight(identity) => Ok(Submission::InFlight(identity)),
        }
    }

    /// Decide what a delivery gets to do.
    ///
    /// Runs under the round's admission gate so the store decision, the
    /// event log check and the in-flight claim happen as one step.
    /// Deliveries for other rounds are admitted concurrently.
    async fn admit(&self, request: TaskRequest) -> Result<Admitted, OrchestratorError> {
        request.validate().map_err(AdmissionError::from)?;
        if self.shutdown.is_cancelled() {
            return Err(OrchestratorError::ShuttingDown);
        }

        let identity = request.identity();
        let _gate = self.admission_gates.gate(&identity).lock_owned().await;

        let admission = self.store.admit(&identity, &request.nonce).await?;
        let events = EventStore::open(&self.home, &identity).await?;

        match admission {
            Admission::Accepted(_) => {
                let Some(claim) = self.claim(&identity) else {
                    return Ok(Admitted::InFlight(identity));
                };
                self.append_admitted(&events, &request).await?;
                info!(task = %identity.task, round = identity.round, "Task admitted");

                Ok(Admitted::Run {
                    claim,
                    events,
                    request,
                    resumed: false,
                })
            }
            Admission::Duplicate { kind, .. } => {
                let record = events.load_record().await?;

                if let Some(record) = record.as_ref().filter(|r| r.is_terminal()) {
                    info!(
                        task = %identity.task,
                        round = identity.round,
                        status = %record.status,
                        "Duplicate of a finished round, replaying stored result"
                    );
                    return Ok(Admitted::Replay(record.clone()));
                }

                let Some(claim) = self.claim(&identity) else {
                    debug!(task = %identity.task, round = identity.round, "Round already running");
                    return Ok(Admitted::InFlight(identity));
                };

                let request = match record {
                    None => {
                        // Admitted before but never logged
                        self.append_admitted(&events, &request).await?;
                        request
                    }
                    Some(record) => {
                        let label = match kind {
                            DuplicateKind::SameDelivery => "retried delivery",
                            DuplicateKind::Redelivery => "redelivery",
                        };
                        let event = Event::new(
                            &identity,
                            EventType::RedeliveryReceived,
                            generate_idempotency_key(&identity, "redelivery", &request.nonce),
                            format!("Resuming at {} after {}", record.status, label),
                            record.status,
                        );
                        events.append(&event).await?;
                        info!(
                            task = %identity.task,
                            round = identity.round,
                            status = %record.status,
                            "Resuming abandoned round"
                        );

                        // The first delivery's request drives the report
                        record.request.unwrap_or(request)
                    }
                };

                Ok(Admitted::Run {
                    claim,
                    events,
                    request,
                    resumed: true,
                })
            }
        }
    }

    fn claim(&self, identity: &TaskIdentity) -> Option<InflightClaim> {
        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        if !inflight.insert(identity.clone()) {
            return None;
        }
        Some(InflightClaim {
            identity: identity.clone(),
            inflight: Arc::clone(&self.inflight),
        })
    }

    async fn append_admitted(
        &self,
        events: &EventStore,
        request: &TaskRequest,
    ) -> Result<(), OrchestratorError> {
        let identity = events.identity();
        let event = Event::new(
            identity,
            EventType::TaskAdmitted,
            generate_idempotency_key(identity, "admit", &request.nonce),
            format!(
                "Admitted '{}' round {} with {} check(s)",
                request.task,
                request.round,
                request.checks.len()
            ),
            TaskStatus::Pending,
        )
        .with_data(request);
        events.append(&event).await?;
        Ok(())
    }

    /// Run the stages the record still owes, in order
    async fn drive(
        &self,
        events: &EventStore,
        request: &TaskRequest,
    ) -> Result<Dispatch, OrchestratorError> {
        let identity = events.identity().clone();
        let mut record = events
            .load_record()
            .await?
            .unwrap_or_else(|| TaskRecord::new(identity.clone()));
        let deadline = tokio::time::Instant::now() + self.task_timeout;

        if record.needs_generation() {
            if self.checkpoint(events, &mut record).await? {
                return Ok(Dispatch::Abandoned(identity));
            }
            self.run_generation(events, &mut record, request, deadline)
                .await?;
        }

        if record.needs_publish(self.publish_on_failure) {
            if self.checkpoint(events, &mut record).await? {
                return Ok(Dispatch::Abandoned(identity));
            }
            if !self
                .run_publish(events, &mut record, request, deadline)
                .await?
            {
                return Ok(Dispatch::Abandoned(identity));
            }
        }

        let report = match record.report.clone() {
            Some(report) => report,
            None => self.prepare_report(events, &mut record, request).await?,
        };

        if record.notification.is_none() {
            if self.checkpoint(events, &mut record).await? {
                return Ok(Dispatch::Abandoned(identity));
            }
            match self
                .notify
                .notify(&request.evaluation_url, &report, &self.shutdown)
                .await
            {
                Ok(outcome) => {
                    let (event_type, summary) = if outcome.is_delivered() {
                        (EventType::NotificationDelivered, "Report delivered")
                    } else {
                        (EventType::NotificationDeadLettered, "Report dead-lettered")
                    };
                    let event = Event::new(
                        &identity,
                        event_type,
                        stage_key(&identity, "notify", &request.evaluation_url),
                        format!("{} after {} attempt(s)", summary, outcome.attempts()),
                        TaskStatus::Notifying,
                    )
                    .with_attempt(outcome.attempts())
                    .with_data(&outcome);
                    self.emit(events, &mut record, event).await?;
                }
                Err(_) => {
                    self.abandon(events, &mut record, "shutdown during report delivery")
                        .await?;
                    return Ok(Dispatch::Abandoned(identity));
                }
            }
        }

        self.finish(events, &mut record).await?;
        Ok(Dispatch::Completed(record))
    }

    async fn run_generation(
        &self,
        events: &EventStore,
        record: &mut TaskRecord,
        request: &TaskRequest,
        deadline: tokio::time::Instant,
    ) -> Result<(), OrchestratorError> {
        let identity = record.identity.clone();
        let key = stage_key(&identity, "generation", &request.brief);
        self.emit(
            events,
            record,
            Event::new(
                &identity,
                EventType::StageStarted,
                key.clone(),
                format!("Generating with {} check(s)", request.checks.len()),
                TaskStatus::Generating,
            ),
        )
        .await?;

        let prior = self.prior_artifact(&identity).await;
        let input = GenerationInput {
            brief: &request.brief,
            checks: &request.checks,
            attachments: &request.attachments,
            prior_artifact: prior.as_ref(),
            round: identity.round,
        };

        let started = Instant::now();
        let result = tokio::time::timeout_at(deadline, self.generation.generate(&input)).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(success)) => {
                events.store_artifact(&success.artifact).await?;
                self.log_attempts(events, record, &key, &success.attempts)
                    .await?;

                let digest = success.artifact.digest();
                let summary = GenerationSummary {
                    digest: Some(digest.clone()),
                    attempts: success.attempts.len() as u32,
                    failed_checks: Vec::new(),
                    error: None,
                };
                let event = Event::new(
                    &identity,
                    EventType::GenerationCompleted,
                    key,
                    format!(
                        "Artifact {} with {} file(s) passed every check",
                        digest,
                        success.artifact.files.len()
                    ),
                    TaskStatus::Generating,
                )
                .with_attempt(summary.attempts)
                .with_duration(duration_ms)
                .with_data(&summary);
                self.emit(events, record, event).await?;
                record.artifact = Some(success.artifact);
            }
            Ok(Err(failed)) => {
                if let Some(artifact) = &failed.last_artifact {
                    events.store_artifact(artifact).await?;
                }
                self.log_attempts(events, record, &key, &failed.attempts)
                    .await?;

                let error = failed.to_stage_error();
                let summary = GenerationSummary {
                    digest: failed.last_artifact.as_ref().map(Artifact::digest),
                    attempts: failed.attempts.len() as u32,
                    failed_checks: failed.failed_checks.iter().map(CheckFailure::feedback).collect(),
                    error: Some(error.clone()),
                };
                warn!(
                    task = %identity.task,
                    round = identity.round,
                    attempts = summary.attempts,
                    error = %error,
                    "Generation failed"
                );
                let event = Event::new(
                    &identity,
                    EventType::GenerationFailed,
                    key,
                    format!("Generation failed after {} attempt(s)", summary.attempts),
                    TaskStatus::Generating,
                )
                .with_attempt(summary.attempts)
                .with_duration(duration_ms)
                .with_error(error.to_string())
                .with_data(&summary);
                self.emit(events, record, event).await?;
                record.artifact = failed.last_artifact;
            }
            Err(_) => {
                let error = self.deadline_error(Stage::Generation);
                warn!(task = %identity.task, round = identity.round, error = %error, "Task deadline hit");
                let summary = GenerationSummary {
                    digest: None,
                    attempts: 0,
                    failed_checks: Vec::new(),
                    error: Some(error.clone()),
                };
                let event = Event::new(
                    &identity,
                    EventType::GenerationFailed,
                    key,
                    "Generation stopped by the task deadline".to_string(),
                    TaskStatus::Generating,
                )
                .with_duration(duration_ms)
                .with_error(error.to_string())
                .with_data(&summary);
                self.emit(events, record, event).await?;
            }
        }

        Ok(())
    }

    async fn log_attempts(
        &self,
        events: &EventStore,
        record: &mut TaskRecord,
        key: &str,
        attempts: &[AttemptReport],
    ) -> Result<(), OrchestratorError> {
        let identity = record.identity.clone();
        for attempt in attempts {
            let summary = match &attempt.error {
                Some(error) => format!("Attempt {} produced nothing: {}", attempt.attempt, error),
                None => format!(
                    "Attempt {}: {} passed, {} failed",
                    attempt.attempt,
                    attempt.passed.len(),
                    attempt.failed.len()
                ),
            };
            let event = Event::new(
                &identity,
                EventType::GenerationAttempt,
                format!("{}:attempt:{}", key, attempt.attempt),
                summary,
                TaskStatus::Generating,
            )
            .with_attempt(attempt.attempt)
            .with_duration(attempt.duration_ms)
            .with_data(attempt);
            self.emit(events, record, event).await?;
        }
        Ok(())
    }

    /// Returns false when shutdown interrupted the stage
    async fn run_publish(
        &self,
        events: &EventStore,
        record: &mut TaskRecord,
        request: &TaskRequest,
        deadline: tokio::time::Instant,
    ) -> Result<bool, OrchestratorError> {
        let identity = record.identity.clone();
        let digest = record.artifact_digest.clone().unwrap_or_default();
        let key = stage_key(&identity, "publish", &digest);
        self.emit(
            events,
            record,
            Event::new(
                &identity,
                EventType::StageStarted,
                key.clone(),
                format!("Publishing artifact {}", digest),
                TaskStatus::Publishing,
            ),
        )
        .await?;

        let Some(artifact) = record.artifact.clone() else {
            let error = StageError::new(
                Stage::Publish,
                FailureCause::Rejected,
                format!("stored artifact {} is missing", digest),
            );
            self.publish_failed(events, record, &key, 0, error).await?;
            return Ok(true);
        };

        let started = Instant::now();
        let result = tokio::time::timeout_at(
            deadline,
            self.publish
                .publish(&identity, &request.brief, &artifact, &self.shutdown),
        )
        .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(success)) => {
                let summary = PublishSummary {
                    attempts: success.attempts,
                    deployment: Some(success.deployment.clone()),
                    error: None,
                };
                let event = Event::new(
                    &identity,
                    EventType::PublishCompleted,
                    key,
                    format!("Live at {}", success.deployment.url),
                    TaskStatus::Publishing,
                )
                .with_attempt(success.attempts)
                .with_duration(duration_ms)
                .with_data(&summary);
                self.emit(events, record, event).await?;
            }
            Ok(Err(PublishError::Failed(failed))) => {
                self.publish_failed(events, record, &key, failed.attempts, failed.to_stage_error())
                    .await?;
            }
            Ok(Err(PublishError::Interrupted { step })) => {
                self.abandon(events, record, &format!("shutdown during {}", step))
                    .await?;
                return Ok(false);
            }
            Err(_) => {
                let error = self.deadline_error(Stage::Publish);
                self.publish_failed(events, record, &key, 0, error).await?;
            }
        }

        Ok(true)
    }

    async fn publish_failed(
        &self,
        events: &EventStore,
        record: &mut TaskRecord,
        key: &str,
        attempts: u32,
        error: StageError,
    ) -> Result<(), OrchestratorError> {
        let identity = record.identity.clone();
        warn!(task = %identity.task, round = identity.round, error = %error, "Publish failed");
        let summary = PublishSummary {
            attempts,
            deployment: None,
            error: Some(error.clone()),
        };
        let event = Event::new(
            &identity,
            EventType::PublishFailed,
            key.to_string(),
            "Publish failed".to_string(),
            TaskStatus::Publishing,
        )
        .with_attempt(attempts)
        .with_error(error.to_string())
        .with_data(&summary);
        self.emit(events, record, event).await
    }

    /// Build and freeze the report
    async fn prepare_report(
        &self,
        events: &EventStore,
        record: &mut TaskRecord,
        request: &TaskRequest,
    ) -> Result<Report, OrchestratorError> {
        let identity = record.identity.clone();
        let outcome = record.outcome.clone().ok_or_else(|| {
            OrchestratorError::Ledger(anyhow::anyhow!(
                "no outcome recorded for {} before reporting",
                identity
            ))
        })?;

        let report = Report::from_outcome(request, &outcome);
        let event = Event::new(
            &identity,
            EventType::ReportPrepared,
            stage_key(&identity, "report", &request.nonce),
            format!(
                "Report prepared: {}",
                if report.is_success() { "success" } else { "failure" }
            ),
            TaskStatus::Notifying,
        )
        .with_data(&report);
        self.emit(events, record, event).await?;
        Ok(report)
    }

    /// Record the terminal status
    async fn finish(
        &self,
        events: &EventStore,
        record: &mut TaskRecord,
    ) -> Result<(), OrchestratorError> {
        let identity = record.identity.clone();
        let succeeded = record.outcome.as_ref().is_some_and(|o| o.is_success());
        let (event_type, status) = if succeeded {
            (EventType::TaskSucceeded, TaskStatus::Succeeded)
        } else {
            (EventType::TaskFailed, TaskStatus::Failed)
        };

        let mut event = Event::new(
            &identity,
            event_type,
            stage_key(&identity, "complete", &status.to_string()),
            match record.deployed_url() {
                Some(url) if succeeded => format!("Task succeeded: {}", url),
                _ => "Task failed".to_string(),
            },
            status,
        );
        if let Some(error) = record.outcome.as_ref().and_then(|o| o.error()) {
            event = event.with_error(error.to_string());
        }
        self.emit(events, record, event).await?;

        if succeeded {
            info!(task = %identity.task, round = identity.round, dead_lettered = record.is_dead_lettered(), "Task succeeded");
        } else {
            error!(
                task = %identity.task,
                round = identity.round,
                error = ?record.last_error.as_ref().map(|e| e.to_string()),
                "Task failed"
            );
        }
        Ok(())
    }

    /// Abandon when shutdown was requested; returns whether it did
    async fn checkpoint(
        &self,
        events: &EventStore,
        record: &mut TaskRecord,
    ) -> Result<bool, OrchestratorError> {
        if !self.shutdown.is_cancelled() {
            return Ok(false);
        }
        self.abandon(events, record, "shutdown requested").await?;
        Ok(true)
    }

    async fn abandon(
        &self,
        events: &EventStore,
        record: &mut TaskRecord,
        reason: &str,
    ) -> Result<(), OrchestratorError> {
        let identity = record.identity.clone();
        warn!(task = %identity.task, round = identity.round, status = %record.status, reason, "Abandoning pipeline");
        let event = Event::new(
            &identity,
            EventType::TaskAbandoned,
            stage_key(&identity, "abandon", &record.status.to_string()),
            format!("Abandoned while {}: {}", record.status, reason),
            record.status,
        );
        self.emit(events, record, event).await
    }

    async fn emit(
        &self,
        events: &EventStore,
        record: &mut TaskRecord,
        event: Event,
    ) -> Result<(), OrchestratorError> {
        events.append(&event).await?;
        record.apply_event(&event);
        Ok(())
    }

    fn deadline_error(&self, stage: Stage) -> StageError {
        StageError::new(
            stage,
            FailureCause::Timeout,
            format!("task deadline of {}s elapsed", self.task_timeout.as_secs()),
        )
    }

    /// Artifact a later round builds on: the latest earlier local round,
    /// else whatever the repository host currently serves
    async fn prior_artifact(&self, identity: &TaskIdentity) -> Option<Artifact> {
        if identity.round <= 1 {
            return None;
        }

        for round in (1..identity.round).rev() {
            let earlier = EventStore::at(&self.home, &TaskIdentity::new(identity.task.clone(), round));
            match earlier.load_artifact().await {
                Ok(Some(artifact)) => {
                    debug!(round, "Using artifact of an earlier round as prior");
                    return Some(artifact);
                }
                Ok(None) => continue,
                Err(e) => warn!(round, error = %e, "Unreadable artifact of an earlier round"),
            }
        }

        match self.publish.fetch_current(&identity.task).await {
            Ok(Some(files)) => {
                debug!(files = files.len(), "Using published files as prior");
                Some(Artifact::new(files, 0))
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Could not fetch published files, generating without prior");
                None
            }
        }
    }

    /// Current record of a round
    pub async fn record(&self, identity: &TaskIdentity) -> Result<Option<TaskRecord>, OrchestratorError> {
        Ok(EventStore::at(&self.home, identity).load_record().await?)
    }

    /// Stored report of a round, exactly as delivered
    pub async fn report(&self, identity: &TaskIdentity) -> Result<Option<Report>, OrchestratorError> {
        Ok(self.record(identity).await?.and_then(|r| r.report))
    }

    /// Most recently updated records first
    pub async fn list_records(&self, limit: usize) -> Result<Vec<TaskRecord>, OrchestratorError> {
        Ok(list_records_in(&self.home, limit).await?)
    }

    /// Records whose report could not be delivered
    pub async fn dead_letters(&self) -> Result<Vec<TaskRecord>, OrchestratorError> {
        let mut records = self.list_records(usize::MAX).await?;
        records.retain(TaskRecord::is_dead_lettered);
        Ok(records)
    }

    /// Check the store and every external dependency
    pub async fn health_check(&self) -> HealthReport {
        let dependencies = vec![
            check_dependency("idempotency-store", self.store.health_check()).await,
            check_dependency("code-generator", self.generation.generator().health_check()).await,
            check_dependency("repo-host", self.publish.repo_host().health_check()).await,
            check_dependency("notifier", self.notify.notifier().health_check()).await,
        ];

        HealthReport {
            healthy: dependencies.iter().all(|d| d.healthy),
            dependencies,
        }
    }

    /// Start shutting down: no new admissions, waits stop at checkpoints
    pub fn begin_shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
    }

    /// Shut down and wait for background pipelines.
    ///
    /// Returns false if some pipeline outlived the grace period.
    pub async fn shutdown(&self) -> bool {
        self.begin_shutdown();
        info!(pending = self.tracker.len(), "Waiting for pipelines to reach a checkpoint");

        match tokio::time::timeout(self.shutdown_grace, self.tracker.wait()).await {
            Ok(()) => {
                info!("All pipelines stopped");
                true
            }
            Err(_) => {
                warn!(pending = self.tracker.len(), "Shutdown grace period elapsed");
                false
            }
        }
    }
}

/// Records under `home`, most recently updated first
pub async fn list_records_in(home: &Path, limit: usize) -> anyhow::Result<Vec<TaskRecord>> {
    let identities = EventStore::list_identities(home).await?;
    let mut records = Vec::new();

    for identity in identities {
        match EventStore::at(home, &identity).load_record().await {
            Ok(Some(record)) => records.push(record),
            Ok(None) => {}
            Err(e) => warn!(task = %identity.task, round = identity.round, error = %e, "Skipping unreadable record"),
        }
    }

    records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    records.truncate(limit);
    Ok(records)
}

/// The configured provider, followed by HuggingFace when it has a token
fn code_generator(config: &ResolvedConfig) -> Result<Arc<dyn CodeGenerator>, ConfigError> {
    let primary: Arc<dyn CodeGenerator> = Arc::new(OpenAiGenerator::from_settings(&config.llm)?);
    if config.huggingface.api_key.is_none() {
        return Ok(primary);
    }

    let secondary = HuggingFaceGenerator::from_settings(
        &config.huggingface,
        Duration::from_secs(config.llm.request_timeout_seconds),
    )?;
    Ok(Arc::new(FallbackGenerator::new(vec![primary, Arc::new(secondary)])))
}

fn stage_key(identity: &TaskIdentity, stage: &str, input: &str) -> String {
    generate_idempotency_key(identity, stage, input)
}

async fn check_dependency<E, F>(name: &str, check: F) -> DependencyHealth
where
    E: std::fmt::Display,
    F: std::future::Future<Output = Result<(), E>>,
{
    let error = match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, check).await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(_) => Some(format!("no answer within {:?}", HEALTH_CHECK_TIMEOUT)),
    };

    DependencyHealth {
        name: name.to_string(),
        healthy: error.is_none(),
        error,
    }
}
