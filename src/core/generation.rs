//! Generation stage: produce a file set that passes every check.
//!
//! Bounded loop. Each attempt after the first carries the failing checks of
//! the previous attempt as feedback and its candidate as the prior artifact.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::adapters::{CheckEvaluator, CheckVerdict, CodeGenerator, GenerationError, GenerationRequest};
use crate::core::retry::Retryable;
use crate::core::safety::{scan_code, ArtifactLimits};
use crate::domain::{Artifact, Attachment, FailureCause, Stage, StageError};

/// Pseudo-check name used when a candidate breaks the artifact limits
pub const LIMITS_CHECK: &str = "Artifact stays within publishing limits";

/// Generation settings
#[derive(Debug, Clone)]
pub struct GenerationPolicy {
    /// Attempts including the first (at least 1)
    pub max_attempts: u32,

    /// Deadline for one generator call
    pub call_timeout: Duration,

    pub limits: ArtifactLimits,
}

impl Default for GenerationPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            call_timeout: Duration::from_secs(120),
            limits: ArtifactLimits::default(),
        }
    }
}

/// Inputs for one generation run
#[derive(Debug, Clone)]
pub struct GenerationInput<'a> {
    pub brief: &'a str,
    pub checks: &'a [String],
    pub attachments: &'a [Attachment],
    pub prior_artifact: Option<&'a Artifact>,
    pub round: u32,
}

/// A check that did not pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckFailure {
    pub check: String,
    pub reason: String,
}

impl CheckFailure {
    /// Feedback line handed to the next attempt
    pub fn feedback(&self) -> String {
        format!("{}: {}", self.check, self.reason)
    }
}

/// Outcome of one attempt, for the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptReport {
    pub attempt: u32,
    pub duration_ms: u64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub passed: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<CheckFailure>,

    /// Generator error, when no candidate was produced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// An artifact passing every check
#[derive(Debug, Clone)]
pub struct GenerationSuccess {
    pub artifact: Artifact,
    pub attempts: Vec<AttemptReport>,
}

/// Attempts exhausted (or a non-retryable generator error)
#[derive(Debug, Clone)]
pub struct GenerationFailed {
    /// Best-effort candidate from the last attempt that produced one
    pub last_artifact: Option<Artifact>,

    /// Checks the last candidate failed
    pub failed_checks: Vec<CheckFailure>,

    pub attempts: Vec<AttemptReport>,

    /// Last generator error, if any attempt produced none
    pub last_error: Option<GenerationError>,
}

impl GenerationFailed {
    pub fn cause(&self) -> FailureCause {
        match (&self.last_artifact, &self.last_error) {
            (Some(_), _) => FailureCause::ChecksNotMet,
            (None, Some(GenerationError::Auth(_))) => FailureCause::AuthRejected,
            (None, Some(GenerationError::Timeout(_))) => FailureCause::Timeout,
            (None, _) => FailureCause::GeneratorError,
        }
    }

    pub fn to_stage_error(&self) -> StageError {
        let detail = if self.last_artifact.is_some() {
            let names: Vec<&str> = self.failed_checks.iter().map(|f| f.check.as_str()).collect();
            format!(
                "{} attempt(s); failing checks: {}",
                self.attempts.len(),
                names.join(", ")
            )
        } else {
            format!(
                "{} attempt(s); {}",
                self.attempts.len(),
                self.last_error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no candidate produced".to_string())
            )
        };
        StageError::new(Stage::Generation, self.cause(), detail)
    }
}

/// Drives a code generator until its output passes the checks
pub struct GenerationEngine {
    generator: Arc<dyn CodeGenerator>,
    evaluator: Arc<dyn CheckEvaluator>,
    policy: GenerationPolicy,
}

impl GenerationEngine {
    pub fn new(
        generator: Arc<dyn CodeGenerator>,
        evaluator: Arc<dyn CheckEvaluator>,
        policy: GenerationPolicy,
    ) -> Self {
        Self {
            generator,
            evaluator,
            policy,
        }
    }

    pub fn policy(&self) -> &GenerationPolicy {
        &self.policy
    }

    pub fn generator(&self) -> &Arc<dyn CodeGenerator> {
        &self.generator
    }

    /// Run the bounded generate-and-check loop
    pub async fn generate(
        &self,
        input: &GenerationInput<'_>,
    ) -> Result<GenerationSuccess, GenerationFailed> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut reports = Vec::new();
        let mut feedback: Vec<String> = Vec::new();
        let mut previous: Option<Artifact> = None;
        let mut failed_checks = Vec::new();
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            let started = Instant::now();
            let request = GenerationRequest {
                brief: input.brief,
                checks: input.checks,
                attachments: input.attachments,
                prior_artifact: previous.as_ref().or(input.prior_artifact),
                feedback: &feedback,
                round: input.round,
                attempt,
            };

            let produced =
                match tokio::time::timeout(self.policy.call_timeout, self.generator.produce(&request))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(GenerationError::Timeout(self.policy.call_timeout)),
                };

            let files = match produced {
                Ok(files) => files,
                Err(error) => {
                    warn!(attempt, max_attempts, error = %error, "Generator produced no candidate");
                    reports.push(AttemptReport {
                        attempt,
                        duration_ms: started.elapsed().as_millis() as u64,
                        passed: Vec::new(),
                        failed: Vec::new(),
                        error: Some(error.to_string()),
                        warnings: Vec::new(),
                    });
                    let retryable = error.is_retryable();
                    last_error = Some(error);
                    if !retryable {
                        break;
                    }
                    continue;
                }
            };

            let mut artifact = Artifact::new(files, attempt);
            artifact.merge_attachments(input.attachments);

            let warnings = scan_code(&artifact);
            for warning in &warnings {
                warn!(attempt, warning = %warning, "Risky code pattern in candidate");
            }

            let mut passed = Vec::new();
            let mut failed = Vec::new();

            if let Err(violation) = self.policy.limits.validate(&artifact) {
                failed.push(CheckFailure {
                    check: LIMITS_CHECK.to_string(),
                    reason: violation.to_string(),
                });
            }

            for check in input.checks {
                match self.evaluator.evaluate(check, &artifact.files).await {
                    CheckVerdict::Pass => passed.push(check.clone()),
                    CheckVerdict::Fail { reason } => failed.push(CheckFailure {
                        check: check.clone(),
                        reason,
                    }),
                }
            }

            info!(
                attempt,
                max_attempts,
                files = artifact.files.len(),
                passed = passed.len(),
                failed = failed.len(),
                failing = ?failed.iter().map(|f| f.check.as_str()).collect::<Vec<_>>(),
                "Generation attempt evaluated"
            );

            let all_passed = failed.is_empty();
            reports.push(AttemptReport {
                attempt,
                duration_ms: started.elapsed().as_millis() as u64,
                passed,
                failed: failed.clone(),
                error: None,
                warnings,
            });

            if all_passed {
                return Ok(GenerationSuccess {
                    artifact,
                    attempts: reports,
                });
            }

            feedback = failed.iter().map(CheckFailure::feedback).collect();
            failed_checks = failed;
            previous = Some(artifact);
        }

        Err(GenerationFailed {
            last_artifact: previous,
            failed_checks,
            attempts: reports,
            last_error,
        })
    }
}
