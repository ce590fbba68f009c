//! Capability interfaces for external systems.
//!
//! The pipeline talks to the LLM providers, the source host, the static
//! host, and the evaluator only through these traits. Concrete HTTP
//! bindings live in the submodules.

pub mod checks;
pub mod fallback;
pub mod github;
pub mod huggingface;
pub mod llm;
pub mod webhook;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::retry::{cancellable_sleep, Retryable};
use crate::domain::{Artifact, Attachment, FileSet, Report};

pub use checks::HeuristicCheckEvaluator;
pub use fallback::FallbackGenerator;
pub use github::GitHubClient;
pub use huggingface::HuggingFaceGenerator;
pub use llm::OpenAiGenerator;
pub use webhook::WebhookNotifier;

/// Everything a code generator needs for one attempt
#[derive(Debug, Clone)]
pub struct GenerationRequest<'a> {
    pub brief: &'a str,
    pub checks: &'a [String],
    pub attachments: &'a [Attachment],

    /// Previous round's artifact, or the previous attempt's candidate
    pub prior_artifact: Option<&'a Artifact>,

    /// Checks the previous attempt failed, with reasons
    pub feedback: &'a [String],

    pub round: u32,
    pub attempt: u32,
}

/// Code generation failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    #[error("Generator provider error: {0}")]
    Provider(String),

    #[error("Generator rejected credentials: {0}")]
    Auth(String),

    #[error("Generator rejected the request: {0}")]
    Rejected(String),

    #[error("Generator output unusable: {0}")]
    Malformed(String),

    #[error("Generator call timed out after {0:?}")]
    Timeout(Duration),
}

impl Retryable for GenerationError {
    fn is_retryable(&self) -> bool {
        !matches!(self, Self::Auth(_) | Self::Rejected(_))
    }
}

/// Produces a candidate file set from a brief
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    /// Human-readable generator name
    fn name(&self) -> &str;

    async fn produce(&self, request: &GenerationRequest<'_>) -> Result<FileSet, GenerationError>;

    /// Health check (for HTTP generators)
    async fn health_check(&self) -> Result<(), GenerationError> {
        Ok(())
    }
}

/// Outcome of evaluating one check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckVerdict {
    Pass,
    Fail { reason: String },
}

impl CheckVerdict {
    pub fn fail(reason: impl Into<String>) -> Self {
        Self::Fail {
            reason: reason.into(),
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }
}

/// Decides whether a file set satisfies one check
#[async_trait]
pub trait CheckEvaluator: Send + Sync {
    async fn evaluate(&self, check: &str, files: &FileSet) -> CheckVerdict;
}

/// Source repository failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepoError {
    #[error("Repository host rejected credentials: {0}")]
    Auth(String),

    #[error("Repository host unavailable: {0}")]
    Transient(String),

    #[error("Repository host rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl Retryable for RepoError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// A repository that exists on the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoInfo {
    pub name: String,
    pub owner: String,
    pub html_url: String,
    pub default_branch: String,

    /// Created by this call
    pub created: bool,
}

/// Source-hosting capability
#[async_trait]
pub trait RepoHost: Send + Sync {
    /// Create the repository if absent; never touches existing history
    async fn ensure_repo(&self, name: &str, description: &str) -> Result<RepoInfo, RepoError>;

    /// Make `files` the repository's current content; returns the commit sha
    async fn push_files(
        &self,
        repo: &RepoInfo,
        files: &FileSet,
        message: &str,
    ) -> Result<String, RepoError>;

    /// Upsert: ensure the repository, then push
    async fn upsert_repo(
        &self,
        name: &str,
        description: &str,
        files: &FileSet,
        message: &str,
    ) -> Result<(RepoInfo, String), RepoError> {
        let repo = self.ensure_repo(name, description).await?;
        let sha = self.push_files(&repo, files, message).await?;
        Ok((repo, sha))
    }

    /// Files currently published for a repository, if known
    async fn current_files(&self, _name: &str) -> Result<Option<FileSet>, RepoError> {
        Ok(None)
    }

    async fn health_check(&self) -> Result<(), RepoError> {
        Ok(())
    }
}

/// Static-hosting failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeployError {
    #[error("Site host rejected credentials: {0}")]
    Auth(String),

    #[error("Site host unavailable: {0}")]
    Transient(String),

    #[error("Site host rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Deployment failed: {0}")]
    Failed(String),

    #[error("Site not live after {0:?}")]
    Timeout(Duration),

    #[error("Deployment wait cancelled")]
    Cancelled,
}

impl Retryable for DeployError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Deployment status reported by the site host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SiteStatus {
    Building,
    Live { url: String },
    Failed { reason: String },
}

/// Static-hosting capability
#[async_trait]
pub trait SiteHost: Send + Sync {
    /// Enable hosting for a repository (already enabled is success)
    async fn enable(&self, repo: &RepoInfo) -> Result<(), DeployError>;

    async fn status(&self, repo: &RepoInfo) -> Result<SiteStatus, DeployError>;

    /// Poll until the site is live, failed, or `timeout` elapses.
    ///
    /// Transient status errors keep the poll going; the wait between polls
    /// observes `cancel`.
    async fn poll_until_live(
        &self,
        repo: &RepoInfo,
        timeout: Duration,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, DeployError> {
        let deadline = Instant::now() + timeout;
        let mut polls = 0u32;

        loop {
            polls += 1;
            match tokio::time::timeout_at(deadline, self.status(repo)).await {
                Err(_) => return Err(DeployError::Timeout(timeout)),
                Ok(Ok(SiteStatus::Live { url })) => {
                    debug!(repo = %repo.name, polls, "Site is live");
                    return Ok(url);
                }
                Ok(Ok(SiteStatus::Failed { reason })) => return Err(DeployError::Failed(reason)),
                Ok(Ok(SiteStatus::Building)) => {
                    debug!(repo = %repo.name, polls, "Site still building");
                }
                Ok(Err(e)) if e.is_retryable() => {
                    warn!(repo = %repo.name, polls, error = %e, "Site status check failed");
                }
                Ok(Err(e)) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(DeployError::Timeout(timeout));
            }
            let wait = interval.min(deadline - now);
            if cancellable_sleep(wait, cancel).await.is_err() {
                return Err(DeployError::Cancelled);
            }
        }
    }
}

/// Evaluator callback failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("Callback unreachable: {0}")]
    Network(String),

    #[error("Callback answered HTTP {code}: {body}")]
    Status { code: u16, body: String },
}

impl Retryable for DeliveryError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Status { code, .. } => !(400..500).contains(code),
        }
    }
}

/// Delivers reports to the evaluator
#[async_trait]
pub trait Notifier: Send + Sync {
    /// POST the report; returns the HTTP status on success
    async fn deliver(&self, url: &str, report: &Report) -> Result<u16, DeliveryError>;

    async fn health_check(&self) -> Result<(), DeliveryError> {
        Ok(())
    }
}
