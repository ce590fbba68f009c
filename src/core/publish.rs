//! Publish stage: repository upsert, push, static hosting, deploy poll.
//!
//! The first three steps retry transient failures with exponential backoff.
//! Authentication and request rejections end the stage immediately.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::adapters::{DeployError, RepoError, RepoHost, SiteHost};
use crate::core::retry::{retry_with_backoff, RetryError, RetryPolicy};
use crate::domain::{
    sanitize_description, sanitize_repo_name, Artifact, Deployment, FailureCause, FileSet, Stage,
    StageError, TaskIdentity,
};

/// Longest brief excerpt used in a commit message
const COMMIT_BRIEF_CHARS: usize = 50;

/// Repository path of the validation workflow pushed next to the site
pub const CI_WORKFLOW_PATH: &str = ".github/workflows/ci.yml";

const CI_WORKFLOW: &str = r#"name: CI Validation

on:
  push:
    branches: [ main ]
  pull_request:
    branches: [ main ]

jobs:
  validate:
    runs-on: ubuntu-latest
    steps:
      - name: Checkout repository
        uses: actions/checkout@v4

      - name: Required files
        run: |
          for f in index.html README.md LICENSE; do
            if [ ! -f "$f" ]; then
              echo "ERROR: $f not found"
              exit 1
            fi
          done

      - name: MIT license
        run: grep -q "MIT License" LICENSE

      - name: HTML structure
        run: |
          if ! grep -qi "<html" index.html; then
            echo "ERROR: index.html has no <html> element"
            exit 1
          fi
"#;

/// Publish settings
#[derive(Debug, Clone)]
pub struct PublishPolicy {
    /// Backoff for ensure-repo, push-files and enable-site
    pub retry: RetryPolicy,

    /// Deadline for the site to go live
    pub deploy_timeout: Duration,

    pub poll_interval: Duration,

    /// Deadline for one host call
    pub call_timeout: Duration,

    /// Push the validation workflow with each artifact
    pub ci_workflow: bool,
}

impl Default for PublishPolicy {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            deploy_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(10),
            call_timeout: Duration::from_secs(60),
            ci_workflow: true,
        }
    }
}

/// Steps of the publish stage, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStep {
    EnsureRepo,
    PushFiles,
    EnableSite,
    DeployPoll,
}

impl fmt::Display for PublishStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::EnsureRepo => "ensure-repo",
            Self::PushFiles => "push-files",
            Self::EnableSite => "enable-site",
            Self::DeployPoll => "deploy-poll",
        };
        f.write_str(name)
    }
}

/// Why a publish step failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishCause {
    Auth,
    Rejected,
    Exhausted,
    Timeout,
    DeployFailed,
}

impl PublishCause {
    pub fn failure_cause(self) -> FailureCause {
        match self {
            Self::Auth => FailureCause::AuthRejected,
            Self::Rejected => FailureCause::Rejected,
            Self::Exhausted => FailureCause::RetriesExhausted,
            Self::Timeout => FailureCause::Timeout,
            Self::DeployFailed => FailureCause::DeployFailed,
        }
    }

    fn of_repo(error: &RepoError) -> Self {
        match error {
            RepoError::Auth(_) => Self::Auth,
            RepoError::Rejected { .. } => Self::Rejected,
            RepoError::Transient(_) => Self::Exhausted,
        }
    }

    fn of_deploy(error: &DeployError) -> Self {
        match error {
            DeployError::Auth(_) => Self::Auth,
            DeployError::Rejected { .. } => Self::Rejected,
            DeployError::Timeout(_) => Self::Timeout,
            DeployError::Failed(_) => Self::DeployFailed,
            DeployError::Transient(_) | DeployError::Cancelled => Self::Exhausted,
        }
    }
}

/// A definitive publish failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishFailed {
    pub step: PublishStep,
    pub cause: PublishCause,

    /// Host calls made across all steps
    pub attempts: u32,

    pub detail: String,
}

impl PublishFailed {
    pub fn to_stage_error(&self) -> StageError {
        StageError::new(
            Stage::Publish,
            self.cause.failure_cause(),
            format!("{}: {}", self.step, self.detail),
        )
    }
}

/// Publish stage errors
#[derive(Debug, Clone, Error)]
pub enum PublishError {
    #[error("publish failed at {}: {}", .0.step, .0.detail)]
    Failed(PublishFailed),

    /// Shutdown interrupted a backoff or poll wait
    #[error("publish interrupted during {step}")]
    Interrupted { step: PublishStep },
}

/// A live deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishSuccess {
    pub deployment: Deployment,
    pub attempts: u32,
}

/// Drives the repo host and site host for one artifact
pub struct PublishEngine {
    repo_host: Arc<dyn RepoHost>,
    site_host: Arc<dyn SiteHost>,
    policy: PublishPolicy,
}

impl PublishEngine {
    pub fn new(
        repo_host: Arc<dyn RepoHost>,
        site_host: Arc<dyn SiteHost>,
        policy: PublishPolicy,
    ) -> Self {
        Self {
            repo_host,
            site_host,
            policy,
        }
    }

    pub fn policy(&self) -> &PublishPolicy {
        &self.policy
    }

    pub fn repo_host(&self) -> &Arc<dyn RepoHost> {
        &self.repo_host
    }

    /// Publish `artifact` as the current content of the task's repository
    #[instrument(skip(self, brief, artifact, cancel), fields(task = %identity.task, round = identity.round))]
    pub async fn publish(
        &self,
        identity: &TaskIdentity,
        brief: &str,
        artifact: &Artifact,
        cancel: &CancellationToken,
    ) -> Result<PublishSuccess, PublishError> {
        let name = sanitize_repo_name(&identity.task).map_err(|e| {
            PublishError::Failed(PublishFailed {
                step: PublishStep::EnsureRepo,
                cause: PublishCause::Rejected,
                attempts: 0,
                detail: e.to_string(),
            })
        })?;
        let description = sanitize_description(&format!("Round {}: {}", identity.round, brief));
        let message = commit_message(identity.round, brief);
        let call_timeout = self.policy.call_timeout;
        let mut attempts = 0;

        let repo_host = &self.repo_host;
        let (repo, used) = retry_with_backoff(&self.policy.retry, "ensure-repo", cancel, |_| {
            let (name, description) = (&name, &description);
            async move {
                within(call_timeout, repo_host.ensure_repo(name, description))
                    .await
                    .unwrap_or_else(|| Err(RepoError::Transient(timed_out(call_timeout))))
            }
        })
        .await
        .map_err(|e| step_error(PublishStep::EnsureRepo, attempts, e, PublishCause::of_repo))?;
        attempts += used;
        info!(repo = %repo.name, created = repo.created, "Repository ready");

        let files = files_to_push(artifact, self.policy.ci_workflow);
        let (commit_sha, used) = retry_with_backoff(&self.policy.retry, "push-files", cancel, |_| {
            let (repo, files, message) = (&repo, &*files, &message);
            async move {
                within(call_timeout, repo_host.push_files(repo, files, message))
                    .await
                    .unwrap_or_else(|| Err(RepoError::Transient(timed_out(call_timeout))))
            }
        })
        .await
        .map_err(|e| step_error(PublishStep::PushFiles, attempts, e, PublishCause::of_repo))?;
        attempts += used;
        info!(commit = %commit_sha, files = files.len(), "Files pushed");

        let site_host = &self.site_host;
        let ((), used) = retry_with_backoff(&self.policy.retry, "enable-site", cancel, |_| {
            let repo = &repo;
            async move {
                within(call_timeout, site_host.enable(repo))
                    .await
                    .unwrap_or_else(|| Err(DeployError::Transient(timed_out(call_timeout))))
            }
        })
        .await
        .map_err(|e| step_error(PublishStep::EnableSite, attempts, e, PublishCause::of_deploy))?;
        attempts += used;

        attempts += 1;
        let url = self
            .site_host
            .poll_until_live(
                &repo,
                self.policy.deploy_timeout,
                self.policy.poll_interval,
                cancel,
            )
            .await
            .map_err(|e| match e {
                DeployError::Cancelled => PublishError::Interrupted {
                    step: PublishStep::DeployPoll,
                },
                other => {
                    warn!(error = %other, "Deployment did not go live");
                    PublishError::Failed(PublishFailed {
                        step: PublishStep::DeployPoll,
                        cause: PublishCause::of_deploy(&other),
                        attempts,
                        detail: other.to_string(),
                    })
                }
            })?;

        info!(url = %url, attempts, "Site is live");
        Ok(PublishSuccess {
            deployment: Deployment {
                url,
                repo_url: repo.html_url.clone(),
                commit_sha,
            },
            attempts,
        })
    }

    /// Files currently published for a task, if the host knows them
    pub async fn fetch_current(&self, task: &str) -> Result<Option<FileSet>, RepoError> {
        let name = sanitize_repo_name(task).map_err(|e| RepoError::Rejected {
            status: 0,
            message: e.to_string(),
        })?;
        within(self.policy.call_timeout, self.repo_host.current_files(&name))
            .await
            .unwrap_or_else(|| Err(RepoError::Transient(timed_out(self.policy.call_timeout))))
    }
}

/// The artifact's files, plus the validation workflow when enabled and
/// the artifact does not carry its own
pub fn files_to_push(artifact: &Artifact, ci_workflow: bool) -> Cow<'_, FileSet> {
    if !ci_workflow || artifact.files.contains_key(CI_WORKFLOW_PATH) {
        return Cow::Borrowed(&artifact.files);
    }

    let mut files = artifact.files.clone();
    files.insert(CI_WORKFLOW_PATH.to_string(), CI_WORKFLOW.to_string());
    Cow::Owned(files)
}

/// Run `fut` under a deadline; `None` when it elapsed
async fn within<F: std::future::Future>(limit: Duration, fut: F) -> Option<F::Output> {
    tokio::time::timeout(limit, fut).await.ok()
}

fn timed_out(limit: Duration) -> String {
    format!("call timed out after {:?}", limit)
}

fn step_error<E: fmt::Display>(
    step: PublishStep,
    attempts_before: u32,
    error: RetryError<E>,
    classify: fn(&E) -> PublishCause,
) -> PublishError {
    match error {
        RetryError::Cancelled { .. } => PublishError::Interrupted { step },
        RetryError::Permanent { error, attempts } => PublishError::Failed(PublishFailed {
            step,
            cause: classify(&error),
            attempts: attempts_before + attempts,
            detail: error.to_string(),
        }),
        RetryError::Exhausted { error, attempts } => PublishError::Failed(PublishFailed {
            step,
            cause: PublishCause::Exhausted,
            attempts: attempts_before + attempts,
            detail: error.to_string(),
        }),
    }
}

/// "Round N: <first 50 chars of the brief>"
pub fn commit_message(round: u32, brief: &str) -> String {
    let excerpt: String = brief.chars().take(COMMIT_BRIEF_CHARS).collect();
    format!("Round {}: {}", round, excerpt.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{RepoInfo, SiteStatus};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct FlakyRepo {
        ensure_failures: u32,
        ensure_calls: AtomicU32,
        push_calls: AtomicU32,
        pushed_paths: std::sync::Mutex<Vec<String>>,
        reject_auth: bool,
    }

    #[async_trait]
    impl RepoHost for FlakyRepo {
        async fn ensure_repo(&self, name: &str, _description: &str) -> Result<RepoInfo, RepoError> {
            let n = self.ensure_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.reject_auth {
                return Err(RepoError::Auth("bad credentials".to_string()));
            }
            if n <= self.ensure_failures {
                return Err(RepoError::Transient("502".to_string()));
            }
            Ok(RepoInfo {
                name: name.to_string(),
                owner: "me".to_string(),
                html_url: format!("https://github.com/me/{}", name),
                default_branch: "main".to_string(),
                created: n == 1,
            })
        }

        async fn push_files(
            &self,
            _repo: &RepoInfo,
            files: &FileSet,
            _message: &str,
        ) -> Result<String, RepoError> {
            self.push_calls.fetch_add(1, Ordering::SeqCst);
            *self.pushed_paths.lock().unwrap() = files.keys().cloned().collect();
            Ok("abc123".to_string())
        }
    }

    struct Site {
        status: SiteStatus,
    }

    #[async_trait]
    impl SiteHost for Site {
        async fn enable(&self, _repo: &RepoInfo) -> Result<(), DeployError> {
            Ok(())
        }

        async fn status(&self, _repo: &RepoInfo) -> Result<SiteStatus, DeployError> {
            Ok(self.status.clone())
        }
    }

    fn policy() -> PublishPolicy {
        PublishPolicy {
            retry: RetryPolicy {
                max_attempts: 3,
                initial_delay_ms: 1,
                max_delay_ms: 5,
                backoff_multiplier: 2.0,
            },
            deploy_timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(5),
            call_timeout: Duration::from_secs(5),
            ci_workflow: true,
        }
    }

    fn artifact() -> Artifact {
        let mut files = FileSet::new();
        files.insert("index.html".to_string(), "<input>".to_string());
        Artifact::new(files, 1)
    }

    fn live() -> Arc<Site> {
        Arc::new(Site {
            status: SiteStatus::Live {
                url: "https://me.github.io/calc/".to_string(),
            },
        })
    }

    #[tokio::test]
    async fn test_publish_retries_transient_repo_errors() {
        let repo = Arc::new(FlakyRepo {
            ensure_failures: 2,
            ..Default::default()
        });
        let engine = PublishEngine::new(repo.clone(), live(), policy());

        let success = engine
            .publish(
                &TaskIdentity::new("Calc", 1),
                "Create a calculator app",
                &artifact(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(success.deployment.url, "https://me.github.io/calc/");
        assert_eq!(success.deployment.repo_url, "https://github.com/me/calc");
        assert_eq!(success.deployment.commit_sha, "abc123");
        assert_eq!(repo.ensure_calls.load(Ordering::SeqCst), 3);
        // 3 ensure + 1 push + 1 enable + 1 poll
        assert_eq!(success.attempts, 6);
    }

    #[tokio::test]
    async fn test_auth_rejection_is_immediate() {
        let repo = Arc::new(FlakyRepo {
            reject_auth: true,
            ..Default::default()
        });
        let engine = PublishEngine::new(repo.clone(), live(), policy());

        let error = engine
            .publish(
                &TaskIdentity::new("calc", 1),
                "brief",
                &artifact(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        let PublishError::Failed(failed) = error else {
            panic!("expected failure");
        };
        assert_eq!(failed.step, PublishStep::EnsureRepo);
        assert_eq!(failed.cause, PublishCause::Auth);
        assert_eq!(repo.ensure_calls.load(Ordering::SeqCst), 1);
        assert_eq!(repo.push_calls.load(Ordering::SeqCst), 0);
        assert_eq!(failed.to_stage_error().cause, FailureCause::AuthRejected);
    }

    #[tokio::test]
    async fn test_deploy_poll_timeout() {
        let engine = PublishEngine::new(
            Arc::new(FlakyRepo::default()),
            Arc::new(Site {
                status: SiteStatus::Building,
            }),
            policy(),
        );

        let error = engine
            .publish(
                &TaskIdentity::new("calc", 1),
                "brief",
                &artifact(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        let PublishError::Failed(failed) = error else {
            panic!("expected failure");
        };
        assert_eq!(failed.step, PublishStep::DeployPoll);
        let stage_error = failed.to_stage_error();
        assert_eq!(stage_error.stage, Stage::Publish);
        assert_eq!(stage_error.cause, FailureCause::Timeout);
    }

    #[tokio::test]
    async fn test_cancelled_poll_is_interrupted() {
        let engine = PublishEngine::new(
            Arc::new(FlakyRepo::default()),
            Arc::new(Site {
                status: SiteStatus::Building,
            }),
            policy(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let error = engine
            .publish(&TaskIdentity::new("calc", 1), "brief", &artifact(), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            PublishError::Interrupted {
                step: PublishStep::DeployPoll
            }
        ));
    }

    #[tokio::test]
    async fn test_ci_workflow_pushed_with_site() {
        let repo = Arc::new(FlakyRepo::default());
        let engine = PublishEngine::new(repo.clone(), live(), policy());

        engine
            .publish(
                &TaskIdentity::new("calc", 1),
                "Create a calculator app",
                &artifact(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let pushed = repo.pushed_paths.lock().unwrap().clone();
        assert_eq!(pushed, vec![CI_WORKFLOW_PATH.to_string(), "index.html".to_string()]);
    }

    #[test]
    fn test_files_to_push_keeps_artifact_workflow() {
        let mut files = FileSet::new();
        files.insert("index.html".to_string(), "<input>".to_string());
        files.insert(CI_WORKFLOW_PATH.to_string(), "name: mine".to_string());
        let own = Artifact::new(files, 1);

        assert!(matches!(files_to_push(&own, true), Cow::Borrowed(_)));
        assert_eq!(files_to_push(&own, true)[CI_WORKFLOW_PATH], "name: mine");

        let plain = artifact();
        assert_eq!(files_to_push(&plain, false).len(), 1);
        let with_ci = files_to_push(&plain, true);
        assert!(with_ci[CI_WORKFLOW_PATH].contains("MIT License"));
        assert_eq!(plain.files.len(), 1);
    }

    #[test]
    fn test_commit_message_truncates_brief() {
        let brief = "x".repeat(80);
        assert_eq!(commit_message(2, &brief), format!("Round 2: {}", "x".repeat(50)));
    }
}
