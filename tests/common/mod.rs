//! Scripted capabilities shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use shipwright::adapters::{
    CodeGenerator, DeliveryError, DeployError, GenerationError, GenerationRequest,
    HeuristicCheckEvaluator, Notifier, RepoError, RepoHost, RepoInfo, SiteHost, SiteStatus,
};
use shipwright::core::{
    Admission, AdmissionError, ArtifactLimits, Capabilities, GenerationPolicy, IdempotencyEntry,
    IdempotencyStore, OrchestratorSettings, PublishPolicy, RetryPolicy,
};
use shipwright::domain::{FileSet, Report, TaskIdentity, TaskRequest, INDEX_FILE};

pub const EVALUATION_URL: &str = "https://evaluator.example/notify";

/// Generator that always answers with the same page
pub struct FakeGenerator {
    html: String,
    delay: Duration,
    calls: AtomicU32,
    saw_prior: Mutex<Vec<bool>>,
}

impl FakeGenerator {
    pub fn returning(html: &str) -> Self {
        Self {
            html: html.to_string(),
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
            saw_prior: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Whether each call received a prior artifact
    pub fn saw_prior(&self) -> Vec<bool> {
        self.saw_prior.lock().unwrap().clone()
    }
}

#[async_trait]
impl CodeGenerator for FakeGenerator {
    fn name(&self) -> &str {
        "fake"
    }

    async fn produce(&self, request: &GenerationRequest<'_>) -> Result<FileSet, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.saw_prior
            .lock()
            .unwrap()
            .push(request.prior_artifact.is_some());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let mut files = FileSet::new();
        files.insert(INDEX_FILE.to_string(), self.html.clone());
        Ok(files)
    }
}

/// Repository host that accepts everything
#[derive(Default)]
pub struct FakeRepo {
    ensure_calls: AtomicU32,
    push_calls: AtomicU32,
}

impl FakeRepo {
    pub fn ensure_calls(&self) -> u32 {
        self.ensure_calls.load(Ordering::SeqCst)
    }

    pub fn push_calls(&self) -> u32 {
        self.push_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RepoHost for FakeRepo {
    async fn ensure_repo(&self, name: &str, _description: &str) -> Result<RepoInfo, RepoError> {
        let n = self.ensure_calls.fetch_add(1, Ordering::SeqCst);
        Ok(RepoInfo {
            name: name.to_string(),
            owner: "me".to_string(),
            html_url: format!("https://github.com/me/{}", name),
            default_branch: "main".to_string(),
            created: n == 0,
        })
    }

    async fn push_files(
        &self,
        _repo: &RepoInfo,
        _files: &FileSet,
        _message: &str,
    ) -> Result<String, RepoError> {
        let n = self.push_calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("sha-{}", n))
    }
}

/// Site host that is either live at once or builds forever
pub struct FakeSite {
    live: AtomicBool,
    status_calls: AtomicU32,
}

impl FakeSite {
    pub fn live() -> Self {
        Self {
            live: AtomicBool::new(true),
            status_calls: AtomicU32::new(0),
        }
    }

    pub fn never_live() -> Self {
        Self {
            live: AtomicBool::new(false),
            status_calls: AtomicU32::new(0),
        }
    }

    pub fn status_calls(&self) -> u32 {
        self.status_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SiteHost for FakeSite {
    async fn enable(&self, _repo: &RepoInfo) -> Result<(), DeployError> {
        Ok(())
    }

    async fn status(&self, repo: &RepoInfo) -> Result<SiteStatus, DeployError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if self.live.load(Ordering::SeqCst) {
            Ok(SiteStatus::Live {
                url: format!("https://me.github.io/{}/", repo.name),
            })
        } else {
            Ok(SiteStatus::Building)
        }
    }
}

/// Idempotency store whose backing storage is gone
pub struct UnavailableStore;

#[async_trait]
impl IdempotencyStore for UnavailableStore {
    async fn admit(&self, _identity: &TaskIdentity, _nonce: &str) -> Result<Admission, AdmissionError> {
        Err(AdmissionError::StoreUnavailable("admissions.jsonl: read-only file system".to_string()))
    }

    async fn entries(&self) -> Result<Vec<IdempotencyEntry>, AdmissionError> {
        Err(AdmissionError::StoreUnavailable("admissions.jsonl: read-only file system".to_string()))
    }

    async fn health_check(&self) -> Result<(), AdmissionError> {
        Err(AdmissionError::StoreUnavailable("admissions.jsonl: read-only file system".to_string()))
    }
}

/// Notifier answering with a fixed status code
pub struct FakeNotifier {
    answer: u16,
    delivered: Mutex<Vec<String>>,
    calls: AtomicU32,
}

impl FakeNotifier {
    pub fn answering(answer: u16) -> Self {
        Self {
            answer,
            delivered: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Report bodies received, in order
    pub fn bodies(&self) -> Vec<String> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for FakeNotifier {
    async fn deliver(&self, _url: &str, report: &Report) -> Result<u16, DeliveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.delivered
            .lock()
            .unwrap()
            .push(report.to_json().unwrap());

        if (200..300).contains(&self.answer) {
            Ok(self.answer)
        } else {
            Err(DeliveryError::Status {
                code: self.answer,
                body: "rejected".to_string(),
            })
        }
    }
}

/// One set of fakes wired into an orchestrator
pub struct Fakes {
    pub generator: Arc<FakeGenerator>,
    pub repo: Arc<FakeRepo>,
    pub site: Arc<FakeSite>,
    pub notifier: Arc<FakeNotifier>,
}

impl Fakes {
    pub fn new(generator: FakeGenerator, site: FakeSite, notifier: FakeNotifier) -> Self {
        Self {
            generator: Arc::new(generator),
            repo: Arc::new(FakeRepo::default()),
            site: Arc::new(site),
            notifier: Arc::new(notifier),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            generator: self.generator.clone(),
            evaluator: Arc::new(HeuristicCheckEvaluator::new()),
            repo_host: self.repo.clone(),
            site_host: self.site.clone(),
            notifier: self.notifier.clone(),
        }
    }
}

/// Page passing "Has input fields"
pub const CALCULATOR_HTML: &str = r#"<!DOCTYPE html>
<html><head><title>Calculator</title></head>
<body><input type="number" id="a"><input type="number" id="b"><button>=</button></body>
</html>"#;

/// Page failing "Has input fields"
pub const PLAIN_HTML: &str = "<!DOCTYPE html><html><body><p>Hello</p></body></html>";

pub fn request(task: &str, round: u32, nonce: &str) -> TaskRequest {
    TaskRequest {
        email: "student@example.com".to_string(),
        secret: "s3cret".to_string(),
        task: task.to_string(),
        round,
        nonce: nonce.to_string(),
        brief: "Build a calculator that adds two numbers".to_string(),
        checks: vec!["Has input fields".to_string()],
        evaluation_url: EVALUATION_URL.to_string(),
        attachments: Vec::new(),
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_delay_ms: 1,
        max_delay_ms: 4,
        backoff_multiplier: 2.0,
    }
}

/// Settings with millisecond waits
pub fn fast_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        generation: GenerationPolicy {
            max_attempts: 3,
            call_timeout: Duration::from_secs(5),
            limits: ArtifactLimits::default(),
        },
        publish: PublishPolicy {
            retry: fast_retry(),
            deploy_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(10),
            call_timeout: Duration::from_secs(2),
            ci_workflow: true,
        },
        notify_retry: fast_retry(),
        notify_call_timeout: Duration::from_secs(2),
        publish_on_failure: false,
        task_timeout: Duration::from_secs(10),
        shutdown_grace: Duration::from_secs(5),
    }
}
