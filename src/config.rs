//! Configuration for shipwright.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (SHIPWRIGHT_HOME, SHIPWRIGHT_SECRET,
//!    SHIPWRIGHT_LLM_*, GITHUB_TOKEN, GITHUB_USERNAME, HF_TOKEN)
//! 2. Config file ($SHIPWRIGHT_CONFIG, else .shipwright/config.yaml)
//! 3. Defaults (~/.shipwright)
//!
//! Config file discovery:
//! - Searches current directory and parents for .shipwright/config.yaml
//! - `home` in the config file is relative to the .shipwright/ directory

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::core::generation::GenerationPolicy;
use crate::core::publish::PublishPolicy;
use crate::core::retry::RetryPolicy;
use crate::core::safety::ArtifactLimits;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const CONFIG_DIR: &str = ".shipwright";

/// Major config schema version this build reads
const SCHEMA_MAJOR: &str = "1";
const CONFIG_FILE: &str = "config.yaml";

/// Configuration problems that must stop the process
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {}", .0.join(", "))]
    Missing(Vec<String>),

    #[error("Invalid configuration for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

/// LLM provider settings
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub base_url: String,
    pub model: String,
    pub fallback_models: Vec<String>,
    pub api_key: Option<String>,
    pub request_timeout_seconds: u64,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            fallback_models: Vec::new(),
            api_key: None,
            request_timeout_seconds: 120,
            temperature: 0.7,
            max_tokens: 4000,
        }
    }
}

impl fmt::Debug for LlmSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmSettings")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("fallback_models", &self.fallback_models)
            .field("api_key", &redacted(&self.api_key))
            .field("request_timeout_seconds", &self.request_timeout_seconds)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

/// Secondary provider: HuggingFace Inference API, tried when the primary
/// provider fails. Enabled by setting `api_key` (or HF_TOKEN).
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HuggingFaceSettings {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_new_tokens: u32,
}

impl Default for HuggingFaceSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api-inference.huggingface.co/models".to_string(),
            model: "meta-llama/Llama-3.2-3B-Instruct".to_string(),
            api_key: None,
            temperature: 0.7,
            max_new_tokens: 4000,
        }
    }
}

impl fmt::Debug for HuggingFaceSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HuggingFaceSettings")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &redacted(&self.api_key))
            .field("temperature", &self.temperature)
            .field("max_new_tokens", &self.max_new_tokens)
            .finish()
    }
}

/// GitHub repository + Pages settings
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GithubSettings {
    pub api_base: String,
    pub username: Option<String>,
    pub token: Option<String>,
    pub branch: String,
}

impl Default for GithubSettings {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com".to_string(),
            username: None,
            token: None,
            branch: "main".to_string(),
        }
    }
}

impl fmt::Debug for GithubSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GithubSettings")
            .field("api_base", &self.api_base)
            .field("username", &self.username)
            .field("token", &redacted(&self.token))
            .field("branch", &self.branch)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    pub max_attempts: u32,

    /// Publish the best-effort artifact when checks never pass
    pub publish_on_failure: bool,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            publish_on_failure: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishSettings {
    pub retry: RetryPolicy,
    pub deploy_timeout_seconds: u64,
    pub poll_interval_seconds: u64,
    pub call_timeout_seconds: u64,
    /// Push a CI validation workflow next to the site
    pub ci_workflow: bool,
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            deploy_timeout_seconds: 300,
            poll_interval_seconds: 10,
            call_timeout_seconds: 60,
            ci_workflow: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifySettings {
    pub retry: RetryPolicy,
    pub call_timeout_seconds: u64,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::notification(),
            call_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSettings {
    /// Deadline for generation + publish
    pub timeout_seconds: u64,

    /// How long shutdown waits for pipelines to reach a checkpoint
    pub shutdown_grace_seconds: u64,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: 570,
            shutdown_grace_seconds: 30,
        }
    }
}

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    /// Engine state directory (relative to .shipwright/)
    #[serde(default)]
    pub home: Option<String>,
    /// Shared secret the front door checks requests against
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub llm: LlmSettings,
    #[serde(default)]
    pub huggingface: HuggingFaceSettings,
    #[serde(default)]
    pub github: GithubSettings,
    #[serde(default)]
    pub generation: GenerationSettings,
    #[serde(default)]
    pub publish: PublishSettings,
    #[serde(default)]
    pub notify: NotifySettings,
    #[serde(default)]
    pub task: TaskSettings,
    #[serde(default)]
    pub limits: ArtifactLimits,
}

impl ConfigFile {
    /// Refuse files written for another major schema version
    fn check_version(&self) -> Result<(), ConfigError> {
        let Some(version) = self.version.as_deref() else {
            return Ok(());
        };

        if version.trim().split('.').next() == Some(SCHEMA_MAJOR) {
            Ok(())
        } else {
            Err(ConfigError::Invalid {
                key: "version".to_string(),
                reason: format!("schema version '{}' is not {}.x", version, SCHEMA_MAJOR),
            })
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Clone)]
pub struct ResolvedConfig {
    /// Absolute path to shipwright home (engine state)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub secret: Option<String>,
    pub llm: LlmSettings,
    pub huggingface: HuggingFaceSettings,
    pub github: GithubSettings,
    pub generation: GenerationSettings,
    pub publish: PublishSettings,
    pub notify: NotifySettings,
    pub task: TaskSettings,
    pub limits: ArtifactLimits,
}

impl ResolvedConfig {
    /// Defaults rooted at `home`, with no file and no environment
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self::from_file(home.into(), None, ConfigFile::default())
    }

    fn from_file(home: PathBuf, config_file: Option<PathBuf>, file: ConfigFile) -> Self {
        Self {
            home,
            config_file,
            secret: file.secret,
            llm: file.llm,
            huggingface: file.huggingface,
            github: file.github,
            generation: file.generation,
            publish: file.publish,
            notify: file.notify,
            task: file.task,
            limits: file.limits,
        }
    }

    /// Apply environment overrides through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |value: &mut Option<String>, key: &str| {
            if let Some(v) = lookup(key).filter(|v| !v.is_empty()) {
                *value = Some(v);
            }
        };

        set(&mut self.secret, "SHIPWRIGHT_SECRET");
        set(&mut self.llm.api_key, "SHIPWRIGHT_LLM_API_KEY");
        set(&mut self.github.token, "GITHUB_TOKEN");
        set(&mut self.github.username, "GITHUB_USERNAME");
        set(&mut self.huggingface.api_key, "HF_TOKEN");

        if let Some(home) = lookup("SHIPWRIGHT_HOME").filter(|v| !v.is_empty()) {
            self.home = PathBuf::from(home);
        }
        if let Some(base_url) = lookup("SHIPWRIGHT_LLM_BASE_URL").filter(|v| !v.is_empty()) {
            self.llm.base_url = base_url;
        }
        if let Some(model) = lookup("SHIPWRIGHT_LLM_MODEL").filter(|v| !v.is_empty()) {
            self.llm.model = model;
        }
    }

    /// Fail when a value the pipeline cannot run without is missing
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut missing = Vec::new();
        if self.secret.is_none() {
            missing.push("secret".to_string());
        }
        if self.llm.api_key.is_none() {
            missing.push("llm.api_key".to_string());
        }
        if self.github.username.is_none() {
            missing.push("github.username".to_string());
        }
        if self.github.token.is_none() {
            missing.push("github.token".to_string());
        }
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        if self.generation.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "generation.max_attempts".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        for (key, policy) in [
            ("publish.retry", &self.publish.retry),
            ("notify.retry", &self.notify.retry),
        ] {
            if policy.max_attempts == 0 || policy.backoff_multiplier < 1.0 {
                return Err(ConfigError::Invalid {
                    key: key.to_string(),
                    reason: "needs max_attempts >= 1 and backoff_multiplier >= 1.0".to_string(),
                });
            }
        }
        for (key, seconds) in [
            ("publish.poll_interval_seconds", self.publish.poll_interval_seconds),
            ("task.timeout_seconds", self.task.timeout_seconds),
        ] {
            if seconds == 0 {
                return Err(ConfigError::Invalid {
                    key: key.to_string(),
                    reason: "must be positive".to_string(),
                });
            }
        }

        Ok(())
    }

    pub fn generation_policy(&self) -> GenerationPolicy {
        GenerationPolicy {
            max_attempts: self.generation.max_attempts,
            call_timeout: Duration::from_secs(self.llm.request_timeout_seconds),
            limits: self.limits.clone(),
        }
    }

    pub fn publish_policy(&self) -> PublishPolicy {
        PublishPolicy {
            retry: self.publish.retry.clone(),
            deploy_timeout: Duration::from_secs(self.publish.deploy_timeout_seconds),
            poll_interval: Duration::from_secs(self.publish.poll_interval_seconds),
            call_timeout: Duration::from_secs(self.publish.call_timeout_seconds),
            ci_workflow: self.publish.ci_workflow,
        }
    }

    /// Whether `provided` matches the configured shared secret.
    ///
    /// Compares SHA-256 digests with a fold over every byte, so the time
    /// taken does not depend on where the values first differ.
    pub fn accepts_secret(&self, provided: &str) -> bool {
        let Some(expected) = self.secret.as_deref() else {
            return false;
        };

        let expected = Sha256::digest(expected.as_bytes());
        let provided = Sha256::digest(provided.as_bytes());
        expected
            .iter()
            .zip(provided.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }

    /// Directory holding every task's rounds
    pub fn tasks_dir(&self) -> PathBuf {
        self.home.join("tasks")
    }

    /// Admission log used by the file idempotency store
    pub fn admissions_path(&self) -> PathBuf {
        self.home.join("admissions.jsonl")
    }
}

impl fmt::Debug for ResolvedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedConfig")
            .field("home", &self.home)
            .field("config_file", &self.config_file)
            .field("secret", &redacted(&self.secret))
            .field("llm", &self.llm)
            .field("huggingface", &self.huggingface)
            .field("github", &self.github)
            .field("generation", &self.generation)
            .field("publish", &self.publish)
            .field("notify", &self.notify)
            .field("task", &self.task)
            .field("limits", &self.limits)
            .finish()
    }
}

fn redacted(value: &Option<String>) -> &'static str {
    if value.is_some() {
        "<redacted>"
    } else {
        "<unset>"
    }
}

/// Find config file: $SHIPWRIGHT_CONFIG, else search current directory and parents
fn find_config_file() -> Option<PathBuf> {
    if let Ok(explicit) = std::env::var("SHIPWRIGHT_CONFIG") {
        return Some(PathBuf::from(explicit));
    }

    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(CONFIG_DIR).join(CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let file: ConfigFile = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    file.check_version()
        .with_context(|| format!("Unsupported config file: {}", path.display()))?;

    Ok(file)
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Load configuration from a specific file (or none), without environment
pub fn load_config_from(config_path: Option<&Path>) -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);

    let Some(config_path) = config_path else {
        return Ok(ResolvedConfig::with_home(default_home));
    };

    let file = load_config_file(config_path)?;
    let home = match &file.home {
        Some(home_path) => {
            let config_dir = config_path.parent().unwrap_or(Path::new("."));
            resolve_path(config_dir, home_path)
        }
        None => default_home,
    };

    Ok(ResolvedConfig::from_file(
        home,
        Some(config_path.to_path_buf()),
        file,
    ))
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let config_file = find_config_file();
    let mut config = load_config_from(config_file.as_deref())?;
    config.apply_env(|key| std::env::var(key).ok());
    Ok(config)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the shipwright home directory (engine state)
pub fn shipwright_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let config_dir = dir.join(CONFIG_DIR);
        std::fs::create_dir_all(&config_dir).unwrap();
        let config_path = config_dir.join(CONFIG_FILE);
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "{}", body).unwrap();
        config_path
    }

    #[test]
    fn test_defaults_without_file() {
        let config = load_config_from(None).unwrap();

        let expected_home = dirs::home_dir().unwrap().join(".shipwright");
        assert_eq!(config.home, expected_home);
        assert!(config.config_file.is_none());
        assert_eq!(config.generation.max_attempts, 3);
        assert!(!config.generation.publish_on_failure);
        assert_eq!(config.notify.retry, RetryPolicy::notification());
        assert_eq!(config.task.timeout_seconds, 570);
        assert_eq!(config.llm.model, "gpt-4o-mini");
        assert_eq!(config.github.branch, "main");
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(
            temp.path(),
            r#"
version: "1.0"
home: ./state
secret: s3cret
llm:
  model: gpt-4o
  fallback_models: [gpt-4o-mini]
generation:
  max_attempts: 5
  publish_on_failure: true
publish:
  retry:
    max_attempts: 4
  deploy_timeout_seconds: 120
"#,
        );

        let config = load_config_from(Some(&config_path)).unwrap();
        assert_eq!(config.home, temp.path().join(".shipwright").join("state"));
        assert_eq!(config.secret.as_deref(), Some("s3cret"));
        assert_eq!(config.llm.model, "gpt-4o");
        assert_eq!(config.llm.base_url, "https://api.openai.com/v1");
        assert_eq!(config.llm.fallback_models, vec!["gpt-4o-mini".to_string()]);
        assert_eq!(config.generation.max_attempts, 5);
        assert!(config.generation.publish_on_failure);
        assert_eq!(config.publish.retry.max_attempts, 4);
        assert_eq!(config.publish.retry.initial_delay_ms, 1000);
        assert_eq!(config.publish.deploy_timeout_seconds, 120);
        assert_eq!(config.publish.poll_interval_seconds, 10);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = ResolvedConfig::with_home("/tmp/sw");
        config.llm.api_key = Some("from-file".to_string());

        let env: HashMap<&str, &str> = [
            ("SHIPWRIGHT_LLM_API_KEY", "from-env"),
            ("GITHUB_TOKEN", "ghp_x"),
            ("GITHUB_USERNAME", "me"),
            ("SHIPWRIGHT_HOME", "/srv/shipwright"),
            ("SHIPWRIGHT_LLM_MODEL", ""),
            ("HF_TOKEN", "hf_x"),
        ]
        .into_iter()
        .collect();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.llm.api_key.as_deref(), Some("from-env"));
        assert_eq!(config.github.token.as_deref(), Some("ghp_x"));
        assert_eq!(config.github.username.as_deref(), Some("me"));
        assert_eq!(config.home, PathBuf::from("/srv/shipwright"));
        assert_eq!(config.huggingface.api_key.as_deref(), Some("hf_x"));
        // Empty values do not override
        assert_eq!(config.llm.model, "gpt-4o-mini");
    }

    #[test]
    fn test_validate_reports_every_missing_value() {
        let config = ResolvedConfig::with_home("/tmp/sw");

        let err = config.validate().unwrap_err();
        assert_eq!(
            err,
            ConfigError::Missing(vec![
                "secret".to_string(),
                "llm.api_key".to_string(),
                "github.username".to_string(),
                "github.token".to_string(),
            ])
        );
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = ResolvedConfig::with_home("/tmp/sw");
        config.secret = Some("s".to_string());
        config.llm.api_key = Some("k".to_string());
        config.github.username = Some("me".to_string());
        config.github.token = Some("t".to_string());
        assert!(config.validate().is_ok());

        config.generation.max_attempts = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key, .. }) if key == "generation.max_attempts"
        ));
    }

    #[test]
    fn test_validate_rejects_zero_poll_interval() {
        let mut config = ResolvedConfig::with_home("/tmp/sw");
        config.secret = Some("s".to_string());
        config.llm.api_key = Some("k".to_string());
        config.github.username = Some("me".to_string());
        config.github.token = Some("t".to_string());

        config.publish.poll_interval_seconds = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key, .. }) if key == "publish.poll_interval_seconds"
        ));
    }

    #[test]
    fn test_other_schema_version_is_refused() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(temp.path(), "version: \"2.0\"\nsecret: s3cret\n");

        let err = load_config_from(Some(&config_path)).unwrap_err();
        assert!(format!("{:#}", err).contains("schema version '2.0' is not 1.x"));

        let config_path = write_config(temp.path(), "version: \"1.3\"\n");
        assert!(load_config_from(Some(&config_path)).is_ok());
    }

    #[test]
    fn test_accepts_only_the_configured_secret() {
        let mut config = ResolvedConfig::with_home("/tmp/sw");
        assert!(!config.accepts_secret(""));

        config.secret = Some("s3cret".to_string());
        assert!(config.accepts_secret("s3cret"));
        assert!(!config.accepts_secret("s3cret "));
        assert!(!config.accepts_secret("wrong"));
        assert!(!config.accepts_secret(""));
    }

    #[test]
    fn test_secrets_are_redacted_in_debug() {
        let mut config = ResolvedConfig::with_home("/tmp/sw");
        config.llm.api_key = Some("sk-live-123".to_string());
        config.github.token = Some("ghp_secret".to_string());
        config.secret = Some("hunter2".to_string());
        config.huggingface.api_key = Some("hf_live_456".to_string());

        let debug = format!("{:?}", config);
        assert!(!debug.contains("sk-live-123"));
        assert!(!debug.contains("ghp_secret"));
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("hf_live_456"));
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "../sibling"),
            PathBuf::from("/home/user/project/../sibling")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
