//! OpenAI-compatible code generator.
//!
//! Endpoint: POST {base_url}/chat/completions
//! Auth: Bearer token
//!
//! The model answers with file sections delimited by `=== path ===` lines.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{CodeGenerator, GenerationError, GenerationRequest};
use crate::config::{ConfigError, LlmSettings};
use crate::domain::{FileSet, INDEX_FILE};

/// At most this many models are tried per call
pub const MAX_MODELS_PER_CALL: usize = 3;

/// Prior `index.html` is truncated to this many characters in prompts
const PRIOR_CODE_LIMIT: usize = 3000;

pub(crate) const SYSTEM_PROMPT: &str = "You are an expert front-end developer. You build small, \
self-contained static web applications using only HTML, CSS, and vanilla JavaScript, \
loading any libraries from a CDN. The result must work when index.html is opened \
directly in a browser. Answer ONLY with file sections, each introduced by a line of \
the form `=== <path> ===`, with no commentary outside the sections.";

const MIT_LICENSE: &str = r#"MIT License

Copyright (c) {year}

Permission is hereby granted, free of charge, to any person obtaining a copy
of this software and associated documentation files (the "Software"), to deal
in the Software without restriction, including without limitation the rights
to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
copies of the Software, and to permit persons to whom the Software is
furnished to do so, subject to the following conditions:

The above copyright notice and this permission notice shall be included in all
copies or substantial portions of the Software.

THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
SOFTWARE.
"#;

static FILE_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^===\s*([^\s=]+)\s*===\s*$").unwrap());

/// Chat-completions client that produces static sites
pub struct OpenAiGenerator {
    base_url: String,
    api_key: String,
    models: Vec<String>,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiGenerator {
    /// Create a new generator for one model
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            models: vec![model.into()],
            temperature: 0.7,
            max_tokens: 4000,
            client: reqwest::Client::new(),
        }
    }

    /// Create from config
    pub fn from_settings(settings: &LlmSettings) -> Result<Self, ConfigError> {
        let api_key = settings
            .api_key
            .clone()
            .ok_or_else(|| ConfigError::Missing(vec!["llm.api_key".to_string()]))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_seconds))
            .build()
            .map_err(|e| ConfigError::Invalid {
                key: "llm".to_string(),
                reason: e.to_string(),
            })?;

        let mut generator = Self::new(&settings.base_url, api_key, &settings.model)
            .with_fallback_models(settings.fallback_models.clone())
            .with_sampling(settings.temperature, settings.max_tokens);
        generator.client = client;
        Ok(generator)
    }

    /// Models tried after the primary one
    pub fn with_fallback_models(mut self, fallback: Vec<String>) -> Self {
        for model in fallback {
            if !self.models.contains(&model) {
                self.models.push(model);
            }
        }
        self
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    /// Models in the order they will be tried
    pub fn models(&self) -> &[String] {
        &self.models[..self.models.len().min(MAX_MODELS_PER_CALL)]
    }

    async fn complete(&self, model: &str, prompt: &str) -> Result<String, GenerationError> {
        let body = ChatRequest {
            model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, text));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::Malformed(format!("unreadable response: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| GenerationError::Malformed("empty completion".to_string()))
    }
}

pub(crate) fn classify_transport(error: reqwest::Error) -> GenerationError {
    GenerationError::Provider(error.to_string())
}

pub(crate) fn classify_status(status: StatusCode, body: String) -> GenerationError {
    let message = format!("HTTP {}: {}", status.as_u16(), body);
    match status.as_u16() {
        401 | 403 => GenerationError::Auth(message),
        429 | 500..=599 => GenerationError::Provider(message),
        _ => GenerationError::Rejected(message),
    }
}

#[async_trait]
impl CodeGenerator for OpenAiGenerator {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn produce(&self, request: &GenerationRequest<'_>) -> Result<FileSet, GenerationError> {
        let prompt = build_prompt(request);
        let mut last_error = GenerationError::Provider("no model configured".to_string());

        for model in self.models() {
            info!(model = %model, attempt = request.attempt, "Requesting generation");

            let result = self.complete(model, &prompt).await.and_then(|content| {
                let mut files = parse_files(&content);
                if !files.contains_key(INDEX_FILE) {
                    return Err(GenerationError::Malformed(format!(
                        "model {} returned no {}",
                        model, INDEX_FILE
                    )));
                }
                ensure_required_files(&mut files, request.brief);
                Ok(files)
            });

            match result {
                Ok(files) => {
                    debug!(model = %model, files = files.len(), "Generation succeeded");
                    return Ok(files);
                }
                Err(e @ GenerationError::Auth(_)) => return Err(e),
                Err(e) => {
                    warn!(model = %model, error = %e, "Model failed, trying next");
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    async fn health_check(&self) -> Result<(), GenerationError> {
        let response = self
            .client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(classify_status(status, String::new()))
        }
    }
}

/// Build the user prompt for one attempt
pub fn build_prompt(request: &GenerationRequest<'_>) -> String {
    let mut prompt = String::new();

    let prior_index = request.prior_artifact.and_then(|a| a.file(INDEX_FILE));
    if prior_index.is_some() {
        prompt.push_str("Modify the existing application below to satisfy this request:\n\n");
        prompt.push_str(request.brief);
    } else {
        prompt.push_str("Build this application:\n\n");
        prompt.push_str(request.brief);
    }
    prompt.push('\n');

    if !request.attachments.is_empty() {
        prompt.push_str("\nATTACHMENTS (published next to index.html under these names):\n");
        for attachment in request.attachments {
            let mime = attachment.mime_type().unwrap_or("linked URL");
            prompt.push_str(&format!("- {} ({})\n", attachment.name, mime));
        }
    }

    if !request.checks.is_empty() {
        prompt.push_str("\nEVALUATION CRITERIA (all must pass):\n");
        for (i, check) in request.checks.iter().enumerate() {
            prompt.push_str(&format!("{}. {}\n", i + 1, check));
        }
        prompt.push_str("Every element id named in the criteria must exist.\n");
    }

    if let Some(code) = prior_index {
        let truncated: String = code.chars().take(PRIOR_CODE_LIMIT).collect();
        prompt.push_str("\nEXISTING index.html:\n```html\n");
        prompt.push_str(&truncated);
        if code.chars().count() > PRIOR_CODE_LIMIT {
            prompt.push_str("\n... (truncated)");
        }
        prompt.push_str("\n```\nPreserve existing functionality that still applies.\n");
    }

    if !request.feedback.is_empty() {
        prompt.push_str("\nYOUR PREVIOUS ATTEMPT FAILED THESE CRITERIA, FIX THEM:\n");
        for item in request.feedback {
            prompt.push_str(&format!("- {}\n", item));
        }
    }

    prompt.push_str(
        "\nOUTPUT FORMAT: === index.html ===, then === README.md ===, then === LICENSE ===, \
         each followed by the complete file content.\n",
    );

    prompt
}

/// Split a completion into files at `=== path ===` header lines
pub fn parse_files(content: &str) -> FileSet {
    let mut files = FileSet::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in content.lines() {
        if let Some(caps) = FILE_HEADER.captures(line.trim_end()) {
            if let Some((path, lines)) = current.take() {
                files.insert(path, strip_fences(&lines));
            }
            current = Some((caps[1].to_string(), Vec::new()));
        } else if let Some((_, lines)) = current.as_mut() {
            lines.push(line);
        }
    }

    if let Some((path, lines)) = current {
        files.insert(path, strip_fences(&lines));
    }

    files
}

fn strip_fences(lines: &[&str]) -> String {
    let mut start = 0;
    let mut end = lines.len();

    while start < end && lines[start].trim().is_empty() {
        start += 1;
    }
    while end > start && lines[end - 1].trim().is_empty() {
        end -= 1;
    }
    if start < end && lines[start].trim_start().starts_with("```") {
        start += 1;
    }
    if end > start && lines[end - 1].trim() == "```" {
        end -= 1;
    }

    lines[start..end].join("\n")
}

/// Fill in README.md and LICENSE when the model left them out
pub fn ensure_required_files(files: &mut FileSet, brief: &str) {
    files
        .entry("README.md".to_string())
        .or_insert_with(|| default_readme(brief));
    files
        .entry("LICENSE".to_string())
        .or_insert_with(mit_license);
}

fn default_readme(brief: &str) -> String {
    format!(
        "# Generated Application\n\n## Summary\n{}\n\n## Setup\nNo build steps required. \
         Open `index.html` in a browser or visit the published site.\n\n## Code\n- \
         `index.html`: the application, with embedded CSS and JavaScript\n\n## License\n\
         MIT, see `LICENSE`.\n",
        brief.trim()
    )
}

fn mit_license() -> String {
    MIT_LICENSE.replace("{year}", &chrono::Utc::now().format("%Y").to_string())
}
