//! HuggingFace Inference API code generator.
//!
//! Endpoint: POST {base_url}/{model}
//! Auth: Bearer token
//!
//! Uses the same prompt and `=== path ===` answer format as the
//! chat-completions generator.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use super::llm::{
    build_prompt, classify_status, classify_transport, ensure_required_files, parse_files,
    SYSTEM_PROMPT,
};
use super::{CodeGenerator, GenerationError, GenerationRequest};
use crate::config::{ConfigError, HuggingFaceSettings};
use crate::domain::{FileSet, INDEX_FILE};

/// Text-generation client for one hosted model
pub struct HuggingFaceGenerator {
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_new_tokens: u32,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct InferenceRequest<'a> {
    inputs: &'a str,
    parameters: InferenceParameters,
}

#[derive(Debug, Serialize)]
struct InferenceParameters {
    max_new_tokens: u32,
    temperature: f32,
    top_p: f32,
    do_sample: bool,
    return_full_text: bool,
}

impl HuggingFaceGenerator {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let model = model.into();
        Self {
            endpoint: format!("{}/{}", base_url.into().trim_end_matches('/'), model),
            api_key: api_key.into(),
            model,
            temperature: 0.7,
            max_new_tokens: 4000,
            client: reqwest::Client::new(),
        }
    }

    /// Create from config, with the per-request timeout shared with the
    /// primary provider
    pub fn from_settings(
        settings: &HuggingFaceSettings,
        request_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let api_key = settings
            .api_key
            .clone()
            .ok_or_else(|| ConfigError::Missing(vec!["huggingface.api_key".to_string()]))?;

        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ConfigError::Invalid {
                key: "huggingface".to_string(),
                reason: e.to_string(),
            })?;

        let mut generator = Self::new(&settings.base_url, api_key, &settings.model);
        generator.temperature = settings.temperature;
        generator.max_new_tokens = settings.max_new_tokens;
        generator.client = client;
        Ok(generator)
    }

    async fn complete(&self, prompt: &str) -> Result<String, GenerationError> {
        let inputs = format!("{}\n\n{}", SYSTEM_PROMPT, prompt);
        let body = InferenceRequest {
            inputs: &inputs,
            parameters: InferenceParameters {
                max_new_tokens: self.max_new_tokens,
                temperature: self.temperature,
                top_p: 0.95,
                do_sample: true,
                return_full_text: false,
            },
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            // 503 while the model is loading lands in the transient class
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, text));
        }

        let parsed: Value = response
            .json()
            .await
            .map_err(|e| GenerationError::Malformed(format!("unreadable response: {}", e)))?;

        generated_text(&parsed)
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| GenerationError::Malformed("empty generation".to_string()))
    }
}

/// The answer is either `[{"generated_text": ..}]` or a bare object
fn generated_text(value: &Value) -> Option<String> {
    let object = match value {
        Value::Array(items) => items.first()?,
        other => other,
    };
    object
        .get("generated_text")
        .or_else(|| object.get("text"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[async_trait]
impl CodeGenerator for HuggingFaceGenerator {
    fn name(&self) -> &str {
        "huggingface"
    }

    async fn produce(&self, request: &GenerationRequest<'_>) -> Result<FileSet, GenerationError> {
        info!(model = %self.model, attempt = request.attempt, "Requesting generation");

        let content = self.complete(&build_prompt(request)).await?;
        let mut files = parse_files(&content);
        if !files.contains_key(INDEX_FILE) {
            return Err(GenerationError::Malformed(format!(
                "model {} returned no {}",
                self.model, INDEX_FILE
            )));
        }
        ensure_required_files(&mut files, request.brief);

        debug!(model = %self.model, files = files.len(), "Generation succeeded");
        Ok(files)
    }

    async fn health_check(&self) -> Result<(), GenerationError> {
        let response = self
            .client
            .get(&self.endpoint)
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
