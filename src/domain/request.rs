//! Inbound task requests.
//!
//! A request is consumed once, at admission. The `secret` field is checked by
//! the front door before the request ever reaches the orchestrator and is
//! never written to the event log.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::record::TaskIdentity;

/// Longest repository name accepted by the hosting provider
pub const MAX_REPO_NAME_LENGTH: usize = 100;

/// Longest repository description we send
pub const MAX_DESCRIPTION_LENGTH: usize = 100;

/// Validation failures for an inbound request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("Field '{0}' must not be empty")]
    EmptyField(&'static str),

    #[error("Round must be >= 1 (got {0})")]
    InvalidRound(u32),

    #[error("Invalid evaluation URL '{url}': {reason}")]
    InvalidEvaluationUrl { url: String, reason: String },

    #[error("Cannot derive a repository name from '{0}'")]
    InvalidRepoName(String),
}

/// A request to build (or rebuild) one round of a task
#[derive(Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Requester email, echoed back in the report
    pub email: String,

    /// Shared secret (checked by the front door, never persisted)
    #[serde(default, skip_serializing)]
    pub secret: String,

    /// Stable task identifier
    pub task: String,

    /// Generation round (1-based)
    pub round: u32,

    /// Unique per physical delivery
    pub nonce: String,

    /// Natural-language description of the app
    pub brief: String,

    /// Ordered acceptance checks
    #[serde(default)]
    pub checks: Vec<String>,

    /// Callback target for the final report
    pub evaluation_url: String,

    /// Auxiliary inputs (data URIs or plain URLs)
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl fmt::Debug for TaskRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRequest")
            .field("email", &self.email)
            .field("secret", &"***")
            .field("task", &self.task)
            .field("round", &self.round)
            .field("nonce", &self.nonce)
            .field("brief", &self.brief)
            .field("checks", &self.checks)
            .field("evaluation_url", &self.evaluation_url)
            .field("attachments", &self.attachments.len())
            .finish()
    }
}

impl TaskRequest {
    /// Parse a request from JSON
    pub fn from_json(content: &str) -> serde_json::Result<Self> {
        serde_json::from_str(content)
    }

    /// The (task, round) identity this request belongs to
    pub fn identity(&self) -> TaskIdentity {
        TaskIdentity::new(self.task.clone(), self.round)
    }

    /// Validate the request shape before admission
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.task.trim().is_empty() {
            return Err(RequestError::EmptyField("task"));
        }
        if self.nonce.trim().is_empty() {
            return Err(RequestError::EmptyField("nonce"));
        }
        if self.brief.trim().is_empty() {
            return Err(RequestError::EmptyField("brief"));
        }
        if self.round == 0 {
            return Err(RequestError::InvalidRound(self.round));
        }

        let url = reqwest::Url::parse(&self.evaluation_url).map_err(|e| {
            RequestError::InvalidEvaluationUrl {
                url: self.evaluation_url.clone(),
                reason: e.to_string(),
            }
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(RequestError::InvalidEvaluationUrl {
                url: self.evaluation_url.clone(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }

        sanitize_repo_name(&self.task)?;

        Ok(())
    }
}

/// An attachment shipped with the request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// File name the attachment should be published under
    pub name: String,

    /// `data:` URI or plain URL
    pub url: String,
}

impl Attachment {
    /// Whether the attachment is embedded inline as a data URI
    pub fn is_data_uri(&self) -> bool {
        self.url.starts_with("data:")
    }

    /// MIME type of a data URI (`None` for plain URLs)
    pub fn mime_type(&self) -> Option<&str> {
        let rest = self.url.strip_prefix("data:")?;
        let end = rest.find([';', ',']).unwrap_or(rest.len());
        let mime = &rest[..end];
        if mime.is_empty() {
            Some("text/plain")
        } else {
            Some(mime)
        }
    }

    /// Decode the attachment payload into publishable text.
    ///
    /// Base64 payloads that are not UTF-8 come back hex-encoded. Plain URLs
    /// are not fetched and decode to `None`.
    pub fn decode(&self) -> Option<String> {
        let rest = self.url.strip_prefix("data:")?;
        let (header, payload) = rest.split_once(',')?;

        if header.split(';').any(|part| part.eq_ignore_ascii_case("base64")) {
            let bytes = BASE64.decode(payload.trim()).ok()?;
            match String::from_utf8(bytes) {
                Ok(text) => Some(text),
                Err(e) => Some(hex::encode(e.into_bytes())),
            }
        } else {
            urlencoding::decode(payload).ok().map(|s| s.into_owned())
        }
    }
}

/// Derive a hosting-safe repository name from a task identifier.
///
/// Lowercase `[a-z0-9-]`, runs of hyphens collapsed, no leading or trailing
/// hyphen, at most [`MAX_REPO_NAME_LENGTH`] characters.
pub fn sanitize_repo_name(name: &str) -> Result<String, RequestError> {
    let mut sanitized = String::with_capacity(name.len());
    for c in name.chars().flat_map(char::to_lowercase) {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() {
            c
        } else {
            '-'
        };
        if c == '-' && (sanitized.is_empty() || sanitized.ends_with('-')) {
            continue;
        }
        sanitized.push(c);
    }

    sanitized.truncate(MAX_REPO_NAME_LENGTH);
    let trimmed = sanitized.trim_end_matches('-');

    if trimmed.is_empty() {
        return Err(RequestError::InvalidRepoName(name.to_string()));
    }

    Ok(trimmed.to_string())
}

/// Make free text safe for a one-line repository description
pub fn sanitize_description(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();

    cleaned
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(MAX_DESCRIPTION_LENGTH)
        .collect()
}
