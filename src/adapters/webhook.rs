//! Evaluator callback client.
//!
//! Endpoint: POST <evaluation_url>
//! Body: the report as JSON

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{DeliveryError, Notifier};
use crate::domain::Report;

/// Longest response body kept in an error
const MAX_ERROR_BODY: usize = 500;

/// HTTP webhook notifier
pub struct WebhookNotifier {
    client: reqwest::Client,
}

impl Default for WebhookNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl WebhookNotifier {
    /// Create a new notifier
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Create a notifier whose requests give up after `timeout`
    pub fn with_timeout(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn deliver(&self, url: &str, report: &Report) -> Result<u16, DeliveryError> {
        let body = report
            .to_json()
            .map_err(|e| DeliveryError::Network(format!("unserializable report: {}", e)))?;

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| DeliveryError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!(url, status = status.as_u16(), "Report delivered");
            return Ok(status.as_u16());
        }

        let mut text = response.text().await.unwrap_or_default();
        if text.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
        }

        Err(DeliveryError::Status {
            code: status.as_u16(),
            body: text,
        })
    }
}
