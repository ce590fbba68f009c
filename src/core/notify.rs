//! Notification stage: deliver the frozen report to the evaluator.
//!
//! Delivery never changes a task's own outcome. A 4xx answer or an
//! exhausted retry budget dead-letters the report.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapters::{DeliveryError, Notifier};
use crate::core::retry::{retry_with_backoff, Interrupted, RetryError, RetryPolicy};
use crate::domain::{NotificationOutcome, Report};

/// Delivers reports with retry and a dead-letter outcome
pub struct NotificationEngine {
    notifier: Arc<dyn Notifier>,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl NotificationEngine {
    pub fn new(notifier: Arc<dyn Notifier>, retry: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            notifier,
            retry,
            call_timeout,
        }
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    /// POST `report` to `url` until delivered or dead-lettered.
    ///
    /// Returns `Err(Interrupted)` only when shutdown cut a backoff wait short;
    /// the record then stays in `Notifying` and delivery resumes on redelivery.
    pub async fn notify(
        &self,
        url: &str,
        report: &Report,
        cancel: &CancellationToken,
    ) -> Result<NotificationOutcome, Interrupted> {
        let notifier = &self.notifier;
        let call_timeout = self.call_timeout;

        let result = retry_with_backoff(&self.retry, "notify", cancel, |_| async move {
            match tokio::time::timeout(call_timeout, notifier.deliver(url, report)).await {
                Ok(result) => result,
                Err(_) => Err(DeliveryError::Network(format!(
                    "no answer within {:?}",
                    call_timeout
                ))),
            }
        })
        .await;

        match result {
            Ok((status_code, attempts)) => {
                info!(task = %report.task, round = report.round, attempts, status_code, "Report delivered");
                Ok(NotificationOutcome::Delivered {
                    attempts,
                    status_code,
                })
            }
            Err(RetryError::Cancelled { attempts }) => {
                warn!(task = %report.task, round = report.round, attempts, "Report delivery interrupted");
                Err(Interrupted)
            }
            Err(RetryError::Permanent { error, attempts })
            | Err(RetryError::Exhausted { error, attempts }) => {
                warn!(
                    task = %report.task,
                    round = report.round,
                    attempts,
                    error = %error,
                    "Report dead-lettered"
                );
                Ok(NotificationOutcome::DeadLettered {
                    attempts,
                    reason: error.to_string(),
                })
            }
        }
    }
}
