//! Admission control for task deliveries.
//!
//! Every delivery of a request passes through [`IdempotencyStore::admit`].
//! Exactly one delivery per (task, round) is ever `Accepted`; every other
//! delivery is a `Duplicate` of it.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::retry::Retryable;
use crate::domain::{RequestError, TaskIdentity};

/// Admission failures
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// The request is malformed; retrying it unchanged will not help
    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] RequestError),

    /// The store could not be read or written; retry later
    #[error("Idempotency store unavailable: {0}")]
    StoreUnavailable(String),
}

impl Retryable for AdmissionError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

/// One admitted delivery: `(task, round, nonce)` and when it was first seen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyEntry {
    pub task: String,
    pub round: u32,
    pub nonce: String,
    pub admitted_at: DateTime<Utc>,
}

impl IdempotencyEntry {
    fn new(identity: &TaskIdentity, nonce: &str) -> Self {
        Self {
            task: identity.task.clone(),
            round: identity.round,
            nonce: nonce.to_string(),
            admitted_at: Utc::now(),
        }
    }

    pub fn identity(&self) -> TaskIdentity {
        TaskIdentity::new(self.task.clone(), self.round)
    }
}

/// How a duplicate relates to the first delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateKind {
    /// Same nonce: a retried HTTP delivery
    SameDelivery,

    /// New nonce for an identity already admitted
    Redelivery,
}

/// Result of an admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// First delivery of this identity; the caller owns its pipeline
    Accepted(TaskIdentity),

    /// The identity was admitted before
    Duplicate {
        identity: TaskIdentity,
        kind: DuplicateKind,
    },
}

impl Admission {
    pub fn identity(&self) -> &TaskIdentity {
        match self {
            Self::Accepted(identity) | Self::Duplicate { identity, .. } => identity,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

/// Atomic admission of (task, round, nonce) deliveries
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Admit a delivery.
    ///
    /// Concurrent calls for the same identity race safely: exactly one of
    /// them receives `Accepted`.
    async fn admit(&self, identity: &TaskIdentity, nonce: &str) -> Result<Admission, AdmissionError>;

    /// All recorded entries, oldest first
    async fn entries(&self) -> Result<Vec<IdempotencyEntry>, AdmissionError>;

    /// Check the store is usable
    async fn health_check(&self) -> Result<(), AdmissionError>;
}

/// Decide an admission against the entries already recorded.
///
/// Returns the decision and the entry to record, if any.
fn decide(
    existing: &[IdempotencyEntry],
    identity: &TaskIdentity,
    nonce: &str,
) -> (Admission, Option<IdempotencyEntry>) {
    let mut seen = false;
    for entry in existing
        .iter()
        .filter(|e| e.task == identity.task && e.round == identity.round)
    {
        if entry.nonce == nonce {
            return (
                Admission::Duplicate {
                    identity: identity.clone(),
                    kind: DuplicateKind::SameDelivery,
                },
                None,
            );
        }
        seen = true;
    }

    let entry = IdempotencyEntry::new(identity, nonce);
    if seen {
        (
            Admission::Duplicate {
                identity: identity.clone(),
                kind: DuplicateKind::Redelivery,
            },
            Some(entry),
        )
    } else {
        (Admission::Accepted(identity.clone()), Some(entry))
    }
}

/// Process-local store, for tests and single-shot runs
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    entries: Mutex<HashMap<TaskIdentity, Vec<IdempotencyEntry>>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn admit(&self, identity: &TaskIdentity, nonce: &str) -> Result<Admission, AdmissionError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let known = entries.entry(identity.clone()).or_default();

        let (admission, entry) = decide(known, identity, nonce);
        if let Some(entry) = entry {
            known.push(entry);
        }

        Ok(admission)
    }

    async fn entries(&self) -> Result<Vec<IdempotencyEntry>, AdmissionError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<IdempotencyEntry> = entries.values().flatten().cloned().collect();
        all.sort_by_key(|e| e.admitted_at);
        Ok(all)
    }

    async fn health_check(&self) -> Result<(), AdmissionError> {
        Ok(())
    }
}

/// Durable store backed by a JSONL file.
///
/// Check-then-append runs under an exclusive file lock, so admissions are
/// atomic across tasks and across processes sharing the file.
#[derive(Debug)]
pub struct FileIdempotencyStore {
    path: PathBuf,
    gate: tokio::sync::Mutex<()>,
}

impl FileIdempotencyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn run_locked<T, F>(&self, f: F) -> Result<T, AdmissionError>
    where
        T: Send + 'static,
        F: FnOnce(&mut std::fs::File) -> std::io::Result<T> + Send + 'static,
    {
        let _guard = self.gate.lock().await;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(&path)?;

            file.lock_exclusive()?;
            let result = f(&mut file);
            let _ = FileExt::unlock(&file);
            result
        })
        .await
        .map_err(|e| AdmissionError::StoreUnavailable(e.to_string()))?
        .map_err(|e| {
            warn!(error = %e, "Idempotency store I/O failed");
            AdmissionError::StoreUnavailable(e.to_string())
        })
    }
}

fn read_entries(file: &mut std::fs::File) -> std::io::Result<Vec<IdempotencyEntry>> {
    file.seek(SeekFrom::Start(0))?;
    let reader = BufReader::new(&*file);
    let mut entries = Vec::new();

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<IdempotencyEntry>(&line) {
            Ok(entry) => entries.push(entry),
            // A torn final line from a crash mid-append
            Err(e) => debug!(error = %e, "Skipping unreadable admission entry"),
        }
    }

    Ok(entries)
}

fn ends_with_newline(file: &mut std::fs::File) -> std::io::Result<bool> {
    let len = file.seek(SeekFrom::End(0))?;
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

#[async_trait]
impl IdempotencyStore for FileIdempotencyStore {
    async fn admit(&self, identity: &TaskIdentity, nonce: &str) -> Result<Admission, AdmissionError> {
        let identity = identity.clone();
        let nonce = nonce.to_string();

        self.run_locked(move |file| {
            let existing = read_entries(file)?;
            let (admission, entry) = decide(&existing, &identity, &nonce);

            if let Some(entry) = entry {
                let json = serde_json::to_string(&entry)?;
                if !ends_with_newline(file)? {
                    writeln!(file)?;
                }
                writeln!(file, "{}", json)?;
                file.flush()?;
                file.sync_data()?;
            }

            Ok(admission)
        })
        .await
    }

    async fn entries(&self) -> Result<Vec<IdempotencyEntry>, AdmissionError> {
        self.run_locked(read_entries).await
    }

    async fn health_check(&self) -> Result<(), AdmissionError> {
        self.run_locked(|_| Ok(())).await
    }
}
