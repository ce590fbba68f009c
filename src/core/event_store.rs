//! Append-only event store with file-based persistence.
//!
//! Each (task, round) gets its own directory holding the event log as
//! newline-delimited JSON (JSONL) and the latest generated artifact.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::warn;

use crate::domain::{sanitize_repo_name, Artifact, Event, TaskIdentity, TaskRecord};

const EVENTS_FILE: &str = "events.jsonl";
const ARTIFACT_FILE: &str = "artifact.json";

/// File-based event store for one task round
#[derive(Debug, Clone)]
pub struct EventStore {
    identity: TaskIdentity,

    /// Directory containing the round
    round_dir: PathBuf,

    /// Path to the events.jsonl file
    events_path: PathBuf,

    /// Path to the artifact.json file
    artifact_path: PathBuf,
}

impl EventStore {
    /// Locate the store for a round without touching the filesystem
    pub fn at(home: &Path, identity: &TaskIdentity) -> Self {
        let round_dir = task_directory(home, &identity.task).join(format!("round-{}", identity.round));

        Self {
            identity: identity.clone(),
            events_path: round_dir.join(EVENTS_FILE),
            artifact_path: round_dir.join(ARTIFACT_FILE),
            round_dir,
        }
    }

    /// Create or open the store for a round
    pub async fn open(home: &Path, identity: &TaskIdentity) -> Result<Self> {
        let store = Self::at(home, identity);

        fs::create_dir_all(&store.round_dir)
            .await
            .with_context(|| format!("Failed to create round directory: {}", store.round_dir.display()))?;

        Ok(store)
    }

    pub fn identity(&self) -> &TaskIdentity {
        &self.identity
    }

    /// Get the path to the events file
    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    /// Store the artifact to disk, replacing any earlier one
    pub async fn store_artifact(&self, artifact: &Artifact) -> Result<PathBuf> {
        fs::create_dir_all(&self.round_dir).await?;

        let json = serde_json::to_string_pretty(artifact).context("Failed to serialize artifact")?;
        let tmp_path = self.artifact_path.with_extension("json.tmp");

        fs::write(&tmp_path, json)
            .await
            .with_context(|| format!("Failed to write artifact: {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.artifact_path)
            .await
            .with_context(|| format!("Failed to move artifact into place: {}", self.artifact_path.display()))?;

        Ok(self.artifact_path.clone())
    }

    /// Load the artifact from disk
    pub async fn load_artifact(&self) -> Result<Option<Artifact>> {
        if !self.artifact_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.artifact_path)
            .await
            .with_context(|| format!("Failed to read artifact: {}", self.artifact_path.display()))?;

        let artifact = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse artifact: {}", self.artifact_path.display()))?;

        Ok(Some(artifact))
    }

    /// Append an event to the log
    pub async fn append(&self, event: &Event) -> Result<()> {
        fs::create_dir_all(&self.round_dir).await?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    /// Replay all events in order
    pub async fn replay(&self) -> Result<Vec<Event>> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Event>(&line) {
                Ok(event) => events.push(event),
                Err(e) => warn!(
                    path = %self.events_path.display(),
                    error = %e,
                    "Skipping unreadable event line"
                ),
            }
        }

        Ok(events)
    }

    /// Rebuild the task record, with its artifact loaded
    pub async fn load_record(&self) -> Result<Option<TaskRecord>> {
        let events = self.replay().await?;
        let Some(mut record) = TaskRecord::from_events(&events) else {
            return Ok(None);
        };

        if record.artifact_digest.is_some() {
            record.artifact = self.load_artifact().await?;
        }

        Ok(Some(record))
    }

    /// List every (task, round) with an event log under `home`
    pub async fn list_identities(home: &Path) -> Result<Vec<TaskIdentity>> {
        let tasks_dir = home.join("tasks");
        if !tasks_dir.exists() {
            return Ok(Vec::new());
        }

        let mut identities = Vec::new();
        let mut task_entries = fs::read_dir(&tasks_dir).await?;

        while let Some(task_entry) = task_entries.next_entry().await? {
            if !task_entry.file_type().await?.is_dir() {
                continue;
            }

            let mut round_entries = fs::read_dir(task_entry.path()).await?;
            while let Some(round_entry) = round_entries.next_entry().await? {
                let events_path = round_entry.path().join(EVENTS_FILE);
                if let Some(identity) = first_identity(&events_path).await? {
                    identities.push(identity);
                }
            }
        }

        identities.sort();
        Ok(identities)
    }
}

/// Directory for all rounds of a task.
///
/// Task identifiers are free text, so the directory name is a slug plus a
/// short hash of the exact identifier.
pub fn task_directory(home: &Path, task: &str) -> PathBuf {
    let slug = sanitize_repo_name(task).unwrap_or_else(|_| "task".to_string());
    home.join("tasks")
        .join(format!("{}-{}", slug, &hash_input(task)[..8]))
}

async fn first_identity(events_path: &Path) -> Result<Option<TaskIdentity>> {
    if !events_path.exists() {
        return Ok(None);
    }

    let file = File::open(events_path).await?;
    let mut lines = BufReader::new(file).lines();

    while let Some(line) = lines.next_line().await? {
        if let Ok(event) = serde_json::from_str::<Event>(&line) {
            return Ok(Some(event.identity()));
        }
    }

    Ok(None)
}

/// Generate an idempotency key for a stage of a round
pub fn generate_idempotency_key(identity: &TaskIdentity, stage: &str, input: &str) -> String {
    let input_hash = hash_input(input);
    format!("{}:{}:{}:{}", identity.task, identity.round, stage, input_hash)
}

/// Hash input content (first 16 chars of SHA256)
pub fn hash_input(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8]) // First 16 hex chars (8 bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventType, FileSet, TaskStatus};
    use tempfile::TempDir;

    fn identity() -> TaskIdentity {
        TaskIdentity::new("calc-app", 1)
    }

    fn event(event_type: EventType, status: TaskStatus, summary: &str) -> Event {
        Event::new(
            &identity(),
            event_type,
            generate_idempotency_key(&identity(), "test", summary),
            summary.to_string(),
            status,
        )
    }

    #[tokio::test]
    async fn test_event_append_and_replay() {
        let temp = TempDir::new().unwrap();
        let store = EventStore::open(temp.path(), &identity()).await.unwrap();

        store
            .append(&event(EventType::TaskAdmitted, TaskStatus::Pending, "admitted"))
            .await
            .unwrap();
        store
            .append(&event(EventType::StageStarted, TaskStatus::Generating, "generating"))
            .await
            .unwrap();

        let events = store.replay().await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::TaskAdmitted);
        assert_eq!(events[1].event_type, EventType::StageStarted);

        let record = store.load_record().await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Generating);
    }

    #[tokio::test]
    async fn test_missing_log_is_empty() {
        let temp = TempDir::new().unwrap();
        let store = EventStore::at(temp.path(), &identity());

        assert!(!store.events_path().exists());
        assert!(store.replay().await.unwrap().is_empty());
        assert!(store.load_record().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_artifact_roundtrip_replaces_previous() {
        let temp = TempDir::new().unwrap();
        let store = EventStore::open(temp.path(), &identity()).await.unwrap();

        let mut files = FileSet::new();
        files.insert("index.html".to_string(), "v1".to_string());
        store.store_artifact(&Artifact::new(files.clone(), 1)).await.unwrap();

        files.insert("index.html".to_string(), "v2".to_string());
        store.store_artifact(&Artifact::new(files, 2)).await.unwrap();

        let loaded = store.load_artifact().await.unwrap().unwrap();
        assert_eq!(loaded.attempt, 2);
        assert_eq!(loaded.file("index.html"), Some("v2"));
    }

    #[tokio::test]
    async fn test_list_identities() {
        let temp = TempDir::new().unwrap();

        for (task, round) in [("calc-app", 2), ("calc-app", 1), ("Weather App/v2", 1)] {
            let id = TaskIdentity::new(task, round);
            let store = EventStore::open(temp.path(), &id).await.unwrap();
            store
                .append(&Event::new(
                    &id,
                    EventType::TaskAdmitted,
                    generate_idempotency_key(&id, "admit", "n1"),
                    "admitted".to_string(),
                    TaskStatus::Pending,
                ))
                .await
                .unwrap();
        }

        let identities = EventStore::list_identities(temp.path()).await.unwrap();
        assert_eq!(
            identities,
            vec![
                TaskIdentity::new("Weather App/v2", 1),
                TaskIdentity::new("calc-app", 1),
                TaskIdentity::new("calc-app", 2),
            ]
        );
    }

    #[test]
    fn test_task_directory_is_stable_and_distinct() {
        let home = Path::new("/tmp/home");
        assert_eq!(task_directory(home, "Calc"), task_directory(home, "Calc"));
        assert_ne!(task_directory(home, "Calc"), task_directory(home, "calc"));
        assert!(task_directory(home, "../../etc")
            .starts_with("/tmp/home/tasks"));
    }

    #[test]
    fn test_idempotency_key_format() {
        let key = generate_idempotency_key(&identity(), "publish", "digest");

        // Format: {task}:{round}:{stage}:{hash16}
        assert!(key.starts_with("calc-app:1:publish:"));
        let parts: Vec<&str> = key.split(':').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[3].len(), 16);
    }

    #[test]
    fn test_input_hash_consistency() {
        let hash1 = hash_input("test input");
        let hash2 = hash_input("test input");
        let hash3 = hash_input("different input");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
        assert_eq!(hash1.len(), 16);
    }
}
