//! Generated artifacts.
//!
//! An artifact is the file set produced by a generation attempt. It is owned
//! by the generation engine until handed to the publish engine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::request::Attachment;

/// Path -> file content, ordered by path
pub type FileSet = BTreeMap<String, String>;

/// Entry point every generated site must contain
pub const INDEX_FILE: &str = "index.html";

/// A generated file set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Files to publish
    pub files: FileSet,

    /// Generation attempt that produced it (0 = fetched from the repo host)
    pub attempt: u32,

    /// When the artifact was created
    pub created_at: DateTime<Utc>,

    /// Total size in bytes (for tracking)
    pub size_bytes: u64,
}

impl Artifact {
    /// Create a new artifact
    pub fn new(files: FileSet, attempt: u32) -> Self {
        let size_bytes = files.values().map(|c| c.len() as u64).sum();
        Self {
            files,
            attempt,
            created_at: Utc::now(),
            size_bytes,
        }
    }

    /// Content of a single file
    pub fn file(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    /// All file paths
    pub fn paths(&self) -> Vec<&str> {
        self.files.keys().map(String::as_str).collect()
    }

    /// HTML files, which carry the app itself
    pub fn html_files(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files
            .iter()
            .filter(|(path, _)| path.ends_with(".html") || path.ends_with(".htm"))
            .map(|(p, c)| (p.as_str(), c.as_str()))
    }

    /// Add decoded attachments the generator did not already produce.
    ///
    /// Returns the number of files added.
    pub fn merge_attachments(&mut self, attachments: &[Attachment]) -> usize {
        let mut added = 0;
        for attachment in attachments {
            if self.files.contains_key(&attachment.name) {
                continue;
            }
            if let Some(content) = attachment.decode() {
                self.size_bytes += content.len() as u64;
                self.files.insert(attachment.name.clone(), content);
                added += 1;
            }
        }
        added
    }

    /// Content digest over paths and contents (first 16 hex chars of SHA256)
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (path, content) in &self.files {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            hasher.update(content.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(&hasher.finalize()[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(entries: &[(&str, &str)]) -> FileSet {
        entries
            .iter()
            .map(|(p, c)| (p.to_string(), c.to_string()))
            .collect()
    }

    #[test]
    fn test_artifact_creation() {
        let artifact = Artifact::new(
            files(&[("index.html", "<html></html>"), ("README.md", "# App")]),
            1,
        );

        assert_eq!(artifact.attempt, 1);
        assert_eq!(artifact.size_bytes, 18);
        assert_eq!(artifact.paths(), vec!["README.md", "index.html"]);
        assert_eq!(artifact.html_files().count(), 1);
    }

    #[test]
    fn test_merge_attachments_keeps_generated_files() {
        let mut artifact = Artifact::new(files(&[("data.csv", "generated")]), 1);
        let attachments = vec![
            Attachment {
                name: "data.csv".to_string(),
                url: "data:text/csv;base64,YSxi".to_string(),
            },
            Attachment {
                name: "extra.txt".to_string(),
                url: "data:,extra".to_string(),
            },
        ];

        assert_eq!(artifact.merge_attachments(&attachments), 1);
        assert_eq!(artifact.file("data.csv"), Some("generated"));
        assert_eq!(artifact.file("extra.txt"), Some("extra"));
    }

    #[test]
    fn test_digest_tracks_content() {
        let a = Artifact::new(files(&[("index.html", "a")]), 1);
        let b = Artifact::new(files(&[("index.html", "a")]), 2);
        let c = Artifact::new(files(&[("index.html", "b")]), 1);

        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
        assert_eq!(a.digest().len(), 16);
    }
}
