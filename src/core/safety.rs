//! Safety limits for generated artifacts.
//!
//! Rejects candidates that would publish too much or leak secrets:
//! - Number of files
//! - Per-file and total sizes
//! - Denylist patterns (to avoid publishing secrets)
//!
//! Risky code patterns are only reported as warnings.

use std::sync::LazyLock;

use glob::Pattern;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::Artifact;

/// Limits applied to every generated artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactLimits {
    /// Maximum number of files (default: 50)
    #[serde(default = "default_max_files")]
    pub max_files: usize,

    /// Maximum size of one file in bytes (default: 1MB)
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,

    /// Maximum size of the whole artifact in bytes (default: 5MB)
    #[serde(default = "default_max_total_bytes")]
    pub max_total_bytes: u64,

    /// Glob patterns to reject (files matching these won't be published)
    #[serde(default = "default_denylist")]
    pub denylist_patterns: Vec<String>,
}

fn default_max_files() -> usize {
    50
}
fn default_max_file_bytes() -> u64 {
    1024 * 1024
} // 1MB
fn default_max_total_bytes() -> u64 {
    5 * 1024 * 1024
} // 5MB

fn default_denylist() -> Vec<String> {
    vec![
        "**/.env*".to_string(),
        "**/secrets*".to_string(),
        "**/*credential*".to_string(),
        "**/*.pem".to_string(),
        "**/*.key".to_string(),
    ]
}

impl Default for ArtifactLimits {
    fn default() -> Self {
        Self {
            max_files: default_max_files(),
            max_file_bytes: default_max_file_bytes(),
            max_total_bytes: default_max_total_bytes(),
            denylist_patterns: default_denylist(),
        }
    }
}

impl ArtifactLimits {
    /// Check if a path matches any denylist pattern.
    ///
    /// Generated paths are repo-relative, so `**/` patterns are also tried
    /// against the bare path.
    pub fn is_denylisted(&self, path: &str) -> bool {
        for pattern_str in &self.denylist_patterns {
            if let Ok(pattern) = Pattern::new(pattern_str) {
                if pattern.matches(path) {
                    return true;
                }
            }
            if let Some(stripped) = pattern_str.strip_prefix("**/") {
                if let Ok(pattern) = Pattern::new(stripped) {
                    if pattern.matches(path) {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Validate an artifact against count, size, and denylist limits
    pub fn validate(&self, artifact: &Artifact) -> Result<(), SafetyViolation> {
        if artifact.files.len() > self.max_files {
            return Err(SafetyViolation::MaxFiles {
                actual: artifact.files.len(),
                limit: self.max_files,
            });
        }

        let mut total = 0u64;
        for (path, content) in &artifact.files {
            if path.starts_with('/') || path.split('/').any(|part| part == "..") {
                return Err(SafetyViolation::UnsafePath { path: path.clone() });
            }
            if self.is_denylisted(path) {
                return Err(SafetyViolation::DenylistMatch { path: path.clone() });
            }

            let size = content.len() as u64;
            if size > self.max_file_bytes {
                return Err(SafetyViolation::MaxFileBytes {
                    path: path.clone(),
                    actual: size,
                    limit: self.max_file_bytes,
                });
            }
            total += size;
        }

        if total > self.max_total_bytes {
            return Err(SafetyViolation::MaxTotalBytes {
                actual: total,
                limit: self.max_total_bytes,
            });
        }

        Ok(())
    }
}

/// Safety violation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SafetyViolation {
    #[error("Too many files: {actual} > {limit}")]
    MaxFiles { actual: usize, limit: usize },

    #[error("File '{path}' too large: {actual} > {limit} bytes")]
    MaxFileBytes { path: String, actual: u64, limit: u64 },

    #[error("Artifact too large: {actual} > {limit} bytes")]
    MaxTotalBytes { actual: u64, limit: u64 },

    #[error("Path matches denylist pattern: {path}")]
    DenylistMatch { path: String },

    #[error("Path escapes the repository root: {path}")]
    UnsafePath { path: String },
}

static RISKY_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        (Regex::new(r"\beval\s*\(").unwrap(), "uses eval()"),
        (
            Regex::new(r"document\.write\s*\(").unwrap(),
            "uses document.write()",
        ),
        (Regex::new(r"rm\s+-rf").unwrap(), "contains 'rm -rf'"),
        (Regex::new(r"(?i)drop\s+table").unwrap(), "contains DROP TABLE"),
        (
            Regex::new(r"innerHTML\s*=\s*[^;]*(location|URLSearchParams)").unwrap(),
            "writes URL input into innerHTML",
        ),
    ]
});

/// Scan an artifact for risky code patterns.
///
/// Returns one warning per (file, pattern) hit.
pub fn scan_code(artifact: &Artifact) -> Vec<String> {
    let mut warnings = Vec::new();
    for (path, content) in &artifact.files {
        for (pattern, description) in RISKY_PATTERNS.iter() {
            if pattern.is_match(content) {
                warnings.push(format!("{}: {}", path, description));
            }
        }
    }
    warnings
}
