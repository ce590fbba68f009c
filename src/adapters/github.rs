//! GitHub REST client: repositories and Pages.
//!
//! Implements both [`RepoHost`] (repository upsert through the contents API)
//! and [`SiteHost`] (Pages enablement and build status).
//!
//! Auth: Bearer token

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::{DeployError, RepoError, RepoHost, RepoInfo, SiteHost, SiteStatus};
use crate::config::{ConfigError, GithubSettings};
use crate::domain::{FileSet, INDEX_FILE};

/// GitHub API client
pub struct GitHubClient {
    api_base: String,
    owner: String,
    token: String,
    branch: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct RepoResponse {
    name: String,
    html_url: String,
    #[serde(default)]
    default_branch: Option<String>,
    owner: OwnerResponse,
}

#[derive(Debug, Deserialize)]
struct OwnerResponse {
    login: String,
}

#[derive(Debug, Deserialize)]
struct ContentResponse {
    sha: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CommitRef {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct PutContentResponse {
    commit: CommitRef,
}

#[derive(Debug, Deserialize)]
struct PagesResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    html_url: Option<String>,
}

/// HTTP failure, before it is mapped to a repository or deploy error
#[derive(Debug)]
enum HttpFailure {
    Auth(String),
    Transient(String),
    Rejected { status: u16, message: String },
}

impl From<HttpFailure> for RepoError {
    fn from(failure: HttpFailure) -> Self {
        match failure {
            HttpFailure::Auth(m) => RepoError::Auth(m),
            HttpFailure::Transient(m) => RepoError::Transient(m),
            HttpFailure::Rejected { status, message } => RepoError::Rejected { status, message },
        }
    }
}

impl From<HttpFailure> for DeployError {
    fn from(failure: HttpFailure) -> Self {
        match failure {
            HttpFailure::Auth(m) => DeployError::Auth(m),
            HttpFailure::Transient(m) => DeployError::Transient(m),
            HttpFailure::Rejected { status, message } => DeployError::Rejected { status, message },
        }
    }
}

fn classify_status(status: StatusCode, body: &str) -> HttpFailure {
    let message = format!("HTTP {}: {}", status.as_u16(), body.trim());
    match status.as_u16() {
        401 | 403 => HttpFailure::Auth(message),
        429 | 500..=599 => HttpFailure::Transient(message),
        code => HttpFailure::Rejected {
            status: code,
            message,
        },
    }
}

fn classify_transport(error: reqwest::Error) -> HttpFailure {
    HttpFailure::Transient(error.to_string())
}

/// Percent-encode each segment of a repository path
fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn decode_content(encoded: &str) -> Option<String> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = BASE64.decode(compact).ok()?;
    String::from_utf8(bytes).ok()
}

impl GitHubClient {
    /// Create a new client
    pub fn new(
        api_base: impl Into<String>,
        owner: impl Into<String>,
        token: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            owner: owner.into(),
            token: token.into(),
            branch: branch.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Create from config
    pub fn from_settings(settings: &GithubSettings) -> Result<Self, ConfigError> {
        let mut missing = Vec::new();
        if settings.username.is_none() {
            missing.push("github.username".to_string());
        }
        if settings.token.is_none() {
            missing.push("github.token".to_string());
        }
        match (&settings.username, &settings.token) {
            (Some(username), Some(token)) => Ok(Self::new(
                &settings.api_base,
                username,
                token,
                &settings.branch,
            )),
            _ => Err(ConfigError::Missing(missing)),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.api_base, path))
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .header("User-Agent", "shipwright")
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, HttpFailure> {
        builder.send().await.map_err(classify_transport)
    }

    async fn fail(response: Response) -> HttpFailure {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        classify_status(status, &body)
    }

    async fn get_repo(&self, name: &str) -> Result<Option<RepoInfo>, HttpFailure> {
        let path = format!("/repos/{}/{}", self.owner, name);
        let response = self.send(self.request(Method::GET, &path)).await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let repo: RepoResponse = response
                    .json()
                    .await
                    .map_err(|e| HttpFailure::Transient(e.to_string()))?;
                Ok(Some(self.repo_info(repo, false)))
            }
            _ => Err(Self::fail(response).await),
        }
    }

    fn repo_info(&self, repo: RepoResponse, created: bool) -> RepoInfo {
        RepoInfo {
            name: repo.name,
            owner: repo.owner.login,
            html_url: repo.html_url,
            default_branch: repo.default_branch.unwrap_or_else(|| self.branch.clone()),
            created,
        }
    }

    async fn get_file(&self, repo: &RepoInfo, path: &str) -> Result<Option<ContentResponse>, HttpFailure> {
        let url = format!(
            "/repos/{}/{}/contents/{}?ref={}",
            repo.owner,
            repo.name,
            encode_path(path),
            repo.default_branch
        );
        let response = self.send(self.request(Method::GET, &url)).await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => response
                .json()
                .await
                .map(Some)
                .map_err(|e| HttpFailure::Transient(e.to_string())),
            _ => Err(Self::fail(response).await),
        }
    }

    async fn head_sha(&self, repo: &RepoInfo) -> Result<String, HttpFailure> {
        let url = format!(
            "/repos/{}/{}/commits/{}",
            repo.owner, repo.name, repo.default_branch
        );
        let response = self.send(self.request(Method::GET, &url)).await?;

        if !response.status().is_success() {
            return Err(Self::fail(response).await);
        }

        let commit: CommitRef = response
            .json()
            .await
            .map_err(|e| HttpFailure::Transient(e.to_string()))?;
        Ok(commit.sha)
    }
}

#[async_trait]
impl RepoHost for GitHubClient {
    async fn ensure_repo(&self, name: &str, description: &str) -> Result<RepoInfo, RepoError> {
        if let Some(repo) = self.get_repo(name).await? {
            debug!(repo = %name, "Repository exists");
            return Ok(repo);
        }

        let response = self
            .send(self.request(Method::POST, "/user/repos").json(&json!({
                "name": name,
                "description": description,
                "private": false,
                "auto_init": true,
            })))
            .await?;

        let status = response.status();
        if status.is_success() {
            let repo: RepoResponse = response
                .json()
                .await
                .map_err(|e| RepoError::Transient(e.to_string()))?;
            info!(repo = %name, "Repository created");
            return Ok(self.repo_info(repo, true));
        }

        // Lost a creation race: the repository exists now
        if status == StatusCode::UNPROCESSABLE_ENTITY {
            if let Some(repo) = self.get_repo(name).await? {
                return Ok(repo);
            }
        }

        Err(Self::fail(response).await.into())
    }

    async fn push_files(
        &self,
        repo: &RepoInfo,
        files: &FileSet,
        message: &str,
    ) -> Result<String, RepoError> {
        let mut last_commit = None;

        for (path, content) in files {
            let existing = self.get_file(repo, path).await?;

            if let Some(current) = &existing {
                let unchanged = current
                    .content
                    .as_deref()
                    .and_then(decode_content)
                    .map(|text| &text == content)
                    .unwrap_or(false);
                if unchanged {
                    debug!(repo = %repo.name, path = %path, "File unchanged, skipping");
                    continue;
                }
            }

            let mut body = json!({
                "message": message,
                "content": BASE64.encode(content.as_bytes()),
                "branch": repo.default_branch,
            });
            if let Some(current) = &existing {
                body["sha"] = json!(current.sha);
            }

            let url = format!("/repos/{}/{}/contents/{}", repo.owner, repo.name, encode_path(path));
            let response = self.send(self.request(Method::PUT, &url).json(&body)).await?;

            if !response.status().is_success() {
                return Err(Self::fail(response).await.into());
            }

            let put: PutContentResponse = response
                .json()
                .await
                .map_err(|e| RepoError::Transient(e.to_string()))?;
            debug!(repo = %repo.name, path = %path, "File pushed");
            last_commit = Some(put.commit.sha);
        }

        match last_commit {
            Some(sha) => Ok(sha),
            None => Ok(self.head_sha(repo).await?),
        }
    }

    async fn current_files(&self, name: &str) -> Result<Option<FileSet>, RepoError> {
        let Some(repo) = self.get_repo(name).await? else {
            return Ok(None);
        };

        let Some(index) = self.get_file(&repo, INDEX_FILE).await? else {
            return Ok(None);
        };

        Ok(index
            .content
            .as_deref()
            .and_then(decode_content)
            .map(|html| {
                let mut files = FileSet::new();
                files.insert(INDEX_FILE.to_string(), html);
                files
            }))
    }

    async fn health_check(&self) -> Result<(), RepoError> {
        let response = self.send(self.request(Method::GET, "/user")).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::fail(response).await.into())
        }
    }
}

#[async_trait]
impl SiteHost for GitHubClient {
    async fn enable(&self, repo: &RepoInfo) -> Result<(), DeployError> {
        let url = format!("/repos/{}/{}/pages", repo.owner, repo.name);
        let response = self
            .send(self.request(Method::POST, &url).json(&json!({
                "source": { "branch": repo.default_branch, "path": "/" }
            })))
            .await?;

        match response.status() {
            StatusCode::CONFLICT => {
                debug!(repo = %repo.name, "Pages already enabled");
                Ok(())
            }
            s if s.is_success() => {
                info!(repo = %repo.name, "Pages enabled");
                Ok(())
            }
            _ => Err(Self::fail(response).await.into()),
        }
    }

    async fn status(&self, repo: &RepoInfo) -> Result<SiteStatus, DeployError> {
        let url = format!("/repos/{}/{}/pages", repo.owner, repo.name);
        let response = self.send(self.request(Method::GET, &url)).await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(SiteStatus::Building),
            s if s.is_success() => {
                let pages: PagesResponse = response
                    .json()
                    .await
                    .map_err(|e| DeployError::Transient(e.to_string()))?;

                match pages.status.as_deref() {
                    Some("built") => Ok(SiteStatus::Live {
                        url: pages.html_url.unwrap_or_else(|| {
                            format!("https://{}.github.io/{}/", repo.owner, repo.name)
                        }),
                    }),
                    Some("errored") => Ok(SiteStatus::Failed {
                        reason: "Pages build errored".to_string(),
                    }),
                    _ => Ok(SiteStatus::Building),
                }
            }
            _ => Err(Self::fail(response).await.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, ""),
            HttpFailure::Auth(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, ""),
            HttpFailure::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            HttpFailure::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, ""),
            HttpFailure::Rejected { status: 422, .. }
        ));
    }

    #[test]
    fn test_encode_path() {
        assert_eq!(encode_path("assets/my file.csv"), "assets/my%20file.csv");
        assert_eq!(encode_path("index.html"), "index.html");
    }

    #[test]
    fn test_decode_content_with_line_breaks() {
        assert_eq!(decode_content("PGh0bWw+\nPC9odG1sPg==\n"), Some("<html></html>".to_string()));
    }
}
