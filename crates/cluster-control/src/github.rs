//! GitHub API client for repository deploy keys.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

const GITHUB_API_URL: &str = "https://api.github.com";

/// Errors from the GitHub API.
#[derive(Error, Debug)]
pub enum GithubError {
    /// No token was configured.
    #[error("a GitHub token is required to manage deploy keys (set GITHUB_TOKEN or --github-token)")]
    MissingToken,

    /// Request could not be sent or the response not decoded.
    #[error("GitHub request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The key or repository does not exist.
    #[error("GitHub resource not found: {0}")]
    NotFound(String),

    /// Any other non-success response.
    #[error("GitHub API error: {status} - {body}")]
    Api { status: u16, body: String },
}

/// A deploy key as returned by GitHub.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeployKey {
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Serialize)]
struct CreateDeployKeyRequest<'a> {
    title: &'a str,
    key: &'a str,
    read_only: bool,
}

/// Registers and revokes repository deploy keys.
#[async_trait]
pub trait DeployKeyRegistry: Send + Sync {
    /// Register a read-only public key, returning its id.
    async fn add_key(
        &self,
        owner: &str,
        repo: &str,
        title: &str,
        public_key: &str,
    ) -> Result<u64, GithubError>;

    /// Revoke a key. [`GithubError::NotFound`] means it is already gone.
    async fn delete_key(&self, owner: &str, repo: &str, id: u64) -> Result<(), GithubError>;
}

/// GitHub REST client.
#[derive(Debug, Clone)]
pub struct GithubClient {
    client: reqwest::Client,
    token: String,
    base_url: String,
}

impl GithubClient {
    /// Create a client authenticating with `token`.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(token: &str) -> Result<Self, GithubError> {
        if token.trim().is_empty() {
            return Err(GithubError::MissingToken);
        }

        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "X-GitHub-Api-Version",
            HeaderValue::from_static("2022-11-28"),
        );
        headers.insert(USER_AGENT, HeaderValue::from_static("cluster-control/0.1"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            token: token.to_string(),
            base_url: GITHUB_API_URL.to_string(),
        })
    }

    /// Point the client at another API root (GitHub Enterprise, tests).
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    async fn error_for(response: reqwest::Response, what: String) -> GithubError {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return GithubError::NotFound(what);
        }
        let body = response.text().await.unwrap_or_default();
        GithubError::Api {
            status: status.as_u16(),
            body,
        }
    }
}

#[async_trait]
impl DeployKeyRegistry for GithubClient {
    async fn add_key(
        &self,
        owner: &str,
        repo: &str,
        title: &str,
        public_key: &str,
    ) -> Result<u64, GithubError> {
        let url = format!("{}/repos/{owner}/{repo}/keys", self.base_url);
        debug!(%url, title, "Registering deploy key");

        let response = self
            .client
            .post(&url)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .json(&CreateDeployKeyRequest {
                title,
                key: public_key,
                read_only: true,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_for(response, format!("repository {owner}/{repo}")).await);
        }

        let key: DeployKey = response.json().await?;
        info!(owner, repo, key_id = key.id, "Deploy key registered");
        Ok(key.id)
    }

    async fn delete_key(&self, owner: &str, repo: &str, id: u64) -> Result<(), GithubError> {
        let url = format!("{}/repos/{owner}/{repo}/keys/{id}", self.base_url);

        let response = self
            .client
            .delete(&url)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_for(response, format!("deploy key {id} on {owner}/{repo}")).await);
        }

        info!(owner, repo, key_id = id, "Deploy key deleted");
        Ok(())
    }
}
