//! GitHub REST implementation of [`RemoteRepo`]
//!
//! Authenticates either as a GitHub App installation (app id + installation
//! id + RSA private key, exchanged for a short-lived installation token) or
//! with a static token. Rate-limit responses are retried a bounded number of
//! times before they surface as errors.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::{Method, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::config::GitHubConfig;
use crate::remote::{
    FileLookup, NewPullRequest, PullRequest, RemoteRepo, RepoId, Result, SubmitError, TreeEntry,
};

const API_VERSION: &str = "2022-11-28";

const FILE_MODE: &str = "100644";
const EXECUTABLE_MODE: &str = "100755";

/// Installation tokens are refreshed this long before they expire.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 120;

/// Credentials for the GitHub API.
pub enum GitHubAuth {
    /// GitHub App installation.
    App {
        app_id: String,
        installation_id: String,
        private_key: SecretString,
    },
    /// Personal access or fine-grained token.
    Token(SecretString),
}

impl std::fmt::Debug for GitHubAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GitHubAuth::App {
                app_id,
                installation_id,
                ..
            } => f
                .debug_struct("App")
                .field("app_id", app_id)
                .field("installation_id", installation_id)
                .finish_non_exhaustive(),
            GitHubAuth::Token(_) => f.write_str("Token(..)"),
        }
    }
}

struct CachedToken {
    token: SecretString,
    expires_at: DateTime<Utc>,
}

/// GitHub REST client.
pub struct GitHubClient {
    config: GitHubConfig,
    auth: GitHubAuth,
    http: reqwest::Client,
    installation_token: Mutex<Option<CachedToken>>,
}

impl GitHubClient {
    pub fn new(config: GitHubConfig, auth: GitHubAuth) -> Result<Self> {
        if let GitHubAuth::App { app_id, .. } = &auth {
            if app_id.trim().is_empty() {
                return Err(SubmitError::Auth("app id must not be empty".to_string()));
            }
        }
        Url::parse(&config.api_base_url).map_err(|e| {
            SubmitError::InvalidInput(format!(
                "invalid api_base_url '{}': {}",
                config.api_base_url, e
            ))
        })?;

        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .map_err(|e| SubmitError::Http(e.to_string()))?;

        Ok(Self {
            config,
            auth,
            http,
            installation_token: Mutex::new(None),
        })
    }

    /// Build `{api_base_url}/{segments...}`. Segments may contain `/`, which
    /// is kept as a separator; every other reserved character is escaped.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.config.api_base_url)
            .map_err(|e| SubmitError::InvalidInput(e.to_string()))?;
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                SubmitError::InvalidInput("api_base_url cannot be a base".to_string())
            })?;
            path.pop_if_empty();
            for segment in segments {
                path.extend(segment.split('/'));
            }
        }
        Ok(url)
    }

    fn repo_endpoint(&self, repo: &RepoId, rest: &[&str]) -> Result<Url> {
        let mut segments = vec!["repos", repo.owner.as_str(), repo.name.as_str()];
        segments.extend_from_slice(rest);
        self.endpoint(&segments)
    }

    fn app_jwt(&self, app_id: &str, private_key: &SecretString) -> Result<String> {
        #[derive(Serialize)]
        struct Claims<'a> {
            iat: i64,
            exp: i64,
            iss: &'a str,
        }

        let now = Utc::now().timestamp();
        let claims = Claims {
            // Backdated to tolerate clock drift.
            iat: now - 60,
            exp: now + 540,
            iss: app_id,
        };
        let key = EncodingKey::from_rsa_pem(private_key.expose_secret().as_bytes())
            .map_err(|e| SubmitError::Auth(format!("invalid app private key: {}", e)))?;
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| SubmitError::Auth(format!("failed to sign app JWT: {}", e)))
    }

    /// Bearer token for API calls, minting an installation token if needed.
    async fn bearer(&self) -> Result<String> {
        let (app_id, installation_id, private_key) = match &self.auth {
            GitHubAuth::Token(token) => return Ok(token.expose_secret().to_string()),
            GitHubAuth::App {
                app_id,
                installation_id,
                private_key,
            } => (app_id, installation_id, private_key),
        };

        let mut cached = self.installation_token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at - chrono::Duration::seconds(TOKEN_REFRESH_MARGIN_SECS) > Utc::now()
            {
                return Ok(token.token.expose_secret().to_string());
            }
        }

        #[derive(Deserialize)]
        struct InstallationToken {
            token: String,
            expires_at: DateTime<Utc>,
        }

        tracing::debug!("minting installation token for installation {}", installation_id);
        let jwt = self.app_jwt(app_id, private_key)?;
        let url = self.endpoint(&["app", "installations", installation_id, "access_tokens"])?;
        let response = self
            .http
            .post(url)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .bearer_auth(jwt)
            .send()
            .await
            .map_err(|e| SubmitError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = error_message(response).await;
            return Err(SubmitError::Auth(format!(
                "installation token request failed ({}): {}",
                status.as_u16(),
                message
            )));
        }
        let minted: InstallationToken = response
            .json()
            .await
            .map_err(|e| SubmitError::Decode(e.to_string()))?;

        let token = minted.token.clone();
        *cached = Some(CachedToken {
            token: SecretString::from(minted.token),
            expires_at: minted.expires_at,
        });
        Ok(token)
    }

    /// Send a request, retrying rate-limit responses with bounded backoff.
    async fn send(&self, method: Method, url: Url, body: Option<&Value>) -> Result<reqwest::Response> {
        let mut attempt: u32 = 0;
        loop {
            let token = self.bearer().await?;
            let mut request = self
                .http
                .request(method.clone(), url.clone())
                .header("Accept", "application/vnd.github+json")
                .header("X-GitHub-Api-Version", API_VERSION)
                .bearer_auth(token);
            if let Some(body) = body {
                request = request.json(body);
            }

            tracing::debug!("{} {}", method, url.path());
            let response = request
                .send()
                .await
                .map_err(|e| SubmitError::Http(e.to_string()))?;

            match rate_limit_delay(&response, attempt, self.config.max_backoff_secs) {
                Some(delay) if attempt < self.config.max_rate_limit_retries => {
                    attempt += 1;
                    tracing::warn!(
                        "rate limited on {} {}, retry {} in {:?}",
                        method,
                        url.path(),
                        attempt,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                _ => return Ok(response),
            }
        }
    }

    /// Send and decode a successful JSON response; map failures.
    async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> Result<T> {
        let response = self.send(method, url, body).await?;
        let response = check(response).await?;
        response
            .json()
            .await
            .map_err(|e| SubmitError::Decode(e.to_string()))
    }

    async fn fetch_blob(&self, repo: &RepoId, sha: &str) -> Result<Vec<u8>> {
        #[derive(Deserialize)]
        struct Blob {
            content: String,
        }
        let url = self.repo_endpoint(repo, &["git", "blobs", sha])?;
        let blob: Blob = self.call(Method::GET, url, None).await?;
        decode_base64(&blob.content)
    }

    /// Paths under `tree_sha` that carry the executable bit.
    async fn executable_paths(&self, repo: &RepoId, tree_sha: &str) -> Result<HashSet<String>> {
        let mut url = self.repo_endpoint(repo, &["git", "trees", tree_sha])?;
        url.query_pairs_mut().append_pair("recursive", "1");
        let listing: TreeListing = self.call(Method::GET, url, None).await?;
        if listing.truncated {
            tracing::warn!(
                "tree {} listing truncated; unlisted paths are written as {}",
                tree_sha,
                FILE_MODE
            );
        }
        Ok(listing
            .tree
            .into_iter()
            .filter(|item| item.mode == EXECUTABLE_MODE)
            .map(|item| item.path)
            .collect())
    }

    async fn create_blob(&self, repo: &RepoId, content: &[u8]) -> Result<String> {
        let url = self.repo_endpoint(repo, &["git", "blobs"])?;
        let body = json!({
            "content": base64::engine::general_purpose::STANDARD.encode(content),
            "encoding": "base64",
        });
        let created: ShaOnly = self.call(Method::POST, url, Some(&body)).await?;
        Ok(created.sha)
    }
}

#[derive(Deserialize)]
struct ShaOnly {
    sha: String,
}

#[derive(Deserialize)]
struct RefObject {
    object: ShaOnly,
}

#[derive(Deserialize)]
struct CommitObject {
    tree: ShaOnly,
}

#[derive(Deserialize)]
struct ContentItem {
    #[serde(rename = "type")]
    kind: String,
    sha: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
}

#[derive(Deserialize)]
struct TreeListing {
    #[serde(default)]
    tree: Vec<TreeItem>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Deserialize)]
struct TreeItem {
    path: String,
    mode: String,
}

#[derive(Deserialize)]
struct BranchRef {
    #[serde(rename = "ref")]
    name: String,
}

#[derive(Deserialize)]
struct ApiPull {
    number: u64,
    html_url: String,
    title: String,
    #[serde(default)]
    body: Option<String>,
    head: BranchRef,
    base: BranchRef,
}

impl From<ApiPull> for PullRequest {
    fn from(p: ApiPull) -> Self {
        PullRequest {
            number: p.number,
            url: p.html_url,
            title: p.title,
            body: p.body,
            head: p.head.name,
            base: p.base.name,
        }
    }
}

/// How long to wait before retrying, if `response` is a rate-limit rejection.
fn rate_limit_delay(response: &reqwest::Response, attempt: u32, max_secs: u64) -> Option<Duration> {
    let status = response.status();
    let header = |name: &str| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let exhausted = header("x-ratelimit-remaining").as_deref() == Some("0");
    let retry_after = header("retry-after").and_then(|v| v.parse::<u64>().ok());

    let limited = status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN && (exhausted || retry_after.is_some()));
    if !limited {
        return None;
    }

    let reset_in = header("x-ratelimit-reset")
        .and_then(|v| v.parse::<i64>().ok())
        .map(|reset| (reset - Utc::now().timestamp()).max(0) as u64);
    let secs = retry_after
        .or(reset_in)
        .unwrap_or_else(|| 1u64 << attempt.min(6));
    Some(Duration::from_secs(secs.clamp(1, max_secs.max(1))))
}

/// Turn a non-success response into a [`SubmitError`].
async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = error_message(response).await;
    if status == StatusCode::NOT_FOUND {
        return Err(SubmitError::NotFound(message));
    }
    Err(SubmitError::Remote {
        status: status.as_u16(),
        message,
    })
}

async fn error_message(response: reqwest::Response) -> String {
    let text = response
        .text()
        .await
        .unwrap_or_else(|_| "unable to read response body".to_string());
    serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or(text)
}

fn decode_base64(content: &str) -> Result<Vec<u8>> {
    // The contents API wraps base64 at 60 columns.
    let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(compact)
        .map_err(|e| SubmitError::Decode(format!("invalid base64 from remote: {}", e)))
}

#[async_trait]
impl RemoteRepo for GitHubClient {
    async fn branch_head(&self, repo: &RepoId, branch: &str) -> Result<String> {
        let url = self.repo_endpoint(repo, &["git", "ref", "heads", branch])?;
        let found: RefObject = self.call(Method::GET, url, None).await?;
        Ok(found.object.sha)
    }

    async fn create_branch(&self, repo: &RepoId, branch: &str, sha: &str) -> Result<()> {
        let url = self.repo_endpoint(repo, &["git", "refs"])?;
        let body = json!({ "ref": format!("refs/heads/{}", branch), "sha": sha });
        let response = self.send(Method::POST, url, Some(&body)).await?;
        match check(response).await {
            Ok(_) => Ok(()),
            Err(SubmitError::Remote { status: 422, message })
                if message.contains("already exists") =>
            {
                Err(SubmitError::BranchExists {
                    branch: branch.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn update_branch(
        &self,
        repo: &RepoId,
        branch: &str,
        sha: &str,
        force: bool,
    ) -> Result<()> {
        let url = self.repo_endpoint(repo, &["git", "refs", "heads", branch])?;
        let body = json!({ "sha": sha, "force": force });
        let _: RefObject = self.call(Method::PATCH, url, Some(&body)).await?;
        Ok(())
    }

    async fn commit_tree(&self, repo: &RepoId, commit_sha: &str) -> Result<String> {
        let url = self.repo_endpoint(repo, &["git", "commits", commit_sha])?;
        let commit: CommitObject = self.call(Method::GET, url, None).await?;
        Ok(commit.tree.sha)
    }

    async fn read_file(&self, repo: &RepoId, path: &str, git_ref: &str) -> Result<FileLookup> {
        let mut url = self.repo_endpoint(repo, &["contents", path])?;
        url.query_pairs_mut().append_pair("ref", git_ref);

        let response = self.send(Method::GET, url, None).await?;
        let value: Value = match check(response).await {
            Ok(r) => r
                .json()
                .await
                .map_err(|e| SubmitError::Decode(e.to_string()))?,
            Err(SubmitError::NotFound(_)) => return Ok(FileLookup::Missing),
            Err(e) => return Err(e),
        };

        // Directories come back as an array of entries.
        if value.is_array() {
            return Ok(FileLookup::NotAFile);
        }
        let item: ContentItem =
            serde_json::from_value(value).map_err(|e| SubmitError::Decode(e.to_string()))?;
        if item.kind != "file" {
            return Ok(FileLookup::NotAFile);
        }

        match (item.encoding.as_deref(), item.content.as_deref()) {
            (Some("base64"), Some(content)) => Ok(FileLookup::File(decode_base64(content)?)),
            // Files over 1 MB come back without inline content.
            _ => Ok(FileLookup::File(self.fetch_blob(repo, &item.sha).await?)),
        }
    }

    async fn create_tree(
        &self,
        repo: &RepoId,
        base_tree: &str,
        entries: &[TreeEntry],
    ) -> Result<String> {
        // Overwrites keep the executable bit; new paths are plain files.
        let executable = self.executable_paths(repo, base_tree).await?;

        let mut tree = Vec::with_capacity(entries.len());
        for entry in entries {
            let mode = if executable.contains(&entry.path) {
                EXECUTABLE_MODE
            } else {
                FILE_MODE
            };
            let item = match std::str::from_utf8(&entry.content) {
                Ok(text) => json!({
                    "path": entry.path,
                    "mode": mode,
                    "type": "blob",
                    "content": text,
                }),
                Err(_) => json!({
                    "path": entry.path,
                    "mode": mode,
                    "type": "blob",
                    "sha": self.create_blob(repo, &entry.content).await?,
                }),
            };
            tree.push(item);
        }

        let url = self.repo_endpoint(repo, &["git", "trees"])?;
        let body = json!({ "base_tree": base_tree, "tree": tree });
        let created: ShaOnly = self.call(Method::POST, url, Some(&body)).await?;
        Ok(created.sha)
    }

    async fn create_commit(
        &self,
        repo: &RepoId,
        message: &str,
        tree_sha: &str,
        parent_sha: &str,
    ) -> Result<String> {
        let url = self.repo_endpoint(repo, &["git", "commits"])?;
        let body = json!({ "message": message, "tree": tree_sha, "parents": [parent_sha] });
        let created: ShaOnly = self.call(Method::POST, url, Some(&body)).await?;
        Ok(created.sha)
    }

    async fn list_open_pulls(
        &self,
        repo: &RepoId,
        head: &str,
        base: &str,
    ) -> Result<Vec<PullRequest>> {
        let mut url = self.repo_endpoint(repo, &["pulls"])?;
        url.query_pairs_mut()
            .append_pair("state", "open")
            .append_pair("head", &format!("{}:{}", repo.owner, head))
            .append_pair("base", base);
        let pulls: Vec<ApiPull> = self.call(Method::GET, url, None).await?;
        Ok(pulls.into_iter().map(PullRequest::from).collect())
    }

    async fn create_pull(&self, repo: &RepoId, pull: &NewPullRequest) -> Result<PullRequest> {
        let url = self.repo_endpoint(repo, &["pulls"])?;
        let body = json!({
            "title": pull.title,
            "head": pull.head,
            "base": pull.base,
            "body": pull.body,
        });
        let created: ApiPull = self.call(Method::POST, url, Some(&body)).await?;
        Ok(created.into())
    }

    async fn update_pull(
        &self,
        repo: &RepoId,
        number: u64,
        title: &str,
        body: &str,
    ) -> Result<PullRequest> {
        let number = number.to_string();
        let url = self.repo_endpoint(repo, &["pulls", &number])?;
        let payload = json!({ "title": title, "body": body });
        let updated: ApiPull = self.call(Method::PATCH, url, Some(&payload)).await?;
        Ok(updated.into())
    }

    async fn add_labels(&self, repo: &RepoId, number: u64, labels: &[String]) -> Result<()> {
        let number = number.to_string();
        let url = self.repo_endpoint(repo, &["issues", &number, "labels"])?;
        let _: Value = self
            .call(Method::POST, url, Some(&json!({ "labels": labels })))
            .await?;
        Ok(())
    }

    async fn request_reviewers(
        &self,
        repo: &RepoId,
        number: u64,
        reviewers: &[String],
    ) -> Result<()> {
        let number = number.to_string();
        let url = self.repo_endpoint(repo, &["pulls", &number, "requested_reviewers"])?;
        let _: Value = self
            .call(Method::POST, url, Some(&json!({ "reviewers": reviewers })))
            .await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "github"
    }
}
