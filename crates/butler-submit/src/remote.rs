//! Core RemoteRepo trait and shared types

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during submit operations
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Branch already exists: {branch}")]
    BranchExists { branch: String },

    #[error("No change: none of the edits modified the branch")]
    NoChange,

    #[error("Remote API error ({status}): {message}")]
    Remote { status: u16, message: String },

    #[error("HTTP transport error: {0}")]
    Http(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Malformed remote response: {0}")]
    Decode(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

pub type Result<T> = std::result::Result<T, SubmitError>;

/// A repository on the remote host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoId {
    pub owner: String,
    pub name: String,
}

impl RepoId {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for RepoId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// What a path resolves to at a given ref.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileLookup {
    /// A regular file with these bytes.
    File(Vec<u8>),
    /// The path exists but is a directory, submodule or symlink.
    NotAFile,
    /// Nothing at this path.
    Missing,
}

/// One changed path in a new tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub path: String,
    pub content: Vec<u8>,
}

/// A pull request as the remote reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    pub head: String,
    pub base: String,
}

/// Parameters for opening a pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPullRequest {
    pub head: String,
    pub base: String,
    pub title: String,
    pub body: String,
}

/// Hosted Git API surface used by the gateway.
///
/// Implementations must report a missing ref as [`SubmitError::NotFound`]
/// and a ref-creation collision as [`SubmitError::BranchExists`]; the branch
/// resolver relies on telling those apart from every other failure.
#[async_trait]
pub trait RemoteRepo: Send + Sync {
    /// Current HEAD commit of `branch`.
    async fn branch_head(&self, repo: &RepoId, branch: &str) -> Result<String>;

    /// Create `branch` pointing at `sha`.
    async fn create_branch(&self, repo: &RepoId, branch: &str, sha: &str) -> Result<()>;

    /// Move `branch` to `sha`.
    async fn update_branch(&self, repo: &RepoId, branch: &str, sha: &str, force: bool)
        -> Result<()>;

    /// Tree SHA of a commit.
    async fn commit_tree(&self, repo: &RepoId, commit_sha: &str) -> Result<String>;

    /// Read `path` at `git_ref` (branch name or commit SHA).
    async fn read_file(&self, repo: &RepoId, path: &str, git_ref: &str) -> Result<FileLookup>;

    /// Create a tree layered on `base_tree` with `entries` overlaid.
    async fn create_tree(&self, repo: &RepoId, base_tree: &str, entries: &[TreeEntry])
        -> Result<String>;

    /// Create a commit object. Does not move any ref.
    async fn create_commit(
        &self,
        repo: &RepoId,
        message: &str,
        tree_sha: &str,
        parent_sha: &str,
    ) -> Result<String>;

    /// Open pull requests from `head` into `base`.
    async fn list_open_pulls(&self, repo: &RepoId, head: &str, base: &str)
        -> Result<Vec<PullRequest>>;

    async fn create_pull(&self, repo: &RepoId, pull: &NewPullRequest) -> Result<PullRequest>;

    async fn update_pull(
        &self,
        repo: &RepoId,
        number: u64,
        title: &str,
        body: &str,
    ) -> Result<PullRequest>;

    async fn add_labels(&self, repo: &RepoId, number: u64, labels: &[String]) -> Result<()>;

    async fn request_reviewers(&self, repo: &RepoId, number: u64, reviewers: &[String])
        -> Result<()>;

    /// Remote display name (for logs)
    fn name(&self) -> &str;
}
