//! Branch resolution: which commit a batch is parented on

use serde::{Deserialize, Serialize};

use crate::remote::{RemoteRepo, RepoId, Result, SubmitError};

/// What to do when the target branch already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchStrategy {
    /// Fail with `BranchExists` if the branch is already there.
    #[default]
    #[serde(alias = "create-new", alias = "create_new")]
    Create,
    /// Build on the existing branch, creating it from base if missing.
    Reuse,
}

/// Result of resolving a branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBranch {
    pub head_sha: String,
    /// Whether this call created the branch.
    pub created: bool,
}

/// Determine the commit new edits must be parented on.
///
/// Under [`BranchStrategy::Create`] the ref creation itself is the
/// collision check: of two racing callers exactly one succeeds.
pub async fn resolve_head(
    remote: &dyn RemoteRepo,
    repo: &RepoId,
    branch: &str,
    base: &str,
    strategy: BranchStrategy,
) -> Result<ResolvedBranch> {
    match strategy {
        BranchStrategy::Create => create_from_base(remote, repo, branch, base).await,
        BranchStrategy::Reuse => match remote.branch_head(repo, branch).await {
            Ok(head_sha) => {
                tracing::info!("reusing branch {} at {}", branch, short(&head_sha));
                Ok(ResolvedBranch {
                    head_sha,
                    created: false,
                })
            }
            Err(SubmitError::NotFound(_)) => {
                match create_from_base(remote, repo, branch, base).await {
                    // Someone else created it between our read and our create.
                    Err(SubmitError::BranchExists { .. }) => {
                        let head_sha = remote.branch_head(repo, branch).await?;
                        Ok(ResolvedBranch {
                            head_sha,
                            created: false,
                        })
                    }
                    other => other,
                }
            }
            Err(e) => Err(e),
        },
    }
}

async fn create_from_base(
    remote: &dyn RemoteRepo,
    repo: &RepoId,
    branch: &str,
    base: &str,
) -> Result<ResolvedBranch> {
    let base_sha = base_head(remote, repo, base).await?;
    create_branch_at(remote, repo, branch, &base_sha).await
}

/// Tip of the base branch; a missing base is reported by name.
pub async fn base_head(remote: &dyn RemoteRepo, repo: &RepoId, base: &str) -> Result<String> {
    match remote.branch_head(repo, base).await {
        Ok(sha) => Ok(sha),
        Err(SubmitError::NotFound(_)) => Err(SubmitError::NotFound(format!(
            "base branch '{}' does not exist in {}",
            base, repo
        ))),
        Err(e) => Err(e),
    }
}

/// Create `branch` at `sha`. Fails with `BranchExists` if the ref is taken.
pub async fn create_branch_at(
    remote: &dyn RemoteRepo,
    repo: &RepoId,
    branch: &str,
    sha: &str,
) -> Result<ResolvedBranch> {
    tracing::info!("creating branch {} at {}", branch, short(sha));
    remote.create_branch(repo, branch, sha).await?;
    Ok(ResolvedBranch {
        head_sha: sha.to_string(),
        created: true,
    })
}

/// Reject names the remote would refuse or that read as options/paths.
pub fn validate_branch_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| {
        Err(SubmitError::InvalidInput(format!(
            "invalid branch name '{}': {}",
            name, reason
        )))
    };

    if name.trim().is_empty() {
        return invalid("must not be empty");
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return invalid("must not contain whitespace");
    }
    if name.contains("..") || name.contains("//") || name.contains("@{") {
        return invalid("contains a forbidden sequence");
    }
    if name.starts_with('-') || name.starts_with('/') || name.ends_with('/') {
        return invalid("must not start with '-' or '/' or end with '/'");
    }
    if name.ends_with(".lock") || name.ends_with('.') {
        return invalid("must not end with '.lock' or '.'");
    }
    if name
        .chars()
        .any(|c| matches!(c, '~' | '^' | ':' | '?' | '*' | '[' | '\\'))
    {
        return invalid("contains a character git does not allow");
    }
    Ok(())
}

fn short(sha: &str) -> &str {
    sha.get(..8).unwrap_or(sha)
}
