//! Pull request reconciliation: at most one open PR per (head, base)

use serde::{Deserialize, Serialize};

use crate::remote::{NewPullRequest, PullRequest, RemoteRepo, RepoId, Result};

/// What the PR for a branch should look like.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReviewRequest {
    pub head: String,
    pub base: String,
    pub title: String,
    pub body: String,
    /// Applied only when the PR is created by this call.
    pub labels: Vec<String>,
    /// Requested only when the PR is created by this call.
    pub reviewers: Vec<String>,
}

/// Secondary steps that run after PR creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowupStep {
    Labels,
    Reviewers,
}

/// A follow-up step that failed. The PR itself still exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowupFailure {
    pub step: FollowupStep,
    pub message: String,
}

/// Result of reconciling a pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewOutcome {
    pub pull: PullRequest,
    /// Whether this call opened the PR (as opposed to updating one).
    pub created: bool,
    pub followup_failures: Vec<FollowupFailure>,
}

impl ReviewOutcome {
    pub fn url(&self) -> &str {
        &self.pull.url
    }
}

/// Update the open PR for `head` → `base` in place, or open one.
///
/// A failure to list PRs is not fatal: creation is attempted directly.
/// Label and reviewer failures are recorded, never propagated.
pub async fn reconcile_pr(
    remote: &dyn RemoteRepo,
    repo: &RepoId,
    request: &ReviewRequest,
) -> Result<ReviewOutcome> {
    let existing = match remote
        .list_open_pulls(repo, &request.head, &request.base)
        .await
    {
        Ok(pulls) => pulls.into_iter().next(),
        Err(e) => {
            tracing::warn!(
                "listing pull requests for {} failed, creating directly: {}",
                request.head,
                e
            );
            None
        }
    };

    if let Some(pull) = existing {
        tracing::info!("updating pull request #{} for {}", pull.number, request.head);
        let pull = remote
            .update_pull(repo, pull.number, &request.title, &request.body)
            .await?;
        return Ok(ReviewOutcome {
            pull,
            created: false,
            followup_failures: Vec::new(),
        });
    }

    tracing::info!("opening pull request {} -> {}", request.head, request.base);
    let pull = remote
        .create_pull(
            repo,
            &NewPullRequest {
                head: request.head.clone(),
                base: request.base.clone(),
                title: request.title.clone(),
                body: request.body.clone(),
            },
        )
        .await?;

    let mut followup_failures = Vec::new();

    if !request.labels.is_empty() {
        if let Err(e) = remote.add_labels(repo, pull.number, &request.labels).await {
            tracing::warn!("labeling pull request #{} failed: {}", pull.number, e);
            followup_failures.push(FollowupFailure {
                step: FollowupStep::Labels,
                message: e.to_string(),
            });
        }
    }

    if !request.reviewers.is_empty() {
        if let Err(e) = remote
            .request_reviewers(repo, pull.number, &request.reviewers)
            .await
        {
            tracing::warn!(
                "requesting reviewers on pull request #{} failed: {}",
                pull.number,
                e
            );
            followup_failures.push(FollowupFailure {
                step: FollowupStep::Reviewers,
                message: e.to_string(),
            });
        }
    }

    Ok(ReviewOutcome {
        pull,
        created: true,
        followup_failures,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRemote;
    use crate::remote::SubmitError;

    fn repo() -> RepoId {
        RepoId::new("acme", "widgets")
    }

    async fn remote_with_branch() -> MemoryRemote {
        let remote = MemoryRemote::seeded(&repo(), "main", &[]);
        let head = remote.branch_head(&repo(), "main").await.unwrap();
        remote.create_branch(&repo(), "work", &head).await.unwrap();
        remote
    }

    fn request(title: &str) -> ReviewRequest {
        ReviewRequest {
            head: "work".into(),
            base: "main".into(),
            title: title.into(),
            body: "body".into(),
            labels: vec!["automation".into()],
            reviewers: vec!["octocat".into()],
        }
    }

    #[tokio::test]
    async fn creates_then_updates_in_place() {
        let remote = remote_with_branch().await;

        let first = reconcile_pr(&remote, &repo(), &request("First")).await.unwrap();
        assert!(first.created);
        assert!(first.followup_failures.is_empty());
        assert_eq!(remote.labels_of(&repo(), first.pull.number), vec!["automation"]);
        assert_eq!(remote.reviewers_of(&repo(), first.pull.number), vec!["octocat"]);

        let second = reconcile_pr(&remote, &repo(), &request("Second")).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.pull.number, first.pull.number);
        assert_eq!(second.url(), first.url());
        assert_eq!(second.pull.title, "Second");
        assert_eq!(remote.pulls(&repo()).len(), 1);
    }

    #[tokio::test]
    async fn update_does_not_touch_labels_or_reviewers() {
        let remote = remote_with_branch().await;
        reconcile_pr(&remote, &repo(), &request("First")).await.unwrap();
        let before = remote
            .calls()
            .iter()
            .filter(|c| *c == "add_labels")
            .count();
        reconcile_pr(&remote, &repo(), &request("Again")).await.unwrap();
        let after = remote
            .calls()
            .iter()
            .filter(|c| *c == "add_labels")
            .count();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn listing_failure_falls_back_to_create() {
        let remote = remote_with_branch().await;
        remote.fail_next("list_open_pulls", 403);
        let outcome = reconcile_pr(&remote, &repo(), &request("T")).await.unwrap();
        assert!(outcome.created);
    }

    #[tokio::test]
    async fn followup_failures_are_reported_not_fatal() {
        let remote = remote_with_branch().await;
        remote.fail_next("add_labels", 422);
        remote.fail_next("request_reviewers", 422);
        let outcome = reconcile_pr(&remote, &repo(), &request("T")).await.unwrap();
        assert!(outcome.created);
        let steps: Vec<FollowupStep> = outcome.followup_failures.iter().map(|f| f.step).collect();
        assert_eq!(steps, vec![FollowupStep::Labels, FollowupStep::Reviewers]);
    }

    #[tokio::test]
    async fn create_failure_propagates() {
        let remote = remote_with_branch().await;
        remote.fail_next("create_pull", 500);
        let err = reconcile_pr(&remote, &repo(), &request("T")).await.unwrap_err();
        assert!(matches!(err, SubmitError::Remote { status: 500, .. }));
    }
}
