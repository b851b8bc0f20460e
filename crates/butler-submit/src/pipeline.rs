//! Apply pipeline: resolve branch → drop create-on-existing → stage → commit → PR
//!
//! Under create-new the batch is staged against the base tip before the ref
//! is created, so a batch that changes nothing leaves no branch behind.

use std::sync::Arc;

use crate::branch::{base_head, create_branch_at, resolve_head, BranchStrategy};
use crate::commit::{
    commit_staged, stage_batch, CommitOutcome, SkipReason, SkippedEdit, StagedBatch,
};
use crate::edit::{EditOperation, WriteMode};
use crate::remote::{FileLookup, RemoteRepo, RepoId, Result, SubmitError};
use crate::review::{reconcile_pr, ReviewOutcome, ReviewRequest};

/// A validated `/apply` request. Paths have already passed the gate.
#[derive(Debug, Clone)]
pub struct ApplyPlan {
    pub repo: RepoId,
    pub branch: String,
    pub base: String,
    pub strategy: BranchStrategy,
    pub title: String,
    /// Generated from the changed paths when absent.
    pub body: Option<String>,
    pub edits: Vec<EditOperation>,
    pub labels: Vec<String>,
    pub reviewers: Vec<String>,
}

/// Everything a successful apply produced.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub branch: String,
    pub branch_created: bool,
    pub commit: CommitOutcome,
    pub review: ReviewOutcome,
}

pub struct ApplyPipeline {
    remote: Arc<dyn RemoteRepo>,
}

impl ApplyPipeline {
    pub fn new(remote: Arc<dyn RemoteRepo>) -> Self {
        Self { remote }
    }

    pub fn remote(&self) -> &dyn RemoteRepo {
        self.remote.as_ref()
    }

    pub async fn apply(&self, mut plan: ApplyPlan) -> Result<ApplyOutcome> {
        let remote = self.remote.as_ref();
        tracing::info!(
            "applying {} edit(s) to {}:{} via {}",
            plan.edits.len(),
            plan.repo,
            plan.branch,
            remote.name()
        );

        let submitted = std::mem::take(&mut plan.edits);
        let (resolved, staged) = match plan.strategy {
            BranchStrategy::Create => {
                let base_sha = base_head(remote, &plan.repo, &plan.base).await?;
                let staged = match prepare(remote, &plan.repo, &base_sha, submitted).await {
                    // A taken name still reports as a collision.
                    Err(SubmitError::NoChange) => {
                        return match remote.branch_head(&plan.repo, &plan.branch).await {
                            Ok(_) => Err(SubmitError::BranchExists {
                                branch: plan.branch.clone(),
                            }),
                            Err(SubmitError::NotFound(_)) => Err(SubmitError::NoChange),
                            Err(e) => Err(e),
                        };
                    }
                    other => other?,
                };
                let resolved =
                    create_branch_at(remote, &plan.repo, &plan.branch, &base_sha).await?;
                (resolved, staged)
            }
            BranchStrategy::Reuse => {
                let resolved = resolve_head(
                    remote,
                    &plan.repo,
                    &plan.branch,
                    &plan.base,
                    BranchStrategy::Reuse,
                )
                .await?;
                let staged = prepare(remote, &plan.repo, &resolved.head_sha, submitted).await?;
                (resolved, staged)
            }
        };

        let commit = commit_staged(
            remote,
            &plan.repo,
            &plan.branch,
            &resolved.head_sha,
            staged,
        )
        .await?;

        let body = plan
            .body
            .clone()
            .filter(|b| !b.trim().is_empty())
            .unwrap_or_else(|| default_body(&plan, &commit));

        let review = reconcile_pr(
            remote,
            &plan.repo,
            &ReviewRequest {
                head: plan.branch.clone(),
                base: plan.base.clone(),
                title: plan.title.clone(),
                body,
                labels: plan.labels.clone(),
                reviewers: plan.reviewers.clone(),
            },
        )
        .await?;

        Ok(ApplyOutcome {
            branch: plan.branch,
            branch_created: resolved.created,
            commit,
            review,
        })
    }
}

/// Drop create-on-existing writes, then stage what is left at `read_sha`.
///
/// Skips are reported against positions in the submitted batch.
async fn prepare(
    remote: &dyn RemoteRepo,
    repo: &RepoId,
    read_sha: &str,
    edits: Vec<EditOperation>,
) -> Result<StagedBatch> {
    let (kept, mut skipped) = drop_existing_creates(remote, repo, read_sha, edits).await?;
    let (positions, edits): (Vec<usize>, Vec<EditOperation>) = kept.into_iter().unzip();

    let mut staged = stage_batch(remote, repo, read_sha, &edits).await?;
    for skip in &mut staged.skipped {
        skip.index = positions[skip.index];
    }
    skipped.append(&mut staged.skipped);
    skipped.sort_by_key(|s| s.index);
    staged.skipped = skipped;
    Ok(staged)
}

/// Drop `create` writes whose path already exists at `head_sha`.
///
/// Returns the surviving edits tagged with their original positions.
async fn drop_existing_creates(
    remote: &dyn RemoteRepo,
    repo: &RepoId,
    head_sha: &str,
    edits: Vec<EditOperation>,
) -> Result<(Vec<(usize, EditOperation)>, Vec<SkippedEdit>)> {
    let mut kept = Vec::with_capacity(edits.len());
    let mut skipped = Vec::new();

    for (index, edit) in edits.into_iter().enumerate() {
        if let EditOperation::Write {
            path,
            mode: WriteMode::Create,
            ..
        } = &edit
        {
            if remote.read_file(repo, path, head_sha).await? != FileLookup::Missing {
                tracing::info!("{} already exists, skipping create", path);
                skipped.push(SkippedEdit {
                    index,
                    path: path.clone(),
                    reason: SkipReason::AlreadyExists,
                });
                continue;
            }
        }
        kept.push((index, edit));
    }

    Ok((kept, skipped))
}

fn default_body(plan: &ApplyPlan, commit: &CommitOutcome) -> String {
    let files = commit
        .changed
        .iter()
        .map(|p| format!("- `{}`", p))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "## Summary\n\n{}\n\n## Changes\n\n{} file(s) changed in `{}`:\n\n{}\n\n---\n\nOpened by butler",
        plan.title,
        commit.changed.len(),
        commit.commit_sha,
        files
    )
}
