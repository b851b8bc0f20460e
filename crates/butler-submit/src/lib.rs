//! Branch and pull request construction against a hosted Git API
//!
//! This crate turns a validated batch of edits into exactly one commit on a
//! branch of a remote repository, then opens or refreshes the pull request
//! for that branch. The remote is abstracted behind the [`RemoteRepo`]
//! trait, with a GitHub REST implementation and an in-memory one for tests.
//!
//! Pieces, leaves first:
//! - [`edit`]: the tagged edit model and its wire form
//! - [`branch`]: resolving the commit new edits are parented on
//! - [`commit`]: building the single tree/commit pair for a batch
//! - [`review`]: finding or creating the pull request
//! - [`pipeline`]: the four steps above in order

pub mod branch;
pub mod commit;
pub mod config;
pub mod edit;
pub mod github;
pub mod memory;
pub mod pipeline;
pub mod remote;
pub mod review;

pub use branch::{
    base_head, create_branch_at, resolve_head, validate_branch_name, BranchStrategy,
    ResolvedBranch,
};
pub use commit::{
    commit_batch, commit_staged, stage_batch, CommitOutcome, SkipReason, SkippedEdit,
    StagedBatch,
};
pub use config::GitHubConfig;
pub use edit::{validate_batch, EditOperation, EditSpec, Encoding, WriteMode};
pub use github::{GitHubAuth, GitHubClient};
pub use memory::MemoryRemote;
pub use pipeline::{ApplyOutcome, ApplyPipeline, ApplyPlan};
pub use remote::{
    FileLookup, NewPullRequest, PullRequest, RemoteRepo, RepoId, Result, SubmitError, TreeEntry,
};
pub use review::{reconcile_pr, FollowupFailure, FollowupStep, ReviewOutcome, ReviewRequest};
