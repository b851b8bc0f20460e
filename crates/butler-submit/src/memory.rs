//! In-memory remote for tests and local dry runs
//!
//! Models just enough of a hosted Git API to exercise branch resolution,
//! commit construction and pull request reconciliation: refs, flat trees,
//! commits and pull requests. Object ids are sequential 40-char hex strings.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::remote::{
    FileLookup, NewPullRequest, PullRequest, RemoteRepo, RepoId, Result, SubmitError, TreeEntry,
};

type Tree = BTreeMap<String, Vec<u8>>;

#[derive(Debug, Clone)]
struct CommitObject {
    tree: String,
    parent: Option<String>,
    message: String,
}

#[derive(Debug, Clone)]
struct StoredPull {
    pull: PullRequest,
    open: bool,
    labels: Vec<String>,
    reviewers: Vec<String>,
}

#[derive(Debug, Default)]
struct RepoState {
    refs: HashMap<String, String>,
    commits: HashMap<String, CommitObject>,
    trees: HashMap<String, Tree>,
    pulls: Vec<StoredPull>,
}

#[derive(Debug, Default)]
struct Inner {
    repos: HashMap<RepoId, RepoState>,
    next_id: u64,
    failures: HashMap<String, VecDeque<u16>>,
    // (repo, branch) -> branch whose tip a concurrent writer copies
    pending_creates: HashMap<(RepoId, String), String>,
    calls: Vec<String>,
}

impl Inner {
    fn next_sha(&mut self) -> String {
        self.next_id += 1;
        format!("{:040x}", self.next_id)
    }

    fn repo(&mut self, repo: &RepoId) -> Result<&mut RepoState> {
        self.repos
            .get_mut(repo)
            .ok_or_else(|| SubmitError::NotFound(format!("repository {}", repo)))
    }
}

/// Remote backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    inner: Mutex<Inner>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// A remote holding one repository whose `branch` has a single commit
    /// containing `files`.
    pub fn seeded(repo: &RepoId, branch: &str, files: &[(&str, &str)]) -> Self {
        let remote = Self::new();
        {
            let mut inner = remote.lock();
            let tree_sha = inner.next_sha();
            let commit_sha = inner.next_sha();
            let tree: Tree = files
                .iter()
                .map(|(p, c)| (p.to_string(), c.as_bytes().to_vec()))
                .collect();
            let state = inner.repos.entry(repo.clone()).or_default();
            state.trees.insert(tree_sha.clone(), tree);
            state.commits.insert(
                commit_sha.clone(),
                CommitObject {
                    tree: tree_sha,
                    parent: None,
                    message: "Initial commit".to_string(),
                },
            );
            state.refs.insert(branch.to_string(), commit_sha);
        }
        remote
    }

    /// Make the next call to `operation` fail with `status`.
    pub fn fail_next(&self, operation: &str, status: u16) {
        self.lock()
            .failures
            .entry(operation.to_string())
            .or_default()
            .push_back(status);
    }

    /// The next time `branch_head` reports `branch` missing, another writer
    /// creates it at the tip of `from` right after the read.
    pub fn create_after_next_miss(&self, repo: &RepoId, branch: &str, from: &str) {
        self.lock()
            .pending_creates
            .insert((repo.clone(), branch.to_string()), from.to_string());
    }

    /// Every trait method invoked so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Number of calls that created or changed remote state.
    pub fn mutation_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| {
                c.starts_with("create_")
                    || c.starts_with("update_")
                    || c.starts_with("add_")
                    || c.starts_with("request_")
            })
            .count()
    }

    /// File content at the tip of `branch`, if the path is a file there.
    pub fn file_at(&self, repo: &RepoId, branch: &str, path: &str) -> Option<Vec<u8>> {
        let inner = self.lock();
        let state = inner.repos.get(repo)?;
        let commit = state.commits.get(state.refs.get(branch)?)?;
        state.trees.get(&commit.tree)?.get(path).cloned()
    }

    /// Message of the commit at the tip of `branch`.
    pub fn head_message(&self, repo: &RepoId, branch: &str) -> Option<String> {
        let inner = self.lock();
        let state = inner.repos.get(repo)?;
        state
            .commits
            .get(state.refs.get(branch)?)
            .map(|c| c.message.clone())
    }

    /// All pull requests, open or not.
    pub fn pulls(&self, repo: &RepoId) -> Vec<PullRequest> {
        self.lock()
            .repos
            .get(repo)
            .map(|s| s.pulls.iter().map(|p| p.pull.clone()).collect())
            .unwrap_or_default()
    }

    pub fn labels_of(&self, repo: &RepoId, number: u64) -> Vec<String> {
        self.stored_pull(repo, number)
            .map(|p| p.labels)
            .unwrap_or_default()
    }

    pub fn reviewers_of(&self, repo: &RepoId, number: u64) -> Vec<String> {
        self.stored_pull(repo, number)
            .map(|p| p.reviewers)
            .unwrap_or_default()
    }

    fn stored_pull(&self, repo: &RepoId, number: u64) -> Option<StoredPull> {
        self.lock()
            .repos
            .get(repo)?
            .pulls
            .iter()
            .find(|p| p.pull.number == number)
            .cloned()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record the call and surface an injected failure, if one is queued.
    fn enter(&self, operation: &str) -> Result<MutexGuard<'_, Inner>> {
        let mut inner = self.lock();
        inner.calls.push(operation.to_string());
        if let Some(status) = inner
            .failures
            .get_mut(operation)
            .and_then(|queue| queue.pop_front())
        {
            return Err(SubmitError::Remote {
                status,
                message: format!("injected failure in {}", operation),
            });
        }
        Ok(inner)
    }
}

fn resolve_tree<'a>(state: &'a RepoState, git_ref: &str) -> Result<&'a Tree> {
    let commit_sha = state
        .refs
        .get(git_ref)
        .map(String::as_str)
        .unwrap_or(git_ref);
    let commit = state
        .commits
        .get(commit_sha)
        .ok_or_else(|| SubmitError::NotFound(format!("ref {}", git_ref)))?;
    state
        .trees
        .get(&commit.tree)
        .ok_or_else(|| SubmitError::NotFound(format!("tree {}", commit.tree)))
}

#[async_trait]
impl RemoteRepo for MemoryRemote {
    async fn branch_head(&self, repo: &RepoId, branch: &str) -> Result<String> {
        let mut inner = self.enter("branch_head")?;
        if let Some(sha) = inner.repo(repo)?.refs.get(branch).cloned() {
            return Ok(sha);
        }
        let racing = inner
            .pending_creates
            .remove(&(repo.clone(), branch.to_string()));
        if let Some(from) = racing {
            let state = inner.repo(repo)?;
            if let Some(sha) = state.refs.get(&from).cloned() {
                state.refs.insert(branch.to_string(), sha);
            }
        }
        Err(SubmitError::NotFound(format!("branch {}", branch)))
    }

    async fn create_branch(&self, repo: &RepoId, branch: &str, sha: &str) -> Result<()> {
        let mut inner = self.enter("create_branch")?;
        let state = inner.repo(repo)?;
        if state.refs.contains_key(branch) {
            return Err(SubmitError::BranchExists {
                branch: branch.to_string(),
            });
        }
        state.refs.insert(branch.to_string(), sha.to_string());
        Ok(())
    }

    async fn update_branch(
        &self,
        repo: &RepoId,
        branch: &str,
        sha: &str,
        force: bool,
    ) -> Result<()> {
        let mut inner = self.enter("update_branch")?;
        let state = inner.repo(repo)?;
        let current = state
            .refs
            .get(branch)
            .cloned()
            .ok_or_else(|| SubmitError::NotFound(format!("branch {}", branch)))?;
        if !force {
            let parent = state.commits.get(sha).and_then(|c| c.parent.clone());
            if parent.as_deref() != Some(current.as_str()) {
                return Err(SubmitError::Remote {
                    status: 422,
                    message: "Update is not a fast forward".to_string(),
                });
            }
        }
        state.refs.insert(branch.to_string(), sha.to_string());
        Ok(())
    }

    async fn commit_tree(&self, repo: &RepoId, commit_sha: &str) -> Result<String> {
        let mut inner = self.enter("commit_tree")?;
        let state = inner.repo(repo)?;
        let tree = state
            .commits
            .get(commit_sha)
            .map(|c| c.tree.clone())
            .ok_or_else(|| SubmitError::NotFound(format!("commit {}", commit_sha)));
        tree
    }

    async fn read_file(&self, repo: &RepoId, path: &str, git_ref: &str) -> Result<FileLookup> {
        let mut inner = self.enter("read_file")?;
        let tree = resolve_tree(inner.repo(repo)?, git_ref)?;
        if let Some(content) = tree.get(path) {
            return Ok(FileLookup::File(content.clone()));
        }
        let dir_prefix = format!("{}/", path.trim_end_matches('/'));
        if tree.keys().any(|k| k.starts_with(&dir_prefix)) {
            return Ok(FileLookup::NotAFile);
        }
        Ok(FileLookup::Missing)
    }

    async fn create_tree(
        &self,
        repo: &RepoId,
        base_tree: &str,
        entries: &[TreeEntry],
    ) -> Result<String> {
        let mut inner = self.enter("create_tree")?;
        let sha = inner.next_sha();
        let state = inner.repo(repo)?;
        let mut tree = state
            .trees
            .get(base_tree)
            .cloned()
            .ok_or_else(|| SubmitError::NotFound(format!("tree {}", base_tree)))?;
        for entry in entries {
            tree.insert(entry.path.clone(), entry.content.clone());
        }
        state.trees.insert(sha.clone(), tree);
        Ok(sha)
    }

    async fn create_commit(
        &self,
        repo: &RepoId,
        message: &str,
        tree_sha: &str,
        parent_sha: &str,
    ) -> Result<String> {
        let mut inner = self.enter("create_commit")?;
        let sha = inner.next_sha();
        let state = inner.repo(repo)?;
        if !state.trees.contains_key(tree_sha) {
            return Err(SubmitError::NotFound(format!("tree {}", tree_sha)));
        }
        state.commits.insert(
            sha.clone(),
            CommitObject {
                tree: tree_sha.to_string(),
                parent: Some(parent_sha.to_string()),
                message: message.to_string(),
            },
        );
        Ok(sha)
    }

    async fn list_open_pulls(
        &self,
        repo: &RepoId,
        head: &str,
        base: &str,
    ) -> Result<Vec<PullRequest>> {
        let mut inner = self.enter("list_open_pulls")?;
        let state = inner.repo(repo)?;
        let open: Vec<PullRequest> = state
            .pulls
            .iter()
            .filter(|p| p.open && p.pull.head == head && p.pull.base == base)
            .map(|p| p.pull.clone())
            .collect();
        Ok(open)
    }

    async fn create_pull(&self, repo: &RepoId, pull: &NewPullRequest) -> Result<PullRequest> {
        let mut inner = self.enter("create_pull")?;
        let state = inner.repo(repo)?;
        if !state.refs.contains_key(&pull.head) {
            return Err(SubmitError::Remote {
                status: 422,
                message: format!("head branch {} does not exist", pull.head),
            });
        }
        if state
            .pulls
            .iter()
            .any(|p| p.open && p.pull.head == pull.head && p.pull.base == pull.base)
        {
            return Err(SubmitError::Remote {
                status: 422,
                message: format!("A pull request already exists for {}", pull.head),
            });
        }
        let number = state.pulls.len() as u64 + 1;
        let created = PullRequest {
            number,
            url: format!(
                "https://github.test/{}/{}/pull/{}",
                repo.owner, repo.name, number
            ),
            title: pull.title.clone(),
            body: Some(pull.body.clone()),
            head: pull.head.clone(),
            base: pull.base.clone(),
        };
        state.pulls.push(StoredPull {
            pull: created.clone(),
            open: true,
            labels: Vec::new(),
            reviewers: Vec::new(),
        });
        Ok(created)
    }

    async fn update_pull(
        &self,
        repo: &RepoId,
        number: u64,
        title: &str,
        body: &str,
    ) -> Result<PullRequest> {
        let mut inner = self.enter("update_pull")?;
        let state = inner.repo(repo)?;
        let stored = state
            .pulls
            .iter_mut()
            .find(|p| p.pull.number == number)
            .ok_or_else(|| SubmitError::NotFound(format!("pull request #{}", number)))?;
        stored.pull.title = title.to_string();
        stored.pull.body = Some(body.to_string());
        let updated = stored.pull.clone();
        Ok(updated)
    }

    async fn add_labels(&self, repo: &RepoId, number: u64, labels: &[String]) -> Result<()> {
        let mut inner = self.enter("add_labels")?;
        let state = inner.repo(repo)?;
        let stored = state
            .pulls
            .iter_mut()
            .find(|p| p.pull.number == number)
            .ok_or_else(|| SubmitError::NotFound(format!("pull request #{}", number)))?;
        for label in labels {
            if !stored.labels.contains(label) {
                stored.labels.push(label.clone());
            }
        }
        Ok(())
    }

    async fn request_reviewers(
        &self,
        repo: &RepoId,
        number: u64,
        reviewers: &[String],
    ) -> Result<()> {
        let mut inner = self.enter("request_reviewers")?;
        let state = inner.repo(repo)?;
        let stored = state
            .pulls
            .iter_mut()
            .find(|p| p.pull.number == number)
            .ok_or_else(|| SubmitError::NotFound(format!("pull request #{}", number)))?;
        stored.reviewers.extend(reviewers.iter().cloned());
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
