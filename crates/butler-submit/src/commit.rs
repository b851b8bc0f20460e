//! Batch committer: one commit per batch of edits
//!
//! Entries are computed in memory first and only then turned into a tree and
//! a commit, so a failure while evaluating edits never publishes anything.
//! A ref update failing after the commit object exists leaves an
//! unreferenced commit behind, which the remote garbage collects.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::edit::{EditOperation, WriteMode};
use crate::remote::{FileLookup, RemoteRepo, RepoId, Result, SubmitError, TreeEntry};

/// Why an edit did not produce a tree entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The edit would leave the file byte-identical.
    Unchanged,
    /// The path is a directory or other non-file object, or is absent.
    NotAFile,
    /// Search/replace needs text and the file is not UTF-8.
    NotUtf8,
    /// A `create` write whose path already exists.
    AlreadyExists,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedEdit {
    /// Position of the edit in the submitted batch.
    pub index: usize,
    pub path: String,
    pub reason: SkipReason,
}

/// Result of a successful batch commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    pub commit_sha: String,
    pub tree_sha: String,
    /// Paths carried in the new tree, sorted.
    pub changed: Vec<String>,
    pub skipped: Vec<SkippedEdit>,
}

/// Edits evaluated against a snapshot, ready to become one commit.
#[derive(Debug, Clone)]
pub struct StagedBatch {
    entries: Vec<TreeEntry>,
    edit_count: usize,
    pub skipped: Vec<SkippedEdit>,
}

impl StagedBatch {
    /// Paths the commit will carry, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.path.clone()).collect()
    }
}

/// Evaluate `edits` against the commit `read_sha` without writing anything.
///
/// Edits see the pending content of earlier edits in the same batch; for a
/// path not yet touched in the batch, content is read at `read_sha`. Fails
/// with [`SubmitError::NoChange`] when no edit changes anything.
pub async fn stage_batch(
    remote: &dyn RemoteRepo,
    repo: &RepoId,
    read_sha: &str,
    edits: &[EditOperation],
) -> Result<StagedBatch> {
    let mut pending: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    let mut skipped = Vec::new();

    for (index, edit) in edits.iter().enumerate() {
        let skip = |reason: SkipReason| {
            tracing::warn!(
                "skipping edit {} on {}: {:?}",
                index,
                edit.path(),
                reason
            );
            SkippedEdit {
                index,
                path: edit.path().to_string(),
                reason,
            }
        };

        match edit {
            EditOperation::Write {
                path,
                content,
                mode,
            } => {
                let next = match mode {
                    WriteMode::Append => {
                        match current(remote, repo, read_sha, path, &pending).await? {
                            FileLookup::File(mut existing) => {
                                existing.extend_from_slice(content);
                                existing
                            }
                            FileLookup::Missing => content.clone(),
                            FileLookup::NotAFile => {
                                skipped.push(skip(SkipReason::NotAFile));
                                continue;
                            }
                        }
                    }
                    WriteMode::Create | WriteMode::Overwrite => content.clone(),
                };
                pending.insert(path.clone(), next);
            }
            EditOperation::Replace {
                path,
                search,
                replace,
                match_all,
            } => {
                let bytes = match current(remote, repo, read_sha, path, &pending).await? {
                    FileLookup::File(bytes) => bytes,
                    FileLookup::NotAFile | FileLookup::Missing => {
                        skipped.push(skip(SkipReason::NotAFile));
                        continue;
                    }
                };
                let Ok(text) = String::from_utf8(bytes) else {
                    skipped.push(skip(SkipReason::NotUtf8));
                    continue;
                };
                let replaced = if *match_all {
                    text.replace(search.as_str(), replace)
                } else {
                    text.replacen(search.as_str(), replace, 1)
                };
                if replaced == text {
                    skipped.push(skip(SkipReason::Unchanged));
                    continue;
                }
                pending.insert(path.clone(), replaced.into_bytes());
            }
        }
    }

    if pending.is_empty() {
        return Err(SubmitError::NoChange);
    }

    Ok(StagedBatch {
        entries: pending
            .into_iter()
            .map(|(path, content)| TreeEntry { path, content })
            .collect(),
        edit_count: edits.len(),
        skipped,
    })
}

/// Write `staged` as one commit on top of `parent_sha` and move `branch`
/// to it.
pub async fn commit_staged(
    remote: &dyn RemoteRepo,
    repo: &RepoId,
    branch: &str,
    parent_sha: &str,
    staged: StagedBatch,
) -> Result<CommitOutcome> {
    let base_tree = remote.commit_tree(repo, parent_sha).await?;
    let changed = staged.paths();

    let tree_sha = remote.create_tree(repo, &base_tree, &staged.entries).await?;
    let message = commit_message(branch, staged.edit_count, &changed);
    let commit_sha = remote
        .create_commit(repo, &message, &tree_sha, parent_sha)
        .await?;

    tracing::info!(
        "committed {} path(s) to {} as {}",
        changed.len(),
        branch,
        commit_sha
    );

    remote
        .update_branch(repo, branch, &commit_sha, true)
        .await?;

    Ok(CommitOutcome {
        commit_sha,
        tree_sha,
        changed,
        skipped: staged.skipped,
    })
}

/// Stage `edits` at `parent_sha` and commit them onto `branch`.
///
/// Fails with [`SubmitError::NoChange`] before any object is created when
/// no edit changes anything.
pub async fn commit_batch(
    remote: &dyn RemoteRepo,
    repo: &RepoId,
    branch: &str,
    parent_sha: &str,
    edits: &[EditOperation],
) -> Result<CommitOutcome> {
    let staged = stage_batch(remote, repo, parent_sha, edits).await?;
    commit_staged(remote, repo, branch, parent_sha, staged).await
}

/// Content of `path` as this batch currently sees it.
async fn current(
    remote: &dyn RemoteRepo,
    repo: &RepoId,
    read_sha: &str,
    path: &str,
    pending: &BTreeMap<String, Vec<u8>>,
) -> Result<FileLookup> {
    match pending.get(path) {
        Some(content) => Ok(FileLookup::File(content.clone())),
        None => remote.read_file(repo, path, read_sha).await,
    }
}

fn commit_message(branch: &str, edit_count: usize, changed: &[String]) -> String {
    let files: String = changed
        .iter()
        .map(|p| format!("- {}", p))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Apply {} edit(s) to {}\n\n{}\n\nEdits: {}\nApplied-At: {}",
        edit_count,
        branch,
        files,
        edit_count,
        Utc::now().to_rfc3339()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRemote;

    fn repo() -> RepoId {
        RepoId::new("acme", "widgets")
    }

    async fn setup(files: &[(&str, &str)]) -> (MemoryRemote, String) {
        let remote = MemoryRemote::seeded(&repo(), "main", files);
        let head = remote.branch_head(&repo(), "main").await.unwrap();
        remote.create_branch(&repo(), "work", &head).await.unwrap();
        (remote, head)
    }

    fn write(path: &str, content: &str, mode: WriteMode) -> EditOperation {
        EditOperation::Write {
            path: path.into(),
            content: content.as_bytes().to_vec(),
            mode,
        }
    }

    fn replace(path: &str, search: &str, with: &str, match_all: bool) -> EditOperation {
        EditOperation::Replace {
            path: path.into(),
            search: search.into(),
            replace: with.into(),
            match_all,
        }
    }

    fn text(remote: &MemoryRemote, path: &str) -> String {
        String::from_utf8(remote.file_at(&repo(), "work", path).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn write_creates_file_and_advances_branch() {
        let (remote, head) = setup(&[("README.md", "# w\n")]).await;
        let outcome = commit_batch(
            &remote,
            &repo(),
            "work",
            &head,
            &[write("src/hello.txt", "hi\n", WriteMode::Create)],
        )
        .await
        .unwrap();

        assert_eq!(outcome.changed, vec!["src/hello.txt"]);
        assert_eq!(
            remote.branch_head(&repo(), "work").await.unwrap(),
            outcome.commit_sha
        );
        assert_eq!(text(&remote, "src/hello.txt"), "hi\n");
        // Unmodified files are inherited from the base tree.
        assert_eq!(text(&remote, "README.md"), "# w\n");
    }

    #[tokio::test]
    async fn replace_all_and_first_only() {
        let (remote, head) = setup(&[("README.md", "foo foo")]).await;
        commit_batch(
            &remote,
            &repo(),
            "work",
            &head,
            &[replace("README.md", "foo", "bar", true)],
        )
        .await
        .unwrap();
        assert_eq!(text(&remote, "README.md"), "bar bar");

        let (remote, head) = setup(&[("README.md", "foo foo")]).await;
        commit_batch(
            &remote,
            &repo(),
            "work",
            &head,
            &[replace("README.md", "foo", "bar", false)],
        )
        .await
        .unwrap();
        assert_eq!(text(&remote, "README.md"), "bar foo");
    }

    #[tokio::test]
    async fn absent_search_is_no_change_without_creating_objects() {
        let (remote, head) = setup(&[("README.md", "hello")]).await;
        let before = remote.mutation_count();
        let err = commit_batch(
            &remote,
            &repo(),
            "work",
            &head,
            &[replace("README.md", "absent", "x", true)],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SubmitError::NoChange));
        assert_eq!(remote.mutation_count(), before);
    }

    #[tokio::test]
    async fn staging_reads_without_writing() {
        let (remote, head) = setup(&[("README.md", "foo")]).await;
        let before = remote.mutation_count();
        let staged = stage_batch(
            &remote,
            &repo(),
            &head,
            &[
                replace("README.md", "foo", "bar", true),
                write("docs/a.md", "a", WriteMode::Create),
            ],
        )
        .await
        .unwrap();
        assert_eq!(staged.paths(), vec!["README.md", "docs/a.md"]);
        assert!(staged.skipped.is_empty());
        assert_eq!(remote.mutation_count(), before);
        assert_eq!(text(&remote, "README.md"), "foo");
    }

    #[tokio::test]
    async fn second_identical_replace_is_no_change() {
        let (remote, head) = setup(&[("README.md", "foo")]).await;
        let edits = [replace("README.md", "foo", "bar", false)];
        let first = commit_batch(&remote, &repo(), "work", &head, &edits)
            .await
            .unwrap();
        let err = commit_batch(&remote, &repo(), "work", &first.commit_sha, &edits)
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::NoChange));
    }

    #[tokio::test]
    async fn replace_on_directory_or_missing_is_skipped() {
        let (remote, head) = setup(&[("src/lib.rs", "x")]).await;
        let outcome = commit_batch(
            &remote,
            &repo(),
            "work",
            &head,
            &[
                replace("src", "x", "y", true),
                replace("missing.txt", "x", "y", true),
                write("notes.txt", "n", WriteMode::Overwrite),
            ],
        )
        .await
        .unwrap();
        assert_eq!(outcome.changed, vec!["notes.txt"]);
        assert_eq!(
            outcome
                .skipped
                .iter()
                .map(|s| (s.index, s.reason))
                .collect::<Vec<_>>(),
            vec![(0, SkipReason::NotAFile), (1, SkipReason::NotAFile)]
        );
    }

    #[tokio::test]
    async fn later_edits_see_earlier_pending_content() {
        let (remote, head) = setup(&[]).await;
        let outcome = commit_batch(
            &remote,
            &repo(),
            "work",
            &head,
            &[
                write("a.txt", "one two", WriteMode::Overwrite),
                replace("a.txt", "two", "three", false),
                write("a.txt", "\nfour", WriteMode::Append),
            ],
        )
        .await
        .unwrap();
        assert_eq!(outcome.changed, vec!["a.txt"]);
        assert_eq!(text(&remote, "a.txt"), "one three\nfour");
    }

    #[tokio::test]
    async fn append_to_existing_file() {
        let (remote, head) = setup(&[("log.txt", "a\n")]).await;
        commit_batch(
            &remote,
            &repo(),
            "work",
            &head,
            &[write("log.txt", "b\n", WriteMode::Append)],
        )
        .await
        .unwrap();
        assert_eq!(text(&remote, "log.txt"), "a\nb\n");
    }

    #[tokio::test]
    async fn replace_on_binary_is_skipped() {
        let (remote, head) = setup(&[]).await;
        let outcome = commit_batch(
            &remote,
            &repo(),
            "work",
            &head,
            &[
                EditOperation::Write {
                    path: "bin".into(),
                    content: vec![0xff, 0xfe],
                    mode: WriteMode::Overwrite,
                },
                replace("bin", "a", "b", true),
            ],
        )
        .await
        .unwrap();
        assert_eq!(outcome.skipped[0].reason, SkipReason::NotUtf8);
    }

    #[tokio::test]
    async fn commit_message_has_count_and_timestamp() {
        let (remote, head) = setup(&[]).await;
        commit_batch(
            &remote,
            &repo(),
            "work",
            &head,
            &[
                write("a", "1", WriteMode::Overwrite),
                write("b", "2", WriteMode::Overwrite),
            ],
        )
        .await
        .unwrap();
        let message = remote.head_message(&repo(), "work").unwrap();
        assert!(message.starts_with("Apply 2 edit(s) to work"));
        assert!(message.contains("Applied-At: "));
    }

    #[tokio::test]
    async fn remote_failure_aborts_batch() {
        let (remote, head) = setup(&[("README.md", "foo")]).await;
        remote.fail_next("read_file", 500);
        let err = commit_batch(
            &remote,
            &repo(),
            "work",
            &head,
            &[replace("README.md", "foo", "bar", true)],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SubmitError::Remote { status: 500, .. }));
        assert_eq!(remote.branch_head(&repo(), "work").await.unwrap(), head);
    }
}
