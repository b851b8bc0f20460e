// plan.rs - Non-mutating `/plan` responses.
//
// A plan is a template the caller fills with edits before calling /apply.
// Building one never touches the remote.

use butler_policy::WORKFLOW_DIR;
use butler_submit::validate_branch_name;
use serde::{Deserialize, Serialize};

use crate::auth::{APPROVE_WORKFLOWS_HEADER, TOKEN_HEADER};
use crate::error::ApiError;

const BRANCH_PREFIX: &str = "butler/";
const MAX_TITLE_CHARS: usize = 72;
const MAX_SLUG_CHARS: usize = 48;

pub fn default_base_branch() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRequest {
    pub goal: String,
    pub repo: RepoRef,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
}

/// How `/apply` will treat the eventual submission.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanHints {
    pub endpoint: &'static str,
    pub auth_header: &'static str,
    pub allowed_paths: Vec<String>,
    pub workflow_dir: &'static str,
    pub workflow_approval_header: &'static str,
    pub edit_ops: Vec<&'static str>,
    pub branch_strategies: Vec<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanResponse {
    pub title: String,
    pub summary: String,
    pub repo: RepoRef,
    pub base_branch: String,
    pub branch: String,
    pub labels: Vec<String>,
    pub edits: Vec<serde_json::Value>,
    pub hints: PlanHints,
}

pub fn build_plan(
    request: PlanRequest,
    allowed_paths: Vec<String>,
    labels: Vec<String>,
) -> Result<PlanResponse, ApiError> {
    let goal = request.goal.trim();
    if goal.is_empty() {
        return Err(ApiError::Invalid("goal must not be empty".into()));
    }
    if request.repo.owner.trim().is_empty() || request.repo.name.trim().is_empty() {
        return Err(ApiError::Invalid("repo.owner and repo.name are required".into()));
    }
    validate_branch_name(&request.base_branch)?;

    let title: String = goal
        .lines()
        .next()
        .unwrap_or(goal)
        .chars()
        .take(MAX_TITLE_CHARS)
        .collect();

    Ok(PlanResponse {
        title: title.trim_end().to_string(),
        summary: goal.to_string(),
        repo: request.repo,
        base_branch: request.base_branch,
        branch: format!("{}{}", BRANCH_PREFIX, slugify(goal)),
        labels,
        edits: Vec::new(),
        hints: PlanHints {
            endpoint: "/apply",
            auth_header: TOKEN_HEADER,
            allowed_paths,
            workflow_dir: WORKFLOW_DIR,
            workflow_approval_header: APPROVE_WORKFLOWS_HEADER,
            edit_ops: vec!["write", "replace"],
            branch_strategies: vec!["create", "reuse"],
        },
    })
}

/// Lowercase ASCII alphanumerics separated by single dashes.
fn slugify(text: &str) -> String {
    let mut slug = String::new();
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
        if slug.len() >= MAX_SLUG_CHARS {
            break;
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "change".to_string()
    } else {
        slug.to_string()
    }
}
