// api.rs - HTTP routes.
//
// Handlers authenticate first, then parse, then validate and gate the whole
// batch before the first remote call. Everything after the gate runs inside
// the per-request deadline.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use butler_policy::{PathGate, PolicyDecision, PolicyError, PolicyStore};
use butler_submit::{
    validate_batch, validate_branch_name, ApplyOutcome, ApplyPipeline, ApplyPlan, BranchStrategy,
    EditSpec, FollowupStep, RemoteRepo, RepoId, SkippedEdit,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::Instrument;
use uuid::Uuid;

use crate::auth::{authorize, workflow_approved};
use crate::config::{ServerConfig, ServerSection};
use crate::error::ApiError;
use crate::plan::{build_plan, default_base_branch, PlanRequest, PlanResponse, RepoRef};

const GITHUB_TOOL: &str = "github";

/// Shared, read-only handler state.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Shared>,
}

struct Shared {
    config: ServerConfig,
    gate: PathGate,
    pipeline: ApplyPipeline,
    policies: PolicyStore,
    started: Instant,
}

impl AppState {
    pub fn new(config: ServerConfig, remote: Arc<dyn RemoteRepo>) -> Result<Self, PolicyError> {
        let gate = PathGate::new(&config.server.allowed_paths)?;
        let policies = match &config.server.policy_file {
            Some(path) => PolicyStore::new(path),
            None => PolicyStore::empty(),
        };
        Ok(Self {
            inner: Arc::new(Shared {
                config,
                gate,
                pipeline: ApplyPipeline::new(remote),
                policies,
                started: Instant::now(),
            }),
        })
    }

    fn config(&self) -> &ServerConfig {
        &self.inner.config
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/apply", post(apply))
        .route("/plan", post(plan))
        .route("/run", post(run))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Wire types ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyRequest {
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub repo: Option<String>,
    pub branch: String,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    pub pr_title: String,
    #[serde(default)]
    pub pr_body: Option<String>,
    pub edits: Vec<EditSpec>,
    #[serde(default)]
    pub branch_strategy: BranchStrategy,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub reviewers: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyResponse {
    pub ok: bool,
    pub branch: String,
    pub branch_created: bool,
    pub pr_url: String,
    pub pr_number: u64,
    pub commit: String,
    /// Whether this request opened the PR.
    pub created: bool,
    pub changed: Vec<String>,
    pub skipped: Vec<SkippedEdit>,
    pub warnings: Vec<String>,
}

impl From<ApplyOutcome> for ApplyResponse {
    fn from(outcome: ApplyOutcome) -> Self {
        let warnings = outcome
            .review
            .followup_failures
            .iter()
            .map(|f| {
                let step = match f.step {
                    FollowupStep::Labels => "adding labels",
                    FollowupStep::Reviewers => "requesting reviewers",
                };
                format!("{} failed: {}", step, f.message)
            })
            .collect();
        Self {
            ok: true,
            branch: outcome.branch,
            branch_created: outcome.branch_created,
            pr_url: outcome.review.pull.url,
            pr_number: outcome.review.pull.number,
            commit: outcome.commit.commit_sha,
            created: outcome.review.created,
            changed: outcome.commit.changed,
            skipped: outcome.commit.skipped,
            warnings,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunRequest {
    tool: String,
    action: String,
    #[serde(default = "default_environment")]
    environment: String,
    repo: RepoRef,
    #[serde(default)]
    input: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlanInput {
    goal: String,
    #[serde(default = "default_base_branch")]
    base_branch: String,
}

fn default_environment() -> String {
    "production".to_string()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    ok: bool,
    revision: String,
    version: &'static str,
    allowed_paths: Vec<String>,
    uptime_seconds: u64,
}

// ── Handlers ────────────────────────────────────────────────────

async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        ok: true,
        revision: state.config().revision.clone(),
        version: env!("CARGO_PKG_VERSION"),
        allowed_paths: state.inner.gate.patterns(),
        uptime_seconds: state.inner.started.elapsed().as_secs(),
    })
}

async fn apply(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ApplyResponse>, ApiError> {
    authorize(&headers, &state.config().secrets)?;
    let request: ApplyRequest = parse_body(&body)?;
    let approved = workflow_approved(&headers, &state.config().secrets);

    let request_id = Uuid::new_v4();
    let span = tracing::info_span!("apply", %request_id, branch = %request.branch);
    let response = with_deadline(
        state.config().request_timeout(),
        apply_edits(&state, request, &state.inner.gate, approved),
    )
    .instrument(span)
    .await?;
    Ok(Json(response))
}

async fn plan(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<PlanResponse>, ApiError> {
    authorize(&headers, &state.config().secrets)?;
    let request: PlanRequest = parse_body(&body)?;
    let server = &state.config().server;
    let plan = build_plan(
        request,
        state.inner.gate.patterns(),
        server.default_labels.clone(),
    )?;
    Ok(Json(plan))
}

async fn run(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    authorize(&headers, &state.config().secrets)?;
    let request: RunRequest = parse_body(&body)?;
    let approved = workflow_approved(&headers, &state.config().secrets);

    let request_id = Uuid::new_v4();
    let span = tracing::info_span!(
        "run",
        %request_id,
        tool = %request.tool,
        action = %request.action,
        environment = %request.environment
    );
    let result = with_deadline(
        state.config().request_timeout(),
        run_tool(&state, request, approved),
    )
    .instrument(span)
    .await?;
    Ok(Json(result))
}

// ── Flows ───────────────────────────────────────────────────────

async fn apply_edits(
    state: &AppState,
    request: ApplyRequest,
    gate: &PathGate,
    workflow_approved: bool,
) -> Result<ApplyResponse, ApiError> {
    let server = &state.config().server;
    let repo = resolve_repo(server, request.owner, request.repo)?;

    validate_branch_name(&request.branch)?;
    validate_branch_name(&request.base_branch)?;
    if request.branch == request.base_branch {
        return Err(ApiError::Invalid(
            "branch must differ from baseBranch".into(),
        ));
    }
    if request.pr_title.trim().is_empty() {
        return Err(ApiError::Invalid("prTitle must not be empty".into()));
    }

    let edits = validate_batch(request.edits)?;
    gate.check_batch(edits.iter().map(|e| e.path()), workflow_approved)?;

    let mut labels = server.default_labels.clone();
    for label in request.labels {
        if !labels.contains(&label) {
            labels.push(label);
        }
    }

    let outcome = state
        .inner
        .pipeline
        .apply(ApplyPlan {
            repo,
            branch: request.branch,
            base: request.base_branch,
            strategy: request.branch_strategy,
            title: request.pr_title,
            body: request.pr_body,
            edits,
            labels,
            reviewers: request.reviewers,
        })
        .await?;

    tracing::info!(
        commit = %outcome.commit.commit_sha,
        pr = %outcome.review.url(),
        "applied {} change(s)",
        outcome.commit.changed.len()
    );
    Ok(outcome.into())
}

async fn run_tool(
    state: &AppState,
    request: RunRequest,
    workflow_approved: bool,
) -> Result<Value, ApiError> {
    let repo_key = format!("{}/{}", request.repo.owner, request.repo.name);
    let engine = state.inner.policies.engine()?;

    if let PolicyDecision::Deny { reason } = engine.evaluate(
        &repo_key,
        &request.tool,
        &request.action,
        &request.environment,
    ) {
        return Err(ApiError::PolicyDenied(reason));
    }
    if request.tool != GITHUB_TOOL {
        return Err(ApiError::UnsupportedTool(request.tool));
    }

    let result = match request.action.as_str() {
        "apply" => {
            let mut input: ApplyRequest = from_input(request.input)?;
            input.owner = Some(request.repo.owner.clone());
            input.repo = Some(request.repo.name.clone());

            let policy_gate = engine
                .path_patterns(&repo_key)
                .map(PathGate::new)
                .transpose()?;
            let gate = policy_gate.as_ref().unwrap_or(&state.inner.gate);
            to_json(apply_edits(state, input, gate, workflow_approved).await?)?
        }
        "plan" => {
            let input: PlanInput = from_input(request.input)?;
            let plan = build_plan(
                PlanRequest {
                    goal: input.goal,
                    repo: request.repo.clone(),
                    base_branch: input.base_branch,
                },
                state.inner.gate.patterns(),
                state.config().server.default_labels.clone(),
            )?;
            to_json(plan)?
        }
        other => {
            return Err(ApiError::UnsupportedTool(format!(
                "{}.{}",
                request.tool, other
            )))
        }
    };

    Ok(json!({
        "ok": true,
        "tool": request.tool,
        "action": request.action,
        "result": result,
    }))
}

// ── Helpers ─────────────────────────────────────────────────────

fn resolve_repo(
    server: &ServerSection,
    owner: Option<String>,
    repo: Option<String>,
) -> Result<RepoId, ApiError> {
    let pick = |given: Option<String>, fallback: &Option<String>| {
        given
            .filter(|v| !v.trim().is_empty())
            .or_else(|| fallback.clone())
    };
    match (
        pick(owner, &server.default_owner),
        pick(repo, &server.default_repo),
    ) {
        (Some(owner), Some(name)) => Ok(RepoId::new(owner, name)),
        _ => Err(ApiError::Invalid(
            "owner and repo are required (no defaults configured)".into(),
        )),
    }
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::Invalid(format!("invalid request body: {}", e)))
}

fn from_input<T: DeserializeOwned>(input: Value) -> Result<T, ApiError> {
    serde_json::from_value(input).map_err(|e| ApiError::Invalid(format!("invalid input: {}", e)))
}

fn to_json<T: Serialize>(value: T) -> Result<Value, ApiError> {
    serde_json::to_value(value).map_err(|e| ApiError::ApplyFailed(e.to_string()))
}

/// Run `work` under the request deadline. Remote calls already issued are
/// not rolled back when it fires.
async fn with_deadline<T, F>(limit: Duration, work: F) -> Result<T, ApiError>
where
    F: Future<Output = Result<T, ApiError>>,
{
    match tokio::time::timeout(limit, work).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!("request exceeded {}s budget", limit.as_secs());
            Err(ApiError::Timeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{APPROVE_WORKFLOWS_HEADER, TOKEN_HEADER};
    use crate::config::Secrets;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use butler_submit::{GitHubConfig, MemoryRemote};
    use secrecy::SecretString;
    use tower::ServiceExt;

    const TOKEN: &str = "test-token";
    const APPROVAL: &str = "approve-me";

    fn repo() -> RepoId {
        RepoId::new("acme", "widgets")
    }

    fn config(policy_file: Option<std::path::PathBuf>) -> ServerConfig {
        ServerConfig {
            server: ServerSection {
                policy_file,
                default_labels: vec![],
                ..ServerSection::default()
            },
            github: GitHubConfig::default(),
            secrets: Secrets {
                api_token: SecretString::from(TOKEN.to_string()),
                workflow_approval: Some(SecretString::from(APPROVAL.to_string())),
            },
            revision: "abc123".into(),
        }
    }

    fn setup(files: &[(&str, &str)]) -> (Router, Arc<MemoryRemote>) {
        setup_with(files, None)
    }

    fn setup_with(
        files: &[(&str, &str)],
        policy_file: Option<std::path::PathBuf>,
    ) -> (Router, Arc<MemoryRemote>) {
        let remote = Arc::new(MemoryRemote::seeded(&repo(), "main", files));
        let state = AppState::new(config(policy_file), remote.clone()).unwrap();
        (router(state), remote)
    }

    fn post_json(uri: &str, body: Value, headers: &[(&str, &str)]) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        (status, body_json(response).await)
    }

    fn apply_body(branch: &str, strategy: &str, edits: Value) -> Value {
        json!({
            "owner": "acme",
            "repo": "widgets",
            "branch": branch,
            "prTitle": "Automated change",
            "branchStrategy": strategy,
            "edits": edits,
        })
    }

    #[tokio::test]
    async fn health_and_status_need_no_token() {
        let (app, _) = setup(&[]);
        let (status, body) = send(
            &app,
            Request::get("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "ok": true }));

        let (status, body) = send(
            &app,
            Request::get("/status").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["revision"], "abc123");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
        assert!(body["allowedPaths"]
            .as_array()
            .unwrap()
            .contains(&json!("src/**")));
        assert!(body["uptimeSeconds"].is_u64());
    }

    #[tokio::test]
    async fn apply_without_token_is_unauthorized() {
        let (app, remote) = setup(&[]);
        let request = post_json(
            "/apply",
            apply_body("butler/x", "create", json!([{ "op": "write", "path": "src/a.txt", "content": "a" }])),
            &[(TOKEN_HEADER, "wrong")],
        );
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["ok"], false);
        assert_eq!(body["error"], "unauthorized");
        assert_eq!(remote.mutation_count(), 0);
    }

    #[tokio::test]
    async fn apply_creates_branch_commit_and_pr() {
        let (app, remote) = setup(&[("README.md", "hello\n")]);
        let request = post_json(
            "/apply",
            apply_body(
                "butler/hello",
                "create",
                json!([{ "op": "write", "path": "src/hello.txt", "content": "hi\n", "mode": "create" }]),
            ),
            &[(TOKEN_HEADER, TOKEN)],
        );
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["ok"], true);
        assert_eq!(body["branch"], "butler/hello");
        assert_eq!(body["created"], true);
        assert_eq!(body["changed"], json!(["src/hello.txt"]));
        assert!(!body["prUrl"].as_str().unwrap().is_empty());
        assert!(!body["commit"].as_str().unwrap().is_empty());
        assert_eq!(
            remote.file_at(&repo(), "butler/hello", "src/hello.txt"),
            Some(b"hi\n".to_vec())
        );
    }

    #[tokio::test]
    async fn reuse_updates_existing_pr() {
        let (app, remote) = setup(&[("docs/guide.md", "old text\n")]);
        let first = post_json(
            "/apply",
            apply_body(
                "butler/docs",
                "reuse",
                json!([{ "op": "replace", "path": "docs/guide.md", "search": "old", "replace": "new" }]),
            ),
            &[(TOKEN_HEADER, TOKEN)],
        );
        let (status, first_body) = send(&app, first).await;
        assert_eq!(status, StatusCode::OK, "{}", first_body);
        assert_eq!(first_body["created"], true);

        let second = post_json(
            "/apply",
            apply_body(
                "butler/docs",
                "reuse",
                json!([{ "op": "write", "path": "docs/guide.md", "content": "tail\n", "mode": "append" }]),
            ),
            &[(TOKEN_HEADER, TOKEN)],
        );
        let (status, second_body) = send(&app, second).await;
        assert_eq!(status, StatusCode::OK, "{}", second_body);
        assert_eq!(second_body["created"], false);
        assert_eq!(second_body["prUrl"], first_body["prUrl"]);
        assert_eq!(remote.pulls(&repo()).len(), 1);
        assert_eq!(
            remote.file_at(&repo(), "butler/docs", "docs/guide.md"),
            Some(b"new text\ntail\n".to_vec())
        );
    }

    #[tokio::test]
    async fn workflow_edit_without_approval_is_blocked_before_any_mutation() {
        let (app, remote) = setup(&[]);
        let request = post_json(
            "/apply",
            apply_body(
                "butler/ci",
                "create",
                json!([
                    { "op": "write", "path": "src/ok.txt", "content": "ok" },
                    { "op": "write", "path": ".github/workflows/ci.yml", "content": "on: push" }
                ]),
            ),
            &[(TOKEN_HEADER, TOKEN)],
        );
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "workflow_edit_blocked");
        assert_eq!(remote.mutation_count(), 0);
    }

    #[tokio::test]
    async fn workflow_edit_with_approval_is_applied() {
        let (app, remote) = setup(&[]);
        let request = post_json(
            "/apply",
            apply_body(
                "butler/ci",
                "create",
                json!([{ "op": "write", "path": ".github/workflows/ci.yml", "content": "on: push" }]),
            ),
            &[(TOKEN_HEADER, TOKEN), (APPROVE_WORKFLOWS_HEADER, APPROVAL)],
        );
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert!(remote
            .file_at(&repo(), "butler/ci", ".github/workflows/ci.yml")
            .is_some());
    }

    #[tokio::test]
    async fn disallowed_path_is_rejected() {
        let (app, remote) = setup(&[]);
        let request = post_json(
            "/apply",
            apply_body(
                "butler/x",
                "create",
                json!([{ "op": "write", "path": "secrets/key.pem", "content": "k" }]),
            ),
            &[(TOKEN_HEADER, TOKEN)],
        );
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "path_not_allowed");
        assert_eq!(remote.mutation_count(), 0);
    }

    #[tokio::test]
    async fn malformed_bodies_are_invalid() {
        let (app, _) = setup(&[]);
        let (status, body) = send(
            &app,
            post_json("/apply", json!({ "branch": "x" }), &[(TOKEN_HEADER, TOKEN)]),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid");

        let (status, body) = send(
            &app,
            post_json(
                "/apply",
                apply_body("butler/x", "create", json!([])),
                &[(TOKEN_HEADER, TOKEN)],
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid");
    }

    #[tokio::test]
    async fn missing_repo_without_defaults_is_invalid() {
        let (app, _) = setup(&[]);
        let mut body = apply_body(
            "butler/x",
            "create",
            json!([{ "op": "write", "path": "src/a", "content": "a" }]),
        );
        body.as_object_mut().unwrap().remove("owner");
        let (status, body) = send(&app, post_json("/apply", body, &[(TOKEN_HEADER, TOKEN)])).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid");
    }

    #[tokio::test]
    async fn resubmitting_identical_batch_is_no_change() {
        let (app, _) = setup(&[]);
        let body = apply_body(
            "butler/same",
            "reuse",
            json!([{ "op": "write", "path": "src/a.txt", "content": "a", "mode": "create" }]),
        );
        let (status, _) = send(&app, post_json("/apply", body.clone(), &[(TOKEN_HEADER, TOKEN)])).await;
        assert_eq!(status, StatusCode::OK);
        let (status, second) = send(&app, post_json("/apply", body, &[(TOKEN_HEADER, TOKEN)])).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(second["error"], "no_change");
    }

    #[tokio::test]
    async fn concurrent_create_new_has_one_winner() {
        let (app, _) = setup(&[]);
        let body = |content: &str| {
            apply_body(
                "butler/race",
                "create",
                json!([{ "op": "write", "path": "src/race.txt", "content": content }]),
            )
        };
        let (a, b) = tokio::join!(
            send(&app, post_json("/apply", body("a"), &[(TOKEN_HEADER, TOKEN)])),
            send(&app, post_json("/apply", body("b"), &[(TOKEN_HEADER, TOKEN)])),
        );
        let mut statuses = vec![a.0.as_u16(), b.0.as_u16()];
        statuses.sort();
        assert_eq!(statuses, vec![200, 422]);
        let loser = if a.0 == StatusCode::OK { b.1 } else { a.1 };
        assert_eq!(loser["error"], "branch_exists");
    }

    #[tokio::test]
    async fn plan_is_read_only() {
        let (app, remote) = setup(&[]);
        let request = post_json(
            "/plan",
            json!({ "goal": "Fix README typo", "repo": { "owner": "acme", "name": "widgets" } }),
            &[(TOKEN_HEADER, TOKEN)],
        );
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["branch"], "butler/fix-readme-typo");
        assert_eq!(body["baseBranch"], "main");
        assert_eq!(body["edits"], json!([]));
        assert!(remote.calls().is_empty());
    }

    fn policy_file(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("policy.yaml");
        std::fs::write(
            &path,
            r#"
repos:
  acme/widgets:
    tools:
      github:
        allow: ["plan", "apply@staging"]
        deny: ["apply@production"]
      shell:
        allow: ["*"]
    paths: ["docs/**"]
"#,
        )
        .unwrap();
        path
    }

    fn run_body(tool: &str, action: &str, environment: &str, input: Value) -> Value {
        json!({
            "tool": tool,
            "action": action,
            "environment": environment,
            "repo": { "owner": "acme", "name": "widgets" },
            "input": input,
        })
    }

    #[tokio::test]
    async fn run_without_policy_is_denied() {
        let (app, _) = setup(&[]);
        let request = post_json(
            "/run",
            run_body("github", "plan", "production", json!({ "goal": "x" })),
            &[(TOKEN_HEADER, TOKEN)],
        );
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "policy_denied");
    }

    #[tokio::test]
    async fn run_dispatches_allowed_actions() {
        let dir = tempfile::tempdir().unwrap();
        let (app, remote) = setup_with(&[], Some(policy_file(&dir)));

        let (status, body) = send(
            &app,
            post_json(
                "/run",
                run_body("github", "plan", "production", json!({ "goal": "Update docs" })),
                &[(TOKEN_HEADER, TOKEN)],
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["result"]["branch"], "butler/update-docs");

        let (status, body) = send(
            &app,
            post_json(
                "/run",
                run_body(
                    "github",
                    "apply",
                    "staging",
                    json!({
                        "branch": "butler/docs",
                        "prTitle": "Docs",
                        "edits": [{ "op": "write", "path": "docs/new.md", "content": "# New" }]
                    }),
                ),
                &[(TOKEN_HEADER, TOKEN)],
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["result"]["created"], true);
        assert!(remote.file_at(&repo(), "butler/docs", "docs/new.md").is_some());
    }

    #[tokio::test]
    async fn run_uses_policy_paths_and_denies() {
        let dir = tempfile::tempdir().unwrap();
        let (app, remote) = setup_with(&[], Some(policy_file(&dir)));

        // src/** is a server default but the repo policy narrows to docs/**.
        let (status, body) = send(
            &app,
            post_json(
                "/run",
                run_body(
                    "github",
                    "apply",
                    "staging",
                    json!({
                        "branch": "butler/src",
                        "prTitle": "Src",
                        "edits": [{ "op": "write", "path": "src/lib.rs", "content": "" }]
                    }),
                ),
                &[(TOKEN_HEADER, TOKEN)],
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "path_not_allowed");

        let (status, body) = send(
            &app,
            post_json(
                "/run",
                run_body("github", "apply", "production", json!({})),
                &[(TOKEN_HEADER, TOKEN)],
            ),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "policy_denied");
        assert_eq!(remote.mutation_count(), 0);
    }

    #[tokio::test]
    async fn run_rejects_unknown_tools() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = setup_with(&[], Some(policy_file(&dir)));
        let (status, body) = send(
            &app,
            post_json(
                "/run",
                run_body("shell", "exec", "production", json!({})),
                &[(TOKEN_HEADER, TOKEN)],
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "unsupported_tool");
    }

    #[tokio::test]
    async fn broken_policy_paths_are_a_server_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.yaml");
        std::fs::write(
            &path,
            r#"
repos:
  acme/widgets:
    tools:
      github:
        allow: ["apply"]
    paths: [""]
"#,
        )
        .unwrap();
        let (app, remote) = setup_with(&[], Some(path));

        let (status, body) = send(
            &app,
            post_json(
                "/run",
                run_body(
                    "github",
                    "apply",
                    "production",
                    json!({
                        "branch": "butler/docs",
                        "prTitle": "Docs",
                        "edits": [{ "op": "write", "path": "docs/a.md", "content": "a" }]
                    }),
                ),
                &[(TOKEN_HEADER, TOKEN)],
            ),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "apply_failed");
        assert_eq!(remote.mutation_count(), 0);
    }

    #[tokio::test]
    async fn deadline_yields_timeout() {
        let result: Result<(), ApiError> = with_deadline(
            Duration::from_millis(10),
            std::future::pending::<Result<(), ApiError>>(),
        )
        .await;
        assert!(matches!(result, Err(ApiError::Timeout)));
    }
}
