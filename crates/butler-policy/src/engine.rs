// engine.rs - Tool policy evaluation for the `/run` surface.
//
// A policy maps repo-key → tool → {allow, deny}. Each entry is a glob over
// either a bare action ("apply") or an action scoped to an environment
// ("apply@production"). Evaluation order:
//
// 1. Find the repo policy (exact "owner/name", else "*") → none → Deny
// 2. Find the tool rules → none → Deny
// 3. Any deny entry matches? → Deny
// 4. Any allow entry matches? → Allow
// 5. No match → Deny
//
// Policies are read from disk on every request through `PolicyStore`, so
// edits to the file take effect without a restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

/// Repo key that applies when no exact entry exists.
const WILDCARD_REPO: &str = "*";

/// Allow and deny entries for one tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolRules {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

/// Per-repository policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepoPolicy {
    /// Rules keyed by tool name (e.g., "github").
    #[serde(default)]
    pub tools: HashMap<String, ToolRules>,
    /// Path allow-patterns; when non-empty they replace the server defaults.
    #[serde(default)]
    pub paths: Vec<String>,
}

/// The whole policy document.
///
/// ```yaml
/// repos:
///   acme/widgets:
///     tools:
///       github:
///         allow: ["plan", "apply@staging"]
///         deny: ["apply@production"]
///     paths: ["src/**", "docs/**"]
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Policy {
    #[serde(default)]
    pub repos: HashMap<String, RepoPolicy>,
}

impl Policy {
    /// Repo policy for `repo_key`, falling back to the `*` entry.
    pub fn repo(&self, repo_key: &str) -> Option<&RepoPolicy> {
        self.repos
            .get(repo_key)
            .or_else(|| self.repos.get(WILDCARD_REPO))
    }
}

/// The result of a policy evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PolicyDecision {
    Allow,
    Deny { reason: String },
}

impl PolicyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyDecision::Allow)
    }
}

/// Evaluates `tool.action@environment` against a loaded [`Policy`].
pub struct PolicyEngine {
    policy: Policy,
}

impl PolicyEngine {
    pub fn new(policy: Policy) -> Self {
        Self { policy }
    }

    /// Path patterns the policy sets for `repo_key`, if any.
    pub fn path_patterns(&self, repo_key: &str) -> Option<&[String]> {
        self.policy
            .repo(repo_key)
            .map(|r| r.paths.as_slice())
            .filter(|p| !p.is_empty())
    }

    pub fn evaluate(
        &self,
        repo_key: &str,
        tool: &str,
        action: &str,
        environment: &str,
    ) -> PolicyDecision {
        let Some(repo) = self.policy.repo(repo_key) else {
            return PolicyDecision::Deny {
                reason: format!("no policy for repo '{}'", repo_key),
            };
        };

        let Some(rules) = repo.tools.get(tool) else {
            return PolicyDecision::Deny {
                reason: format!("tool '{}' is not enabled for '{}'", tool, repo_key),
            };
        };

        let scoped = format!("{}@{}", action, environment);
        let hits = |entries: &[String]| {
            entries
                .iter()
                .find(|e| entry_matches(e, action, &scoped))
                .cloned()
        };

        if let Some(entry) = hits(&rules.deny) {
            return PolicyDecision::Deny {
                reason: format!(
                    "{}.{} in '{}' denied by '{}'",
                    tool, action, environment, entry
                ),
            };
        }

        if hits(&rules.allow).is_some() {
            PolicyDecision::Allow
        } else {
            PolicyDecision::Deny {
                reason: format!(
                    "no allow entry for {}.{} in '{}'",
                    tool, action, environment
                ),
            }
        }
    }
}

/// Entries without `@` match the action in any environment.
/// Invalid globs never match.
fn entry_matches(entry: &str, action: &str, scoped: &str) -> bool {
    let target = if entry.contains('@') { scoped } else { action };
    match Pattern::new(entry) {
        Ok(p) => p.matches(target),
        Err(_) => false,
    }
}

/// Loads the policy file fresh on each call.
#[derive(Debug, Clone)]
pub struct PolicyStore {
    path: Option<PathBuf>,
}

impl PolicyStore {
    /// A store with no backing file: every load yields an empty policy.
    pub fn empty() -> Self {
        Self { path: None }
    }

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Read and parse the policy. A missing file is an empty (deny-all) policy.
    pub fn load(&self) -> Result<Policy, PolicyError> {
        let Some(path) = &self.path else {
            return Ok(Policy::default());
        };
        let shown = path.display().to_string();
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("policy file {} not found, denying all", shown);
                return Ok(Policy::default());
            }
            Err(source) => {
                return Err(PolicyError::Io {
                    path: shown,
                    source,
                })
            }
        };
        if content.trim().is_empty() {
            return Ok(Policy::default());
        }
        serde_yaml::from_str(&content).map_err(|source| PolicyError::Parse {
            path: shown,
            source,
        })
    }

    pub fn engine(&self) -> Result<PolicyEngine, PolicyError> {
        Ok(PolicyEngine::new(self.load()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(allow: &[&str], deny: &[&str]) -> ToolRules {
        ToolRules {
            allow: allow.iter().map(|s| s.to_string()).collect(),
            deny: deny.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn engine_with(repo: &str, tool: &str, r: ToolRules) -> PolicyEngine {
        let mut tools = HashMap::new();
        tools.insert(tool.to_string(), r);
        let mut repos = HashMap::new();
        repos.insert(
            repo.to_string(),
            RepoPolicy {
                tools,
                paths: vec![],
            },
        );
        PolicyEngine::new(Policy { repos })
    }

    #[test]
    fn empty_policy_denies() {
        let engine = PolicyEngine::new(Policy::default());
        assert!(!engine
            .evaluate("acme/widgets", "github", "apply", "production")
            .is_allowed());
    }

    #[test]
    fn allow_bare_action_any_environment() {
        let engine = engine_with("acme/widgets", "github", rules(&["plan"], &[]));
        assert_eq!(
            engine.evaluate("acme/widgets", "github", "plan", "production"),
            PolicyDecision::Allow
        );
        assert_eq!(
            engine.evaluate("acme/widgets", "github", "plan", "staging"),
            PolicyDecision::Allow
        );
    }

    #[test]
    fn environment_scoped_entries() {
        let engine = engine_with("acme/widgets", "github", rules(&["apply@staging"], &[]));
        assert!(engine
            .evaluate("acme/widgets", "github", "apply", "staging")
            .is_allowed());
        assert!(!engine
            .evaluate("acme/widgets", "github", "apply", "production")
            .is_allowed());
    }

    #[test]
    fn deny_beats_allow() {
        let engine = engine_with(
            "acme/widgets",
            "github",
            rules(&["*"], &["apply@prod*"]),
        );
        match engine.evaluate("acme/widgets", "github", "apply", "production") {
            PolicyDecision::Deny { reason } => assert!(reason.contains("apply@prod*")),
            other => panic!("expected Deny, got {:?}", other),
        }
        assert!(engine
            .evaluate("acme/widgets", "github", "apply", "staging")
            .is_allowed());
    }

    #[test]
    fn unknown_tool_denied() {
        let engine = engine_with("acme/widgets", "github", rules(&["*"], &[]));
        match engine.evaluate("acme/widgets", "slack", "post", "production") {
            PolicyDecision::Deny { reason } => assert!(reason.contains("slack")),
            other => panic!("expected Deny, got {:?}", other),
        }
    }

    #[test]
    fn wildcard_repo_fallback() {
        let engine = engine_with("*", "github", rules(&["plan"], &[]));
        assert!(engine
            .evaluate("someone/else", "github", "plan", "production")
            .is_allowed());
    }

    #[test]
    fn invalid_glob_never_matches() {
        let engine = engine_with("acme/widgets", "github", rules(&["[apply"], &[]));
        assert!(!engine
            .evaluate("acme/widgets", "github", "apply", "production")
            .is_allowed());
    }

    #[test]
    fn decision_serialization() {
        let json = serde_json::to_string(&PolicyDecision::Deny {
            reason: "nope".into(),
        })
        .unwrap();
        assert!(json.contains("\"decision\":\"deny\""));
    }

    #[test]
    fn store_loads_yaml_fresh_each_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.yaml");
        std::fs::write(
            &path,
            "repos:\n  acme/widgets:\n    tools:\n      github:\n        allow: [plan]\n    paths: [\"src/**\"]\n",
        )
        .unwrap();

        let store = PolicyStore::new(&path);
        let engine = store.engine().unwrap();
        assert!(engine
            .evaluate("acme/widgets", "github", "plan", "production")
            .is_allowed());
        assert_eq!(
            engine.path_patterns("acme/widgets"),
            Some(&["src/**".to_string()][..])
        );

        std::fs::write(&path, "repos: {}\n").unwrap();
        let engine = store.engine().unwrap();
        assert!(!engine
            .evaluate("acme/widgets", "github", "plan", "production")
            .is_allowed());
    }

    #[test]
    fn store_missing_file_is_empty_policy() {
        let dir = tempfile::tempdir().unwrap();
        let store = PolicyStore::new(dir.path().join("absent.yaml"));
        assert_eq!(store.load().unwrap(), Policy::default());
        assert_eq!(PolicyStore::empty().load().unwrap(), Policy::default());
    }

    #[test]
    fn store_rejects_bad_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.yaml");
        std::fs::write(&path, "repos: [not, a, map]\n").unwrap();
        assert!(matches!(
            PolicyStore::new(&path).load(),
            Err(PolicyError::Parse { .. })
        ));
    }
}
