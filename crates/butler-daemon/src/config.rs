// config.rs - Gateway configuration.
//
// ServerConfig is built once at startup from butler.toml (non-secret
// settings) and the process environment (secrets), then shared read-only
// with every handler. Nothing below the HTTP layer reads the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use butler_submit::GitHubConfig;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// `[server]` table of butler.toml.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerSection {
    /// Glob-like patterns for paths edits may touch.
    #[serde(default = "default_allowed_paths")]
    pub allowed_paths: Vec<String>,

    /// Wall-clock budget for one request.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Owner used when a request omits `owner`.
    #[serde(default)]
    pub default_owner: Option<String>,

    /// Repository used when a request omits `repo`.
    #[serde(default)]
    pub default_repo: Option<String>,

    /// YAML policy consulted by `/run`. Read on every request.
    #[serde(default)]
    pub policy_file: Option<PathBuf>,

    /// Labels suggested by `/plan` and added to PRs opened by `/apply`.
    #[serde(default = "default_labels")]
    pub default_labels: Vec<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            allowed_paths: default_allowed_paths(),
            request_timeout_secs: default_request_timeout_secs(),
            default_owner: None,
            default_repo: None,
            policy_file: None,
            default_labels: default_labels(),
        }
    }
}

// Serde default functions
fn default_allowed_paths() -> Vec<String> {
    ["src/**", "docs/**", "tests/**", "**/*.md", ".github/workflows/**"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_request_timeout_secs() -> u64 {
    25
}

fn default_labels() -> Vec<String> {
    vec!["butler".to_string()]
}

/// Contents of butler.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub github: GitHubConfig,
}

impl FileConfig {
    /// Load butler.toml. A missing file yields the defaults; a malformed one
    /// is an error.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
    }
}

/// Shared secrets presented by callers.
pub struct Secrets {
    /// Expected `X-Butler-Token` value.
    pub api_token: SecretString,
    /// Expected `X-Butler-Approve-Workflows` value. Unset means workflow
    /// edits are always blocked.
    pub workflow_approval: Option<SecretString>,
}

/// Immutable configuration handed to the router.
pub struct ServerConfig {
    pub server: ServerSection,
    pub github: GitHubConfig,
    pub secrets: Secrets,
    /// Deployed revision identifier reported by `/status`.
    pub revision: String,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs.max(1))
    }
}
