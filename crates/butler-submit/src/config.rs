//! GitHub client configuration

use serde::{Deserialize, Serialize};

/// Settings for [`crate::GitHubClient`], read from the `[github]` table of
/// butler.toml. Credentials are not part of this struct.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GitHubConfig {
    /// REST API root (GitHub Enterprise uses `https://host/api/v3`)
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// User-Agent header sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Retries after a rate-limit response before giving up
    #[serde(default = "default_max_rate_limit_retries")]
    pub max_rate_limit_retries: u32,

    /// Upper bound on a single rate-limit wait
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,

    /// Per-call HTTP timeout
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            user_agent: default_user_agent(),
            max_rate_limit_retries: default_max_rate_limit_retries(),
            max_backoff_secs: default_max_backoff_secs(),
            http_timeout_secs: default_http_timeout_secs(),
        }
    }
}

// Serde default functions
fn default_api_base_url() -> String {
    "https://api.github.com".to_string()
}

fn default_user_agent() -> String {
    format!("butler-gateway/{}", env!("CARGO_PKG_VERSION"))
}

fn default_max_rate_limit_retries() -> u32 {
    3
}

fn default_max_backoff_secs() -> u64 {
    8
}

fn default_http_timeout_secs() -> u64 {
    20
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_table_fills_defaults() {
        let config: GitHubConfig =
            toml::from_str("api_base_url = \"https://ghe.example.com/api/v3\"").unwrap();
        assert_eq!(config.api_base_url, "https://ghe.example.com/api/v3");
        assert_eq!(config.max_rate_limit_retries, 3);
        assert!(config.user_agent.starts_with("butler-gateway/"));
    }
}
