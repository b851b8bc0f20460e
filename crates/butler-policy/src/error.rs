// error.rs - Error types for the policy subsystem.

use thiserror::Error;

/// Errors that can occur during gate and policy operations.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// A path pattern could not be compiled into a matcher.
    #[error("invalid path pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// The path is not covered by any allow pattern (or is malformed).
    #[error("path not allowed: '{path}'")]
    PathNotAllowed { path: String },

    /// The path is under the workflow directory and no valid approval was presented.
    #[error("workflow edit blocked: '{path}' requires workflow approval")]
    WorkflowEditBlocked { path: String },

    /// The policy file could not be read.
    #[error("failed to read policy file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The policy file is not valid YAML for a [`crate::Policy`].
    #[error("failed to parse policy file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}
