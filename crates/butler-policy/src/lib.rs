//! # butler-policy
//!
//! Gate decisions for the Butler automation gateway.
//!
//! Two independent checks run before anything reaches the remote
//! repository:
//!
//! - [`PathGate`] decides whether a batch may touch a path at all, and
//!   whether the path sits under the CI workflow directory, which needs a
//!   separate approval credential.
//! - [`PolicyEngine`] decides whether a `tool.action` may run against a repo
//!   in a given environment. Only the multi-tool `/run` surface consults it.
//!
//! ## Key invariants
//!
//! - **Default deny**: no matching allow entry → denied. Deny beats allow.
//! - **Path traversal blocked**: paths containing `..` are never allowed.
//! - **Workflow edits gated**: `.github/workflows/**` always needs approval,
//!   even when an allow pattern matches.

pub mod engine;
pub mod error;
pub mod path_gate;

pub use engine::{Policy, PolicyDecision, PolicyEngine, PolicyStore, RepoPolicy, ToolRules};
pub use error::PolicyError;
pub use path_gate::{normalize_path, PathGate, WORKFLOW_DIR};
