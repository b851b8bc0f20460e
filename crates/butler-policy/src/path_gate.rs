// path_gate.rs - Allow-list gate for repository write paths.
//
// Every path in an edit batch passes through `PathGate::check()` before any
// remote call is made:
//
// 1. Is the path a workflow file (`.github/workflows/**`)? → needs approval
// 2. Is the path malformed (empty, absolute, `..`)? → PathNotAllowed
// 3. Does any allow pattern match? → No → PathNotAllowed
//
// Patterns are glob-like: `**` spans directories, `*` stays inside one path
// segment, everything else is literal. They are compiled to anchored regexes
// once, when the gate is built.

use regex::Regex;

use crate::error::PolicyError;

/// Directory whose contents drive CI automation on the remote host.
pub const WORKFLOW_DIR: &str = ".github/workflows/";

/// A compiled allow-pattern.
#[derive(Debug, Clone)]
struct PathMatcher {
    source: String,
    regex: Regex,
}

/// Classifies candidate write paths. Pure: no I/O, no hidden state.
#[derive(Debug, Clone)]
pub struct PathGate {
    matchers: Vec<PathMatcher>,
}

impl PathGate {
    /// Compile a gate from glob-like patterns.
    pub fn new<I, S>(patterns: I) -> Result<Self, PolicyError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let matchers = patterns
            .into_iter()
            .map(|p| {
                let source = normalize_path(p.as_ref());
                let regex = compile_pattern(&source)?;
                Ok(PathMatcher { source, regex })
            })
            .collect::<Result<Vec<_>, PolicyError>>()?;
        Ok(Self { matchers })
    }

    /// The patterns this gate was built from (normalized).
    pub fn patterns(&self) -> Vec<String> {
        self.matchers.iter().map(|m| m.source.clone()).collect()
    }

    /// Whether `path` matches an allow pattern and is well-formed.
    pub fn is_allowed(&self, path: &str) -> bool {
        let path = normalize_path(path);
        if is_malformed(&path) {
            return false;
        }
        self.matchers.iter().any(|m| m.regex.is_match(&path))
    }

    /// Whether `path` lives under the workflow automation directory.
    ///
    /// Independent of the allow patterns.
    pub fn is_workflow_path(&self, path: &str) -> bool {
        is_workflow_path(path)
    }

    /// Gate a single path. `workflow_approved` is whether the caller
    /// presented a valid workflow approval credential.
    pub fn check(&self, path: &str, workflow_approved: bool) -> Result<(), PolicyError> {
        if is_workflow_path(path) && !workflow_approved {
            return Err(PolicyError::WorkflowEditBlocked {
                path: path.to_string(),
            });
        }
        if !self.is_allowed(path) {
            return Err(PolicyError::PathNotAllowed {
                path: path.to_string(),
            });
        }
        Ok(())
    }

    /// Gate every path of a batch, returning the first rejection.
    ///
    /// Workflow rejections are reported ahead of ordinary disallowed paths so
    /// a batch mixing both surfaces the approval problem.
    pub fn check_batch<'a, I>(&self, paths: I, workflow_approved: bool) -> Result<(), PolicyError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let paths: Vec<&str> = paths.into_iter().collect();
        if !workflow_approved {
            if let Some(path) = paths.iter().find(|p| is_workflow_path(p)) {
                tracing::warn!(path = %path, "workflow edit without approval");
                return Err(PolicyError::WorkflowEditBlocked {
                    path: path.to_string(),
                });
            }
        }
        for path in paths {
            self.check(path, workflow_approved)?;
        }
        Ok(())
    }
}

/// Normalize separators and strip leading `./` segments.
pub fn normalize_path(path: &str) -> String {
    let mut normalized = path.replace('\\', "/");
    while let Some(rest) = normalized.strip_prefix("./") {
        normalized = rest.to_string();
    }
    normalized
}

// Segment-wise so `.` and empty segments cannot hide the directory.
fn is_workflow_path(path: &str) -> bool {
    let path = normalize_path(path);
    let mut segments = path.split('/').filter(|seg| !seg.is_empty() && *seg != ".");
    let mut prefix = WORKFLOW_DIR.split('/').filter(|seg| !seg.is_empty());
    prefix.all(|want| segments.next() == Some(want)) && segments.next().is_some()
}

fn is_malformed(path: &str) -> bool {
    path.is_empty()
        || path.starts_with('/')
        || path.ends_with('/')
        || path
            .split('/')
            .any(|seg| seg == ".." || seg == "." || seg.is_empty())
}

/// Translate a glob-like pattern into an anchored regex.
fn compile_pattern(pattern: &str) -> Result<Regex, PolicyError> {
    if pattern.is_empty() {
        return Err(PolicyError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: "pattern is empty".to_string(),
        });
    }

    let mut out = String::from("^");
    let mut rest = pattern;
    while !rest.is_empty() {
        if let Some(tail) = rest.strip_prefix("**/") {
            out.push_str("(?:.*/)?");
            rest = tail;
        } else if let Some(tail) = rest.strip_prefix("**") {
            out.push_str(".*");
            rest = tail;
        } else if let Some(tail) = rest.strip_prefix('*') {
            out.push_str("[^/]*");
            rest = tail;
        } else {
            let mut chars = rest.chars();
            if let Some(c) = chars.next() {
                out.push_str(&regex::escape(c.encode_utf8(&mut [0u8; 4])));
            }
            rest = chars.as_str();
        }
    }
    out.push('$');

    Regex::new(&out).map_err(|e| PolicyError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}
