//! Edit operations: the wire form callers send and the validated form the
//! committer consumes.

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::remote::{Result, SubmitError};

/// How a write treats an existing file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Only write when the path is absent; existing files are left alone.
    Create,
    #[default]
    Overwrite,
    Append,
}

/// Encoding of `content` on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Utf8,
    Base64,
}

/// An edit as submitted in a request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum EditSpec {
    Write {
        path: String,
        content: String,
        #[serde(default)]
        mode: WriteMode,
        #[serde(default)]
        encoding: Encoding,
    },
    Replace {
        path: String,
        search: String,
        replace: String,
        #[serde(default, rename = "matchAll", alias = "all")]
        match_all: bool,
    },
}

/// A validated edit. Paths are normalized and content is decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOperation {
    Write {
        path: String,
        content: Vec<u8>,
        mode: WriteMode,
    },
    Replace {
        path: String,
        search: String,
        replace: String,
        match_all: bool,
    },
}

impl EditOperation {
    pub fn path(&self) -> &str {
        match self {
            EditOperation::Write { path, .. } | EditOperation::Replace { path, .. } => path,
        }
    }
}

impl EditSpec {
    pub fn path(&self) -> &str {
        match self {
            EditSpec::Write { path, .. } | EditSpec::Replace { path, .. } => path,
        }
    }

    /// Check fields and decode content.
    pub fn validate(self) -> Result<EditOperation> {
        let path = butler_policy::normalize_path(self.path().trim());
        if path.is_empty() {
            return Err(SubmitError::InvalidInput("edit path is empty".to_string()));
        }

        match self {
            EditSpec::Write {
                content,
                mode,
                encoding,
                ..
            } => {
                let content = match encoding {
                    Encoding::Utf8 => content.into_bytes(),
                    Encoding::Base64 => base64::engine::general_purpose::STANDARD
                        .decode(content.trim())
                        .map_err(|e| {
                            SubmitError::InvalidInput(format!(
                                "invalid base64 content for '{}': {}",
                                path, e
                            ))
                        })?,
                };
                Ok(EditOperation::Write {
                    path,
                    content,
                    mode,
                })
            }
            EditSpec::Replace {
                search,
                replace,
                match_all,
                ..
            } => {
                if search.is_empty() {
                    return Err(SubmitError::InvalidInput(format!(
                        "replace on '{}' has an empty search string",
                        path
                    )));
                }
                Ok(EditOperation::Replace {
                    path,
                    search,
                    replace,
                    match_all,
                })
            }
        }
    }
}

/// Validate a whole batch. An empty batch is rejected.
pub fn validate_batch(specs: Vec<EditSpec>) -> Result<Vec<EditOperation>> {
    if specs.is_empty() {
        return Err(SubmitError::InvalidInput("edits must not be empty".to_string()));
    }
    specs
        .into_iter()
        .enumerate()
        .map(|(i, spec)| {
            spec.validate().map_err(|e| match e {
                SubmitError::InvalidInput(msg) => {
                    SubmitError::InvalidInput(format!("edits[{}]: {}", i, msg))
                }
                other => other,
            })
        })
        .collect()
}
