// auth.rs - Shared-secret checks for incoming requests.

use axum::http::HeaderMap;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::config::Secrets;
use crate::error::ApiError;

pub const TOKEN_HEADER: &str = "x-butler-token";
pub const APPROVE_WORKFLOWS_HEADER: &str = "x-butler-approve-workflows";

/// Require a valid `X-Butler-Token`.
pub fn authorize(headers: &HeaderMap, secrets: &Secrets) -> Result<(), ApiError> {
    if secret_matches(header(headers, TOKEN_HEADER), &secrets.api_token) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

/// Whether the request carries the workflow approval secret.
///
/// Always false when no approval secret is configured.
pub fn workflow_approved(headers: &HeaderMap, secrets: &Secrets) -> bool {
    match &secrets.workflow_approval {
        Some(expected) => secret_matches(header(headers, APPROVE_WORKFLOWS_HEADER), expected),
        None => false,
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

// Constant-time over fixed-length digests.
fn secret_matches(presented: Option<&str>, expected: &SecretString) -> bool {
    let expected = expected.expose_secret();
    let Some(presented) = presented else {
        return false;
    };
    if expected.is_empty() {
        return false;
    }
    let a = Sha256::digest(presented.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    bool::from(a.as_slice().ct_eq(b.as_slice()))
}
