//! Credential validation boundary.
//!
//! Credential checking itself lives outside the engine; the engine only
//! consumes a yes/no decision plus identity attributes. The
//! [`CredentialValidator`] trait is that seam — the hosting service plugs
//! in its real verifier, and [`ClaimsValidator`] provides the default
//! claims-passthrough used in development and tests.

use std::collections::HashMap;
use std::fmt;

/// Identity attributes produced by a successful validation.
#[derive(Debug, Clone)]
pub struct AuthIdentity {
    /// User the connection belongs to.
    pub user_id: String,
    /// Organization the connection belongs to, if any.
    pub organization_id: Option<String>,
    /// Session the connection belongs to, if any.
    pub session_id: Option<String>,
    /// Capability flags and other attributes to merge into the
    /// connection's metadata (e.g. `"elevated": true`).
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Validates an `auth` payload into identity attributes.
///
/// Returning `None` rejects the authentication attempt; the connection
/// stays open and unauthenticated.
pub trait CredentialValidator: Send + Sync + fmt::Debug {
    /// Validates the raw `auth` payload.
    fn validate(&self, payload: &serde_json::Value) -> Option<AuthIdentity>;
}

/// Default validator: accepts identity claims carried in the payload.
///
/// Requires a non-empty `user_id` string; `organization_id`, `session_id`,
/// and a `metadata` object are passed through when present.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClaimsValidator;

impl CredentialValidator for ClaimsValidator {
    fn validate(&self, payload: &serde_json::Value) -> Option<AuthIdentity> {
        let user_id = payload
            .get("user_id")
            .and_then(serde_json::Value::as_str)
            .filter(|s| !s.is_empty())?
            .to_string();

        let metadata = payload
            .get("metadata")
            .and_then(serde_json::Value::as_object)
            .map(|obj| obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        Some(AuthIdentity {
            user_id,
            organization_id: string_claim(payload, "organization_id"),
            session_id: string_claim(payload, "session_id"),
            metadata,
        })
    }
}

fn string_claim(payload: &serde_json::Value, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(serde_json::Value::as_str)
        .map(ToString::to_string)
}
