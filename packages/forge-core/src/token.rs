//! Policy tokens: short-lived HMAC-signed capabilities for action jobs.
//!
//! Wire form is `base64url(payload_json) + "." + base64url(signature)` with
//! no padding; the signature is HMAC-SHA256 over the encoded payload
//! segment. Verification accepts a rotation list of secrets ordered newest
//! first and compares signatures in constant time.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::canonical::canonical_json;

type HmacSha256 = Hmac<Sha256>;

/// Claims schema version carried in `ver`.
pub const TOKEN_VERSION: &str = "1";

/// Tolerated clock skew for `iat`/`exp` checks, in seconds.
pub const CLOCK_SKEW_SECS: i64 = 60;

const MAX_TTL_SECS: i64 = 24 * 3600;
const DEFAULT_TTL_SECS: i64 = 3600;

/// Claims carried by a policy token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyClaims {
    pub jti: String,
    pub ver: String,
    pub iat: i64,
    pub exp: i64,
    pub tid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<Uuid>,
    pub act: String,
    pub scp: Vec<String>,
    pub aud: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub res: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctx: Option<serde_json::Value>,
}

impl PolicyClaims {
    /// Claims for `actor` to run `action` on `tenant`, expiring after `ttl`
    /// (default one hour).
    pub fn new(
        tenant_id: Uuid,
        project_id: Option<Uuid>,
        actor: impl Into<String>,
        scopes: Vec<String>,
        action: impl Into<String>,
        ttl: Option<Duration>,
    ) -> Self {
        let now = Utc::now();
        let ttl = ttl.unwrap_or_else(|| Duration::seconds(DEFAULT_TTL_SECS));
        Self {
            jti: Uuid::new_v4().to_string(),
            ver: TOKEN_VERSION.to_string(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
            tid: tenant_id,
            pid: project_id,
            act: actor.into(),
            scp: scopes,
            aud: action.into(),
            res: None,
            ctx: None,
        }
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.res = Some(resource.into());
        self
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.exp, 0).unwrap_or_else(Utc::now)
    }
}

/// Issuance failures.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum IssueError {
    #[error("scopes must not be empty")]
    EmptyScopes,
    #[error("token lifetime exceeds {MAX_TTL_SECS} seconds")]
    TtlTooLong,
    #[error("expiry must be after issuance")]
    InvalidExpiry,
    #[error("failed to serialize claims")]
    Serialize,
}

/// Verification failures, in the order the checks run.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("token not yet valid")]
    NotYetValid,
    #[error("token audience does not authorize this action")]
    ActionMismatch,
    #[error("token issued for a different tenant")]
    TenantMismatch,
    #[error("token issued for a different project")]
    ProjectMismatch,
    #[error("token missing required scopes: {0:?}")]
    MissingScopes(Vec<String>),
    #[error("token already consumed")]
    Replayed,
}

impl TokenError {
    /// Stable code for the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            TokenError::Malformed => "POLICY_TOKEN_MALFORMED",
            TokenError::InvalidSignature => "POLICY_TOKEN_INVALID_SIGNATURE",
            TokenError::Expired => "POLICY_TOKEN_EXPIRED",
            TokenError::NotYetValid => "POLICY_TOKEN_NOT_YET_VALID",
            TokenError::ActionMismatch => "POLICY_TOKEN_ACTION_MISMATCH",
            TokenError::TenantMismatch => "POLICY_TOKEN_TENANT_MISMATCH",
            TokenError::ProjectMismatch => "POLICY_TOKEN_PROJECT_MISMATCH",
            TokenError::MissingScopes(_) => "POLICY_TOKEN_MISSING_SCOPES",
            TokenError::Replayed => "POLICY_TOKEN_REPLAYED",
        }
    }
}

/// What the caller is about to do with the token.
#[derive(Debug, Clone)]
pub struct VerifyRequirements {
    pub action: String,
    pub tenant_id: Uuid,
    pub project_id: Option<Uuid>,
    pub scopes: Vec<String>,
}

/// Sign claims under `secret`. New tokens are always issued under the
/// newest secret of the rotation.
pub fn issue(claims: &PolicyClaims, secret: &str) -> Result<String, IssueError> {
    if claims.scp.is_empty() {
        return Err(IssueError::EmptyScopes);
    }
    if claims.exp <= claims.iat {
        return Err(IssueError::InvalidExpiry);
    }
    if claims.exp - claims.iat > MAX_TTL_SECS {
        return Err(IssueError::TtlTooLong);
    }

    let payload = serde_json::to_value(claims).map_err(|_| IssueError::Serialize)?;
    let payload_b64 = URL_SAFE_NO_PAD.encode(canonical_json(&payload));
    let sig = sign(secret, &payload_b64).map_err(|_| IssueError::Serialize)?;
    Ok(format!("{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig)))
}

/// Verify `token` against the rotation list and the caller's requirements.
pub fn verify(
    token: &str,
    secrets: &[String],
    requirements: &VerifyRequirements,
) -> Result<PolicyClaims, TokenError> {
    verify_at(token, secrets, requirements, Utc::now())
}

/// Verification with an explicit clock.
pub fn verify_at(
    token: &str,
    secrets: &[String],
    requirements: &VerifyRequirements,
    now: DateTime<Utc>,
) -> Result<PolicyClaims, TokenError> {
    let segments: Vec<&str> = token.split('.').collect();
    let &[payload_b64, sig_b64] = segments.as_slice() else {
        return Err(TokenError::Malformed);
    };

    let payload_bytes = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| TokenError::Malformed)?;
    let claims: PolicyClaims =
        serde_json::from_slice(&payload_bytes).map_err(|_| TokenError::Malformed)?;
    if claims.ver != TOKEN_VERSION {
        return Err(TokenError::Malformed);
    }

    let now_secs = now.timestamp();
    if claims.exp < now_secs - CLOCK_SKEW_SECS {
        return Err(TokenError::Expired);
    }
    if claims.iat > now_secs + CLOCK_SKEW_SECS {
        return Err(TokenError::NotYetValid);
    }

    let provided = URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|_| TokenError::Malformed)?;
    let mut matched = false;
    for secret in secrets {
        let computed = sign(secret, payload_b64).map_err(|_| TokenError::InvalidSignature)?;
        if computed.len() == provided.len() && bool::from(computed.ct_eq(&provided)) {
            matched = true;
            break;
        }
    }
    if !matched {
        return Err(TokenError::InvalidSignature);
    }

    if claims.aud != requirements.action {
        return Err(TokenError::ActionMismatch);
    }
    if claims.tid != requirements.tenant_id {
        return Err(TokenError::TenantMismatch);
    }
    if let Some(required_project) = requirements.project_id {
        if claims.pid != Some(required_project) {
            return Err(TokenError::ProjectMismatch);
        }
    }
    let missing: Vec<String> = requirements
        .scopes
        .iter()
        .filter(|scope| !claims.scp.contains(scope))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(TokenError::MissingScopes(missing));
    }

    Ok(claims)
}

fn sign(secret: &str, payload_b64: &str) -> Result<Vec<u8>, hmac::digest::InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())?;
    mac.update(payload_b64.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}
