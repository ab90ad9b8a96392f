//! Error taxonomy shared across the execution plane.
//!
//! Errors carry two axes: a *kind* (what went wrong) and *retryability*
//! (derived from the kind). Every error that crosses a component boundary
//! carries a stable code, a human message, the correlating trace id, and a
//! timestamp; validation errors additionally carry field-level issues.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Unauthorized,
    Forbidden,
    RateLimited,
    Timeout,
    Transient,
    Database,
    Permanent,
    Internal,
}

impl ErrorKind {
    /// Whether a failure of this kind should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited
                | ErrorKind::Timeout
                | ErrorKind::Transient
                | ErrorKind::Database
        )
    }

    /// Default stable code for this kind.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::Unauthorized => "UNAUTHORIZED",
            ErrorKind::Forbidden => "FORBIDDEN",
            ErrorKind::RateLimited => "RATE_LIMIT_EXCEEDED",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Transient => "EXTERNAL_SERVICE_ERROR",
            ErrorKind::Database => "DATABASE_ERROR",
            ErrorKind::Permanent => "EXTERNAL_SERVICE_ERROR",
            ErrorKind::Internal => "INTERNAL_ERROR",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Transient => "transient",
            ErrorKind::Database => "database",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "validation" => Ok(ErrorKind::Validation),
            "not_found" => Ok(ErrorKind::NotFound),
            "conflict" => Ok(ErrorKind::Conflict),
            "unauthorized" => Ok(ErrorKind::Unauthorized),
            "forbidden" => Ok(ErrorKind::Forbidden),
            "rate_limited" => Ok(ErrorKind::RateLimited),
            "timeout" => Ok(ErrorKind::Timeout),
            "transient" => Ok(ErrorKind::Transient),
            "database" => Ok(ErrorKind::Database),
            "permanent" => Ok(ErrorKind::Permanent),
            "internal" => Ok(ErrorKind::Internal),
            other => Err(format!("unknown error kind: {other}")),
        }
    }
}

/// A single field-level validation issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldIssue {
    pub field: String,
    pub message: String,
}

impl FieldIssue {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// The standard error envelope crossing component boundaries.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct CoreError {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<FieldIssue>,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: kind.code().to_string(),
            message: message.into(),
            trace_id: None,
            timestamp: Utc::now(),
            details: Vec::new(),
        }
    }

    /// Override the default code derived from the kind.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn validation(issues: Vec<FieldIssue>) -> Self {
        let mut err = Self::new(ErrorKind::Validation, "validation failed");
        err.details = issues;
        err
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(ErrorKind::RateLimited.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::Transient.is_retryable());
        assert!(ErrorKind::Database.is_retryable());
    }

    #[test]
    fn non_retryable_kinds() {
        assert!(!ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::Permanent.is_retryable());
        assert!(!ErrorKind::Internal.is_retryable());
        assert!(!ErrorKind::Forbidden.is_retryable());
    }

    #[test]
    fn kind_round_trips_through_str() {
        for kind in [
            ErrorKind::Validation,
            ErrorKind::NotFound,
            ErrorKind::Conflict,
            ErrorKind::Unauthorized,
            ErrorKind::Forbidden,
            ErrorKind::RateLimited,
            ErrorKind::Timeout,
            ErrorKind::Transient,
            ErrorKind::Database,
            ErrorKind::Permanent,
            ErrorKind::Internal,
        ] {
            assert_eq!(kind.as_str().parse::<ErrorKind>(), Ok(kind));
        }
    }

    #[test]
    fn database_kind_has_its_own_code() {
        assert_eq!(ErrorKind::Database.code(), "DATABASE_ERROR");
        assert_ne!(ErrorKind::Database.code(), ErrorKind::Transient.code());
    }

    #[test]
    fn validation_error_carries_details() {
        let err = CoreError::validation(vec![FieldIssue::new("payload", "too large")]);
        assert_eq!(err.code, "VALIDATION_ERROR");
        assert_eq!(err.details.len(), 1);
        assert!(!err.is_retryable());
    }
}
