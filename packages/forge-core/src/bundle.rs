//! Request bundles: atomic groups of related job requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::canonical::{canonical_json, numbers_js_safe};
use crate::error::FieldIssue;
use crate::job::MAX_PAYLOAD_BYTES;

/// Current bundle schema version.
pub const BUNDLE_SCHEMA_VERSION: &str = "1.0.0";

/// Bounds on the number of requests per bundle.
pub const MAX_BUNDLE_REQUESTS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    DryRun,
    Execute,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::DryRun => "dry_run",
            ExecutionMode::Execute => "execute",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct BundleMetadata {
    pub source: String,
    #[builder(default = Utc::now())]
    pub triggered_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct BundleRequest {
    pub id: String,
    pub job_type: String,
    pub tenant_id: Uuid,
    #[builder(default, setter(strip_option))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<Uuid>,
    #[builder(default = Value::Null)]
    pub payload: Value,
    pub idempotency_key: String,
    #[builder(default)]
    #[serde(default)]
    pub required_scopes: Vec<String>,
    #[builder(default = false)]
    #[serde(default)]
    pub is_action_job: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct JobRequestBundle {
    #[builder(default = Uuid::new_v4())]
    pub bundle_id: Uuid,
    #[builder(default = BUNDLE_SCHEMA_VERSION.to_string())]
    pub schema_version: String,
    /// Legacy compatibility key; `schema_version` is authoritative.
    #[builder(default, setter(strip_option))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub tenant_id: Uuid,
    #[builder(default, setter(strip_option))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<Uuid>,
    pub trace_id: String,
    pub requests: Vec<BundleRequest>,
    pub metadata: BundleMetadata,
}

/// Result of bundle validation: hard issues and non-fatal warnings.
#[derive(Debug, Clone, Default)]
pub struct BundleValidation {
    pub issues: Vec<FieldIssue>,
    pub warnings: Vec<FieldIssue>,
}

impl BundleValidation {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }
}

impl JobRequestBundle {
    /// Validate the bundle against its schema, returning every issue.
    pub fn validate(&self) -> BundleValidation {
        let mut v = BundleValidation::default();

        if self.requests.is_empty() {
            v.issues.push(FieldIssue::new("requests", "must contain at least one request"));
        }
        if self.requests.len() > MAX_BUNDLE_REQUESTS {
            v.issues.push(FieldIssue::new(
                "requests",
                format!("must contain at most {MAX_BUNDLE_REQUESTS} requests"),
            ));
        }
        if self.trace_id.trim().is_empty() {
            v.issues.push(FieldIssue::new("trace_id", "must not be empty"));
        }
        if self.schema_version.trim().is_empty() {
            v.issues.push(FieldIssue::new("schema_version", "must not be empty"));
        }
        if let Some(version) = &self.version {
            if !self.schema_version.starts_with(version.as_str()) {
                v.warnings.push(FieldIssue::new(
                    "version",
                    format!(
                        "legacy version {version:?} disagrees with schema_version {:?}",
                        self.schema_version
                    ),
                ));
            }
        }

        let mut seen_ids: HashSet<&str> = HashSet::new();
        let mut seen_keys: HashSet<&str> = HashSet::new();
        for (index, request) in self.requests.iter().enumerate() {
            let at = |field: &str| format!("requests[{index}].{field}");

            if request.id.trim().is_empty() {
                v.issues.push(FieldIssue::new(at("id"), "must not be empty"));
            } else if !seen_ids.insert(request.id.as_str()) {
                v.issues.push(FieldIssue::new(at("id"), "duplicate request id"));
            }
            if request.idempotency_key.trim().is_empty() {
                v.issues.push(FieldIssue::new(at("idempotency_key"), "must not be empty"));
            } else if !seen_keys.insert(request.idempotency_key.as_str()) {
                v.issues.push(FieldIssue::new(at("idempotency_key"), "duplicate idempotency key"));
            }
            if request.job_type.trim().is_empty() {
                v.issues.push(FieldIssue::new(at("job_type"), "must not be empty"));
            }
            if request.tenant_id != self.tenant_id {
                v.issues.push(FieldIssue::new(at("tenant_id"), "does not match bundle tenant"));
            }
            if let (Some(bundle_project), Some(request_project)) = (self.project_id, request.project_id) {
                if bundle_project != request_project {
                    v.issues.push(FieldIssue::new(at("project_id"), "does not match bundle project"));
                }
            }
            let payload_len = canonical_json(&request.payload).len();
            if payload_len > MAX_PAYLOAD_BYTES {
                v.issues.push(FieldIssue::new(
                    at("payload"),
                    format!("serialized size {payload_len} exceeds {MAX_PAYLOAD_BYTES} bytes"),
                ));
            }
            if !numbers_js_safe(&request.payload) {
                v.issues.push(FieldIssue::new(
                    at("payload"),
                    "contains integers outside the JS-safe range",
                ));
            }
        }

        v
    }
}

/// Status of one request after the executor processed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildRunStatus {
    Accepted,
    Duplicate,
    Denied,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildRun {
    pub request_id: String,
    pub status: ChildRunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Original action-job flag before any forced dry-run rewrite.
    pub was_action_job: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BundleSummary {
    pub total: u32,
    pub accepted: u32,
    pub duplicates: u32,
    pub denied: u32,
    pub errors: u32,
    pub action_jobs_blocked: u32,
}

impl BundleSummary {
    pub fn is_success(&self) -> bool {
        self.errors + self.denied + self.action_jobs_blocked == 0
    }
}

/// Durable record of one bundle execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleRun {
    pub run_id: Uuid,
    pub tenant_id: Uuid,
    pub bundle_id: Uuid,
    pub trace_id: String,
    pub mode: ExecutionMode,
    pub summary: BundleSummary,
    pub child_job_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}
