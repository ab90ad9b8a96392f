//! Job model: the unit of work routed through the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::backoff::BackoffPolicy;
use crate::canonical::{canonical_json, numbers_js_safe};
use crate::error::{ErrorKind, FieldIssue};

/// Maximum serialized payload size accepted by enqueue.
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Claimed,
    Running,
    Succeeded,
    Failed,
    Dead,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Dead)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Claimed => "claimed",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "claimed" => Ok(JobStatus::Claimed),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "dead" => Ok(JobStatus::Dead),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub tenant_id: Uuid,
    #[builder(default, setter(strip_option))]
    pub project_id: Option<Uuid>,
    pub job_type: String,
    #[builder(default = Value::Null)]
    pub payload: Value,
    pub idempotency_key: String,
    #[builder(default)]
    pub status: JobStatus,
    #[builder(default = 0)]
    pub priority: i32,
    #[builder(default = 0)]
    pub attempt_no: i32,
    #[builder(default = 3)]
    pub max_attempts: i32,
    #[builder(default = Utc::now())]
    pub available_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub claimed_by: Option<String>,
    #[builder(default, setter(strip_option))]
    pub claimed_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub heartbeat_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub result_id: Option<Uuid>,
    pub trace_id: String,
    #[builder(default = false)]
    pub is_action_job: bool,
    #[builder(default)]
    pub required_scopes: Vec<String>,
    #[builder(default, setter(strip_option))]
    pub error_kind: Option<ErrorKind>,
    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Whether the job may be handed to a worker right now.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.available_at <= now
    }
}

/// One row per execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAttempt {
    pub id: Uuid,
    pub job_id: Uuid,
    pub tenant_id: Uuid,
    pub attempt_no: i32,
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<AttemptOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_ref: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Succeeded => "succeeded",
            AttemptOutcome::Failed => "failed",
            AttemptOutcome::TimedOut => "timed_out",
            AttemptOutcome::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for AttemptOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(AttemptOutcome::Succeeded),
            "failed" => Ok(AttemptOutcome::Failed),
            "timed_out" => Ok(AttemptOutcome::TimedOut),
            "cancelled" => Ok(AttemptOutcome::Cancelled),
            other => Err(format!("unknown attempt outcome: {other}")),
        }
    }
}

/// Arguments to the enqueue procedure.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct EnqueueJob {
    pub tenant_id: Uuid,
    #[builder(default, setter(strip_option))]
    pub project_id: Option<Uuid>,
    pub job_type: String,
    pub payload: Value,
    pub idempotency_key: String,
    #[builder(default = 0)]
    pub priority: i32,
    #[builder(default = 3)]
    pub max_attempts: i32,
    #[builder(default, setter(strip_option))]
    pub available_at: Option<DateTime<Utc>>,
    #[builder(default = false)]
    pub is_action_job: bool,
    #[builder(default)]
    pub required_scopes: Vec<String>,
    pub trace_id: String,
}

impl EnqueueJob {
    /// Validate arguments, returning every issue found.
    pub fn validate(&self) -> Vec<FieldIssue> {
        let mut issues = Vec::new();
        if self.job_type.trim().is_empty() {
            issues.push(FieldIssue::new("type", "must not be empty"));
        }
        if self.idempotency_key.trim().is_empty() {
            issues.push(FieldIssue::new("idempotency_key", "must not be empty"));
        }
        if self.max_attempts < 1 {
            issues.push(FieldIssue::new("max_attempts", "must be at least 1"));
        }
        if self.trace_id.trim().is_empty() {
            issues.push(FieldIssue::new("trace_id", "must not be empty"));
        }
        let payload_len = canonical_json(&self.payload).len();
        if payload_len > MAX_PAYLOAD_BYTES {
            issues.push(FieldIssue::new(
                "payload",
                format!("serialized size {payload_len} exceeds {MAX_PAYLOAD_BYTES} bytes"),
            ));
        }
        if !numbers_js_safe(&self.payload) {
            issues.push(FieldIssue::new(
                "payload",
                "contains integers outside the JS-safe range",
            ));
        }
        issues
    }
}

/// Result of an enqueue: either a fresh row or the idempotency hit.
#[derive(Debug, Clone)]
pub enum EnqueueResult {
    Created(Job),
    Duplicate(Job),
}

impl EnqueueResult {
    pub fn job(&self) -> &Job {
        match self {
            EnqueueResult::Created(job) | EnqueueResult::Duplicate(job) => job,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job().id
    }

    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

/// What the store should do with a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDisposition {
    /// Retry later: return to pending at `available_at`.
    Reschedule { available_at_millis_from_now: u64 },
    /// Terminal failure.
    Failed,
    /// Dead-letter: attempts exhausted.
    Dead,
}

/// Shared retry decision used by every store implementation.
pub fn retry_disposition(
    attempt_no: i32,
    max_attempts: i32,
    retryable: bool,
    policy: &BackoffPolicy,
) -> RetryDisposition {
    if retryable && attempt_no < max_attempts {
        let delay = policy.queue_delay(attempt_no.max(1) as u32);
        RetryDisposition::Reschedule {
            available_at_millis_from_now: delay.as_millis() as u64,
        }
    } else if attempt_no >= max_attempts {
        RetryDisposition::Dead
    } else {
        RetryDisposition::Failed
    }
}
