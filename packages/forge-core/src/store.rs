//! Store interfaces: the named procedures owning all durable state.
//!
//! Interfaces only; scheduling policy lives with the caller and SQL lives in
//! the application crate. Every method takes the tenant first and must never
//! return or mutate rows belonging to another tenant.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::bundle::BundleRun;
use crate::error::{ErrorKind, FieldIssue};
use crate::event::EventEnvelope;
use crate::job::{EnqueueJob, EnqueueResult, Job, JobAttempt};
use crate::manifest::{ArtifactDescriptor, RunManifest};
use crate::trigger::{TriggerEvaluation, TriggerRule};

/// Failures surfaced by store procedures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("validation failed: {0:?}")]
    Validation(Vec<FieldIssue>),
    #[error("row not found")]
    NotFound,
    #[error("claim lost: job is not held by this worker")]
    ClaimLost,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Validation(_) => ErrorKind::Validation,
            StoreError::NotFound => ErrorKind::NotFound,
            StoreError::ClaimLost => ErrorKind::Conflict,
            StoreError::Conflict(_) => ErrorKind::Conflict,
            StoreError::Database(_) => ErrorKind::Database,
        }
    }
}

/// Job lifecycle procedures.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Idempotent insert keyed by `(tenant_id, type, idempotency_key)`.
    /// A prior job is returned unchanged.
    async fn enqueue_job(&self, request: EnqueueJob) -> Result<EnqueueResult, StoreError>;

    /// Atomically claim up to `limit` ready jobs for `worker_id`, ordered by
    /// `(priority DESC, available_at ASC, created_at ASC, id)`. A null
    /// tenant claims across tenants.
    async fn claim_jobs(
        &self,
        tenant_id: Option<Uuid>,
        worker_id: &str,
        limit: i64,
    ) -> Result<Vec<Job>, StoreError>;

    /// Refresh liveness. Returns false when the claim has been lost, which
    /// is the cooperative cancellation signal.
    async fn heartbeat_job(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
        worker_id: &str,
    ) -> Result<bool, StoreError>;

    /// Terminal success: writes the manifest and the succeeded attempt.
    async fn complete_job(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
        worker_id: &str,
        manifest: RunManifest,
    ) -> Result<(), StoreError>;

    /// Record a failed attempt and either reschedule with backoff or settle
    /// terminally (failed, or dead once attempts are exhausted).
    async fn fail_job(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
        worker_id: &str,
        error_kind: ErrorKind,
        error_message: &str,
        retryable: bool,
    ) -> Result<(), StoreError>;

    /// Recover jobs whose heartbeat went stale: record a timed-out attempt
    /// and re-enter the retry schedule. Returns the number reaped.
    async fn reap_stuck_jobs(&self, stale_after: Duration) -> Result<u64, StoreError>;

    async fn get_job(&self, tenant_id: Uuid, job_id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Attempts for a job, ordered by `attempt_no`.
    async fn list_attempts(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
    ) -> Result<Vec<JobAttempt>, StoreError>;

    /// Earliest `available_at` among pending jobs, for reaper and CLI
    /// observability. A null tenant looks across tenants.
    async fn next_available_at(
        &self,
        tenant_id: Option<Uuid>,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;
}

/// Manifest reads (writes happen inside `complete_job`/`fail_job`).
#[async_trait]
pub trait ManifestStore: Send + Sync {
    async fn get_manifest(
        &self,
        tenant_id: Uuid,
        run_id: Uuid,
    ) -> Result<Option<RunManifest>, StoreError>;

    async fn list_artifacts(
        &self,
        tenant_id: Uuid,
        run_id: Uuid,
    ) -> Result<Vec<ArtifactDescriptor>, StoreError>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn insert_event(&self, event: EventEnvelope) -> Result<Uuid, StoreError>;
}

/// Trigger rules and their durable safety counters.
#[async_trait]
pub trait TriggerStore: Send + Sync {
    /// Insert or replace a rule after validating it.
    async fn put_rule(&self, rule: TriggerRule) -> Result<(), StoreError>;

    async fn get_rule(
        &self,
        tenant_id: Uuid,
        rule_id: Uuid,
    ) -> Result<Option<TriggerRule>, StoreError>;

    async fn list_enabled_rules(&self, tenant_id: Uuid) -> Result<Vec<TriggerRule>, StoreError>;

    async fn record_evaluation(&self, evaluation: TriggerEvaluation) -> Result<(), StoreError>;

    /// Update `last_fired_at` and increment `fire_count`.
    async fn mark_fired(
        &self,
        tenant_id: Uuid,
        rule_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Fire decisions recorded for the rule in the trailing hour.
    async fn fires_in_last_hour(
        &self,
        tenant_id: Uuid,
        rule_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    /// Whether a fire with this dedupe key was recorded since `since`.
    async fn fired_with_dedupe_key(
        &self,
        tenant_id: Uuid,
        rule_id: Uuid,
        dedupe_key: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}

/// Single-use policy-token records, keyed by `(tenant_id, jti)`.
#[async_trait]
pub trait ReplayStore: Send + Sync {
    /// Consume a token id for `(action, resource)`. Returns true on first
    /// use, false when the token was already consumed. Rows expire at `exp`.
    async fn consume_jti(
        &self,
        tenant_id: Uuid,
        jti: &str,
        action: &str,
        resource: Option<&str>,
        exp: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait BundleStore: Send + Sync {
    async fn record_bundle_run(&self, run: BundleRun) -> Result<(), StoreError>;

    async fn get_bundle_run(
        &self,
        tenant_id: Uuid,
        run_id: Uuid,
    ) -> Result<Option<BundleRun>, StoreError>;
}

/// The full set of store procedures.
pub trait Store:
    JobStore + ManifestStore + EventStore + TriggerStore + ReplayStore + BundleStore
{
}

impl<T> Store for T where
    T: JobStore + ManifestStore + EventStore + TriggerStore + ReplayStore + BundleStore
{
}
