//! Process-local store implementation.
//!
//! Backs tests and single-process local runs. The scheduling semantics are
//! shared with the durable implementation through [`crate::job::retry_disposition`],
//! so behavior exercised here holds for both.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::backoff::BackoffPolicy;
use crate::bundle::BundleRun;
use crate::error::ErrorKind;
use crate::event::EventEnvelope;
use crate::job::{
    retry_disposition, AttemptOutcome, EnqueueJob, EnqueueResult, Job, JobAttempt, JobStatus,
    RetryDisposition,
};
use crate::manifest::{ArtifactDescriptor, ManifestError, RunManifest};
use crate::store::{
    BundleStore, EventStore, JobStore, ManifestStore, ReplayStore, StoreError, TriggerStore,
};
use crate::trigger::{TriggerDecision, TriggerEvaluation, TriggerRule};

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    attempts: Vec<JobAttempt>,
    manifests: HashMap<Uuid, RunManifest>,
    events: Vec<EventEnvelope>,
    rules: HashMap<Uuid, TriggerRule>,
    evaluations: Vec<TriggerEvaluation>,
    consumed_jtis: HashMap<(Uuid, String, String, Option<String>), DateTime<Utc>>,
    bundle_runs: HashMap<Uuid, BundleRun>,
}

/// In-memory store. All state is held behind one async lock, which makes
/// every procedure atomic with respect to the others.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    backoff: BackoffPolicy,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_backoff(BackoffPolicy::default())
    }

    /// Custom backoff policy, used by tests to keep retry delays short.
    pub fn with_backoff(backoff: BackoffPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            backoff,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn close_open_attempt(
    inner: &mut Inner,
    job_id: Uuid,
    attempt_no: i32,
    outcome: AttemptOutcome,
    error_kind: Option<ErrorKind>,
    error_message: Option<String>,
    now: DateTime<Utc>,
) {
    if let Some(attempt) = inner
        .attempts
        .iter_mut()
        .find(|a| a.job_id == job_id && a.attempt_no == attempt_no && a.ended_at.is_none())
    {
        attempt.ended_at = Some(now);
        attempt.outcome = Some(outcome);
        attempt.error_kind = error_kind;
        attempt.error_message = error_message;
    }
}

fn write_failed_manifest(inner: &mut Inner, job: &Job, kind: ErrorKind, message: &str) {
    if inner.manifests.contains_key(&job.id) {
        return;
    }
    let manifest = RunManifest::failed(
        job.id,
        job.tenant_id,
        job.project_id,
        job.job_type.clone(),
        crate::canonical::hash_canonical(&job.payload),
        ManifestError {
            kind,
            code: kind.code().to_string(),
            message: message.to_string(),
        },
    );
    inner.manifests.insert(job.id, manifest);
}

/// Apply a failure disposition to a job already verified to be held.
fn settle_failure(
    inner: &mut Inner,
    job_id: Uuid,
    kind: ErrorKind,
    message: &str,
    retryable: bool,
    backoff: &BackoffPolicy,
    now: DateTime<Utc>,
) {
    let Some(job) = inner.jobs.get_mut(&job_id) else {
        return;
    };
    let disposition = retry_disposition(job.attempt_no, job.max_attempts, retryable, backoff);
    job.claimed_by = None;
    job.claimed_at = None;
    job.heartbeat_at = None;
    job.error_kind = Some(kind);
    job.error_message = Some(message.to_string());
    job.updated_at = now;
    match disposition {
        RetryDisposition::Reschedule {
            available_at_millis_from_now,
        } => {
            let next = now + Duration::milliseconds(available_at_millis_from_now as i64);
            job.status = JobStatus::Pending;
            // available_at never moves backwards across retries
            job.available_at = job.available_at.max(next);
        }
        RetryDisposition::Failed => {
            job.status = JobStatus::Failed;
        }
        RetryDisposition::Dead => {
            job.status = JobStatus::Dead;
        }
    }
    if job.status.is_terminal() {
        let job = job.clone();
        write_failed_manifest(inner, &job, kind, message);
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn enqueue_job(&self, request: EnqueueJob) -> Result<EnqueueResult, StoreError> {
        let issues = request.validate();
        if !issues.is_empty() {
            return Err(StoreError::Validation(issues));
        }

        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.jobs.values().find(|job| {
            job.tenant_id == request.tenant_id
                && job.job_type == request.job_type
                && job.idempotency_key == request.idempotency_key
        }) {
            return Ok(EnqueueResult::Duplicate(existing.clone()));
        }

        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            tenant_id: request.tenant_id,
            project_id: request.project_id,
            job_type: request.job_type,
            payload: request.payload,
            idempotency_key: request.idempotency_key,
            status: JobStatus::Pending,
            priority: request.priority,
            attempt_no: 0,
            max_attempts: request.max_attempts,
            available_at: request.available_at.unwrap_or(now),
            claimed_by: None,
            claimed_at: None,
            heartbeat_at: None,
            result_id: None,
            trace_id: request.trace_id,
            is_action_job: request.is_action_job,
            required_scopes: request.required_scopes,
            error_kind: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        debug!(job_id = %job.id, job_type = %job.job_type, "job enqueued");
        inner.jobs.insert(job.id, job.clone());
        Ok(EnqueueResult::Created(job))
    }

    async fn claim_jobs(
        &self,
        tenant_id: Option<Uuid>,
        worker_id: &str,
        limit: i64,
    ) -> Result<Vec<Job>, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        let mut candidates: Vec<Uuid> = inner
            .jobs
            .values()
            .filter(|job| {
                tenant_id.map_or(true, |t| job.tenant_id == t) && job.is_claimable(now)
            })
            .map(|job| job.id)
            .collect();
        candidates.sort_by(|a, b| {
            let ja = &inner.jobs[a];
            let jb = &inner.jobs[b];
            jb.priority
                .cmp(&ja.priority)
                .then(ja.available_at.cmp(&jb.available_at))
                .then(ja.created_at.cmp(&jb.created_at))
                .then(ja.id.cmp(&jb.id))
        });
        candidates.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            if let Some(job) = inner.jobs.get_mut(&id) {
                job.status = JobStatus::Claimed;
                job.claimed_by = Some(worker_id.to_string());
                job.claimed_at = Some(now);
                job.heartbeat_at = Some(now);
                job.attempt_no += 1;
                job.updated_at = now;
                let attempt = JobAttempt {
                    id: Uuid::new_v4(),
                    job_id: job.id,
                    tenant_id: job.tenant_id,
                    attempt_no: job.attempt_no,
                    worker_id: worker_id.to_string(),
                    started_at: now,
                    ended_at: None,
                    outcome: None,
                    error_kind: None,
                    error_message: None,
                    evidence_ref: None,
                };
                claimed.push(job.clone());
                inner.attempts.push(attempt);
            }
        }
        Ok(claimed)
    }

    async fn heartbeat_job(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
        worker_id: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if job.tenant_id != tenant_id {
            return Ok(false);
        }
        let held = job.claimed_by.as_deref() == Some(worker_id)
            && matches!(job.status, JobStatus::Claimed | JobStatus::Running);
        if held {
            job.heartbeat_at = Some(Utc::now());
            job.status = JobStatus::Running;
            job.updated_at = Utc::now();
        }
        Ok(held)
    }

    async fn complete_job(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
        worker_id: &str,
        manifest: RunManifest,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Err(StoreError::NotFound);
        };
        if job.tenant_id != tenant_id {
            return Err(StoreError::NotFound);
        }
        // idempotent under procedure retry
        if job.status == JobStatus::Succeeded && job.claimed_by.as_deref() == Some(worker_id) {
            return Ok(());
        }
        if job.claimed_by.as_deref() != Some(worker_id)
            || !matches!(job.status, JobStatus::Claimed | JobStatus::Running)
        {
            return Err(StoreError::ClaimLost);
        }

        job.status = JobStatus::Succeeded;
        job.result_id = Some(manifest.run_id);
        job.updated_at = now;
        let attempt_no = job.attempt_no;
        close_open_attempt(
            &mut inner,
            job_id,
            attempt_no,
            AttemptOutcome::Succeeded,
            None,
            None,
            now,
        );
        inner.manifests.entry(manifest.run_id).or_insert(manifest);
        Ok(())
    }

    async fn fail_job(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
        worker_id: &str,
        error_kind: ErrorKind,
        error_message: &str,
        retryable: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let Some(job) = inner.jobs.get(&job_id) else {
            return Err(StoreError::NotFound);
        };
        if job.tenant_id != tenant_id {
            return Err(StoreError::NotFound);
        }
        // idempotent under procedure retry
        if job.status.is_terminal() || job.status == JobStatus::Pending {
            return Ok(());
        }
        if job.claimed_by.as_deref() != Some(worker_id) {
            return Err(StoreError::ClaimLost);
        }
        let attempt_no = job.attempt_no;
        let outcome = if error_kind == ErrorKind::Timeout {
            AttemptOutcome::TimedOut
        } else {
            AttemptOutcome::Failed
        };
        close_open_attempt(
            &mut inner,
            job_id,
            attempt_no,
            outcome,
            Some(error_kind),
            Some(error_message.to_string()),
            now,
        );
        settle_failure(
            &mut inner,
            job_id,
            error_kind,
            error_message,
            retryable,
            &self.backoff,
            now,
        );
        Ok(())
    }

    async fn reap_stuck_jobs(&self, stale_after: Duration) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let cutoff = now - stale_after;

        let stuck: Vec<Uuid> = inner
            .jobs
            .values()
            .filter(|job| {
                matches!(job.status, JobStatus::Claimed | JobStatus::Running)
                    && job.heartbeat_at.map_or(true, |hb| hb < cutoff)
            })
            .map(|job| job.id)
            .collect();

        for id in &stuck {
            let attempt_no = inner.jobs.get(id).map(|j| j.attempt_no).unwrap_or(0);
            close_open_attempt(
                &mut inner,
                *id,
                attempt_no,
                AttemptOutcome::TimedOut,
                Some(ErrorKind::Timeout),
                Some("heartbeat went stale".to_string()),
                now,
            );
            settle_failure(
                &mut inner,
                *id,
                ErrorKind::Timeout,
                "heartbeat went stale",
                true,
                &self.backoff,
                now,
            );
        }
        if !stuck.is_empty() {
            debug!(count = stuck.len(), "reaped stale claims");
        }
        Ok(stuck.len() as u64)
    }

    async fn get_job(&self, tenant_id: Uuid, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .get(&job_id)
            .filter(|job| job.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_attempts(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
    ) -> Result<Vec<JobAttempt>, StoreError> {
        let inner = self.inner.lock().await;
        let mut attempts: Vec<JobAttempt> = inner
            .attempts
            .iter()
            .filter(|a| a.job_id == job_id && a.tenant_id == tenant_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|a| a.attempt_no);
        Ok(attempts)
    }

    async fn next_available_at(
        &self,
        tenant_id: Option<Uuid>,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .values()
            .filter(|job| {
                job.status == JobStatus::Pending
                    && tenant_id.map_or(true, |t| job.tenant_id == t)
            })
            .map(|job| job.available_at)
            .min())
    }
}

#[async_trait]
impl ManifestStore for MemoryStore {
    async fn get_manifest(
        &self,
        tenant_id: Uuid,
        run_id: Uuid,
    ) -> Result<Option<RunManifest>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .manifests
            .get(&run_id)
            .filter(|m| m.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_artifacts(
        &self,
        tenant_id: Uuid,
        run_id: Uuid,
    ) -> Result<Vec<ArtifactDescriptor>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .manifests
            .get(&run_id)
            .filter(|m| m.tenant_id == tenant_id)
            .map(|m| m.outputs.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn insert_event(&self, event: EventEnvelope) -> Result<Uuid, StoreError> {
        let issues = event.validate();
        if !issues.is_empty() {
            return Err(StoreError::Validation(issues));
        }
        let mut inner = self.inner.lock().await;
        let id = event.id;
        inner.events.push(event);
        Ok(id)
    }
}

#[async_trait]
impl TriggerStore for MemoryStore {
    async fn put_rule(&self, rule: TriggerRule) -> Result<(), StoreError> {
        let issues = rule.validate();
        if !issues.is_empty() {
            return Err(StoreError::Validation(issues));
        }
        let mut inner = self.inner.lock().await;
        inner.rules.insert(rule.rule_id, rule);
        Ok(())
    }

    async fn get_rule(
        &self,
        tenant_id: Uuid,
        rule_id: Uuid,
    ) -> Result<Option<TriggerRule>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .rules
            .get(&rule_id)
            .filter(|r| r.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_enabled_rules(&self, tenant_id: Uuid) -> Result<Vec<TriggerRule>, StoreError> {
        let inner = self.inner.lock().await;
        let mut rules: Vec<TriggerRule> = inner
            .rules
            .values()
            .filter(|r| r.tenant_id == tenant_id && r.enabled)
            .cloned()
            .collect();
        rules.sort_by_key(|r| r.rule_id);
        Ok(rules)
    }

    async fn record_evaluation(&self, evaluation: TriggerEvaluation) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.evaluations.push(evaluation);
        Ok(())
    }

    async fn mark_fired(
        &self,
        tenant_id: Uuid,
        rule_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(rule) = inner
            .rules
            .get_mut(&rule_id)
            .filter(|r| r.tenant_id == tenant_id)
        else {
            return Err(StoreError::NotFound);
        };
        rule.last_fired_at = Some(at);
        rule.fire_count += 1;
        Ok(())
    }

    async fn fires_in_last_hour(
        &self,
        tenant_id: Uuid,
        rule_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let inner = self.inner.lock().await;
        let since = now - Duration::hours(1);
        Ok(inner
            .evaluations
            .iter()
            .filter(|e| {
                e.tenant_id == tenant_id
                    && e.rule_id == rule_id
                    && e.decision == TriggerDecision::Fire
                    && e.evaluated_at > since
            })
            .count() as i64)
    }

    async fn fired_with_dedupe_key(
        &self,
        tenant_id: Uuid,
        rule_id: Uuid,
        dedupe_key: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.evaluations.iter().any(|e| {
            e.tenant_id == tenant_id
                && e.rule_id == rule_id
                && e.decision == TriggerDecision::Fire
                && e.dedupe_key.as_deref() == Some(dedupe_key)
                && e.evaluated_at > since
        }))
    }
}

#[async_trait]
impl ReplayStore for MemoryStore {
    async fn consume_jti(
        &self,
        tenant_id: Uuid,
        jti: &str,
        action: &str,
        resource: Option<&str>,
        exp: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        inner.consumed_jtis.retain(|_, expiry| *expiry > now);

        let key = (
            tenant_id,
            jti.to_string(),
            action.to_string(),
            resource.map(str::to_string),
        );
        if inner.consumed_jtis.contains_key(&key) {
            return Ok(false);
        }
        inner.consumed_jtis.insert(key, exp);
        Ok(true)
    }
}

#[async_trait]
impl BundleStore for MemoryStore {
    async fn record_bundle_run(&self, run: BundleRun) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.bundle_runs.insert(run.run_id, run);
        Ok(())
    }

    async fn get_bundle_run(
        &self,
        tenant_id: Uuid,
        run_id: Uuid,
    ) -> Result<Option<BundleRun>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .bundle_runs
            .get(&run_id)
            .filter(|r| r.tenant_id == tenant_id)
            .cloned())
    }
}
