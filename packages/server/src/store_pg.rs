//! PostgreSQL store implementation.
//!
//! Every procedure scopes its predicates by tenant and mutates rows only
//! through the statements below; the claim path relies on
//! `FOR UPDATE SKIP LOCKED` so that no two workers ever hold the same job.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use forge_core::backoff::BackoffPolicy;
use forge_core::bundle::{BundleRun, BundleSummary, ExecutionMode};
use forge_core::error::ErrorKind;
use forge_core::event::EventEnvelope;
use forge_core::job::{
    retry_disposition, AttemptOutcome, EnqueueJob, EnqueueResult, Job, JobAttempt, JobStatus,
    RetryDisposition,
};
use forge_core::manifest::{ArtifactDescriptor, ManifestError, RunManifest};
use forge_core::store::{
    BundleStore, EventStore, JobStore, ManifestStore, ReplayStore, StoreError, TriggerStore,
};
use forge_core::trigger::{
    TriggerAction, TriggerEvaluation, TriggerMatch, TriggerRule, TriggerSafety,
};

const JOB_COLUMNS: &str = "id, tenant_id, project_id, job_type, payload, idempotency_key, \
     status, priority, attempt_no, max_attempts, available_at, claimed_by, claimed_at, \
     heartbeat_at, result_id, trace_id, is_action_job, required_scopes, error_kind, \
     error_message, created_at, updated_at";

/// Durable store over PostgreSQL.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    backoff: BackoffPolicy,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff(pool: PgPool, backoff: BackoffPolicy) -> Self {
        Self { pool, backoff }
    }

    /// Connect and run pending migrations.
    pub async fn connect(store_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(store_url).await.map_err(db_err)?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn parse_err(what: &str, detail: impl std::fmt::Display) -> StoreError {
    StoreError::Database(format!("corrupt {what} row: {detail}"))
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let status: String = row.try_get("status").map_err(db_err)?;
    let error_kind: Option<String> = row.try_get("error_kind").map_err(db_err)?;
    Ok(Job {
        id: row.try_get("id").map_err(db_err)?,
        tenant_id: row.try_get("tenant_id").map_err(db_err)?,
        project_id: row.try_get("project_id").map_err(db_err)?,
        job_type: row.try_get("job_type").map_err(db_err)?,
        payload: row.try_get("payload").map_err(db_err)?,
        idempotency_key: row.try_get("idempotency_key").map_err(db_err)?,
        status: status.parse().map_err(|e| parse_err("jobs", e))?,
        priority: row.try_get("priority").map_err(db_err)?,
        attempt_no: row.try_get("attempt_no").map_err(db_err)?,
        max_attempts: row.try_get("max_attempts").map_err(db_err)?,
        available_at: row.try_get("available_at").map_err(db_err)?,
        claimed_by: row.try_get("claimed_by").map_err(db_err)?,
        claimed_at: row.try_get("claimed_at").map_err(db_err)?,
        heartbeat_at: row.try_get("heartbeat_at").map_err(db_err)?,
        result_id: row.try_get("result_id").map_err(db_err)?,
        trace_id: row.try_get("trace_id").map_err(db_err)?,
        is_action_job: row.try_get("is_action_job").map_err(db_err)?,
        required_scopes: row.try_get("required_scopes").map_err(db_err)?,
        error_kind: error_kind
            .map(|k| k.parse().map_err(|e| parse_err("jobs", e)))
            .transpose()?,
        error_message: row.try_get("error_message").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn attempt_from_row(row: &PgRow) -> Result<JobAttempt, StoreError> {
    let outcome: Option<String> = row.try_get("outcome").map_err(db_err)?;
    let error_kind: Option<String> = row.try_get("error_kind").map_err(db_err)?;
    Ok(JobAttempt {
        id: row.try_get("id").map_err(db_err)?,
        job_id: row.try_get("job_id").map_err(db_err)?,
        tenant_id: row.try_get("tenant_id").map_err(db_err)?,
        attempt_no: row.try_get("attempt_no").map_err(db_err)?,
        worker_id: row.try_get("worker_id").map_err(db_err)?,
        started_at: row.try_get("started_at").map_err(db_err)?,
        ended_at: row.try_get("ended_at").map_err(db_err)?,
        outcome: outcome
            .map(|o| o.parse().map_err(|e| parse_err("job_attempts", e)))
            .transpose()?,
        error_kind: error_kind
            .map(|k| k.parse().map_err(|e| parse_err("job_attempts", e)))
            .transpose()?,
        error_message: row.try_get("error_message").map_err(db_err)?,
        evidence_ref: row.try_get("evidence_ref").map_err(db_err)?,
    })
}

fn rule_from_row(row: &PgRow) -> Result<TriggerRule, StoreError> {
    let match_spec: serde_json::Value = row.try_get("match_spec").map_err(db_err)?;
    let action_spec: serde_json::Value = row.try_get("action_spec").map_err(db_err)?;
    let safety_spec: serde_json::Value = row.try_get("safety_spec").map_err(db_err)?;
    Ok(TriggerRule {
        rule_id: row.try_get("rule_id").map_err(db_err)?,
        tenant_id: row.try_get("tenant_id").map_err(db_err)?,
        project_id: row.try_get("project_id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        enabled: row.try_get("enabled").map_err(db_err)?,
        matcher: serde_json::from_value::<TriggerMatch>(match_spec)
            .map_err(|e| parse_err("trigger_rules", e))?,
        action: serde_json::from_value::<TriggerAction>(action_spec)
            .map_err(|e| parse_err("trigger_rules", e))?,
        safety: serde_json::from_value::<TriggerSafety>(safety_spec)
            .map_err(|e| parse_err("trigger_rules", e))?,
        last_fired_at: row.try_get("last_fired_at").map_err(db_err)?,
        fire_count: row.try_get("fire_count").map_err(db_err)?,
    })
}

#[async_trait]
impl JobStore for PgStore {
    async fn enqueue_job(&self, request: EnqueueJob) -> Result<EnqueueResult, StoreError> {
        let issues = request.validate();
        if !issues.is_empty() {
            return Err(StoreError::Validation(issues));
        }

        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO jobs (
                id, tenant_id, project_id, job_type, payload, idempotency_key,
                status, priority, attempt_no, max_attempts, available_at,
                trace_id, is_action_job, required_scopes, created_at, updated_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6,
                'pending', $7, 0, $8, COALESCE($9, NOW()),
                $10, $11, $12, NOW(), NOW()
            )
            ON CONFLICT (tenant_id, job_type, idempotency_key) DO NOTHING
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(request.tenant_id)
        .bind(request.project_id)
        .bind(&request.job_type)
        .bind(&request.payload)
        .bind(&request.idempotency_key)
        .bind(request.priority)
        .bind(request.max_attempts)
        .bind(request.available_at)
        .bind(&request.trace_id)
        .bind(request.is_action_job)
        .bind(&request.required_scopes)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        if let Some(row) = inserted {
            return Ok(EnqueueResult::Created(job_from_row(&row)?));
        }

        // idempotency hit: return the prior row unchanged
        let existing = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE tenant_id = $1 AND job_type = $2 AND idempotency_key = $3
            "#
        ))
        .bind(request.tenant_id)
        .bind(&request.job_type)
        .bind(&request.idempotency_key)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(EnqueueResult::Duplicate(job_from_row(&existing)?))
    }

    async fn claim_jobs(
        &self,
        tenant_id: Option<Uuid>,
        worker_id: &str,
        limit: i64,
    ) -> Result<Vec<Job>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let rows = sqlx::query(&format!(
            r#"
            WITH ready AS (
                SELECT id
                FROM jobs
                WHERE status = 'pending'
                  AND available_at <= NOW()
                  AND ($1::uuid IS NULL OR tenant_id = $1)
                ORDER BY priority DESC, available_at ASC, created_at ASC, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'claimed',
                claimed_by = $3,
                claimed_at = NOW(),
                heartbeat_at = NOW(),
                attempt_no = attempt_no + 1,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM ready)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(tenant_id)
        .bind(limit)
        .bind(worker_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            claimed.push(job_from_row(row)?);
        }

        for job in &claimed {
            sqlx::query(
                r#"
                INSERT INTO job_attempts (id, tenant_id, job_id, attempt_no, worker_id, started_at)
                VALUES ($1, $2, $3, $4, $5, NOW())
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(job.tenant_id)
            .bind(job.id)
            .bind(job.attempt_no)
            .bind(worker_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(claimed)
    }

    async fn heartbeat_job(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
        worker_id: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET heartbeat_at = NOW(),
                status = 'running',
                updated_at = NOW()
            WHERE tenant_id = $1
              AND id = $2
              AND claimed_by = $3
              AND status IN ('claimed', 'running')
            "#,
        )
        .bind(tenant_id)
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn complete_job(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
        worker_id: &str,
        manifest: RunManifest,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'succeeded',
                result_id = $4,
                updated_at = NOW()
            WHERE tenant_id = $1
              AND id = $2
              AND claimed_by = $3
              AND status IN ('claimed', 'running')
            RETURNING attempt_no
            "#,
        )
        .bind(tenant_id)
        .bind(job_id)
        .bind(worker_id)
        .bind(manifest.run_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(row) = updated else {
            // distinguish a retried call from a lost claim
            let status: Option<String> =
                sqlx::query_scalar("SELECT status FROM jobs WHERE tenant_id = $1 AND id = $2")
                    .bind(tenant_id)
                    .bind(job_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(db_err)?;
            return match status.as_deref() {
                None => Err(StoreError::NotFound),
                Some("succeeded") => Ok(()),
                Some(_) => Err(StoreError::ClaimLost),
            };
        };
        let attempt_no: i32 = row.try_get("attempt_no").map_err(db_err)?;

        sqlx::query(
            r#"
            UPDATE job_attempts
            SET ended_at = NOW(), outcome = 'succeeded'
            WHERE tenant_id = $1 AND job_id = $2 AND attempt_no = $3 AND ended_at IS NULL
            "#,
        )
        .bind(tenant_id)
        .bind(job_id)
        .bind(attempt_no)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        insert_manifest(&mut tx, &manifest).await?;

        tx.commit().await.map_err(db_err)?;
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
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE tenant_id = $1 AND id = $2 FOR UPDATE"
        ))
        .bind(tenant_id)
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        let Some(row) = row else {
            return Err(StoreError::NotFound);
        };
        let job = job_from_row(&row)?;

        // idempotent under procedure retry
        if job.status.is_terminal() || job.status == JobStatus::Pending {
            return Ok(());
        }
        if job.claimed_by.as_deref() != Some(worker_id) {
            return Err(StoreError::ClaimLost);
        }

        let outcome = if error_kind == ErrorKind::Timeout {
            AttemptOutcome::TimedOut
        } else {
            AttemptOutcome::Failed
        };
        settle_failed_attempt(
            &mut tx,
            &job,
            outcome,
            error_kind,
            error_message,
            retryable,
            &self.backoff,
        )
        .await?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn reap_stuck_jobs(&self, stale_after: Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - stale_after;
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status IN ('claimed', 'running')
              AND (heartbeat_at IS NULL OR heartbeat_at < $1)
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        let mut reaped = 0u64;
        for row in &rows {
            let job = job_from_row(row)?;
            settle_failed_attempt(
                &mut tx,
                &job,
                AttemptOutcome::TimedOut,
                ErrorKind::Timeout,
                "heartbeat went stale",
                true,
                &self.backoff,
            )
            .await?;
            reaped += 1;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(reaped)
    }

    async fn get_job(&self, tenant_id: Uuid, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(tenant_id)
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_attempts(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
    ) -> Result<Vec<JobAttempt>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, job_id, attempt_no, worker_id, started_at, ended_at,
                   outcome, error_kind, error_message, evidence_ref
            FROM job_attempts
            WHERE tenant_id = $1 AND job_id = $2
            ORDER BY attempt_no ASC
            "#,
        )
        .bind(tenant_id)
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(attempt_from_row).collect()
    }

    async fn next_available_at(
        &self,
        tenant_id: Option<Uuid>,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let next: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            SELECT available_at
            FROM jobs
            WHERE status = 'pending'
              AND ($1::uuid IS NULL OR tenant_id = $1)
            ORDER BY available_at ASC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(next)
    }
}

async fn insert_manifest(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    manifest: &RunManifest,
) -> Result<(), StoreError> {
    let document =
        serde_json::to_value(manifest).map_err(|e| StoreError::Database(e.to_string()))?;
    // manifests are immutable: the first write wins
    sqlx::query(
        r#"
        INSERT INTO run_manifests (run_id, tenant_id, project_id, job_type, status, document, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (run_id) DO NOTHING
        "#,
    )
    .bind(manifest.run_id)
    .bind(manifest.tenant_id)
    .bind(manifest.project_id)
    .bind(&manifest.job_type)
    .bind(manifest.status.as_str())
    .bind(&document)
    .bind(manifest.created_at)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(())
}

/// Close the open attempt and apply the retry disposition to the job.
async fn settle_failed_attempt(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    job: &Job,
    outcome: AttemptOutcome,
    error_kind: ErrorKind,
    error_message: &str,
    retryable: bool,
    backoff: &BackoffPolicy,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE job_attempts
        SET ended_at = NOW(), outcome = $4, error_kind = $5, error_message = $6
        WHERE tenant_id = $1 AND job_id = $2 AND attempt_no = $3 AND ended_at IS NULL
        "#,
    )
    .bind(job.tenant_id)
    .bind(job.id)
    .bind(job.attempt_no)
    .bind(outcome.as_str())
    .bind(error_kind.as_str())
    .bind(error_message)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;

    let disposition = retry_disposition(job.attempt_no, job.max_attempts, retryable, backoff);
    let status = match disposition {
        RetryDisposition::Reschedule { .. } => JobStatus::Pending,
        RetryDisposition::Failed => JobStatus::Failed,
        RetryDisposition::Dead => JobStatus::Dead,
    };
    let next_available = match disposition {
        RetryDisposition::Reschedule {
            available_at_millis_from_now,
        } => Some(Utc::now() + Duration::milliseconds(available_at_millis_from_now as i64)),
        _ => None,
    };

    sqlx::query(
        r#"
        UPDATE jobs
        SET status = $3,
            claimed_by = NULL,
            claimed_at = NULL,
            heartbeat_at = NULL,
            available_at = GREATEST(available_at, COALESCE($4, available_at)),
            error_kind = $5,
            error_message = $6,
            updated_at = NOW()
        WHERE tenant_id = $1 AND id = $2
        "#,
    )
    .bind(job.tenant_id)
    .bind(job.id)
    .bind(status.as_str())
    .bind(next_available)
    .bind(error_kind.as_str())
    .bind(error_message)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;

    if status.is_terminal() {
        let manifest = RunManifest::failed(
            job.id,
            job.tenant_id,
            job.project_id,
            job.job_type.clone(),
            forge_core::canonical::hash_canonical(&job.payload),
            ManifestError {
                kind: error_kind,
                code: error_kind.code().to_string(),
                message: error_message.to_string(),
            },
        );
        insert_manifest(tx, &manifest).await?;
    }

    Ok(())
}

#[async_trait]
impl ManifestStore for PgStore {
    async fn get_manifest(
        &self,
        tenant_id: Uuid,
        run_id: Uuid,
    ) -> Result<Option<RunManifest>, StoreError> {
        let document: Option<serde_json::Value> = sqlx::query_scalar(
            "SELECT document FROM run_manifests WHERE tenant_id = $1 AND run_id = $2",
        )
        .bind(tenant_id)
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        document
            .map(|doc| serde_json::from_value(doc).map_err(|e| parse_err("run_manifests", e)))
            .transpose()
    }

    async fn list_artifacts(
        &self,
        tenant_id: Uuid,
        run_id: Uuid,
    ) -> Result<Vec<ArtifactDescriptor>, StoreError> {
        Ok(self
            .get_manifest(tenant_id, run_id)
            .await?
            .map(|m| m.outputs)
            .unwrap_or_default())
    }
}

#[async_trait]
impl EventStore for PgStore {
    async fn insert_event(&self, event: EventEnvelope) -> Result<Uuid, StoreError> {
        let issues = event.validate();
        if !issues.is_empty() {
            return Err(StoreError::Validation(issues));
        }

        sqlx::query(
            r#"
            INSERT INTO events (
                id, tenant_id, project_id, event_type, occurred_at, trace_id,
                source_app, source_module, subject_type, subject_id, payload,
                contains_pii, redaction_hints
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(event.id)
        .bind(event.tenant_id)
        .bind(event.project_id)
        .bind(&event.event_type)
        .bind(event.occurred_at)
        .bind(&event.trace_id)
        .bind(&event.source_app)
        .bind(&event.source_module)
        .bind(event.subject.as_ref().map(|s| s.kind.clone()))
        .bind(event.subject.as_ref().map(|s| s.id.clone()))
        .bind(&event.payload)
        .bind(event.contains_pii)
        .bind(&event.redaction_hints)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(event.id)
    }
}

#[async_trait]
impl TriggerStore for PgStore {
    async fn put_rule(&self, rule: TriggerRule) -> Result<(), StoreError> {
        let issues = rule.validate();
        if !issues.is_empty() {
            return Err(StoreError::Validation(issues));
        }

        let match_spec =
            serde_json::to_value(&rule.matcher).map_err(|e| StoreError::Database(e.to_string()))?;
        let action_spec =
            serde_json::to_value(&rule.action).map_err(|e| StoreError::Database(e.to_string()))?;
        let safety_spec =
            serde_json::to_value(&rule.safety).map_err(|e| StoreError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO trigger_rules (
                rule_id, tenant_id, project_id, name, enabled,
                match_spec, action_spec, safety_spec, last_fired_at, fire_count
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (rule_id) DO UPDATE SET
                name = EXCLUDED.name,
                enabled = EXCLUDED.enabled,
                match_spec = EXCLUDED.match_spec,
                action_spec = EXCLUDED.action_spec,
                safety_spec = EXCLUDED.safety_spec,
                updated_at = NOW()
            "#,
        )
        .bind(rule.rule_id)
        .bind(rule.tenant_id)
        .bind(rule.project_id)
        .bind(&rule.name)
        .bind(rule.enabled)
        .bind(&match_spec)
        .bind(&action_spec)
        .bind(&safety_spec)
        .bind(rule.last_fired_at)
        .bind(rule.fire_count)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn get_rule(
        &self,
        tenant_id: Uuid,
        rule_id: Uuid,
    ) -> Result<Option<TriggerRule>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT rule_id, tenant_id, project_id, name, enabled,
                   match_spec, action_spec, safety_spec, last_fired_at, fire_count
            FROM trigger_rules
            WHERE tenant_id = $1 AND rule_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(rule_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(rule_from_row).transpose()
    }

    async fn list_enabled_rules(&self, tenant_id: Uuid) -> Result<Vec<TriggerRule>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT rule_id, tenant_id, project_id, name, enabled,
                   match_spec, action_spec, safety_spec, last_fired_at, fire_count
            FROM trigger_rules
            WHERE tenant_id = $1 AND enabled = TRUE
            ORDER BY rule_id
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(rule_from_row).collect()
    }

    async fn record_evaluation(&self, evaluation: TriggerEvaluation) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO trigger_evaluations (
                id, tenant_id, rule_id, event_id, event_type,
                decision, reason, dry_run, dedupe_key, evaluated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(evaluation.id)
        .bind(evaluation.tenant_id)
        .bind(evaluation.rule_id)
        .bind(evaluation.event_id)
        .bind(&evaluation.event_type)
        .bind(evaluation.decision.as_str())
        .bind(&evaluation.reason)
        .bind(evaluation.dry_run)
        .bind(&evaluation.dedupe_key)
        .bind(evaluation.evaluated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn mark_fired(
        &self,
        tenant_id: Uuid,
        rule_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE trigger_rules
            SET last_fired_at = $3, fire_count = fire_count + 1, updated_at = NOW()
            WHERE tenant_id = $1 AND rule_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(rule_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn fires_in_last_hour(
        &self,
        tenant_id: Uuid,
        rule_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM trigger_evaluations
            WHERE tenant_id = $1 AND rule_id = $2 AND decision = 'fire' AND evaluated_at > $3
            "#,
        )
        .bind(tenant_id)
        .bind(rule_id)
        .bind(now - Duration::hours(1))
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(count)
    }

    async fn fired_with_dedupe_key(
        &self,
        tenant_id: Uuid,
        rule_id: Uuid,
        dedupe_key: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM trigger_evaluations
                WHERE tenant_id = $1 AND rule_id = $2 AND decision = 'fire'
                  AND dedupe_key = $3 AND evaluated_at > $4
            )
            "#,
        )
        .bind(tenant_id)
        .bind(rule_id)
        .bind(dedupe_key)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(exists)
    }
}

#[async_trait]
impl ReplayStore for PgStore {
    async fn consume_jti(
        &self,
        tenant_id: Uuid,
        jti: &str,
        action: &str,
        resource: Option<&str>,
        exp: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        sqlx::query("DELETE FROM policy_token_used WHERE expires_at < NOW()")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        let result = sqlx::query(
            r#"
            INSERT INTO policy_token_used (tenant_id, jti, action, resource, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (tenant_id, jti, action, resource) DO NOTHING
            "#,
        )
        .bind(tenant_id)
        .bind(jti)
        .bind(action)
        .bind(resource.unwrap_or(""))
        .bind(exp)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl BundleStore for PgStore {
    async fn record_bundle_run(&self, run: BundleRun) -> Result<(), StoreError> {
        let summary =
            serde_json::to_value(&run.summary).map_err(|e| StoreError::Database(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO bundle_runs (run_id, tenant_id, bundle_id, trace_id, mode, summary, child_job_ids, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (run_id) DO NOTHING
            "#,
        )
        .bind(run.run_id)
        .bind(run.tenant_id)
        .bind(run.bundle_id)
        .bind(&run.trace_id)
        .bind(run.mode.as_str())
        .bind(&summary)
        .bind(&run.child_job_ids)
        .bind(run.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn get_bundle_run(
        &self,
        tenant_id: Uuid,
        run_id: Uuid,
    ) -> Result<Option<BundleRun>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT run_id, tenant_id, bundle_id, trace_id, mode, summary, child_job_ids, created_at
            FROM bundle_runs
            WHERE tenant_id = $1 AND run_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mode: String = row.try_get("mode").map_err(db_err)?;
        let summary: serde_json::Value = row.try_get("summary").map_err(db_err)?;
        Ok(Some(BundleRun {
            run_id: row.try_get("run_id").map_err(db_err)?,
            tenant_id: row.try_get("tenant_id").map_err(db_err)?,
            bundle_id: row.try_get("bundle_id").map_err(db_err)?,
            trace_id: row.try_get("trace_id").map_err(db_err)?,
            mode: match mode.as_str() {
                "execute" => ExecutionMode::Execute,
                _ => ExecutionMode::DryRun,
            },
            summary: serde_json::from_value::<BundleSummary>(summary)
                .map_err(|e| parse_err("bundle_runs", e))?,
            child_job_ids: row.try_get("child_job_ids").map_err(db_err)?,
            created_at: row.try_get("created_at").map_err(db_err)?,
        }))
    }
}
