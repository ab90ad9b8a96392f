//! Worker runtime: polls the store, claims ready jobs, and dispatches them
//! to registered handlers.
//!
//! ```text
//! Worker
//!     │
//!     ├─► claim_jobs (store, skip-locked)
//!     ├─► HandlerRegistry lookup by job type
//!     ├─► handler.run(payload, ctx)   ── heartbeat task alongside
//!     └─► complete_job / fail_job
//! ```
//!
//! Heartbeats double as the cancellation channel: when the store reports the
//! claim lost, the job's token is cancelled and the task abandons its work
//! without reporting an outcome.

mod registry;

pub use registry::{
    HandlerError, HandlerErrorKind, HandlerOutput, HandlerRegistry, HeartbeatHandle, JobContext,
    JobHandler,
};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use forge_core::canonical::hash_canonical;
use forge_core::job::Job;
use forge_core::manifest::{ManifestStatus, RunManifest};
use forge_core::store::{JobStore, Store};

use crate::config::Config;

/// Configuration for the worker runtime.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique id for this process.
    pub worker_id: String,
    /// Restrict claims to one tenant; `None` claims across tenants.
    pub tenant_id: Option<Uuid>,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub claim_limit: i64,
    pub max_in_flight: usize,
    pub drain_deadline: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            tenant_id: None,
            poll_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(30),
            claim_limit: 10,
            max_in_flight: 16,
            drain_deadline: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            worker_id: config.worker_id.clone(),
            tenant_id: None,
            poll_interval: config.poll_interval,
            heartbeat_interval: config.heartbeat_interval,
            claim_limit: config.claim_limit,
            max_in_flight: config.max_in_flight,
            drain_deadline: config.drain_deadline,
        }
    }
}

/// Long-running worker processing jobs from the store.
pub struct Worker {
    store: Arc<dyn Store>,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(store: Arc<dyn Store>, registry: Arc<HandlerRegistry>, config: WorkerConfig) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Run until the shutdown token fires, then drain in-flight jobs up to
    /// the drain deadline. Jobs still running at the deadline stay claimed
    /// and are recovered by the reaper.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            claim_limit = self.config.claim_limit,
            max_in_flight = self.config.max_in_flight,
            "worker starting"
        );

        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            // reap finished tasks without blocking
            while tasks.try_join_next().is_some() {}

            let capacity = self.config.max_in_flight.saturating_sub(tasks.len());
            if capacity == 0 {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tasks.join_next() => {}
                }
                continue;
            }

            let limit = self.config.claim_limit.min(capacity as i64);
            let jobs = match self
                .store
                .claim_jobs(self.config.tenant_id, &self.config.worker_id, limit)
                .await
            {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!(error = %e, "failed to claim jobs");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                    continue;
                }
            };

            if jobs.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            }

            debug!(count = jobs.len(), "claimed jobs");
            for job in jobs {
                let worker = self.clone();
                let shutdown = shutdown.clone();
                tasks.spawn(async move {
                    worker.process_job(job, &shutdown).await;
                });
            }
        }

        if !tasks.is_empty() {
            info!(count = tasks.len(), "draining in-flight jobs");
            let deadline = tokio::time::Instant::now() + self.config.drain_deadline;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        warn!(remaining = tasks.len(), "drain deadline reached; leaving jobs for the reaper");
                        tasks.abort_all();
                        break;
                    }
                    joined = tasks.join_next() => {
                        if joined.is_none() {
                            break;
                        }
                    }
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "worker stopped");
        Ok(())
    }

    /// Single claim/execute pass; returns the number of jobs processed.
    pub async fn run_once(&self) -> Result<usize> {
        let limit = self.config.claim_limit.min(self.config.max_in_flight as i64);
        let jobs = self
            .store
            .claim_jobs(self.config.tenant_id, &self.config.worker_id, limit)
            .await?;
        let count = jobs.len();
        let shutdown = CancellationToken::new();
        for job in jobs {
            self.process_job(job, &shutdown).await;
        }
        Ok(count)
    }

    async fn process_job(&self, job: Job, shutdown: &CancellationToken) {
        let job_id = job.id;
        let job_type = job.job_type.clone();
        let tenant_id = job.tenant_id;

        debug!(
            job_id = %job_id,
            job_type = %job_type,
            tenant_id = %tenant_id,
            trace_id = %job.trace_id,
            attempt = job.attempt_no,
            "executing job"
        );

        let Some(handler) = self.registry.get(&job_type) else {
            warn!(job_id = %job_id, job_type = %job_type, "no handler registered");
            self.report_failure(
                &job,
                HandlerError::permanent(format!("no handler registered for type {job_type}")),
            )
            .await;
            return;
        };

        // promote the claim to running before the handler starts
        let held = self
            .store
            .heartbeat_job(tenant_id, job_id, &self.config.worker_id)
            .await
            .unwrap_or(false);
        if !held {
            warn!(job_id = %job_id, "claim lost before handler start; abandoning");
            return;
        }

        let job_cancel = shutdown.child_token();
        let claim_lost = Arc::new(AtomicBool::new(false));

        let heartbeat_task = {
            let store = self.store.clone();
            let worker_id = self.config.worker_id.clone();
            let interval = self.config.heartbeat_interval;
            let cancel = job_cancel.clone();
            let claim_lost = claim_lost.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await; // skip the immediate tick
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            match store.heartbeat_job(tenant_id, job_id, &worker_id).await {
                                Ok(true) => {}
                                Ok(false) => {
                                    claim_lost.store(true, Ordering::SeqCst);
                                    cancel.cancel();
                                    break;
                                }
                                Err(e) => {
                                    warn!(job_id = %job_id, error = %e, "heartbeat failed");
                                }
                            }
                        }
                    }
                }
            })
        };

        let ctx = JobContext {
            job_id,
            tenant_id,
            project_id: job.project_id,
            attempt_no: job.attempt_no,
            trace_id: job.trace_id.clone(),
            heartbeat: HeartbeatHandle::new(
                self.store.clone(),
                tenant_id,
                job_id,
                self.config.worker_id.clone(),
            ),
            cancellation: job_cancel.clone(),
        };

        let result = handler.run(job.payload.clone(), ctx).await;

        job_cancel.cancel();
        let _ = heartbeat_task.await;

        if claim_lost.load(Ordering::SeqCst) {
            warn!(
                job_id = %job_id,
                job_type = %job_type,
                "claim lost during execution; abandoning without reporting"
            );
            return;
        }

        match result {
            Ok(output) => {
                let manifest = self.build_manifest(&job, output);
                if let Err(e) = self
                    .store
                    .complete_job(tenant_id, job_id, &self.config.worker_id, manifest)
                    .await
                {
                    error!(job_id = %job_id, error = %e, "failed to mark job as succeeded");
                } else {
                    info!(job_id = %job_id, job_type = %job_type, trace_id = %job.trace_id, "job succeeded");
                }
            }
            Err(err) => {
                warn!(
                    job_id = %job_id,
                    job_type = %job_type,
                    trace_id = %job.trace_id,
                    error = %err,
                    "job failed"
                );
                self.report_failure(&job, err).await;
            }
        }
    }

    async fn report_failure(&self, job: &Job, err: HandlerError) {
        let kind = err.kind.error_kind();
        if let Err(e) = self
            .store
            .fail_job(
                job.tenant_id,
                job.id,
                &self.config.worker_id,
                kind,
                &err.message,
                err.kind.is_retryable(),
            )
            .await
        {
            error!(job_id = %job.id, error = %e, "failed to mark job as failed");
        }
    }

    fn build_manifest(&self, job: &Job, output: HandlerOutput) -> RunManifest {
        let mut env_fingerprint = BTreeMap::new();
        env_fingerprint.insert("worker_id".to_string(), self.config.worker_id.clone());
        let mut tool_versions = BTreeMap::new();
        tool_versions.insert(
            "jobforge".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        );

        RunManifest {
            run_id: job.id,
            tenant_id: job.tenant_id,
            project_id: job.project_id,
            job_type: job.job_type.clone(),
            created_at: chrono::Utc::now(),
            inputs_snapshot_hash: hash_canonical(&job.payload),
            outputs: output.outputs,
            metrics: output.metrics,
            env_fingerprint,
            tool_versions,
            status: ManifestStatus::Complete,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.claim_limit, 10);
        assert_eq!(config.max_in_flight, 16);
        assert!(config.worker_id.starts_with("worker-"));
    }

    #[test]
    fn config_with_worker_id() {
        let config = WorkerConfig::with_worker_id("w-test");
        assert_eq!(config.worker_id, "w-test");
    }
}
