//! Bundle executor: validates a request bundle, gates action jobs behind
//! policy tokens, fans out child jobs, and aggregates the result.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use async_trait::async_trait;

use forge_core::bundle::{
    BundleRequest, BundleRun, BundleSummary, ChildRun, ChildRunStatus, ExecutionMode,
    JobRequestBundle,
};
use forge_core::job::EnqueueJob;
use forge_core::manifest::ArtifactDescriptor;
use forge_core::store::{BundleStore, JobStore, ReplayStore, Store};
use forge_core::token::{self, TokenError, VerifyRequirements};

use crate::config::FeatureFlags;
use crate::worker::{HandlerError, HandlerOutput, JobContext, JobHandler};

/// The distinguished job type the executor runs as.
pub const BUNDLE_JOB_TYPE: &str = "autopilot.execute_request_bundle";

/// Side-band payload key carrying trace context into child jobs.
pub const TRACE_CONTEXT_KEY: &str = "_trace_context";

/// Payload of a bundle execution job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleJobPayload {
    pub bundle: JobRequestBundle,
    pub mode: ExecutionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_token: Option<String>,
}

/// Aggregated result of one bundle execution.
#[derive(Debug, Clone)]
pub struct BundleOutcome {
    pub success: bool,
    pub summary: BundleSummary,
    pub child_runs: Vec<ChildRun>,
    pub warnings: Vec<String>,
}

pub struct BundleExecutor {
    store: Arc<dyn Store>,
    flags: FeatureFlags,
    token_secrets: Vec<String>,
}

impl BundleExecutor {
    pub fn new(store: Arc<dyn Store>, flags: FeatureFlags, token_secrets: Vec<String>) -> Self {
        Self {
            store,
            flags,
            token_secrets,
        }
    }

    /// Execute a bundle under `run_id` (the executing job's id).
    pub async fn execute(
        &self,
        run_id: Uuid,
        payload: &BundleJobPayload,
    ) -> Result<BundleOutcome, HandlerError> {
        let bundle = &payload.bundle;
        let validation = bundle.validate();
        if !validation.is_valid() {
            let issues = validation
                .issues
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(HandlerError::validation(format!(
                "bundle {} failed validation: {issues}",
                bundle.bundle_id
            )));
        }
        let mut warnings: Vec<String> = validation
            .warnings
            .iter()
            .map(ToString::to_string)
            .collect();

        let mut summary = BundleSummary {
            total: bundle.requests.len() as u32,
            ..Default::default()
        };
        let mut child_runs = Vec::with_capacity(bundle.requests.len());
        let mut child_job_ids = Vec::new();

        for request in &bundle.requests {
            let child = self
                .process_request(bundle, request, payload, &mut summary, &mut warnings)
                .await;
            if let Some(job_id) = child.job_id {
                child_job_ids.push(job_id);
            }
            child_runs.push(child);
        }

        let success = summary.is_success();
        let run = BundleRun {
            run_id,
            tenant_id: bundle.tenant_id,
            bundle_id: bundle.bundle_id,
            trace_id: bundle.trace_id.clone(),
            mode: payload.mode,
            summary,
            child_job_ids,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.record_bundle_run(run).await {
            warn!(bundle_id = %bundle.bundle_id, error = %e, "failed to record bundle run");
        }

        info!(
            bundle_id = %bundle.bundle_id,
            trace_id = %bundle.trace_id,
            total = summary.total,
            accepted = summary.accepted,
            duplicates = summary.duplicates,
            denied = summary.denied,
            action_jobs_blocked = summary.action_jobs_blocked,
            success,
            "bundle executed"
        );

        Ok(BundleOutcome {
            success,
            summary,
            child_runs,
            warnings,
        })
    }

    async fn process_request(
        &self,
        bundle: &JobRequestBundle,
        request: &BundleRequest,
        payload: &BundleJobPayload,
        summary: &mut BundleSummary,
        warnings: &mut Vec<String>,
    ) -> ChildRun {
        let was_action_job = request.is_action_job;
        let mut effective_action_job = request.is_action_job;

        if effective_action_job {
            if payload.mode == ExecutionMode::DryRun && self.flags.integration_dry_run() {
                // forced dry-run rewrites the request to a plain job; the
                // original flag stays visible on the child run for audit
                effective_action_job = false;
                warnings.push(format!(
                    "request {}: action job rewritten to dry-run",
                    request.id
                ));
            } else {
                if !self.flags.action_jobs_enabled() {
                    summary.action_jobs_blocked += 1;
                    return denied(request, was_action_job, "action jobs are disabled");
                }
                match self.authorize_action(bundle, request, payload).await {
                    Ok(()) => {}
                    Err(reason) => {
                        summary.action_jobs_blocked += 1;
                        return denied(request, was_action_job, &reason);
                    }
                }
            }
        }

        // child payload carries the bundle's trace in the side-band key
        let mut child_payload = request.payload.clone();
        if let Some(map) = child_payload.as_object_mut() {
            map.insert(
                TRACE_CONTEXT_KEY.to_string(),
                serde_json::json!({"trace_id": bundle.trace_id}),
            );
        }

        let enqueue = EnqueueJob {
            tenant_id: request.tenant_id,
            project_id: request.project_id.or(bundle.project_id),
            job_type: request.job_type.clone(),
            payload: child_payload,
            idempotency_key: request.idempotency_key.clone(),
            priority: 0,
            max_attempts: 3,
            available_at: None,
            is_action_job: effective_action_job,
            required_scopes: request.required_scopes.clone(),
            trace_id: bundle.trace_id.clone(),
        };

        match self.store.enqueue_job(enqueue).await {
            Ok(result) => {
                let status = if result.is_created() {
                    summary.accepted += 1;
                    ChildRunStatus::Accepted
                } else {
                    summary.duplicates += 1;
                    ChildRunStatus::Duplicate
                };
                ChildRun {
                    request_id: request.id.clone(),
                    status,
                    job_id: Some(result.job_id()),
                    reason: None,
                    was_action_job,
                }
            }
            Err(e) => {
                summary.errors += 1;
                ChildRun {
                    request_id: request.id.clone(),
                    status: ChildRunStatus::Error,
                    job_id: None,
                    reason: Some(e.to_string()),
                    was_action_job,
                }
            }
        }
    }

    async fn authorize_action(
        &self,
        bundle: &JobRequestBundle,
        request: &BundleRequest,
        payload: &BundleJobPayload,
    ) -> Result<(), String> {
        let Some(raw_token) = payload.policy_token.as_deref() else {
            return Err("policy token required for action job".to_string());
        };

        let requirements = VerifyRequirements {
            action: request.job_type.clone(),
            tenant_id: request.tenant_id,
            project_id: request.project_id.or(bundle.project_id),
            scopes: request.required_scopes.clone(),
        };
        let claims = token::verify(raw_token, &self.token_secrets, &requirements)
            .map_err(|e| format!("policy token rejected: {e}"))?;

        // single use per (jti, action, resource)
        let fresh = self
            .store
            .consume_jti(
                request.tenant_id,
                &claims.jti,
                &claims.aud,
                claims.res.as_deref(),
                claims.expires_at(),
            )
            .await
            .map_err(|e| format!("replay check failed: {e}"))?;
        if !fresh {
            return Err(format!("policy token rejected: {}", TokenError::Replayed));
        }
        Ok(())
    }
}

fn denied(request: &BundleRequest, was_action_job: bool, reason: &str) -> ChildRun {
    ChildRun {
        request_id: request.id.clone(),
        status: ChildRunStatus::Denied,
        job_id: None,
        reason: Some(reason.to_string()),
        was_action_job,
    }
}

/// Handler wiring the executor into the worker as a distinguished job type.
pub struct BundleExecutorHandler {
    executor: BundleExecutor,
    flags: FeatureFlags,
}

impl BundleExecutorHandler {
    pub fn new(store: Arc<dyn Store>, flags: FeatureFlags, token_secrets: Vec<String>) -> Self {
        Self {
            executor: BundleExecutor::new(store, flags.clone(), token_secrets),
            flags,
        }
    }
}

#[async_trait]
impl JobHandler for BundleExecutorHandler {
    async fn run(&self, payload: Value, ctx: JobContext) -> Result<HandlerOutput, HandlerError> {
        if !self.flags.autopilot_jobs_enabled() {
            return Err(HandlerError::permanent("autopilot jobs are disabled"));
        }

        let payload: BundleJobPayload = serde_json::from_value(payload)
            .map_err(|e| HandlerError::validation(format!("invalid bundle payload: {e}")))?;

        if payload.bundle.tenant_id != ctx.tenant_id {
            return Err(HandlerError::validation(
                "bundle tenant does not match job tenant",
            ));
        }

        let outcome = self.executor.execute(ctx.job_id, &payload).await?;

        let mut metrics = BTreeMap::new();
        metrics.insert("total".to_string(), outcome.summary.total as f64);
        metrics.insert("accepted".to_string(), outcome.summary.accepted as f64);
        metrics.insert("duplicates".to_string(), outcome.summary.duplicates as f64);
        metrics.insert("denied".to_string(), outcome.summary.denied as f64);
        metrics.insert("errors".to_string(), outcome.summary.errors as f64);
        metrics.insert(
            "action_jobs_blocked".to_string(),
            outcome.summary.action_jobs_blocked as f64,
        );

        let outputs = outcome
            .child_runs
            .iter()
            .map(|child| ArtifactDescriptor {
                name: child.request_id.clone(),
                kind: "child_job".to_string(),
                reference: child
                    .job_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| format!("{:?}", child.status).to_lowercase()),
                size: None,
                checksum: None,
                mime_type: None,
            })
            .collect();

        if !outcome.success {
            let blocked: Vec<&ChildRun> = outcome
                .child_runs
                .iter()
                .filter(|c| c.status != ChildRunStatus::Accepted && c.status != ChildRunStatus::Duplicate)
                .collect();
            let detail = blocked
                .iter()
                .map(|c| {
                    format!(
                        "{}: {}",
                        c.request_id,
                        c.reason.as_deref().unwrap_or("rejected")
                    )
                })
                .collect::<Vec<_>>()
                .join("; ");
            return Err(HandlerError::permanent(format!(
                "bundle completed with failures: {detail}"
            )));
        }

        Ok(HandlerOutput { outputs, metrics })
    }
}
