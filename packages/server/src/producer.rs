//! Producer API: the in-process surface clients use to feed the core.

use serde_json::Value;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use forge_core::canonical::hash_canonical;
use forge_core::error::CoreError;
use forge_core::event::EventEnvelope;
use forge_core::job::{EnqueueJob, JobStatus};
use forge_core::manifest::{ArtifactDescriptor, RunManifest};
use forge_core::store::{EventStore, JobStore, ManifestStore, Store, StoreError};
use forge_core::trigger::TriggerEvaluation;

use crate::autopilot::TriggerEngine;
use crate::config::FeatureFlags;

/// Acknowledgement of an enqueue.
#[derive(Debug, Clone)]
pub struct EnqueueReceipt {
    pub id: Uuid,
    pub status: JobStatus,
    pub duplicate: bool,
    pub trace_id: String,
}

/// Acknowledgement of a templated job request.
#[derive(Debug, Clone)]
pub struct RequestJobReceipt {
    pub job: Option<EnqueueReceipt>,
    pub trace_id: String,
}

/// Arguments to [`Producer::request_job`].
#[derive(Debug, Clone)]
pub struct RequestJob {
    pub tenant_id: Uuid,
    pub project_id: Option<Uuid>,
    pub template_key: String,
    pub inputs: Value,
    pub trace_id: Option<String>,
    pub actor_id: Option<String>,
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct ArtifactList {
    pub items: Vec<ArtifactDescriptor>,
    pub total_count: usize,
}

/// Map a store failure into the standard error envelope surfaced at
/// external boundaries. Internal detail never leaks past the message.
pub fn error_envelope(err: &StoreError, trace_id: impl Into<String>) -> CoreError {
    let mut envelope = CoreError::new(err.kind(), err.to_string()).with_trace(trace_id);
    if let StoreError::Validation(issues) = err {
        envelope.details = issues.clone();
    }
    envelope
}

pub struct Producer {
    store: Arc<dyn Store>,
    flags: FeatureFlags,
    triggers: Arc<TriggerEngine>,
}

impl Producer {
    pub fn new(store: Arc<dyn Store>, flags: FeatureFlags, triggers: Arc<TriggerEngine>) -> Self {
        Self {
            store,
            flags,
            triggers,
        }
    }

    pub async fn enqueue_job(&self, request: EnqueueJob) -> Result<EnqueueReceipt, StoreError> {
        let result = self.store.enqueue_job(request).await?;
        let job = result.job();
        Ok(EnqueueReceipt {
            id: job.id,
            status: job.status,
            duplicate: !result.is_created(),
            trace_id: job.trace_id.clone(),
        })
    }

    /// Record an event, then run trigger evaluation when enabled. Returns the
    /// event id and any evaluations that ran.
    pub async fn submit_event(
        &self,
        event: EventEnvelope,
    ) -> Result<(Uuid, Vec<TriggerEvaluation>), StoreError> {
        let id = self.store.insert_event(event.clone()).await?;
        let evaluations = if self.flags.bundle_triggers_enabled() {
            self.triggers.on_event(&event).await?
        } else {
            debug!(event_id = %id, "bundle triggers disabled; skipping evaluation");
            Vec::new()
        };
        Ok((id, evaluations))
    }

    /// Sugar over `enqueue_job`: the template key is the job type and the
    /// idempotency key derives from the inputs, so identical requests fold
    /// into one job.
    pub async fn request_job(&self, request: RequestJob) -> Result<RequestJobReceipt, StoreError> {
        let trace_id = request
            .trace_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if request.dry_run {
            return Ok(RequestJobReceipt {
                job: None,
                trace_id,
            });
        }

        let idempotency_key = format!(
            "req:{}:{}",
            request.template_key,
            hash_canonical(&request.inputs)
        );
        let receipt = self
            .enqueue_job(EnqueueJob {
                tenant_id: request.tenant_id,
                project_id: request.project_id,
                job_type: request.template_key,
                payload: request.inputs,
                idempotency_key,
                priority: 0,
                max_attempts: 3,
                available_at: None,
                is_action_job: false,
                required_scopes: Vec::new(),
                trace_id: trace_id.clone(),
            })
            .await?;

        Ok(RequestJobReceipt {
            job: Some(receipt),
            trace_id,
        })
    }

    pub async fn get_run_manifest(
        &self,
        tenant_id: Uuid,
        run_id: Uuid,
    ) -> Result<Option<RunManifest>, StoreError> {
        self.store.get_manifest(tenant_id, run_id).await
    }

    pub async fn list_artifacts(
        &self,
        tenant_id: Uuid,
        run_id: Uuid,
    ) -> Result<ArtifactList, StoreError> {
        let items = self.store.list_artifacts(tenant_id, run_id).await?;
        Ok(ArtifactList {
            total_count: items.len(),
            items,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::error::{ErrorKind, FieldIssue};

    #[test]
    fn validation_envelope_carries_field_issues() {
        let err = StoreError::Validation(vec![FieldIssue::new("payload", "too large")]);
        let envelope = error_envelope(&err, "tr-9");
        assert_eq!(envelope.kind, ErrorKind::Validation);
        assert_eq!(envelope.code, "VALIDATION_ERROR");
        assert_eq!(envelope.trace_id.as_deref(), Some("tr-9"));
        assert_eq!(envelope.details.len(), 1);
    }

    #[test]
    fn database_envelope_is_retryable_with_its_own_code() {
        let err = StoreError::Database("connection refused".into());
        let envelope = error_envelope(&err, "tr-9");
        assert_eq!(envelope.kind, ErrorKind::Database);
        assert_eq!(envelope.code, "DATABASE_ERROR");
        assert!(envelope.is_retryable());
        assert!(envelope.details.is_empty());
    }
}
