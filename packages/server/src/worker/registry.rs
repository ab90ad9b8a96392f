//! Handler registry: maps job types to handler implementations.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use forge_core::error::ErrorKind;
use forge_core::manifest::ArtifactDescriptor;
use forge_core::store::{JobStore, Store};

/// Classification a handler gives its own failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerErrorKind {
    Validation,
    Timeout,
    RateLimited,
    Transient,
    Permanent,
}

impl HandlerErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HandlerErrorKind::Timeout | HandlerErrorKind::RateLimited | HandlerErrorKind::Transient
        )
    }

    pub fn error_kind(&self) -> ErrorKind {
        match self {
            HandlerErrorKind::Validation => ErrorKind::Validation,
            HandlerErrorKind::Timeout => ErrorKind::Timeout,
            HandlerErrorKind::RateLimited => ErrorKind::RateLimited,
            HandlerErrorKind::Transient => ErrorKind::Transient,
            HandlerErrorKind::Permanent => ErrorKind::Permanent,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct HandlerError {
    pub kind: HandlerErrorKind,
    pub message: String,
}

impl HandlerError {
    pub fn new(kind: HandlerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::Validation, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::Timeout, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::RateLimited, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::Permanent, message)
    }
}

/// What a successful handler hands back to the worker.
#[derive(Debug, Clone, Default)]
pub struct HandlerOutput {
    pub outputs: Vec<ArtifactDescriptor>,
    pub metrics: BTreeMap<String, f64>,
}

/// Liveness probe handed to handlers through the context.
#[derive(Clone)]
pub struct HeartbeatHandle {
    store: Arc<dyn Store>,
    tenant_id: Uuid,
    job_id: Uuid,
    worker_id: String,
}

impl HeartbeatHandle {
    pub fn new(store: Arc<dyn Store>, tenant_id: Uuid, job_id: Uuid, worker_id: String) -> Self {
        Self {
            store,
            tenant_id,
            job_id,
            worker_id,
        }
    }

    /// Refresh the claim. Returns false once the claim is lost.
    pub async fn beat(&self) -> bool {
        self.store
            .heartbeat_job(self.tenant_id, self.job_id, &self.worker_id)
            .await
            .unwrap_or(false)
    }
}

/// Per-job execution context threaded through every handler call.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub tenant_id: Uuid,
    pub project_id: Option<Uuid>,
    pub attempt_no: i32,
    pub trace_id: String,
    pub heartbeat: HeartbeatHandle,
    /// Cancelled when the claim is lost or the worker shuts down.
    pub cancellation: CancellationToken,
}

impl JobContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// A job handler for one job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, payload: Value, ctx: JobContext) -> Result<HandlerOutput, HandlerError>;
}

/// Registry of handlers keyed by job type.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a job type.
    ///
    /// # Panics
    ///
    /// Panics if a handler is already registered for this job type.
    pub fn register(&mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let job_type = job_type.into();
        if self.handlers.contains_key(&job_type) {
            panic!("handler already registered for job type: {job_type}");
        }
        self.handlers.insert(job_type, handler);
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn has(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("registered_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;

    #[async_trait]
    impl JobHandler for NoopHandler {
        async fn run(&self, _: Value, _: JobContext) -> Result<HandlerOutput, HandlerError> {
            Ok(HandlerOutput::default())
        }
    }

    #[test]
    fn register_and_lookup() {
        let mut registry = HandlerRegistry::new();
        registry.register("ops.scan", Arc::new(NoopHandler));
        assert!(registry.has("ops.scan"));
        assert!(!registry.has("ops.other"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn duplicate_registration_panics() {
        let mut registry = HandlerRegistry::new();
        registry.register("ops.scan", Arc::new(NoopHandler));
        registry.register("ops.scan", Arc::new(NoopHandler));
    }

    #[test]
    fn handler_error_kinds_classify_retryability() {
        assert!(HandlerError::timeout("t").kind.is_retryable());
        assert!(HandlerError::rate_limited("r").kind.is_retryable());
        assert!(HandlerError::transient("t").kind.is_retryable());
        assert!(!HandlerError::validation("v").kind.is_retryable());
        assert!(!HandlerError::permanent("p").kind.is_retryable());
    }
}
