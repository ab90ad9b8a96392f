//! Connector harness: every external effect runs through here.
//!
//! The harness validates inputs strictly, races the connector body against a
//! timeout, retries retryable failures with jittered backoff, trips a
//! per-endpoint circuit breaker, and emits a sealed evidence packet on every
//! path, validation failures included.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use forge_core::backoff::BackoffPolicy;
use forge_core::breaker::{BreakerConfig, BreakerRegistry};
use forge_core::canonical::numbers_js_safe;
use forge_core::error::FieldIssue;
use forge_core::evidence::{EvidenceBuilder, EvidenceError, EvidencePacket};
use forge_core::job::MAX_PAYLOAD_BYTES;
use forge_core::redact;

/// Stable connector failure codes.
pub const CONFIG_VALIDATION_ERROR: &str = "CONFIG_VALIDATION_ERROR";
pub const INPUT_VALIDATION_ERROR: &str = "INPUT_VALIDATION_ERROR";
pub const CONTEXT_VALIDATION_ERROR: &str = "CONTEXT_VALIDATION_ERROR";
pub const CIRCUIT_BREAKER_OPEN: &str = "CIRCUIT_BREAKER_OPEN";

/// Retry policy for one connector.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: Duration::from_millis(200),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.base, self.multiplier, self.max_delay)
    }
}

/// Static configuration for one connector instance.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub auth_type: String,
    pub settings: Value,
    pub retry: RetryPolicy,
    pub timeout: Duration,
    pub rate_limit_per_minute: Option<u32>,
    pub allowed_hosts: Option<Vec<String>>,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            auth_type: "none".to_string(),
            settings: Value::Null,
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(10),
            rate_limit_per_minute: None,
            allowed_hosts: None,
        }
    }
}

impl ConnectorConfig {
    pub fn validate(&self) -> Vec<FieldIssue> {
        let mut issues = Vec::new();
        if self.auth_type.trim().is_empty() {
            issues.push(FieldIssue::new("auth_type", "must not be empty"));
        }
        if self.timeout.is_zero() {
            issues.push(FieldIssue::new("timeout", "must be positive"));
        }
        if self.rate_limit_per_minute == Some(0) {
            issues.push(FieldIssue::new("rate_limit_per_minute", "must be positive when set"));
        }
        issues
    }
}

/// One invocation request.
#[derive(Debug, Clone)]
pub struct ConnectorInput {
    pub operation: String,
    pub payload: Value,
    pub idempotency_key: Option<String>,
}

impl ConnectorInput {
    pub fn validate(&self) -> Vec<FieldIssue> {
        let mut issues = Vec::new();
        if self.operation.trim().is_empty() {
            issues.push(FieldIssue::new("operation", "must not be empty"));
        }
        let size = forge_core::canonical::canonical_json(&self.payload).len();
        if size > MAX_PAYLOAD_BYTES {
            issues.push(FieldIssue::new(
                "payload",
                format!("serialized size {size} exceeds {MAX_PAYLOAD_BYTES} bytes"),
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

/// Caller identity and correlation for one invocation.
#[derive(Debug, Clone)]
pub struct ConnectorContext {
    pub trace_id: String,
    pub tenant_id: Uuid,
    pub project_id: Option<Uuid>,
    pub actor_id: Option<String>,
    pub dry_run: bool,
    pub attempt: i32,
}

impl ConnectorContext {
    pub fn validate(&self) -> Vec<FieldIssue> {
        let mut issues = Vec::new();
        if self.trace_id.trim().is_empty() {
            issues.push(FieldIssue::new("trace_id", "must not be empty"));
        }
        if self.attempt < 0 {
            issues.push(FieldIssue::new("attempt", "must be non-negative"));
        }
        issues
    }
}

/// Classified connector failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCode {
    Timeout,
    RateLimit,
    Transient,
    SsrfBlocked,
    Connector,
}

impl FailureCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCode::Timeout => "TIMEOUT",
            FailureCode::RateLimit => "RATE_LIMIT",
            FailureCode::Transient => "TRANSIENT",
            FailureCode::SsrfBlocked => "SSRF_BLOCKED",
            FailureCode::Connector => "CONNECTOR_ERROR",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureCode::Timeout | FailureCode::RateLimit | FailureCode::Transient
        )
    }

    /// Whether this failure counts against the endpoint's circuit breaker.
    fn counts_for_breaker(&self) -> bool {
        !matches!(self, FailureCode::SsrfBlocked)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{}: {message}", .code.as_str())]
pub struct ConnectorFailure {
    pub code: FailureCode,
    pub message: String,
    pub status: Option<u16>,
}

impl ConnectorFailure {
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

/// Successful connector response.
#[derive(Debug, Clone)]
pub struct ConnectorResponse {
    pub data: Value,
    pub status_codes: Vec<u16>,
}

/// A pluggable adapter to an external system.
#[async_trait]
pub trait Connector: Send + Sync {
    fn id(&self) -> &str;

    /// Breaker key, usually `host:port`. `None` disables the breaker.
    fn endpoint_key(&self, config: &ConnectorConfig, input: &ConnectorInput) -> Option<String>;

    async fn call(
        &self,
        config: &ConnectorConfig,
        input: &ConnectorInput,
        ctx: &ConnectorContext,
    ) -> Result<ConnectorResponse, ConnectorFailure>;
}

/// Result of one harness invocation; the evidence packet is always present.
#[derive(Debug, Clone)]
pub struct ConnectorOutcome {
    pub ok: bool,
    pub data: Option<Value>,
    pub error: Option<EvidenceError>,
    pub evidence: EvidencePacket,
}

/// Shared harness state: breakers per endpoint and secrets to scrub.
pub struct Harness {
    breakers: BreakerRegistry,
    secrets: Vec<String>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_breaker_config(BreakerConfig::default())
    }

    pub fn with_breaker_config(config: BreakerConfig) -> Self {
        Self {
            breakers: BreakerRegistry::new(config),
            secrets: Vec::new(),
        }
    }

    /// Secrets that must never appear raw in evidence.
    pub fn with_secrets(mut self, secrets: Vec<String>) -> Self {
        self.secrets = secrets;
        self
    }

    pub async fn invoke(
        &self,
        connector: &dyn Connector,
        config: &ConnectorConfig,
        input: &ConnectorInput,
        ctx: &ConnectorContext,
    ) -> ConnectorOutcome {
        let evidence_input = json!({
            "operation": input.operation,
            "payload": input.payload,
            "settings": config.settings,
        });
        let mut evidence = EvidenceBuilder::new(
            connector.id(),
            ctx.trace_id.clone(),
            ctx.tenant_id,
            ctx.project_id,
            &evidence_input,
        );

        let mut secrets = self.secrets.clone();
        secrets.extend(redact::collect_secret_values(&config.settings));

        // fail fast on validation; no external call occurs
        for (code, issues) in [
            (CONFIG_VALIDATION_ERROR, config.validate()),
            (INPUT_VALIDATION_ERROR, input.validate()),
            (CONTEXT_VALIDATION_ERROR, ctx.validate()),
        ] {
            if !issues.is_empty() {
                let message = issues
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ");
                let error = EvidenceError {
                    code: code.to_string(),
                    message,
                    retryable: false,
                };
                return ConnectorOutcome {
                    ok: false,
                    data: None,
                    error: Some(error.clone()),
                    evidence: evidence.finish(false, None, Some(error), &secrets),
                };
            }
        }

        let breaker = connector
            .endpoint_key(config, input)
            .map(|key| (self.breakers.breaker(&key), key));

        if let Some((breaker, key)) = &breaker {
            if let Err(remaining) = breaker.try_acquire() {
                let error = EvidenceError {
                    code: CIRCUIT_BREAKER_OPEN.to_string(),
                    message: format!(
                        "circuit open for {key}; remaining_cooldown_ms={}",
                        remaining.as_millis()
                    ),
                    retryable: true,
                };
                warn!(connector = connector.id(), endpoint = %key, "circuit breaker open");
                return ConnectorOutcome {
                    ok: false,
                    data: None,
                    error: Some(error.clone()),
                    evidence: evidence.finish(false, None, Some(error), &secrets),
                };
            }
        }

        let backoff = config.retry.backoff();
        let mut last_failure: Option<ConnectorFailure> = None;

        for attempt in 0..=config.retry.max_retries {
            let result = tokio::time::timeout(config.timeout, connector.call(config, input, ctx))
                .await
                .unwrap_or_else(|_| {
                    Err(ConnectorFailure::new(
                        FailureCode::Timeout,
                        format!("connector timed out after {}ms", config.timeout.as_millis()),
                    ))
                });

            match result {
                Ok(response) => {
                    for code in &response.status_codes {
                        evidence.record_status(*code);
                    }
                    if let Some((breaker, _)) = &breaker {
                        breaker.record_success();
                    }
                    let packet = evidence.finish(true, Some(&response.data), None, &secrets);
                    return ConnectorOutcome {
                        ok: true,
                        data: Some(response.data),
                        error: None,
                        evidence: packet,
                    };
                }
                Err(failure) => {
                    if let Some(status) = failure.status {
                        evidence.record_status(status);
                    }
                    if failure.code == FailureCode::RateLimit {
                        evidence.mark_rate_limited();
                    }
                    if failure.code.counts_for_breaker() {
                        if let Some((breaker, _)) = &breaker {
                            breaker.record_failure();
                        }
                    }

                    let retry = failure.code.is_retryable() && attempt < config.retry.max_retries;
                    debug!(
                        connector = connector.id(),
                        attempt,
                        code = failure.code.as_str(),
                        retry,
                        "connector attempt failed"
                    );
                    last_failure = Some(failure);
                    if !retry {
                        break;
                    }
                    let delay = backoff.harness_delay(attempt);
                    evidence.record_retry(delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }

        let failure = last_failure.unwrap_or_else(|| {
            ConnectorFailure::new(FailureCode::Connector, "connector produced no result")
        });
        let error = EvidenceError {
            code: failure.code.as_str().to_string(),
            message: failure.message.clone(),
            retryable: failure.code.is_retryable(),
        };
        let packet = evidence.finish(false, None, Some(error.clone()), &secrets);
        ConnectorOutcome {
            ok: false,
            data: None,
            error: Some(error),
            evidence: packet,
        }
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
