//! Connector harness behavior: validation fail-fast, timeout, retries,
//! circuit breaking, and evidence emission on every path.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use forge_core::breaker::BreakerConfig;
use forge_core::redact::REDACTED;
use server_core::connectors::{
    Connector, ConnectorConfig, ConnectorContext, ConnectorFailure, ConnectorInput,
    ConnectorResponse, FailureCode, Harness, HttpConnector, RetryPolicy, CIRCUIT_BREAKER_OPEN,
    INPUT_VALIDATION_ERROR,
};

/// Scripted connector: pops one behavior per call, repeats the last.
struct FakeConnector {
    id: String,
    endpoint: Option<String>,
    script: Mutex<Vec<Result<ConnectorResponse, ConnectorFailure>>>,
    delay: Option<Duration>,
    calls: AtomicU32,
}

impl FakeConnector {
    fn new(script: Vec<Result<ConnectorResponse, ConnectorFailure>>) -> Self {
        Self {
            id: "fake:test".to_string(),
            endpoint: Some("fake.example.com:443".to_string()),
            script: Mutex::new(script),
            delay: None,
            calls: AtomicU32::new(0),
        }
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    fn id(&self) -> &str {
        &self.id
    }

    fn endpoint_key(&self, _: &ConnectorConfig, _: &ConnectorInput) -> Option<String> {
        self.endpoint.clone()
    }

    async fn call(
        &self,
        _: &ConnectorConfig,
        _: &ConnectorInput,
        _: &ConnectorContext,
    ) -> Result<ConnectorResponse, ConnectorFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut script = self.script.lock().expect("script lock");
        if script.len() > 1 {
            script.remove(0)
        } else {
            script[0].clone()
        }
    }
}

fn ok_response(data: serde_json::Value, status: u16) -> Result<ConnectorResponse, ConnectorFailure> {
    Ok(ConnectorResponse {
        data,
        status_codes: vec![status],
    })
}

fn failure(code: FailureCode, message: &str) -> Result<ConnectorResponse, ConnectorFailure> {
    Err(ConnectorFailure::new(code, message))
}

fn fast_config() -> ConnectorConfig {
    ConnectorConfig {
        retry: RetryPolicy {
            max_retries: 2,
            base: Duration::from_millis(5),
            multiplier: 2.0,
            max_delay: Duration::from_millis(50),
        },
        timeout: Duration::from_millis(100),
        ..Default::default()
    }
}

fn input() -> ConnectorInput {
    ConnectorInput {
        operation: "sync".to_string(),
        payload: json!({"q": "rows"}),
        idempotency_key: None,
    }
}

fn ctx() -> ConnectorContext {
    ConnectorContext {
        trace_id: "tr-harness".to_string(),
        tenant_id: Uuid::new_v4(),
        project_id: None,
        actor_id: None,
        dry_run: false,
        attempt: 0,
    }
}

#[tokio::test]
async fn success_returns_data_and_sealed_evidence() {
    let connector = FakeConnector::new(vec![ok_response(json!({"rows": 3}), 200)]);
    let harness = Harness::new();

    let outcome = harness
        .invoke(&connector, &fast_config(), &input(), &ctx())
        .await;

    assert!(outcome.ok);
    assert_eq!(outcome.data, Some(json!({"rows": 3})));
    assert!(outcome.error.is_none());
    assert!(outcome.evidence.verify_seal());
    assert_eq!(outcome.evidence.status_codes, vec![200]);
    assert_eq!(outcome.evidence.retries, 0);
    assert_eq!(
        outcome.evidence.output_hash.as_deref(),
        Some(forge_core::canonical::hash_canonical(&json!({"rows": 3})).as_str())
    );
}

#[tokio::test]
async fn validation_failure_skips_the_connector_entirely() {
    let connector = FakeConnector::new(vec![ok_response(json!({}), 200)]);
    let harness = Harness::new();
    let bad_input = ConnectorInput {
        operation: "  ".to_string(),
        payload: json!({}),
        idempotency_key: None,
    };

    let outcome = harness
        .invoke(&connector, &fast_config(), &bad_input, &ctx())
        .await;

    assert!(!outcome.ok);
    let error = outcome.error.expect("error");
    assert_eq!(error.code, INPUT_VALIDATION_ERROR);
    assert!(!error.retryable);
    assert_eq!(connector.calls(), 0, "no external call may occur");
    assert!(outcome.evidence.verify_seal());
}

#[tokio::test]
async fn timeout_is_classified_and_retried() {
    let connector =
        FakeConnector::new(vec![ok_response(json!({}), 200)]).slow(Duration::from_millis(300));
    let mut config = fast_config();
    config.timeout = Duration::from_millis(20);
    config.retry.max_retries = 1;
    let harness = Harness::new();

    let outcome = harness.invoke(&connector, &config, &input(), &ctx()).await;

    assert!(!outcome.ok);
    let error = outcome.error.expect("error");
    assert_eq!(error.code, "TIMEOUT");
    assert!(error.retryable);
    assert_eq!(connector.calls(), 2, "one retry after the first timeout");
    assert_eq!(outcome.evidence.retries, 1);
    assert_eq!(outcome.evidence.backoff_delays_ms.len(), 1);
}

#[tokio::test]
async fn rate_limit_marks_evidence_and_retries() {
    let connector = FakeConnector::new(vec![Err(ConnectorFailure::new(
        FailureCode::RateLimit,
        "upstream returned status 429",
    )
    .with_status(429))]);
    let harness = Harness::new();

    let outcome = harness
        .invoke(&connector, &fast_config(), &input(), &ctx())
        .await;

    assert!(!outcome.ok);
    assert_eq!(outcome.error.expect("error").code, "RATE_LIMIT");
    assert!(outcome.evidence.rate_limited);
    assert_eq!(connector.calls(), 3, "initial call plus two retries");
    assert_eq!(outcome.evidence.status_codes, vec![429, 429, 429]);
}

#[tokio::test]
async fn transient_failure_recovers_on_retry() {
    let connector = FakeConnector::new(vec![
        failure(FailureCode::Transient, "connection reset"),
        ok_response(json!({"ok": true}), 200),
    ]);
    let harness = Harness::new();

    let outcome = harness
        .invoke(&connector, &fast_config(), &input(), &ctx())
        .await;

    assert!(outcome.ok);
    assert_eq!(connector.calls(), 2);
    assert_eq!(outcome.evidence.retries, 1);
}

#[tokio::test]
async fn non_retryable_failure_stops_after_one_attempt() {
    let connector = FakeConnector::new(vec![failure(FailureCode::Connector, "bad request")]);
    let harness = Harness::new();

    let outcome = harness
        .invoke(&connector, &fast_config(), &input(), &ctx())
        .await;

    assert!(!outcome.ok);
    assert_eq!(connector.calls(), 1);
    assert_eq!(outcome.evidence.retries, 0);
    let error = outcome.error.expect("error");
    assert_eq!(error.code, "CONNECTOR_ERROR");
    assert!(!error.retryable);
}

#[tokio::test]
async fn breaker_trips_after_five_failures_and_recovers() {
    let mut script = vec![failure(FailureCode::Transient, "connection refused"); 5];
    script.push(ok_response(json!({"up": true}), 200));
    let connector = FakeConnector::new(script);

    let harness = Harness::with_breaker_config(BreakerConfig {
        failure_threshold: 5,
        cooldown: Duration::from_millis(100),
    });
    let mut config = fast_config();
    config.retry.max_retries = 0;

    // five consecutive failures open the circuit
    for _ in 0..5 {
        let outcome = harness.invoke(&connector, &config, &input(), &ctx()).await;
        assert!(!outcome.ok);
        assert_eq!(outcome.error.expect("error").code, "TRANSIENT");
    }
    assert_eq!(connector.calls(), 5);

    // sixth call fails fast without touching the connector
    let outcome = harness.invoke(&connector, &config, &input(), &ctx()).await;
    assert!(!outcome.ok);
    let error = outcome.error.expect("error");
    assert_eq!(error.code, CIRCUIT_BREAKER_OPEN);
    assert!(error.message.contains("remaining_cooldown_ms="));
    assert_eq!(connector.calls(), 5, "open circuit must not call out");
    assert!(outcome.evidence.verify_seal());

    // after the cooldown a probe succeeds and the circuit closes
    tokio::time::sleep(Duration::from_millis(120)).await;
    let outcome = harness.invoke(&connector, &config, &input(), &ctx()).await;
    assert!(outcome.ok);
    assert_eq!(connector.calls(), 6);

    let outcome = harness.invoke(&connector, &config, &input(), &ctx()).await;
    assert!(outcome.ok, "circuit stays closed after recovery");
}

#[tokio::test]
async fn secrets_never_reach_the_evidence_packet() {
    let secret = "sk-live-12345";
    let connector = FakeConnector::new(vec![failure(
        FailureCode::Connector,
        "upstream rejected key sk-live-12345",
    )]);
    let mut config = fast_config();
    config.settings = json!({"api_key": secret, "region": "us"});
    let harness = Harness::new();

    let outcome = harness.invoke(&connector, &config, &input(), &ctx()).await;

    assert!(!outcome.ok);
    let wire = serde_json::to_string(&outcome.evidence).expect("serialize");
    assert!(!wire.contains(secret), "raw secret leaked: {wire}");
    assert_eq!(outcome.evidence.redacted_input["settings"]["api_key"], REDACTED);
    assert_eq!(outcome.evidence.redacted_input["settings"]["region"], "us");
    assert!(outcome.evidence.leak_scrubbed);
    assert!(outcome.evidence.verify_seal());
}

#[tokio::test]
async fn http_connector_ssrf_violation_fails_without_retry() {
    let connector = HttpConnector::new("http:metadata");
    let mut config = fast_config();
    config.settings = json!({"base_url": "http://169.254.169.254"});
    let harness = Harness::new();

    let outcome = harness
        .invoke(
            &connector,
            &config,
            &ConnectorInput {
                operation: "get".to_string(),
                payload: json!({"path": "/latest/meta-data"}),
                idempotency_key: None,
            },
            &ctx(),
        )
        .await;

    assert!(!outcome.ok);
    let error = outcome.error.expect("error");
    assert_eq!(error.code, "SSRF_BLOCKED");
    assert!(!error.retryable);
    assert_eq!(outcome.evidence.retries, 0);
    assert!(outcome.evidence.verify_seal());
}
