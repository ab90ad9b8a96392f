//! HTTP connector over reqwest.
//!
//! Settings shape:
//!
//! ```json
//! { "base_url": "https://api.example.com", "headers": {"x-api-key": "..."} }
//! ```
//!
//! The operation is the HTTP method; the payload carries `path`, optional
//! `query` map, and optional `body`.

use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use super::harness::{
    Connector, ConnectorConfig, ConnectorContext, ConnectorFailure, ConnectorInput,
    ConnectorResponse, FailureCode,
};
use super::ssrf;

pub struct HttpConnector {
    id: String,
    client: reqwest::Client,
}

impl HttpConnector {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            client: reqwest::Client::new(),
        }
    }

    fn base_url(config: &ConnectorConfig) -> Result<String, ConnectorFailure> {
        config
            .settings
            .get("base_url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                ConnectorFailure::new(FailureCode::Connector, "settings.base_url is required")
            })
    }

    fn request_url(config: &ConnectorConfig, input: &ConnectorInput) -> Result<String, ConnectorFailure> {
        let base = Self::base_url(config)?;
        let path = input
            .payload
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or("/");
        Ok(format!("{}{}", base.trim_end_matches('/'), path))
    }
}

fn classify_status(status: u16) -> Option<FailureCode> {
    match status {
        429 => Some(FailureCode::RateLimit),
        500..=599 => Some(FailureCode::Transient),
        200..=399 => None,
        _ => Some(FailureCode::Connector),
    }
}

fn classify_transport(e: &reqwest::Error) -> FailureCode {
    if e.is_timeout() {
        FailureCode::Timeout
    } else if e.is_connect() || e.is_request() {
        // reset / refused / dns
        FailureCode::Transient
    } else {
        FailureCode::Connector
    }
}

#[async_trait]
impl Connector for HttpConnector {
    fn id(&self) -> &str {
        &self.id
    }

    fn endpoint_key(&self, config: &ConnectorConfig, _input: &ConnectorInput) -> Option<String> {
        let base = Self::base_url(config).ok()?;
        let url = Url::parse(&base).ok()?;
        let host = url.host_str()?;
        let port = url.port_or_known_default()?;
        Some(format!("{host}:{port}"))
    }

    async fn call(
        &self,
        config: &ConnectorConfig,
        input: &ConnectorInput,
        ctx: &ConnectorContext,
    ) -> Result<ConnectorResponse, ConnectorFailure> {
        let raw_url = Self::request_url(config, input)?;
        let url = ssrf::check_url(&raw_url, config.allowed_hosts.as_deref())
            .await
            .map_err(|violation| {
                ConnectorFailure::new(FailureCode::SsrfBlocked, violation.to_string())
            })?;

        if ctx.dry_run {
            return Ok(ConnectorResponse {
                data: serde_json::json!({"dry_run": true, "url": url.as_str()}),
                status_codes: Vec::new(),
            });
        }

        let method: reqwest::Method = input
            .operation
            .to_ascii_uppercase()
            .parse()
            .map_err(|_| {
                ConnectorFailure::new(
                    FailureCode::Connector,
                    format!("unsupported HTTP method {:?}", input.operation),
                )
            })?;

        let mut request = self.client.request(method, url).header("x-trace-id", &ctx.trace_id);

        if let Some(headers) = config.settings.get("headers").and_then(Value::as_object) {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name, value);
                }
            }
        }
        if let Some(query) = input.payload.get("query").and_then(Value::as_object) {
            let pairs: Vec<(String, String)> = query
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect();
            request = request.query(&pairs);
        }
        if let Some(body) = input.payload.get("body") {
            if !body.is_null() {
                request = request.json(body);
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| ConnectorFailure::new(classify_transport(&e), e.to_string()))?;

        let status = response.status().as_u16();
        if let Some(code) = classify_status(status) {
            return Err(ConnectorFailure::new(
                code,
                format!("upstream returned status {status}"),
            )
            .with_status(status));
        }

        let data = match response.json::<Value>().await {
            Ok(body) => body,
            Err(_) => Value::Null,
        };
        Ok(ConnectorResponse {
            data,
            status_codes: vec![status],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_base(base: &str) -> ConnectorConfig {
        ConnectorConfig {
            settings: serde_json::json!({"base_url": base}),
            ..Default::default()
        }
    }

    fn input(path: &str) -> ConnectorInput {
        ConnectorInput {
            operation: "get".into(),
            payload: serde_json::json!({"path": path}),
            idempotency_key: None,
        }
    }

    fn ctx(dry_run: bool) -> ConnectorContext {
        ConnectorContext {
            trace_id: "tr-1".into(),
            tenant_id: uuid::Uuid::new_v4(),
            project_id: None,
            actor_id: None,
            dry_run,
            attempt: 0,
        }
    }

    #[test]
    fn endpoint_key_is_host_and_port() {
        let connector = HttpConnector::new("http:test");
        let key = connector.endpoint_key(&config_with_base("https://api.example.com/v2"), &input("/x"));
        assert_eq!(key.as_deref(), Some("api.example.com:443"));
        let key = connector.endpoint_key(&config_with_base("http://api.example.com:8080"), &input("/x"));
        assert_eq!(key.as_deref(), Some("api.example.com:8080"));
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(200), None);
        assert_eq!(classify_status(301), None);
        assert_eq!(classify_status(429), Some(FailureCode::RateLimit));
        assert_eq!(classify_status(503), Some(FailureCode::Transient));
        assert_eq!(classify_status(404), Some(FailureCode::Connector));
    }

    #[tokio::test]
    async fn blocked_target_returns_ssrf_failure_without_io() {
        let connector = HttpConnector::new("http:test");
        let err = connector
            .call(
                &config_with_base("http://169.254.169.254"),
                &input("/latest/meta-data"),
                &ctx(false),
            )
            .await
            .expect_err("must be blocked");
        assert_eq!(err.code, FailureCode::SsrfBlocked);
    }

    #[tokio::test]
    async fn dry_run_skips_network_io() {
        let connector = HttpConnector::new("http:test");
        // unroutable test domain: a real request would fail, dry-run must not try
        let response = connector
            .call(
                &config_with_base("https://api.invalid"),
                &input("/ping"),
                &ctx(true),
            )
            .await
            .expect("dry run succeeds");
        assert_eq!(response.data["dry_run"], true);
        assert!(response.status_codes.is_empty());
    }
}
