//! Evidence packets: hash-sealed receipts of connector invocations.
//!
//! A packet is emitted for every invocation, success or failure. The input
//! copy is key-redacted up front, raw secret values are scrubbed in a
//! terminal pass, and `evidence_hash` seals every other field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::canonical::hash_canonical;
use crate::redact;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidencePacket {
    pub evidence_id: Uuid,
    pub connector_id: String,
    pub trace_id: String,
    pub tenant_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub retries: u32,
    pub status_codes: Vec<u16>,
    pub redacted_input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_hash: Option<String>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EvidenceError>,
    pub backoff_delays_ms: Vec<u64>,
    pub rate_limited: bool,
    #[serde(default)]
    pub leak_scrubbed: bool,
    pub evidence_hash: String,
}

impl EvidencePacket {
    /// The packet as a JSON value, `evidence_hash` excluded; the input to
    /// the seal.
    fn hashable_value(&self) -> Value {
        json!({
            "evidence_id": self.evidence_id,
            "connector_id": self.connector_id,
            "trace_id": self.trace_id,
            "tenant_id": self.tenant_id,
            "project_id": self.project_id,
            "started_at": self.started_at,
            "ended_at": self.ended_at,
            "duration_ms": self.duration_ms,
            "retries": self.retries,
            "status_codes": self.status_codes,
            "redacted_input": self.redacted_input,
            "output_hash": self.output_hash,
            "ok": self.ok,
            "error": self.error,
            "backoff_delays_ms": self.backoff_delays_ms,
            "rate_limited": self.rate_limited,
            "leak_scrubbed": self.leak_scrubbed,
        })
    }

    /// Recompute and store the seal.
    pub fn seal(&mut self) {
        self.evidence_hash = hash_canonical(&self.hashable_value());
    }

    /// Whether the stored seal matches the packet contents.
    pub fn verify_seal(&self) -> bool {
        self.evidence_hash == hash_canonical(&self.hashable_value())
    }
}

/// Accumulates per-attempt telemetry and produces the sealed packet.
#[derive(Debug)]
pub struct EvidenceBuilder {
    connector_id: String,
    trace_id: String,
    tenant_id: Uuid,
    project_id: Option<Uuid>,
    started_at: DateTime<Utc>,
    status_codes: Vec<u16>,
    backoff_delays_ms: Vec<u64>,
    retries: u32,
    rate_limited: bool,
    redacted_input: Value,
}

impl EvidenceBuilder {
    pub fn new(
        connector_id: impl Into<String>,
        trace_id: impl Into<String>,
        tenant_id: Uuid,
        project_id: Option<Uuid>,
        input: &Value,
    ) -> Self {
        Self {
            connector_id: connector_id.into(),
            trace_id: trace_id.into(),
            tenant_id,
            project_id,
            started_at: Utc::now(),
            status_codes: Vec::new(),
            backoff_delays_ms: Vec::new(),
            retries: 0,
            rate_limited: false,
            redacted_input: redact::redact_keys(input),
        }
    }

    pub fn record_status(&mut self, code: u16) {
        self.status_codes.push(code);
    }

    pub fn record_retry(&mut self, delay: std::time::Duration) {
        self.retries += 1;
        self.backoff_delays_ms.push(delay.as_millis() as u64);
    }

    pub fn mark_rate_limited(&mut self) {
        self.rate_limited = true;
    }

    /// Build, scrub, and seal the packet.
    pub fn finish(
        self,
        ok: bool,
        output: Option<&Value>,
        error: Option<EvidenceError>,
        secrets: &[String],
    ) -> EvidencePacket {
        let ended_at = Utc::now();
        let duration_ms = (ended_at - self.started_at).num_milliseconds().max(0) as u64;
        let mut packet = EvidencePacket {
            evidence_id: Uuid::new_v4(),
            connector_id: self.connector_id,
            trace_id: self.trace_id,
            tenant_id: self.tenant_id,
            project_id: self.project_id,
            started_at: self.started_at,
            ended_at,
            duration_ms,
            retries: self.retries,
            status_codes: self.status_codes,
            redacted_input: self.redacted_input,
            output_hash: output.map(hash_canonical),
            ok,
            error,
            backoff_delays_ms: self.backoff_delays_ms,
            rate_limited: self.rate_limited,
            leak_scrubbed: false,
            evidence_hash: String::new(),
        };

        // terminal scan: no raw secret value may survive into the packet
        let mut scrubbed = redact::scrub_secret_values(&mut packet.redacted_input, secrets);
        scrubbed |= redact::scrub_str(&mut packet.connector_id, secrets);
        scrubbed |= redact::scrub_str(&mut packet.trace_id, secrets);
        if let Some(err) = packet.error.as_mut() {
            scrubbed |= redact::scrub_str(&mut err.code, secrets);
            scrubbed |= redact::scrub_str(&mut err.message, secrets);
        }
        packet.leak_scrubbed = scrubbed;

        packet.seal();
        packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn builder(input: Value) -> EvidenceBuilder {
        EvidenceBuilder::new("http:example", "tr-1", Uuid::new_v4(), None, &input)
    }

    #[test]
    fn packet_is_sealed_and_verifiable() {
        let mut b = builder(json!({"operation": "get"}));
        b.record_status(200);
        let packet = b.finish(true, Some(&json!({"rows": 3})), None, &[]);
        assert!(packet.ok);
        assert!(packet.verify_seal());
        assert!(packet.output_hash.is_some());
    }

    #[test]
    fn tampering_breaks_the_seal() {
        let packet = builder(json!({})).finish(true, None, None, &[]);
        let mut tampered = packet.clone();
        tampered.retries = 99;
        assert!(!tampered.verify_seal());
    }

    #[test]
    fn secret_keyed_input_is_redacted() {
        let packet = builder(json!({"api_key": "sk-live-1", "q": "ok"})).finish(true, None, None, &[]);
        assert_eq!(packet.redacted_input["api_key"], redact::REDACTED);
        assert_eq!(packet.redacted_input["q"], "ok");
    }

    #[test]
    fn raw_secret_leak_is_scrubbed_and_annotated() {
        let secret = "sk-live-1".to_string();
        let packet = builder(json!({"note": "used sk-live-1 for auth"}))
            .finish(
                false,
                None,
                Some(EvidenceError {
                    code: "CONNECTOR_ERROR".into(),
                    message: "upstream rejected sk-live-1".into(),
                    retryable: false,
                }),
                &[secret.clone()],
            );
        assert!(packet.leak_scrubbed);
        assert!(packet.verify_seal());
        let wire = serde_json::to_string(&packet).expect("serialize");
        assert!(!wire.contains(&secret));
    }

    #[test]
    fn retries_and_delays_are_recorded_in_order() {
        let mut b = builder(json!({}));
        b.record_status(500);
        b.record_retry(std::time::Duration::from_millis(100));
        b.record_status(429);
        b.mark_rate_limited();
        b.record_retry(std::time::Duration::from_millis(200));
        b.record_status(200);
        let packet = b.finish(true, Some(&json!({})), None, &[]);
        assert_eq!(packet.status_codes, vec![500, 429, 200]);
        assert_eq!(packet.backoff_delays_ms, vec![100, 200]);
        assert_eq!(packet.retries, 2);
        assert!(packet.rate_limited);
    }

    #[test]
    fn serde_round_trip_preserves_packet() {
        let packet = builder(json!({"a": 1})).finish(true, Some(&json!({"b": 2})), None, &[]);
        let wire = serde_json::to_string(&packet).expect("serialize");
        let parsed: EvidencePacket = serde_json::from_str(&wire).expect("parse");
        assert_eq!(parsed, packet);
        assert!(parsed.verify_seal());
    }
}
