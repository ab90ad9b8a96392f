//! Event envelope: immutable facts submitted by producers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::FieldIssue;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSubject {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct EventEnvelope {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub event_type: String,
    #[builder(default = Utc::now())]
    pub occurred_at: DateTime<Utc>,
    pub trace_id: String,
    pub tenant_id: Uuid,
    #[builder(default, setter(strip_option))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<Uuid>,
    pub source_app: String,
    #[builder(default, setter(strip_option))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_module: Option<String>,
    #[builder(default, setter(strip_option))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<EventSubject>,
    #[builder(default = Value::Null)]
    pub payload: Value,
    #[builder(default = false)]
    pub contains_pii: bool,
    #[builder(default, setter(strip_option))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redaction_hints: Option<Vec<String>>,
}

impl EventEnvelope {
    pub fn validate(&self) -> Vec<FieldIssue> {
        let mut issues = Vec::new();
        if self.event_type.trim().is_empty() {
            issues.push(FieldIssue::new("event_type", "must not be empty"));
        }
        if self.source_app.trim().is_empty() {
            issues.push(FieldIssue::new("source_app", "must not be empty"));
        }
        if self.trace_id.trim().is_empty() {
            issues.push(FieldIssue::new("trace_id", "must not be empty"));
        }
        issues
    }

    /// Numeric `severity` field from the payload, when present.
    pub fn severity(&self) -> Option<i64> {
        self.payload.get("severity").and_then(Value::as_i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> EventEnvelope {
        EventEnvelope::builder()
            .event_type("infrastructure.alert")
            .trace_id("tr-9")
            .tenant_id(Uuid::new_v4())
            .source_app("monitor")
            .payload(json!({"severity": 7, "host": "db-1"}))
            .build()
    }

    #[test]
    fn serde_round_trip_preserves_event() {
        let event = sample();
        let wire = serde_json::to_string(&event).expect("serialize");
        let parsed: EventEnvelope = serde_json::from_str(&wire).expect("parse");
        assert_eq!(parsed, event);
    }

    #[test]
    fn validation_reports_blank_fields() {
        let mut event = sample();
        event.event_type = "".into();
        event.source_app = " ".into();
        assert_eq!(event.validate().len(), 2);
    }

    #[test]
    fn severity_reads_from_payload() {
        assert_eq!(sample().severity(), Some(7));
        let mut event = sample();
        event.payload = json!({});
        assert_eq!(event.severity(), None);
    }
}
