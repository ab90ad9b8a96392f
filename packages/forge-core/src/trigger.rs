//! Trigger rules: tenant-scoped event → bundle mappings with safety gates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::bundle::ExecutionMode;
use crate::error::FieldIssue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleSource {
    Inline,
    ArtifactRef,
    Builder,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct TriggerMatch {
    pub event_type_allowlist: Vec<String>,
    #[builder(default, setter(strip_option))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_module_allowlist: Option<Vec<String>>,
    #[builder(default, setter(strip_option))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity_threshold: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct TriggerAction {
    pub bundle_source: BundleSource,
    #[builder(default, setter(strip_option))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_ref: Option<String>,
    #[builder(default, setter(strip_option))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_builder: Option<String>,
    /// Bundle template used when `bundle_source` is `inline`.
    #[builder(default, setter(strip_option))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_inline: Option<Value>,
    pub mode: ExecutionMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
pub struct TriggerSafety {
    pub cooldown_seconds: i64,
    pub max_runs_per_hour: i64,
    #[builder(default, setter(strip_option))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_key_template: Option<String>,
    #[builder(default = false)]
    #[serde(default)]
    pub allow_action_jobs: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct TriggerRule {
    #[builder(default = Uuid::new_v4())]
    pub rule_id: Uuid,
    pub tenant_id: Uuid,
    #[builder(default, setter(strip_option))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<Uuid>,
    pub name: String,
    #[builder(default = true)]
    pub enabled: bool,
    #[serde(rename = "match")]
    pub matcher: TriggerMatch,
    pub action: TriggerAction,
    pub safety: TriggerSafety,
    #[builder(default, setter(strip_option))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fired_at: Option<DateTime<Utc>>,
    #[builder(default = 0)]
    pub fire_count: i64,
}

impl TriggerRule {
    /// Rule-level validation, returning every issue.
    pub fn validate(&self) -> Vec<FieldIssue> {
        let mut issues = Vec::new();
        if self.name.trim().is_empty() {
            issues.push(FieldIssue::new("name", "must not be empty"));
        }
        if self.matcher.event_type_allowlist.is_empty() {
            issues.push(FieldIssue::new(
                "match.event_type_allowlist",
                "must not be empty",
            ));
        }
        if self.safety.cooldown_seconds < 0 {
            issues.push(FieldIssue::new("safety.cooldown_seconds", "must be non-negative"));
        }
        if self.safety.max_runs_per_hour < 1 {
            issues.push(FieldIssue::new("safety.max_runs_per_hour", "must be at least 1"));
        }
        if self.action.mode == ExecutionMode::Execute && !self.safety.allow_action_jobs {
            issues.push(FieldIssue::new(
                "action.mode",
                "execute mode requires safety.allow_action_jobs",
            ));
        }
        match self.action.bundle_source {
            BundleSource::Inline if self.action.bundle_inline.is_none() => {
                issues.push(FieldIssue::new("action.bundle_inline", "required for inline source"));
            }
            BundleSource::ArtifactRef if self.action.bundle_ref.is_none() => {
                issues.push(FieldIssue::new("action.bundle_ref", "required for artifact_ref source"));
            }
            BundleSource::Builder if self.action.bundle_builder.is_none() => {
                issues.push(FieldIssue::new("action.bundle_builder", "required for builder source"));
            }
            _ => {}
        }
        issues
    }
}

/// Outcome of evaluating one rule against one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerDecision {
    Fire,
    Skip,
    Cooldown,
    RateLimited,
    Disabled,
}

impl TriggerDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerDecision::Fire => "fire",
            TriggerDecision::Skip => "skip",
            TriggerDecision::Cooldown => "cooldown",
            TriggerDecision::RateLimited => "rate_limited",
            TriggerDecision::Disabled => "disabled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvaluation {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub rule_id: Uuid,
    pub event_id: Uuid,
    pub event_type: String,
    pub decision: TriggerDecision,
    pub reason: String,
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    pub evaluated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(tenant: Uuid) -> TriggerRule {
        TriggerRule::builder()
            .tenant_id(tenant)
            .name("alert-scan")
            .matcher(
                TriggerMatch::builder()
                    .event_type_allowlist(vec!["infrastructure.alert".to_string()])
                    .build(),
            )
            .action(
                TriggerAction::builder()
                    .bundle_source(BundleSource::Inline)
                    .bundle_inline(json!({"requests": []}))
                    .mode(ExecutionMode::DryRun)
                    .build(),
            )
            .safety(
                TriggerSafety::builder()
                    .cooldown_seconds(60)
                    .max_runs_per_hour(10)
                    .build(),
            )
            .build()
    }

    #[test]
    fn valid_rule_passes() {
        assert!(rule(Uuid::new_v4()).validate().is_empty());
    }

    #[test]
    fn execute_mode_requires_action_job_allowance() {
        let mut r = rule(Uuid::new_v4());
        r.action.mode = ExecutionMode::Execute;
        assert!(r.validate().iter().any(|i| i.field == "action.mode"));
        r.safety.allow_action_jobs = true;
        assert!(r.validate().is_empty());
    }

    #[test]
    fn inline_source_requires_inline_bundle() {
        let mut r = rule(Uuid::new_v4());
        r.action.bundle_inline = None;
        assert!(r.validate().iter().any(|i| i.field == "action.bundle_inline"));
    }

    #[test]
    fn match_key_serializes_as_wire_name() {
        let wire = serde_json::to_value(rule(Uuid::new_v4())).expect("serialize");
        assert!(wire.get("match").is_some());
        assert!(wire.get("matcher").is_none());
    }
}
