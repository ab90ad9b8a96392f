//! Trigger evaluation: event → rule matching → bundle submission, governed
//! by cooldown, hourly caps, and dedupe keys. Safety counters are durable in
//! the store so every worker observes the same history.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use async_trait::async_trait;

use forge_core::bundle::{ExecutionMode, JobRequestBundle};
use forge_core::event::EventEnvelope;
use forge_core::job::EnqueueJob;
use forge_core::store::{JobStore, ManifestStore, Store, StoreError, TriggerStore};
use forge_core::trigger::{BundleSource, TriggerDecision, TriggerEvaluation, TriggerRule};

use super::executor::{BundleJobPayload, BUNDLE_JOB_TYPE};
use crate::config::FeatureFlags;

/// Synthesizes a bundle from an event for rules with `bundle_source: builder`.
#[async_trait]
pub trait BundleBuilder: Send + Sync {
    async fn build(
        &self,
        rule: &TriggerRule,
        event: &EventEnvelope,
    ) -> Result<JobRequestBundle, String>;
}

pub struct TriggerEngine {
    store: Arc<dyn Store>,
    flags: FeatureFlags,
    builders: HashMap<String, Arc<dyn BundleBuilder>>,
}

impl TriggerEngine {
    pub fn new(store: Arc<dyn Store>, flags: FeatureFlags) -> Self {
        Self {
            store,
            flags,
            builders: HashMap::new(),
        }
    }

    pub fn register_builder(&mut self, name: impl Into<String>, builder: Arc<dyn BundleBuilder>) {
        self.builders.insert(name.into(), builder);
    }

    /// Evaluate every enabled rule of the event's tenant. Each decision is
    /// recorded; matching rules submit a bundle execution job.
    pub async fn on_event(
        &self,
        event: &EventEnvelope,
    ) -> Result<Vec<TriggerEvaluation>, StoreError> {
        let rules = self.store.list_enabled_rules(event.tenant_id).await?;
        let mut evaluations = Vec::with_capacity(rules.len());
        for rule in rules {
            let evaluation = self.evaluate_rule(&rule, event).await?;
            self.store.record_evaluation(evaluation.clone()).await?;
            if evaluation.decision == TriggerDecision::Fire {
                self.store
                    .mark_fired(rule.tenant_id, rule.rule_id, evaluation.evaluated_at)
                    .await?;
            }
            evaluations.push(evaluation);
        }
        Ok(evaluations)
    }

    async fn evaluate_rule(
        &self,
        rule: &TriggerRule,
        event: &EventEnvelope,
    ) -> Result<TriggerEvaluation, StoreError> {
        let now = Utc::now();
        let mode = effective_mode(rule);
        let dry_run = mode == ExecutionMode::DryRun;
        let dedupe_key = rule
            .safety
            .dedupe_key_template
            .as_deref()
            .map(|template| render_template(template, event));

        let evaluation = |decision: TriggerDecision, reason: String| TriggerEvaluation {
            id: Uuid::new_v4(),
            tenant_id: rule.tenant_id,
            rule_id: rule.rule_id,
            event_id: event.id,
            event_type: event.event_type.clone(),
            decision,
            reason,
            dry_run,
            dedupe_key: dedupe_key.clone(),
            evaluated_at: now,
        };

        if !rule.enabled {
            return Ok(evaluation(TriggerDecision::Disabled, "rule is disabled".into()));
        }
        if !rule
            .matcher
            .event_type_allowlist
            .iter()
            .any(|t| t == &event.event_type)
        {
            return Ok(evaluation(
                TriggerDecision::Skip,
                format!("event type {:?} not in allowlist", event.event_type),
            ));
        }
        if let Some(modules) = &rule.matcher.source_module_allowlist {
            let matched = event
                .source_module
                .as_deref()
                .map(|m| modules.iter().any(|allowed| allowed == m))
                .unwrap_or(false);
            if !matched {
                return Ok(evaluation(
                    TriggerDecision::Skip,
                    "source module not in allowlist".into(),
                ));
            }
        }
        if let Some(rule_project) = rule.project_id {
            if event.project_id != Some(rule_project) {
                return Ok(evaluation(
                    TriggerDecision::Skip,
                    "event is outside the rule's project".into(),
                ));
            }
        }
        if let Some(threshold) = rule.matcher.severity_threshold {
            let severity = event.severity().unwrap_or(i64::MIN);
            if severity < threshold {
                return Ok(evaluation(
                    TriggerDecision::Skip,
                    format!("severity {severity} below threshold {threshold}"),
                ));
            }
        }

        // safety gates
        if let Some(last) = rule.last_fired_at {
            let elapsed = now - last;
            if elapsed < Duration::seconds(rule.safety.cooldown_seconds) {
                return Ok(evaluation(
                    TriggerDecision::Cooldown,
                    format!(
                        "cooldown active: {}s of {}s elapsed",
                        elapsed.num_seconds(),
                        rule.safety.cooldown_seconds
                    ),
                ));
            }
        }
        let recent_fires = self
            .store
            .fires_in_last_hour(rule.tenant_id, rule.rule_id, now)
            .await?;
        if recent_fires >= rule.safety.max_runs_per_hour {
            return Ok(evaluation(
                TriggerDecision::RateLimited,
                format!(
                    "hourly cap reached: {recent_fires}/{}",
                    rule.safety.max_runs_per_hour
                ),
            ));
        }
        if let Some(key) = &dedupe_key {
            let window_start = now - Duration::hours(1);
            if self
                .store
                .fired_with_dedupe_key(rule.tenant_id, rule.rule_id, key, window_start)
                .await?
            {
                return Ok(evaluation(
                    TriggerDecision::Skip,
                    format!("duplicate dedupe key {key:?}"),
                ));
            }
        }

        let bundle = match self.load_bundle(rule, event).await {
            Ok(bundle) => bundle,
            Err(reason) => return Ok(evaluation(TriggerDecision::Skip, reason)),
        };

        let payload = BundleJobPayload {
            bundle,
            mode,
            policy_token: None,
        };
        let payload_value = match serde_json::to_value(&payload) {
            Ok(v) => v,
            Err(e) => {
                return Ok(evaluation(
                    TriggerDecision::Skip,
                    format!("failed to serialize bundle payload: {e}"),
                ))
            }
        };
        let idempotency_key = dedupe_key
            .clone()
            .unwrap_or_else(|| format!("trigger:{}:{}", rule.rule_id, event.id));

        let enqueue = EnqueueJob {
            tenant_id: rule.tenant_id,
            project_id: rule.project_id,
            job_type: BUNDLE_JOB_TYPE.to_string(),
            payload: payload_value,
            idempotency_key,
            priority: 0,
            max_attempts: 3,
            available_at: None,
            is_action_job: false,
            required_scopes: Vec::new(),
            trace_id: event.trace_id.clone(),
        };
        let result = self.store.enqueue_job(enqueue).await?;

        info!(
            rule_id = %rule.rule_id,
            rule = %rule.name,
            event_type = %event.event_type,
            trace_id = %event.trace_id,
            bundle_job_id = %result.job_id(),
            dry_run,
            "trigger fired"
        );

        Ok(evaluation(
            TriggerDecision::Fire,
            format!("submitted bundle job {}", result.job_id()),
        ))
    }

    async fn load_bundle(
        &self,
        rule: &TriggerRule,
        event: &EventEnvelope,
    ) -> Result<JobRequestBundle, String> {
        let mut bundle = match rule.action.bundle_source {
            BundleSource::Inline => {
                let template = rule
                    .action
                    .bundle_inline
                    .as_ref()
                    .ok_or_else(|| "rule has no inline bundle".to_string())?;
                serde_json::from_value::<JobRequestBundle>(template.clone())
                    .map_err(|e| format!("inline bundle does not parse: {e}"))?
            }
            BundleSource::ArtifactRef => {
                let reference = rule
                    .action
                    .bundle_ref
                    .as_deref()
                    .ok_or_else(|| "rule has no bundle_ref".to_string())?;
                self.load_artifact_bundle(rule, reference).await?
            }
            BundleSource::Builder => {
                let name = rule
                    .action
                    .bundle_builder
                    .as_deref()
                    .ok_or_else(|| "rule has no bundle_builder".to_string())?;
                let builder = self
                    .builders
                    .get(name)
                    .ok_or_else(|| format!("bundle builder {name:?} is not registered"))?;
                builder.build(rule, event).await?
            }
        };

        if bundle.tenant_id != rule.tenant_id {
            return Err("bundle tenant does not match rule tenant".to_string());
        }
        // fresh identity per firing; the trace follows the event
        bundle.bundle_id = Uuid::new_v4();
        bundle.trace_id = event.trace_id.clone();
        bundle.metadata.source = format!("trigger:{}", rule.name);
        bundle.metadata.triggered_at = Utc::now();
        Ok(bundle)
    }

    /// `bundle_ref` is `run_id#artifact_name`; the artifact's `ref` must
    /// carry the bundle JSON inline, raw or base64-encoded.
    async fn load_artifact_bundle(
        &self,
        rule: &TriggerRule,
        reference: &str,
    ) -> Result<JobRequestBundle, String> {
        let (run_id, artifact_name) = reference
            .split_once('#')
            .ok_or_else(|| format!("bundle_ref {reference:?} is not run_id#artifact"))?;
        let run_id: Uuid = run_id
            .parse()
            .map_err(|_| format!("bundle_ref {reference:?} has an invalid run id"))?;

        let artifacts = self
            .store
            .list_artifacts(rule.tenant_id, run_id)
            .await
            .map_err(|e| format!("bundle artifact unavailable: {e}"))?;
        let artifact = artifacts
            .into_iter()
            .find(|a| a.name == artifact_name)
            .ok_or_else(|| format!("bundle artifact {artifact_name:?} not found"))?;

        let raw = artifact.reference;
        let json = if let Some(encoded) = raw.strip_prefix("data:application/json;base64,") {
            let bytes = BASE64_STANDARD
                .decode(encoded)
                .map_err(|e| format!("bundle artifact is not valid base64: {e}"))?;
            String::from_utf8(bytes).map_err(|e| format!("bundle artifact is not utf-8: {e}"))?
        } else {
            raw
        };
        serde_json::from_str::<JobRequestBundle>(&json)
            .map_err(|e| format!("bundle artifact does not parse: {e}"))
    }
}

fn effective_mode(rule: &TriggerRule) -> ExecutionMode {
    if rule.action.mode == ExecutionMode::Execute && !rule.safety.allow_action_jobs {
        // execute without the action-job allowance degrades to dry-run
        warn!(rule_id = %rule.rule_id, "execute mode without allow_action_jobs; degrading to dry_run");
        ExecutionMode::DryRun
    } else {
        rule.action.mode
    }
}

/// Substitute `{event_type}`, `{subject_type}`, `{subject_id}` and
/// `{project_id}` placeholders.
fn render_template(template: &str, event: &EventEnvelope) -> String {
    template
        .replace("{event_type}", &event.event_type)
        .replace(
            "{subject_type}",
            event
                .subject
                .as_ref()
                .map(|s| s.kind.as_str())
                .unwrap_or(""),
        )
        .replace(
            "{subject_id}",
            event.subject.as_ref().map(|s| s.id.as_str()).unwrap_or(""),
        )
        .replace(
            "{project_id}",
            &event
                .project_id
                .map(|p| p.to_string())
                .unwrap_or_default(),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::event::EventSubject;

    #[test]
    fn template_rendering_substitutes_event_fields() {
        let event = EventEnvelope::builder()
            .event_type("infrastructure.alert")
            .trace_id("tr")
            .tenant_id(Uuid::new_v4())
            .source_app("monitor")
            .subject(EventSubject {
                kind: "host".into(),
                id: "db-1".into(),
            })
            .build();
        assert_eq!(
            render_template("{event_type}:{subject_type}:{subject_id}", &event),
            "infrastructure.alert:host:db-1"
        );
        assert_eq!(render_template("static-key", &event), "static-key");
    }
}
