//! Run manifests: the immutable record of what a job produced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::canonical::hash_canonical;
use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestStatus {
    Pending,
    Complete,
    Failed,
}

impl ManifestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManifestStatus::Pending => "pending",
            ManifestStatus::Complete => "complete",
            ManifestStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for ManifestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ManifestStatus::Pending),
            "complete" => Ok(ManifestStatus::Complete),
            "failed" => Ok(ManifestStatus::Failed),
            other => Err(format!("unknown manifest status: {other}")),
        }
    }
}

/// Descriptor of one produced artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct ArtifactDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "ref")]
    pub reference: String,
    #[builder(default, setter(strip_option))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[builder(default, setter(strip_option))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[builder(default, setter(strip_option))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestError {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
}

/// Immutable record of a job (or bundle) outcome.
///
/// `run_id` equals the job id for single jobs. Maps are ordered so the
/// canonical serialization is deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct RunManifest {
    pub run_id: Uuid,
    pub tenant_id: Uuid,
    #[builder(default, setter(strip_option))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<Uuid>,
    pub job_type: String,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    pub inputs_snapshot_hash: String,
    #[builder(default)]
    pub outputs: Vec<ArtifactDescriptor>,
    #[builder(default)]
    pub metrics: BTreeMap<String, f64>,
    #[builder(default)]
    pub env_fingerprint: BTreeMap<String, String>,
    #[builder(default)]
    pub tool_versions: BTreeMap<String, String>,
    pub status: ManifestStatus,
    #[builder(default, setter(strip_option))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ManifestError>,
}

impl RunManifest {
    /// Canonical hash over everything except timestamps.
    pub fn content_hash(&self) -> String {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(map) = value.as_object_mut() {
            map.remove("created_at");
        }
        hash_canonical(&value)
    }

    /// Minimal failed manifest for a terminal failure.
    pub fn failed(
        run_id: Uuid,
        tenant_id: Uuid,
        project_id: Option<Uuid>,
        job_type: impl Into<String>,
        inputs_snapshot_hash: impl Into<String>,
        error: ManifestError,
    ) -> Self {
        Self {
            run_id,
            tenant_id,
            project_id,
            job_type: job_type.into(),
            created_at: Utc::now(),
            inputs_snapshot_hash: inputs_snapshot_hash.into(),
            outputs: Vec::new(),
            metrics: BTreeMap::new(),
            env_fingerprint: BTreeMap::new(),
            tool_versions: BTreeMap::new(),
            status: ManifestStatus::Failed,
            error: Some(error),
        }
    }
}
