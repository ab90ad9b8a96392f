//! Application configuration loaded from environment variables.

use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;
use uuid::Uuid;

/// Static configuration read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub store_url: String,
    pub store_key: Option<String>,
    pub worker_id: String,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub claim_limit: i64,
    pub max_in_flight: usize,
    pub drain_deadline: Duration,
    /// Token secrets, newest first.
    pub policy_token_secrets: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            store_url: env::var("STORE_URL").context("STORE_URL must be set")?,
            store_key: env::var("STORE_KEY").ok(),
            worker_id: env::var("WORKER_ID")
                .unwrap_or_else(|_| format!("worker-{}", Uuid::new_v4())),
            poll_interval: millis_var("POLL_INTERVAL_MS", 2_000)?,
            heartbeat_interval: millis_var("HEARTBEAT_INTERVAL_MS", 30_000)?,
            claim_limit: parsed_var("CLAIM_LIMIT", 10)?,
            max_in_flight: parsed_var("MAX_IN_FLIGHT", 16)?,
            drain_deadline: millis_var("DRAIN_DEADLINE_MS", 30_000)?,
            policy_token_secrets: env::var("POLICY_TOKEN_SECRET")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        })
    }
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{name} must be a valid number")),
        Err(_) => Ok(default),
    }
}

fn millis_var(name: &str, default_ms: u64) -> Result<Duration> {
    Ok(Duration::from_millis(parsed_var(name, default_ms)?))
}

/// Runtime feature flags.
///
/// Flags are read from the environment at every check rather than cached at
/// startup, so operators can flip them on a running process. Tests pin them
/// with [`FeatureFlags::fixed`].
#[derive(Debug, Clone)]
pub enum FeatureFlags {
    FromEnv,
    Fixed {
        autopilot_jobs: bool,
        action_jobs: bool,
        bundle_triggers: bool,
        integration_dry_run: bool,
    },
}

impl FeatureFlags {
    pub fn from_env() -> Self {
        FeatureFlags::FromEnv
    }

    pub fn fixed(
        autopilot_jobs: bool,
        action_jobs: bool,
        bundle_triggers: bool,
        integration_dry_run: bool,
    ) -> Self {
        FeatureFlags::Fixed {
            autopilot_jobs,
            action_jobs,
            bundle_triggers,
            integration_dry_run,
        }
    }

    pub fn autopilot_jobs_enabled(&self) -> bool {
        match self {
            FeatureFlags::FromEnv => env_flag("AUTOPILOT_JOBS_ENABLED", false),
            FeatureFlags::Fixed { autopilot_jobs, .. } => *autopilot_jobs,
        }
    }

    pub fn action_jobs_enabled(&self) -> bool {
        match self {
            FeatureFlags::FromEnv => env_flag("ACTION_JOBS_ENABLED", false),
            FeatureFlags::Fixed { action_jobs, .. } => *action_jobs,
        }
    }

    pub fn bundle_triggers_enabled(&self) -> bool {
        match self {
            FeatureFlags::FromEnv => env_flag("BUNDLE_TRIGGERS_ENABLED", false),
            FeatureFlags::Fixed { bundle_triggers, .. } => *bundle_triggers,
        }
    }

    pub fn integration_dry_run(&self) -> bool {
        match self {
            FeatureFlags::FromEnv => env_flag("INTEGRATION_DRY_RUN", true),
            FeatureFlags::Fixed {
                integration_dry_run,
                ..
            } => *integration_dry_run,
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(raw) => matches!(raw.trim(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}
