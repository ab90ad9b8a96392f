//! Autopilot layer: bundle execution and event-triggered bundle submission.

mod executor;
mod triggers;

pub use executor::{
    BundleExecutor, BundleExecutorHandler, BundleJobPayload, BundleOutcome, BUNDLE_JOB_TYPE,
    TRACE_CONTEXT_KEY,
};
pub use triggers::{BundleBuilder, TriggerEngine};
