//! Connector harness and adapters.
//!
//! Every external effect goes through [`Harness::invoke`], which enforces
//! validation, timeouts, retries, circuit breaking, and evidence emission
//! identically for every connector.

mod harness;
mod http;
pub mod ssrf;

pub use harness::{
    Connector, ConnectorConfig, ConnectorContext, ConnectorFailure, ConnectorInput,
    ConnectorOutcome, ConnectorResponse, FailureCode, Harness, RetryPolicy,
    CIRCUIT_BREAKER_OPEN, CONFIG_VALIDATION_ERROR, CONTEXT_VALIDATION_ERROR,
    INPUT_VALIDATION_ERROR,
};
pub use http::HttpConnector;
pub use ssrf::SsrfViolation;
