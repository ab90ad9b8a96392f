//! JobForge execution plane.
//!
//! Layered leaves-first: the store (Postgres or in-memory via `forge-core`),
//! queue procedures, the worker runtime, the connector harness, and the
//! autopilot bundle executor with trigger evaluation. External clients talk
//! to the core through [`producer::Producer`].

pub mod autopilot;
pub mod config;
pub mod connectors;
pub mod producer;
pub mod store_pg;
pub mod worker;

pub use config::{Config, FeatureFlags};
pub use store_pg::PgStore;
