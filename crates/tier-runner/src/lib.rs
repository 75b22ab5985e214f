//! Command-line driver for the tiered execution engine.
//!
//! Reads a TOML file describing the tier ladder and the endpoints behind
//! each backend id, runs one task and appends its escalation trace to a
//! JSONL telemetry file.

pub mod cli;
pub mod config;
pub mod http_backend;
pub mod static_backend;

pub use cli::{run, Args, RunReport};
pub use config::{EndpointConfig, EndpointError, RunnerConfig};
pub use http_backend::HttpBackend;
pub use static_backend::StaticBackend;
