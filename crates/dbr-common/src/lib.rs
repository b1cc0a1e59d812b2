//! ---
//! dbr_section: "01-core-functionality"
//! dbr_subsection: "module"
//! dbr_type: "source"
//! dbr_scope: "code"
//! dbr_description: "Shared primitives and utilities for the Data Broker."
//! dbr_version: "v0.0.0-prealpha"
//! dbr_owner: "tbd"
//! ---
//! Core shared primitives for the Data Broker workspace.
//! This crate exposes the result-code vocabulary, the cluster phase model,
//! configuration loading, and tracing initialisation consumed across the workspace.

pub mod config;
pub mod error_code;
pub mod logging;
pub mod phase;

pub use config::{
    ClientConfig, ClusterConfig, DbrConfig, LoadedDbrConfig, LoggingConfig, MetricsConfig,
    PollConfig, ToolConfig,
};
pub use error_code::{error_message, ErrorCode};
pub use logging::{init_tracing, LogFormat};
pub use phase::ClusterPhase;

/// Protocol version implemented by this workspace.
pub const PROTOCOL_VERSION: &str = "0.6.1";

/// Maximum length in bytes of namespace names, tuple names, and match templates.
pub const MAX_KEY_LEN: usize = 1023;
