//! ---
//! dbr_section: "03-persistence-logging"
//! dbr_subsection: "module"
//! dbr_type: "source"
//! dbr_scope: "code"
//! dbr_description: "Structured logging adapters and lifecycle events."
//! dbr_version: "v0.0.0-prealpha"
//! dbr_owner: "tbd"
//! ---
#![warn(missing_docs)]

use tracing::Level;
use tracing_subscriber::{fmt as subscriber_fmt, prelude::*, EnvFilter, Registry};

pub mod macros;

/// Initialize a baseline tracing subscriber suitable for development.
pub fn init() {
    let _ = Registry::default()
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(subscriber_fmt::layer())
        .try_init();
}

/// Structured logging context propagated by the convenience macros.
#[derive(Debug, Default, Clone)]
pub struct LogContext<'a> {
    /// Cluster instance identifier.
    pub cluster: Option<&'a str>,
    /// Node index in `host-rank/local-rank` form.
    pub node: Option<&'a str>,
    /// Lifecycle phase the event belongs to.
    pub phase: Option<&'a str>,
    /// Tuple-space namespace associated with the event.
    pub namespace: Option<&'a str>,
}

impl<'a> LogContext<'a> {
    /// Create an empty logging context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a cluster identifier.
    pub fn with_cluster(mut self, cluster: &'a str) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Attach a node identifier.
    pub fn with_node(mut self, node: &'a str) -> Self {
        self.node = Some(node);
        self
    }

    /// Attach a lifecycle phase.
    pub fn with_phase(mut self, phase: &'a str) -> Self {
        self.phase = Some(phase);
        self
    }

    /// Attach a namespace name.
    pub fn with_namespace(mut self, namespace: &'a str) -> Self {
        self.namespace = Some(namespace);
        self
    }
}

/// High-level outcome used when emitting lifecycle log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEventOutcome {
    /// The operation completed successfully.
    Success,
    /// The operation failed or was aborted.
    Fault,
}

impl SystemEventOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            SystemEventOutcome::Success => "success",
            SystemEventOutcome::Fault => "fault",
        }
    }
}

/// Emit a standardized system event with a success/fault outcome.
pub fn log_system_event(
    context: Option<&LogContext>,
    event: &str,
    message: &str,
    outcome: SystemEventOutcome,
) {
    let default = LogContext::default();
    let ctx = context.unwrap_or(&default);
    match outcome {
        SystemEventOutcome::Success => tracing::event!(
            Level::INFO,
            event,
            outcome = outcome.as_str(),
            cluster = ctx.cluster.unwrap_or(""),
            node = ctx.node.unwrap_or(""),
            phase = ctx.phase.unwrap_or(""),
            namespace = ctx.namespace.unwrap_or(""),
            message = %message
        ),
        SystemEventOutcome::Fault => tracing::event!(
            Level::ERROR,
            event,
            outcome = outcome.as_str(),
            cluster = ctx.cluster.unwrap_or(""),
            node = ctx.node.unwrap_or(""),
            phase = ctx.phase.unwrap_or(""),
            namespace = ctx.namespace.unwrap_or(""),
            message = %message
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macros_emit_without_panic() {
        init();
        let ctx = LogContext::new()
            .with_cluster("c-1")
            .with_node("0-1");
        dbr_info!(context = ctx.clone(), "node launched");
        dbr_debug!("debug message");
        dbr_warn!(context = ctx.clone(), "probe retry {}", 3);
        dbr_error!(context = ctx, "error code: {}", 42);
    }

    #[test]
    fn system_event_helper_emits() {
        init();
        let ctx = LogContext::new().with_phase("saving");
        log_system_event(
            Some(&ctx),
            "cluster.phase",
            "snapshot complete",
            SystemEventOutcome::Success,
        );
        log_system_event(
            None,
            "cluster.phase",
            "snapshot stalled",
            SystemEventOutcome::Fault,
        );
    }
}
