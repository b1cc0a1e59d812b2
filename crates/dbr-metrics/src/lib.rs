//! ---
//! dbr_section: "03-persistence-logging"
//! dbr_subsection: "module"
//! dbr_type: "source"
//! dbr_scope: "code"
//! dbr_description: "Metrics collection and export utilities."
//! dbr_version: "v0.0.0-prealpha"
//! dbr_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::{IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::debug;

/// Shared registry type used across the workspace.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Render the registry in the Prometheus text exposition format.
pub fn render(registry: &SharedRegistry) -> Result<String> {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    encoder
        .encode_to_string(&families)
        .context("failed to encode metrics")
}

/// Metrics recorded while driving a cluster through its lifecycle.
#[derive(Clone)]
pub struct OrchestratorMetrics {
    registry: SharedRegistry,
    phase: IntGauge,
    nodes: IntGauge,
    fanout_outcomes: IntCounterVec,
    poll_attempts: IntCounterVec,
}

impl OrchestratorMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let phase = IntGauge::with_opts(Opts::new(
            "dbr_cluster_phase",
            "Ordinal of the current cluster lifecycle phase",
        ))?;
        registry.register(Box::new(phase.clone()))?;

        let nodes = IntGauge::with_opts(Opts::new(
            "dbr_cluster_nodes",
            "Number of backend nodes in the current host allocation",
        ))?;
        registry.register(Box::new(nodes.clone()))?;

        let fanout_outcomes = IntCounterVec::new(
            Opts::new(
                "dbr_fanout_outcomes_total",
                "Per-node results of fan-out actions by action and outcome",
            ),
            &["action", "outcome"],
        )?;
        registry.register(Box::new(fanout_outcomes.clone()))?;

        let poll_attempts = IntCounterVec::new(
            Opts::new(
                "dbr_poll_attempts_total",
                "Predicate evaluations performed by convergence and snapshot polling",
            ),
            &["action"],
        )?;
        registry.register(Box::new(poll_attempts.clone()))?;

        Ok(Self {
            registry,
            phase,
            nodes,
            fanout_outcomes,
            poll_attempts,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn set_phase(&self, ordinal: i64) {
        self.phase.set(ordinal);
    }

    pub fn set_node_count(&self, count: usize) {
        self.nodes.set(count as i64);
    }

    pub fn record_fanout(&self, action: &str, succeeded: usize, failed: usize) {
        self.fanout_outcomes
            .with_label_values(&[action, "success"])
            .inc_by(succeeded as u64);
        self.fanout_outcomes
            .with_label_values(&[action, "failure"])
            .inc_by(failed as u64);
        debug!(action, succeeded, failed, "fan-out outcome recorded");
    }

    pub fn record_poll_attempts(&self, action: &str, attempts: u32) {
        self.poll_attempts
            .with_label_values(&[action])
            .inc_by(u64::from(attempts));
    }
}

impl std::fmt::Debug for OrchestratorMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorMetrics")
            .field("phase", &self.phase.get())
            .field("nodes", &self.nodes.get())
            .finish_non_exhaustive()
    }
}

/// Metrics recorded by tuple-space clients.
#[derive(Clone)]
pub struct BrokerMetrics {
    operations: IntCounterVec,
    outstanding_tags: IntGauge,
}

impl BrokerMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let operations = IntCounterVec::new(
            Opts::new(
                "dbr_broker_operations_total",
                "Tuple-space operations by operation name and result code",
            ),
            &["operation", "code"],
        )?;
        registry.register(Box::new(operations.clone()))?;

        let outstanding_tags = IntGauge::with_opts(Opts::new(
            "dbr_outstanding_tags",
            "Asynchronous request tags issued but not yet collected",
        ))?;
        registry.register(Box::new(outstanding_tags.clone()))?;

        Ok(Self {
            operations,
            outstanding_tags,
        })
    }

    pub fn record(&self, operation: &str, code: &str) {
        self.operations.with_label_values(&[operation, code]).inc();
    }

    pub fn set_outstanding_tags(&self, count: usize) {
        self.outstanding_tags.set(count as i64);
    }
}

impl std::fmt::Debug for BrokerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerMetrics")
            .field("outstanding_tags", &self.outstanding_tags.get())
            .finish_non_exhaustive()
    }
}

pub use prometheus;
