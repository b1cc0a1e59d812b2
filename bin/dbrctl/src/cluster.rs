//! ---
//! dbr_section: "05-networking-external-interfaces"
//! dbr_subsection: "binary"
//! dbr_type: "source"
//! dbr_scope: "code"
//! dbr_description: "Cluster-wide lifecycle commands of the control CLI."
//! dbr_version: "v0.0.0-prealpha"
//! dbr_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use dbr_common::{ClusterConfig, DbrConfig};
use dbr_metrics::{new_registry, OrchestratorMetrics, SharedRegistry};
use dbr_orchestrator::{
    fan_out, Aggregation, ClusterNode, ClusterOrchestrator, FanOutReport, HostfileLauncher,
    JobLauncher, LocalProcessChannel, NodeControlChannel, NodeState, ReentrantChannel,
    SimulatedChannel, StaticLauncher,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::{ChannelKind, HostArgs};

/// Everything a command needs, built once from the command line and configuration.
pub struct CommandContext {
    pub config: DbrConfig,
    pub cluster: Arc<ClusterConfig>,
    pub channel: ChannelKind,
    pub hosts: HostArgs,
    pub registry: SharedRegistry,
}

impl CommandContext {
    pub fn new(config: DbrConfig, channel: ChannelKind, hosts: HostArgs) -> Self {
        Self {
            cluster: Arc::new(config.cluster.clone()),
            config,
            channel,
            hosts,
            registry: new_registry(),
        }
    }

    pub fn launcher(&self) -> Box<dyn JobLauncher> {
        if !self.hosts.hosts.is_empty() {
            return Box::new(StaticLauncher::new(self.hosts.hosts.iter().cloned()));
        }
        match &self.hosts.hostfile {
            Some(path) => Box::new(HostfileLauncher::with_path(path)),
            None => Box::new(HostfileLauncher::from_env()),
        }
    }

    /// Channel for this invocation. `adopt` marks nodes started by an earlier invocation.
    pub fn node_channel(&self, adopt: bool) -> Result<Arc<dyn NodeControlChannel>> {
        Ok(match self.channel {
            ChannelKind::Reentrant => {
                let program =
                    std::env::current_exe().context("unable to locate the dbrctl executable")?;
                Arc::new(ReentrantChannel::new(self.cluster.clone(), program))
            }
            ChannelKind::Local => Arc::new(LocalProcessChannel::new(self.cluster.clone())),
            ChannelKind::Simulated if adopt => Arc::new(SimulatedChannel::already_running()),
            ChannelKind::Simulated => Arc::new(SimulatedChannel::new()),
        })
    }

    pub fn orchestrator(&self, adopt: bool) -> Result<ClusterOrchestrator> {
        let metrics = OrchestratorMetrics::new(self.registry.clone())
            .context("failed to register orchestrator metrics")?;
        Ok(ClusterOrchestrator::new(
            self.cluster.clone(),
            self.config.poll.clone(),
            self.node_channel(adopt)?,
            Some(metrics),
        ))
    }
}

#[derive(Debug, Serialize)]
struct NodeSummary {
    node: String,
    host: String,
    endpoint: String,
    state: NodeState,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct ClusterSummary {
    cluster: String,
    channel: &'static str,
    phase: String,
    nodes: Vec<NodeSummary>,
}

fn summarize<T>(
    orchestrator: &ClusterOrchestrator,
    report: Option<&FanOutReport<T>>,
) -> ClusterSummary {
    let nodes = orchestrator
        .nodes()
        .into_iter()
        .map(|node| {
            let error = report.and_then(|report| {
                report
                    .failures()
                    .find(|(id, _)| *id == node.id)
                    .map(|(_, err)| err.to_string())
            });
            NodeSummary {
                node: node.id.to_string(),
                endpoint: node.endpoint(),
                host: node.host,
                state: node.state,
                error,
            }
        })
        .collect();
    ClusterSummary {
        cluster: orchestrator.id().to_string(),
        channel: orchestrator.channel_name(),
        phase: orchestrator.phase().to_string(),
        nodes,
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn start(context: &CommandContext) -> Result<()> {
    let orchestrator = context.orchestrator(false)?;
    let launcher = context.launcher();
    orchestrator
        .bootstrap(launcher.as_ref())
        .await
        .context("cluster start failed")?;
    info!(cluster = %orchestrator.id(), nodes = orchestrator.nodes().len(), "cluster ready");
    print_json(&summarize::<()>(&orchestrator, None))
}

pub async fn launch_all(context: &CommandContext) -> Result<()> {
    let orchestrator = context.orchestrator(false)?;
    let launcher = context.launcher();
    orchestrator.allocate(launcher.as_ref()).await?;
    orchestrator.launch().await.context("node launch failed")?;
    print_json(&summarize::<()>(&orchestrator, None))
}

pub async fn stop(context: &CommandContext) -> Result<()> {
    let orchestrator = context.orchestrator(true)?;
    let launcher = context.launcher();
    orchestrator.allocate(launcher.as_ref()).await?;
    let report = orchestrator.stop().await.context("cluster stop failed")?;
    print_json(&summarize(&orchestrator, Some(&report)))?;
    shutdown_verdict(&report)
}

/// Shutdown is best-effort, but the exit status still reports nodes that refused it.
fn shutdown_verdict<T>(report: &FanOutReport<T>) -> Result<()> {
    if !report.all_succeeded() {
        warn!(failed = report.failed(), total = report.total(), "shutdown incomplete");
        bail!(
            "shutdown failed on {} of {} nodes",
            report.failed(),
            report.total()
        );
    }
    Ok(())
}

pub async fn save(context: &CommandContext) -> Result<()> {
    let orchestrator = context.orchestrator(true)?;
    let launcher = context.launcher();
    orchestrator
        .attach_running(launcher.as_ref())
        .await
        .context("cluster is not reachable")?;
    let report = orchestrator.save().await.context("snapshot failed")?;

    #[derive(Serialize)]
    struct SaveSummary {
        cluster: String,
        attempts: u32,
        elapsed_ms: u128,
        lastsave: Vec<(String, u64)>,
    }
    print_json(&SaveSummary {
        cluster: orchestrator.id().to_string(),
        attempts: report.attempts,
        elapsed_ms: report.elapsed.as_millis(),
        lastsave: report
            .completed
            .iter()
            .map(|(id, ts)| (id.to_string(), *ts))
            .collect(),
    })
}

pub async fn restore(context: &CommandContext) -> Result<()> {
    let orchestrator = context.orchestrator(true)?;
    let launcher = context.launcher();
    orchestrator
        .attach_running(launcher.as_ref())
        .await
        .context("cluster is not reachable")?;
    let report = orchestrator.restore().await.context("restore failed")?;
    print_json(&summarize(&orchestrator, Some(&report)))
}

pub async fn status(context: &CommandContext) -> Result<()> {
    let orchestrator = context.orchestrator(true)?;
    let launcher = context.launcher();
    orchestrator.allocate(launcher.as_ref()).await?;
    let nodes: Vec<ClusterNode> = orchestrator.nodes();
    let channel = context.node_channel(true)?;
    let report = fan_out(
        "probe",
        &nodes,
        context.cluster.fanout_concurrency,
        Aggregation::BestEffort,
        |node| channel.probe(node),
    )
    .await;

    #[derive(Serialize)]
    struct ProbeSummary {
        node: String,
        endpoint: String,
        ready: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    }
    let probes: Vec<ProbeSummary> = nodes
        .iter()
        .zip(&report.outcomes)
        .map(|(node, outcome)| ProbeSummary {
            node: node.id.to_string(),
            endpoint: node.endpoint(),
            ready: matches!(outcome.result, Ok(true)),
            error: outcome.result.as_ref().err().map(ToString::to_string),
        })
        .collect();
    print_json(&probes)
}

const REDACTED: &str = "<redacted>";

pub fn print_config(context: &CommandContext) -> Result<()> {
    print_json(&redacted(&context.config))
}

/// Copy of the configuration safe to print: credentials are masked.
fn redacted(config: &DbrConfig) -> DbrConfig {
    let mut shown = config.clone();
    if shown.cluster.password.is_some() {
        shown.cluster.password = Some(REDACTED.to_owned());
    }
    shown
}

#[cfg(test)]
mod tests {
    use dbr_orchestrator::{NodeError, NodeId, NodeOutcome};

    use super::*;

    fn shutdown_report(failures: usize) -> FanOutReport<()> {
        let outcomes = (0..3u16)
            .map(|host| {
                let node = NodeId::new(host, 0);
                let result = if usize::from(host) < failures {
                    Err(NodeError::Unreachable {
                        node,
                        reason: "connection refused".into(),
                    })
                } else {
                    Ok(())
                };
                NodeOutcome { node, result }
            })
            .collect();
        FanOutReport {
            action: "shutdown",
            rule: Aggregation::BestEffort,
            outcomes,
        }
    }

    #[test]
    fn partial_shutdown_is_an_error() {
        assert!(shutdown_verdict(&shutdown_report(0)).is_ok());
        let err = shutdown_verdict(&shutdown_report(2)).unwrap_err();
        assert_eq!(err.to_string(), "shutdown failed on 2 of 3 nodes");
    }

    #[test]
    fn password_never_printed() {
        let config = DbrConfig::default();
        assert_eq!(config.cluster.password.as_deref(), Some("foobared"));
        let shown = redacted(&config);
        assert_eq!(shown.cluster.password.as_deref(), Some(REDACTED));
        assert_eq!(shown.cluster.base_port, config.cluster.base_port);
        assert_eq!(config.cluster.password.as_deref(), Some("foobared"));
    }
}
