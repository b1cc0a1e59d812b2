//! ---
//! dbr_section: "15-testing-qa-runbook"
//! dbr_subsection: "integration-tests"
//! dbr_type: "source"
//! dbr_scope: "code"
//! dbr_description: "Cluster lifecycle scenarios against the simulated node channel."
//! dbr_version: "v0.0.0-prealpha"
//! dbr_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dbr_common::{ClusterConfig, ClusterPhase, ErrorCode, PollConfig};
use dbr_metrics::{new_registry, render, OrchestratorMetrics};
use dbr_orchestrator::{
    ClusterNode, ClusterOrchestrator, CommandReply, Fault, NodeCommand, NodeControlChannel,
    NodeError, NodeId, NodeState, OrchestratorError, SimulatedChannel, StaticLauncher,
};
use parking_lot::Mutex;

fn poll_config() -> PollConfig {
    PollConfig {
        initial_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_secs(1),
        multiplier: 2.0,
        jitter: Duration::ZERO,
        converge_deadline: Duration::from_secs(10),
        save_deadline: Duration::from_secs(10),
    }
}

fn cluster_config() -> Arc<ClusterConfig> {
    Arc::new(ClusterConfig {
        nodes_per_host: 2,
        ..ClusterConfig::default()
    })
}

fn launcher() -> StaticLauncher {
    StaticLauncher::new(["c1", "c2", "c3"])
}

fn orchestrator(channel: &Arc<SimulatedChannel>) -> ClusterOrchestrator {
    ClusterOrchestrator::new(cluster_config(), poll_config(), channel.clone(), None)
}

#[tokio::test(start_paused = true)]
async fn bootstrap_waits_for_every_node() {
    let channel = Arc::new(SimulatedChannel::new());
    channel.inject(NodeId::new(1, 1), Fault::SlowProbe(3));
    let orchestrator = orchestrator(&channel);

    orchestrator.bootstrap(&launcher()).await.unwrap();

    assert_eq!(orchestrator.phase(), ClusterPhase::Ready);
    let nodes = orchestrator.nodes();
    assert_eq!(nodes.len(), 6);
    assert!(nodes.iter().all(|node| node.state == NodeState::Clustered));
    assert_eq!(channel.formation_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn never_ready_node_blocks_ready() {
    let channel = Arc::new(SimulatedChannel::new());
    channel.inject(NodeId::new(2, 0), Fault::NeverReady);
    let orchestrator = orchestrator(&channel);

    let err = orchestrator.bootstrap(&launcher()).await.unwrap_err();
    match &err {
        OrchestratorError::Timeout {
            action, pending, ..
        } => {
            assert_eq!(*action, "converge");
            assert_eq!(*pending, 1);
        }
        other => panic!("expected convergence timeout, got {other:?}"),
    }
    assert_eq!(err.code(), ErrorCode::Timeout);
    assert_eq!(orchestrator.phase(), ClusterPhase::Failed);
    assert_eq!(channel.formation_count(), 0);

    orchestrator.stop().await.unwrap();
    assert_eq!(orchestrator.phase(), ClusterPhase::Stopped);
}

#[tokio::test(start_paused = true)]
async fn launch_failure_fails_cluster() {
    let channel = Arc::new(SimulatedChannel::new());
    channel.inject(NodeId::new(0, 1), Fault::LaunchFails);
    let orchestrator = orchestrator(&channel);

    let err = orchestrator.bootstrap(&launcher()).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::FanOut {
            action: "launch",
            failed: 1,
            total: 6,
            ..
        }
    ));
    assert_eq!(err.code(), ErrorCode::BackendPost);
    assert_eq!(orchestrator.phase(), ClusterPhase::Failed);
}

#[tokio::test(start_paused = true)]
async fn save_completes_once_every_timestamp_advances() {
    let channel = Arc::new(SimulatedChannel::new());
    let orchestrator = orchestrator(&channel);
    orchestrator.bootstrap(&launcher()).await.unwrap();

    let report = orchestrator.save().await.unwrap();
    assert_eq!(report.completed.len(), 6);
    for (node, after) in &report.completed {
        assert!(after > &report.previous[node], "node {node} did not advance");
    }
    assert_eq!(orchestrator.phase(), ClusterPhase::Ready);
}

#[tokio::test(start_paused = true)]
async fn stalled_node_never_reports_false_completion() {
    let channel = Arc::new(SimulatedChannel::new());
    let orchestrator = orchestrator(&channel);
    orchestrator.bootstrap(&launcher()).await.unwrap();
    let stalled = NodeId::new(1, 0);
    channel.inject(stalled, Fault::SaveStalls);

    let err = orchestrator.save().await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Timeout {
            action: "save",
            pending: 1,
            ..
        }
    ));
    assert_eq!(orchestrator.phase(), ClusterPhase::Ready);
    assert!(orchestrator
        .nodes()
        .iter()
        .all(|node| node.state == NodeState::Clustered));

    channel.clear_faults(stalled);
    let report = orchestrator.save().await.unwrap();
    assert_eq!(report.completed.len(), 6);
}

#[tokio::test(start_paused = true)]
async fn unresponsive_node_fails_save_up_front() {
    let channel = Arc::new(SimulatedChannel::new());
    let orchestrator = orchestrator(&channel);
    orchestrator.bootstrap(&launcher()).await.unwrap();
    channel.inject(NodeId::new(0, 0), Fault::Unresponsive);

    let err = orchestrator.save().await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::FanOut {
            action: "lastsave",
            ..
        }
    ));
    assert_eq!(err.code(), ErrorCode::BackendGeneral);
    assert_eq!(orchestrator.phase(), ClusterPhase::Ready);
}

#[tokio::test(start_paused = true)]
async fn stop_is_best_effort() {
    let channel = Arc::new(SimulatedChannel::new());
    let orchestrator = orchestrator(&channel);
    orchestrator.bootstrap(&launcher()).await.unwrap();
    let stubborn = NodeId::new(0, 0);
    channel.inject(stubborn, Fault::ShutdownFails);

    let report = orchestrator.stop().await.unwrap();
    assert_eq!(report.failed(), 1);
    assert!(report.is_success());
    assert_eq!(orchestrator.phase(), ClusterPhase::Stopped);
    assert!(channel.is_running(stubborn));
    assert!(!channel.is_running(NodeId::new(2, 1)));

    let again = orchestrator.stop().await.unwrap_err();
    assert!(matches!(again, OrchestratorError::InvalidPhase { .. }));
}

#[tokio::test(start_paused = true)]
async fn cluster_formation_can_be_repeated() {
    let channel = Arc::new(SimulatedChannel::new());
    let orchestrator = orchestrator(&channel);
    orchestrator.bootstrap(&launcher()).await.unwrap();

    channel.form_cluster(&orchestrator.nodes(), 0).await.unwrap();
    assert_eq!(channel.formation_count(), 2);
    assert_eq!(orchestrator.phase(), ClusterPhase::Ready);
}

#[tokio::test(start_paused = true)]
async fn restore_reloads_every_node() {
    let channel = Arc::new(SimulatedChannel::new());
    let orchestrator = orchestrator(&channel);
    orchestrator.bootstrap(&launcher()).await.unwrap();

    let report = orchestrator.restore().await.unwrap();
    assert!(report.all_succeeded());
    assert_eq!(channel.restore_count(NodeId::new(2, 1)), 1);
    assert_eq!(orchestrator.phase(), ClusterPhase::Ready);

    channel.inject(NodeId::new(1, 1), Fault::RestoreFails);
    let err = orchestrator.restore().await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoFile);
    assert_eq!(orchestrator.phase(), ClusterPhase::Failed);
}

#[tokio::test(start_paused = true)]
async fn phase_guards_reject_out_of_order_operations() {
    let channel = Arc::new(SimulatedChannel::new());
    let orchestrator = orchestrator(&channel);

    let err = orchestrator.save().await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::InvalidPhase {
            operation: "save",
            phase: ClusterPhase::Allocating
        }
    ));
    assert!(matches!(
        orchestrator.launch().await,
        Err(OrchestratorError::NoNodes)
    ));

    let phases = orchestrator.subscribe();
    orchestrator.bootstrap(&launcher()).await.unwrap();
    assert_eq!(*phases.borrow(), ClusterPhase::Ready);
    assert!(matches!(
        orchestrator.converge().await,
        Err(OrchestratorError::InvalidPhase { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn attach_adopts_running_cluster_without_forming() {
    let channel = Arc::new(SimulatedChannel::already_running());
    let orchestrator = orchestrator(&channel);

    orchestrator.attach_running(&launcher()).await.unwrap();
    assert_eq!(orchestrator.phase(), ClusterPhase::Ready);
    assert_eq!(channel.formation_count(), 0);

    let report = orchestrator.save().await.unwrap();
    assert_eq!(report.completed.len(), 6);
}

#[tokio::test(start_paused = true)]
async fn metrics_follow_the_lifecycle() {
    let registry = new_registry();
    let metrics = OrchestratorMetrics::new(registry.clone()).unwrap();
    let channel = Arc::new(SimulatedChannel::new());
    let orchestrator =
        ClusterOrchestrator::new(cluster_config(), poll_config(), channel.clone(), Some(metrics));

    orchestrator.bootstrap(&launcher()).await.unwrap();
    orchestrator.save().await.unwrap();

    let text = render(&registry).unwrap();
    assert!(text.contains("dbr_cluster_phase 3"));
    assert!(text.contains("dbr_cluster_nodes 6"));
    assert!(text.contains("dbr_fanout_outcomes_total"));
    assert!(text.contains("dbr_poll_attempts_total"));
}

/// Simulated nodes, except that the chosen host stops answering probes, or
/// stops answering LASTSAVE once a snapshot has been requested.
#[derive(Debug, Default)]
struct SilentHostChannel {
    inner: SimulatedChannel,
    silent_host: u16,
    silent_liveness: bool,
    saving: Mutex<HashSet<NodeId>>,
}

impl SilentHostChannel {
    fn never_ready(host: u16) -> Self {
        Self {
            silent_host: host,
            silent_liveness: true,
            ..Self::default()
        }
    }

    fn silent_after_bgsave(host: u16) -> Self {
        Self {
            silent_host: host,
            ..Self::default()
        }
    }

    fn silent(&self, node: &ClusterNode) -> bool {
        node.id.host_rank == self.silent_host
    }
}

#[async_trait]
impl NodeControlChannel for SilentHostChannel {
    fn name(&self) -> &'static str {
        "silent-host"
    }

    async fn launch(&self, node: &ClusterNode) -> Result<(), NodeError> {
        self.inner.launch(node).await
    }

    async fn probe(&self, node: &ClusterNode) -> Result<bool, NodeError> {
        if self.silent_liveness && self.silent(node) {
            std::future::pending::<()>().await;
        }
        self.inner.probe(node).await
    }

    async fn exec(
        &self,
        node: &ClusterNode,
        command: NodeCommand,
    ) -> Result<CommandReply, NodeError> {
        match command {
            NodeCommand::BackgroundSave if self.silent(node) => {
                self.saving.lock().insert(node.id);
            }
            NodeCommand::LastSave if self.saving.lock().contains(&node.id) => {
                std::future::pending::<()>().await;
            }
            _ => {}
        }
        self.inner.exec(node, command).await
    }

    async fn form_cluster(&self, nodes: &[ClusterNode], replicas: u32) -> Result<(), NodeError> {
        self.inner.form_cluster(nodes, replicas).await
    }

    async fn shutdown(&self, node: &ClusterNode) -> Result<(), NodeError> {
        self.inner.shutdown(node).await
    }
}

fn bounded_cluster_config() -> Arc<ClusterConfig> {
    Arc::new(ClusterConfig {
        nodes_per_host: 2,
        command_timeout: Duration::from_secs(1),
        ..ClusterConfig::default()
    })
}

#[tokio::test(start_paused = true)]
async fn silent_host_times_out_convergence() {
    let channel = Arc::new(SilentHostChannel::never_ready(1));
    let orchestrator =
        ClusterOrchestrator::new(bounded_cluster_config(), poll_config(), channel, None);

    let launcher = launcher();
    let result = tokio::time::timeout(Duration::from_secs(3600), orchestrator.bootstrap(&launcher))
        .await
        .expect("bootstrap must return within its convergence deadline");
    match result {
        Err(OrchestratorError::Timeout {
            action, pending, ..
        }) => {
            assert_eq!(action, "converge");
            assert_eq!(pending, 2);
        }
        other => panic!("expected convergence timeout, got {other:?}"),
    }
    assert_eq!(orchestrator.phase(), ClusterPhase::Failed);
}

#[tokio::test(start_paused = true)]
async fn convergence_deadline_holds_even_when_a_call_outlives_it() {
    let channel = Arc::new(SilentHostChannel::never_ready(0));
    let orchestrator = orchestrator_with(channel, cluster_config());
    let started = tokio::time::Instant::now();

    let launcher = launcher();
    let err = tokio::time::timeout(Duration::from_secs(3600), orchestrator.bootstrap(&launcher))
        .await
        .expect("bootstrap must return within its convergence deadline")
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Timeout {
            action: "converge",
            ..
        }
    ));
    assert!(started.elapsed() <= Duration::from_secs(11));
    assert_eq!(orchestrator.phase(), ClusterPhase::Failed);
}

#[tokio::test(start_paused = true)]
async fn silent_lastsave_times_out_snapshot() {
    let channel = Arc::new(SilentHostChannel::silent_after_bgsave(2));
    let orchestrator =
        ClusterOrchestrator::new(bounded_cluster_config(), poll_config(), channel, None);
    orchestrator.bootstrap(&launcher()).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(3600), orchestrator.save())
        .await
        .expect("save must return within its deadline");
    match result {
        Err(OrchestratorError::Timeout {
            action, pending, ..
        }) => {
            assert_eq!(action, "save");
            assert_eq!(pending, 2);
        }
        other => panic!("expected snapshot timeout, got {other:?}"),
    }
    assert_eq!(orchestrator.phase(), ClusterPhase::Ready);
}

fn orchestrator_with(
    channel: Arc<dyn NodeControlChannel>,
    config: Arc<ClusterConfig>,
) -> ClusterOrchestrator {
    ClusterOrchestrator::new(config, poll_config(), channel, None)
}
