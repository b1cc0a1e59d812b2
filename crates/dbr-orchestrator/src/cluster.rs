//! ---
//! dbr_section: "04-configuration-orchestration"
//! dbr_subsection: "module"
//! dbr_type: "source"
//! dbr_scope: "code"
//! dbr_description: "Cluster lifecycle state machine driving backend nodes through fan-out phases."
//! dbr_version: "v0.0.0-prealpha"
//! dbr_owner: "tbd"
//! ---
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dbr_common::{ClusterConfig, ClusterPhase, ErrorCode, PollConfig};
use dbr_logging::{dbr_warn, log_system_event, LogContext, SystemEventOutcome};
use dbr_metrics::OrchestratorMetrics;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::allocation::{AllocationError, HostAllocation, JobLauncher, NodeId};
use crate::channel::{CommandReply, NodeCommand, NodeControlChannel, NodeError};
use crate::fanout::{fan_out, Aggregation, FanOutReport};
use crate::node::{plan_nodes, ClusterNode, NodeState};
use crate::poll::{poll_until, BackoffPolicy, PollOutcome};

/// Phase-level orchestration failure.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("{operation} is not permitted in phase {phase}")]
    InvalidPhase {
        operation: &'static str,
        phase: ClusterPhase,
    },
    #[error("host allocation failed: {0}")]
    Allocation(#[from] AllocationError),
    #[error("no nodes have been allocated")]
    NoNodes,
    #[error("{action} failed on {failed} of {total} nodes: {first}")]
    FanOut {
        action: &'static str,
        failed: usize,
        total: usize,
        first: NodeError,
    },
    #[error("{action} did not complete within {deadline:?} ({pending} nodes pending after {attempts} attempts)")]
    Timeout {
        action: &'static str,
        deadline: Duration,
        attempts: u32,
        pending: usize,
    },
    #[error(transparent)]
    Node(#[from] NodeError),
}

impl OrchestratorError {
    pub fn code(&self) -> ErrorCode {
        match self {
            OrchestratorError::InvalidPhase { .. } | OrchestratorError::NoNodes => {
                ErrorCode::InvalidOperation
            }
            OrchestratorError::Allocation(err) => err.code(),
            OrchestratorError::FanOut { first, .. } => first.code(),
            OrchestratorError::Timeout { .. } => ErrorCode::Timeout,
            OrchestratorError::Node(err) => err.code(),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Per-node snapshot timestamps observed once a save completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveReport {
    pub previous: BTreeMap<NodeId, u64>,
    pub completed: BTreeMap<NodeId, u64>,
    pub attempts: u32,
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
struct ClusterState {
    allocation: Option<HostAllocation>,
    nodes: Vec<ClusterNode>,
}

/// Drives one cluster instance through its lifecycle.
///
/// The orchestrator is the single writer of the cluster phase. Readers obtain a
/// [`watch::Receiver`] through [`ClusterOrchestrator::subscribe`].
#[derive(Debug)]
pub struct ClusterOrchestrator {
    id: Uuid,
    config: Arc<ClusterConfig>,
    poll: PollConfig,
    backoff: BackoffPolicy,
    channel: Arc<dyn NodeControlChannel>,
    state: Mutex<ClusterState>,
    phase_tx: watch::Sender<ClusterPhase>,
    ops: tokio::sync::Mutex<()>,
    metrics: Option<OrchestratorMetrics>,
}

impl ClusterOrchestrator {
    pub fn new(
        config: Arc<ClusterConfig>,
        poll: PollConfig,
        channel: Arc<dyn NodeControlChannel>,
        metrics: Option<OrchestratorMetrics>,
    ) -> Self {
        let (phase_tx, _) = watch::channel(ClusterPhase::Allocating);
        if let Some(metrics) = &metrics {
            metrics.set_phase(ClusterPhase::Allocating.ordinal());
        }
        Self {
            id: Uuid::new_v4(),
            backoff: BackoffPolicy::from_config(&poll),
            config,
            poll,
            channel,
            state: Mutex::new(ClusterState::default()),
            phase_tx,
            ops: tokio::sync::Mutex::new(()),
            metrics,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &Arc<ClusterConfig> {
        &self.config
    }

    pub fn channel_name(&self) -> &'static str {
        self.channel.name()
    }

    pub fn phase(&self) -> ClusterPhase {
        *self.phase_tx.borrow()
    }

    /// Read-only view of phase changes, suitable for binding a tuple-space backend.
    pub fn subscribe(&self) -> watch::Receiver<ClusterPhase> {
        self.phase_tx.subscribe()
    }

    pub fn nodes(&self) -> Vec<ClusterNode> {
        self.state.lock().nodes.clone()
    }

    pub fn allocation(&self) -> Option<HostAllocation> {
        self.state.lock().allocation.clone()
    }

    /// Obtain the host allocation and plan the node set. Phase stays ALLOCATING.
    pub async fn allocate(&self, launcher: &dyn JobLauncher) -> Result<HostAllocation> {
        let _guard = self.ops.lock().await;
        self.require("allocate", &[ClusterPhase::Allocating])?;
        if self.state.lock().allocation.is_some() {
            return Err(OrchestratorError::InvalidPhase {
                operation: "allocate",
                phase: ClusterPhase::Allocating,
            });
        }

        let allocation = match launcher.allocate(&self.config).await {
            Ok(allocation) => allocation,
            Err(err) => {
                self.event("allocate", &err.to_string(), SystemEventOutcome::Fault);
                return Err(err.into());
            }
        };
        let nodes = plan_nodes(&allocation, &self.config);
        info!(
            cluster = %self.id,
            launcher = launcher.name(),
            hosts = allocation.hosts().len(),
            nodes = nodes.len(),
            "cluster nodes planned"
        );
        if let Some(metrics) = &self.metrics {
            metrics.set_node_count(nodes.len());
        }
        let mut state = self.state.lock();
        state.allocation = Some(allocation.clone());
        state.nodes = nodes;
        Ok(allocation)
    }

    /// Start one process per planned node. Any failure fails the cluster.
    pub async fn launch(&self) -> Result<()> {
        let _guard = self.ops.lock().await;
        self.require("launch", &[ClusterPhase::Allocating])?;
        let nodes = self.planned_nodes()?;
        self.transition(ClusterPhase::Launching)?;

        let (channel, limit) = (&self.channel, self.config.command_timeout);
        let report = fan_out(
            "launch",
            &nodes,
            self.config.fanout_concurrency,
            Aggregation::AllMustSucceed,
            |node| bounded(limit, node, "launch", channel.launch(node)),
        )
        .await;
        self.observe(&report);
        if let Err(err) = Self::verdict(&report) {
            self.fail(&err);
            return Err(err);
        }
        self.set_node_states(NodeState::Launched);
        Ok(())
    }

    /// Wait for every node to answer its probe, then form the cluster.
    pub async fn converge(&self) -> Result<()> {
        let _guard = self.ops.lock().await;
        self.require("converge", &[ClusterPhase::Launching])?;
        self.converge_nodes(true).await
    }

    /// ALLOCATING through READY in one call.
    pub async fn bootstrap(&self, launcher: &dyn JobLauncher) -> Result<()> {
        self.allocate(launcher).await?;
        self.launch().await?;
        self.converge().await
    }

    /// Adopt nodes that are already running and clustered: probe only, no launch or formation.
    pub async fn attach_running(&self, launcher: &dyn JobLauncher) -> Result<()> {
        self.allocate(launcher).await?;
        let _guard = self.ops.lock().await;
        self.require("attach", &[ClusterPhase::Allocating])?;
        self.converge_nodes(false).await
    }

    /// Snapshot every node and wait until each node's snapshot timestamp has advanced.
    ///
    /// A save that fails or times out returns the cluster to READY; the error
    /// names how many nodes never confirmed.
    pub async fn save(&self) -> Result<SaveReport> {
        let _guard = self.ops.lock().await;
        self.require("save", &[ClusterPhase::Ready])?;
        let nodes = self.planned_nodes()?;
        self.transition(ClusterPhase::Saving)?;
        self.set_node_states(NodeState::Saving);

        let result = self.save_nodes(&nodes).await;
        self.set_node_states(NodeState::Clustered);
        match &result {
            Ok(report) => info!(
                cluster = %self.id,
                nodes = report.completed.len(),
                attempts = report.attempts,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "snapshot complete on every node"
            ),
            Err(err) => {
                warn!(cluster = %self.id, code = %err.code(), error = %err, "snapshot failed");
                self.event("save", &err.to_string(), SystemEventOutcome::Fault);
            }
        }
        self.transition(ClusterPhase::Ready)?;
        result
    }

    /// Reload every node from its dump file.
    pub async fn restore(&self) -> Result<FanOutReport<CommandReply>> {
        let _guard = self.ops.lock().await;
        self.require("restore", &[ClusterPhase::Ready])?;
        let nodes = self.planned_nodes()?;
        self.transition(ClusterPhase::Restoring)?;

        let (channel, limit) = (&self.channel, self.config.command_timeout);
        let report = fan_out(
            "restore",
            &nodes,
            self.config.fanout_concurrency,
            Aggregation::AllMustSucceed,
            |node| bounded(limit, node, "restore", channel.exec(node, NodeCommand::Restore)),
        )
        .await;
        self.observe(&report);
        if let Err(err) = Self::verdict(&report) {
            self.fail(&err);
            return Err(err);
        }
        self.transition(ClusterPhase::Ready)?;
        Ok(report)
    }

    /// Shut every node down. Per-node failures are reported in the returned
    /// report but never block reaching STOPPED.
    pub async fn stop(&self) -> Result<FanOutReport<()>> {
        let _guard = self.ops.lock().await;
        let phase = self.phase();
        if !phase.can_transition_to(ClusterPhase::Stopping) {
            return Err(OrchestratorError::InvalidPhase {
                operation: "stop",
                phase,
            });
        }
        self.transition(ClusterPhase::Stopping)?;
        let nodes = self.nodes();

        let (channel, limit) = (&self.channel, self.config.command_timeout);
        let report = fan_out(
            "shutdown",
            &nodes,
            self.config.fanout_concurrency,
            Aggregation::BestEffort,
            |node| bounded(limit, node, "shutdown", channel.shutdown(node)),
        )
        .await;
        self.observe(&report);
        self.set_node_states(NodeState::Stopped);
        if !report.all_succeeded() {
            warn!(
                cluster = %self.id,
                failed = report.failed(),
                total = report.total(),
                "some nodes did not acknowledge shutdown"
            );
        }
        self.transition(ClusterPhase::Stopped)?;
        Ok(report)
    }

    async fn converge_nodes(&self, form: bool) -> Result<()> {
        let nodes = self.planned_nodes()?;
        self.transition(ClusterPhase::Converging)?;

        let deadline = self.poll.converge_deadline;
        let ready: Mutex<HashSet<NodeId>> = Mutex::new(HashSet::new());
        let (channel, limit) = (&self.channel, self.config.command_timeout);
        let concurrency = self.config.fanout_concurrency;
        let (ready_ref, nodes_ref) = (&ready, &nodes);
        let outcome = poll_until(&self.backoff, deadline, |attempt| async move {
            let pending: Vec<ClusterNode> = {
                let done = ready_ref.lock();
                nodes_ref
                    .iter()
                    .filter(|node| !done.contains(&node.id))
                    .cloned()
                    .collect()
            };
            let report = fan_out("probe", &pending, concurrency, Aggregation::BestEffort, |node| {
                bounded(limit, node, "probe", channel.probe(node))
            })
            .await;
            let mut done = ready_ref.lock();
            for (node, up) in report.values() {
                if *up {
                    done.insert(node);
                }
            }
            debug!(attempt, ready = done.len(), total = nodes_ref.len(), "convergence probe");
            (done.len() == nodes_ref.len()).then_some(())
        })
        .await;
        self.record_poll("converge", outcome.attempts());

        if let PollOutcome::TimedOut { attempts, .. } = outcome {
            let pending = nodes.len() - ready.lock().len();
            let err = OrchestratorError::Timeout {
                action: "converge",
                deadline,
                attempts,
                pending,
            };
            self.fail(&err);
            return Err(err);
        }
        self.set_node_states(NodeState::Ready);

        if form {
            let formed = timeout(limit, self.channel.form_cluster(&nodes, self.config.replicas))
                .await
                .unwrap_or_else(|_| {
                    Err(NodeError::Formation(format!(
                        "cluster create did not finish within {limit:?}"
                    )))
                });
            if let Err(err) = formed {
                let err = OrchestratorError::from(err);
                self.fail(&err);
                return Err(err);
            }
        }
        self.set_node_states(NodeState::Clustered);
        self.transition(ClusterPhase::Ready)
    }

    async fn save_nodes(&self, nodes: &[ClusterNode]) -> Result<SaveReport> {
        let (channel, limit) = (&self.channel, self.config.command_timeout);
        let concurrency = self.config.fanout_concurrency;

        let before = fan_out("lastsave", nodes, concurrency, Aggregation::AllMustSucceed, |node| {
            last_save(&**channel, node, limit)
        })
        .await;
        self.observe(&before);
        Self::verdict(&before)?;
        let previous: BTreeMap<NodeId, u64> = before.values().map(|(id, ts)| (id, *ts)).collect();

        let started = fan_out("bgsave", nodes, concurrency, Aggregation::AllMustSucceed, |node| {
            bounded(limit, node, "bgsave", channel.exec(node, NodeCommand::BackgroundSave))
        })
        .await;
        self.observe(&started);
        Self::verdict(&started)?;

        let deadline = self.poll.save_deadline;
        let completed: Mutex<BTreeMap<NodeId, u64>> = Mutex::new(BTreeMap::new());
        let (completed_ref, previous_ref) = (&completed, &previous);
        let outcome = poll_until(&self.backoff, deadline, |attempt| async move {
            let pending: Vec<ClusterNode> = {
                let done = completed_ref.lock();
                nodes
                    .iter()
                    .filter(|node| !done.contains_key(&node.id))
                    .cloned()
                    .collect()
            };
            let report = fan_out("lastsave", &pending, concurrency, Aggregation::BestEffort, |node| {
                last_save(&**channel, node, limit)
            })
            .await;
            let mut done = completed_ref.lock();
            for (id, ts) in report.values() {
                if previous_ref.get(&id).map_or(true, |before| ts > before) {
                    done.insert(id, *ts);
                }
            }
            debug!(attempt, saved = done.len(), total = nodes.len(), "snapshot progress");
            (done.len() == nodes.len()).then_some(())
        })
        .await;
        self.record_poll("save", outcome.attempts());

        match outcome {
            PollOutcome::Ready {
                attempts, elapsed, ..
            } => Ok(SaveReport {
                previous,
                completed: completed.into_inner(),
                attempts,
                elapsed,
            }),
            PollOutcome::TimedOut { attempts, .. } => Err(OrchestratorError::Timeout {
                action: "save",
                deadline,
                attempts,
                pending: nodes.len() - completed.lock().len(),
            }),
        }
    }

    fn require(&self, operation: &'static str, allowed: &[ClusterPhase]) -> Result<()> {
        let phase = self.phase();
        if allowed.contains(&phase) {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidPhase { operation, phase })
        }
    }

    fn planned_nodes(&self) -> Result<Vec<ClusterNode>> {
        let nodes = self.nodes();
        if nodes.is_empty() {
            Err(OrchestratorError::NoNodes)
        } else {
            Ok(nodes)
        }
    }

    fn transition(&self, next: ClusterPhase) -> Result<()> {
        let current = self.phase();
        if !current.can_transition_to(next) {
            return Err(OrchestratorError::InvalidPhase {
                operation: "transition",
                phase: current,
            });
        }
        self.phase_tx.send_replace(next);
        if let Some(metrics) = &self.metrics {
            metrics.set_phase(next.ordinal());
        }
        let outcome = if next == ClusterPhase::Failed {
            SystemEventOutcome::Fault
        } else {
            SystemEventOutcome::Success
        };
        self.event(
            "phase_transition",
            &format!("{current} -> {next}"),
            outcome,
        );
        Ok(())
    }

    fn fail(&self, err: &OrchestratorError) {
        let cluster = self.id.to_string();
        let phase = self.phase().to_string();
        dbr_warn!(
            context = LogContext::new().with_cluster(&cluster).with_phase(&phase),
            "cluster failed ({}): {}",
            err.code(),
            err
        );
        if self.transition(ClusterPhase::Failed).is_err() {
            debug!(cluster = %self.id, phase = %self.phase(), "failure outside a failable phase");
        }
    }

    fn event(&self, event: &str, message: &str, outcome: SystemEventOutcome) {
        let cluster = self.id.to_string();
        let phase = self.phase().to_string();
        let context = LogContext::new().with_cluster(&cluster).with_phase(&phase);
        log_system_event(Some(&context), event, message, outcome);
    }

    fn set_node_states(&self, state: NodeState) {
        for node in self.state.lock().nodes.iter_mut() {
            node.state = state;
        }
    }

    fn observe<T>(&self, report: &FanOutReport<T>) {
        if let Some(metrics) = &self.metrics {
            metrics.record_fanout(report.action, report.succeeded(), report.failed());
        }
    }

    fn record_poll(&self, action: &str, attempts: u32) {
        if let Some(metrics) = &self.metrics {
            metrics.record_poll_attempts(action, attempts);
        }
    }

    fn verdict<T>(report: &FanOutReport<T>) -> Result<()> {
        if report.is_success() {
            return Ok(());
        }
        match report.first_failure() {
            Some(first) => Err(OrchestratorError::FanOut {
                action: report.action,
                failed: report.failed(),
                total: report.total(),
                first: first.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Bound one channel call so a node that never answers cannot stall a phase.
async fn bounded<T>(
    limit: Duration,
    node: &ClusterNode,
    action: &str,
    call: impl Future<Output = std::result::Result<T, NodeError>>,
) -> std::result::Result<T, NodeError> {
    timeout(limit, call).await.unwrap_or_else(|_| {
        Err(NodeError::TimedOut {
            node: node.id,
            command: action.to_owned(),
            limit,
        })
    })
}

async fn last_save(
    channel: &dyn NodeControlChannel,
    node: &ClusterNode,
    limit: Duration,
) -> std::result::Result<u64, NodeError> {
    bounded(limit, node, "lastsave", channel.exec(node, NodeCommand::LastSave))
        .await
        .and_then(|reply| timestamp_of(node, reply))
}

fn timestamp_of(node: &ClusterNode, reply: CommandReply) -> std::result::Result<u64, NodeError> {
    reply.timestamp().ok_or_else(|| NodeError::UnexpectedReply {
        node: node.id,
        command: NodeCommand::LastSave.name().to_owned(),
        reply: format!("{reply:?}"),
    })
}
