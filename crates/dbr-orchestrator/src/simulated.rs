//! ---
//! dbr_section: "04-configuration-orchestration"
//! dbr_subsection: "module"
//! dbr_type: "source"
//! dbr_scope: "code"
//! dbr_description: "In-process node control channel with fault injection."
//! dbr_version: "v0.0.0-prealpha"
//! dbr_owner: "tbd"
//! ---
use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::allocation::NodeId;
use crate::channel::{CommandReply, NodeCommand, NodeControlChannel, NodeError};
use crate::node::ClusterNode;

/// Misbehaviour injected into a single simulated node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    LaunchFails,
    /// Probe never reports ready.
    NeverReady,
    /// Probe reports ready only after this many probes.
    SlowProbe(u32),
    /// Background saves never complete; LASTSAVE keeps its old value.
    SaveStalls,
    /// LASTSAVE fails outright.
    Unresponsive,
    RestoreFails,
    ShutdownFails,
}

#[derive(Debug, Clone, Default)]
struct SimNode {
    running: bool,
    probes: u32,
    lastsave: u64,
    save_pending: bool,
    restores: u32,
}

#[derive(Debug, Default)]
struct SimState {
    nodes: HashMap<NodeId, SimNode>,
    faults: HashMap<NodeId, HashSet<Fault>>,
    formations: usize,
    formed: bool,
}

impl SimState {
    fn has(&self, id: NodeId, fault: Fault) -> bool {
        self.faults.get(&id).is_some_and(|set| set.contains(&fault))
    }

    fn slow_probe(&self, id: NodeId) -> Option<u32> {
        self.faults.get(&id)?.iter().find_map(|fault| match fault {
            Fault::SlowProbe(n) => Some(*n),
            _ => None,
        })
    }
}

/// Node channel that keeps every node in memory.
///
/// Snapshot timestamps are logical: a background save completes on the next
/// LASTSAVE query unless [`Fault::SaveStalls`] is injected.
#[derive(Debug, Default)]
pub struct SimulatedChannel {
    state: Mutex<SimState>,
    adopt_unknown: bool,
}

const INITIAL_LASTSAVE: u64 = 1_700_000_000;

impl SimulatedChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat nodes that were never launched through this channel as already running.
    pub fn already_running() -> Self {
        Self {
            adopt_unknown: true,
            ..Self::default()
        }
    }

    pub fn inject(&self, node: NodeId, fault: Fault) {
        self.state.lock().faults.entry(node).or_default().insert(fault);
    }

    pub fn clear_faults(&self, node: NodeId) {
        self.state.lock().faults.remove(&node);
    }

    pub fn formation_count(&self) -> usize {
        self.state.lock().formations
    }

    pub fn is_running(&self, node: NodeId) -> bool {
        self.state.lock().nodes.get(&node).is_some_and(|sim| sim.running)
    }

    pub fn restore_count(&self, node: NodeId) -> u32 {
        self.state.lock().nodes.get(&node).map_or(0, |sim| sim.restores)
    }

    pub fn lastsave(&self, node: NodeId) -> Option<u64> {
        self.state.lock().nodes.get(&node).map(|sim| sim.lastsave)
    }

    fn with_node<T>(
        &self,
        node: &ClusterNode,
        op: impl FnOnce(&mut SimNode, &SimState) -> Result<T, NodeError>,
    ) -> Result<T, NodeError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut sim = match state.nodes.get(&node.id) {
            Some(sim) => sim.clone(),
            None if self.adopt_unknown => SimNode {
                running: true,
                lastsave: INITIAL_LASTSAVE,
                ..SimNode::default()
            },
            None => SimNode::default(),
        };
        let result = op(&mut sim, state);
        state.nodes.insert(node.id, sim);
        result
    }

    fn unreachable(node: &ClusterNode) -> NodeError {
        NodeError::Unreachable {
            node: node.id,
            reason: "node is not running".into(),
        }
    }
}

#[async_trait]
impl NodeControlChannel for SimulatedChannel {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn launch(&self, node: &ClusterNode) -> Result<(), NodeError> {
        self.with_node(node, |sim, state| {
            if state.has(node.id, Fault::LaunchFails) {
                return Err(NodeError::Spawn {
                    node: node.id,
                    program: "simulated-server".into(),
                    reason: "injected launch failure".into(),
                });
            }
            sim.running = true;
            sim.probes = 0;
            if sim.lastsave == 0 {
                sim.lastsave = INITIAL_LASTSAVE;
            }
            debug!(node = %node.id, port = node.port, "simulated node launched");
            Ok(())
        })
    }

    async fn probe(&self, node: &ClusterNode) -> Result<bool, NodeError> {
        self.with_node(node, |sim, state| {
            if !sim.running {
                return Ok(false);
            }
            sim.probes += 1;
            if state.has(node.id, Fault::NeverReady) {
                return Ok(false);
            }
            Ok(state.slow_probe(node.id).map_or(true, |needed| sim.probes > needed))
        })
    }

    async fn exec(
        &self,
        node: &ClusterNode,
        command: NodeCommand,
    ) -> Result<CommandReply, NodeError> {
        self.with_node(node, |sim, state| {
            if !sim.running {
                return Err(Self::unreachable(node));
            }
            match command {
                NodeCommand::LastSave => {
                    if state.has(node.id, Fault::Unresponsive) {
                        return Err(NodeError::CommandFailed {
                            node: node.id,
                            command: command.name().into(),
                            status: "timeout".into(),
                            stderr: "no reply".into(),
                        });
                    }
                    if sim.save_pending && !state.has(node.id, Fault::SaveStalls) {
                        sim.lastsave += 1;
                        sim.save_pending = false;
                    }
                    Ok(CommandReply::Timestamp(sim.lastsave))
                }
                NodeCommand::BackgroundSave => {
                    sim.save_pending = true;
                    Ok(CommandReply::Text("Background saving started".into()))
                }
                NodeCommand::Restore => {
                    if state.has(node.id, Fault::RestoreFails) {
                        return Err(NodeError::MissingDump {
                            node: node.id,
                            path: node.layout.dump_file.clone(),
                        });
                    }
                    sim.restores += 1;
                    Ok(CommandReply::Accepted)
                }
            }
        })
    }

    async fn form_cluster(&self, nodes: &[ClusterNode], replicas: u32) -> Result<(), NodeError> {
        let mut state = self.state.lock();
        let down: Vec<String> = nodes
            .iter()
            .filter(|node| {
                !state
                    .nodes
                    .get(&node.id)
                    .map_or(self.adopt_unknown, |sim| sim.running)
            })
            .map(|node| node.id.to_string())
            .collect();
        if !down.is_empty() {
            return Err(NodeError::Formation(format!(
                "nodes not running: {}",
                down.join(", ")
            )));
        }
        state.formations += 1;
        if state.formed {
            debug!(nodes = nodes.len(), "cluster already formed");
        } else {
            state.formed = true;
            debug!(nodes = nodes.len(), replicas, "simulated cluster formed");
        }
        Ok(())
    }

    async fn shutdown(&self, node: &ClusterNode) -> Result<(), NodeError> {
        self.with_node(node, |sim, state| {
            if state.has(node.id, Fault::ShutdownFails) {
                return Err(NodeError::CommandFailed {
                    node: node.id,
                    command: "shutdown".into(),
                    status: "exit status: 1".into(),
                    stderr: "injected shutdown failure".into(),
                });
            }
            if !sim.running {
                return Err(Self::unreachable(node));
            }
            sim.running = false;
            Ok(())
        })
    }
}
