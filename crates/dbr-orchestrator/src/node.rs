//! ---
//! dbr_section: "04-configuration-orchestration"
//! dbr_subsection: "module"
//! dbr_type: "source"
//! dbr_scope: "code"
//! dbr_description: "Backend node identity, liveness state, and persisted file layout."
//! dbr_version: "v0.0.0-prealpha"
//! dbr_owner: "tbd"
//! ---
use std::fmt;
use std::path::{Path, PathBuf};

use dbr_common::ClusterConfig;
use serde::{Deserialize, Serialize};

use crate::allocation::{HostAllocation, NodeId};

/// Declared role of a node. The cluster is flat; every node holds data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    #[default]
    Data,
}

/// Process liveness as tracked by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeState {
    #[default]
    Launched,
    Ready,
    Clustered,
    Saving,
    Stopped,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NodeState::Launched => "launched",
            NodeState::Ready => "ready",
            NodeState::Clustered => "clustered",
            NodeState::Saving => "saving",
            NodeState::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// Files a node persists, named from its [`NodeId`] so restarts and restores
/// address the same node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeLayout {
    pub config_file: PathBuf,
    pub dump_file: PathBuf,
    pub log_file: PathBuf,
}

impl NodeLayout {
    pub fn new(data_dir: &Path, id: NodeId) -> Self {
        Self {
            config_file: data_dir.join(format!("nodes-{id}.conf")),
            dump_file: data_dir.join(format!("dump-{id}.rdb")),
            log_file: data_dir.join(format!("log-{id}.log")),
        }
    }

    /// File name of the dump, relative to the data directory.
    pub fn dump_file_name(&self) -> String {
        self.dump_file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// One backend process instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub id: NodeId,
    pub host: String,
    /// Network address, including any interface suffix.
    pub address: String,
    pub port: u16,
    pub role: NodeRole,
    pub state: NodeState,
    pub layout: NodeLayout,
}

impl ClusterNode {
    pub fn new(id: NodeId, host: &str, config: &ClusterConfig) -> Self {
        Self {
            id,
            host: host.to_owned(),
            address: config.address_for(host),
            port: config.port_for(id.local_rank),
            role: NodeRole::Data,
            state: NodeState::Launched,
            layout: NodeLayout::new(&config.data_dir, id),
        }
    }

    /// `address:port` endpoint.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl fmt::Display for ClusterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {} ({})", self.id, self.endpoint())
    }
}

/// Expand an allocation into its node set, host-major.
pub fn plan_nodes(allocation: &HostAllocation, config: &ClusterConfig) -> Vec<ClusterNode> {
    allocation
        .node_ids()
        .filter_map(|id| {
            allocation
                .host(id)
                .map(|host| ClusterNode::new(id, host, config))
        })
        .collect()
}
