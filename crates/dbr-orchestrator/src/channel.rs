//! ---
//! dbr_section: "04-configuration-orchestration"
//! dbr_subsection: "module"
//! dbr_type: "source"
//! dbr_scope: "code"
//! dbr_description: "Transport-neutral control interface to backend nodes."
//! dbr_version: "v0.0.0-prealpha"
//! dbr_owner: "tbd"
//! ---
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use dbr_common::ErrorCode;
use thiserror::Error;

use crate::allocation::NodeId;
use crate::node::ClusterNode;

/// Commands executed against a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeCommand {
    /// Report the timestamp of the last completed snapshot.
    LastSave,
    /// Start a snapshot without waiting for it.
    BackgroundSave,
    /// Reload the node's dump file into the running node.
    Restore,
}

impl NodeCommand {
    pub fn name(self) -> &'static str {
        match self {
            NodeCommand::LastSave => "lastsave",
            NodeCommand::BackgroundSave => "bgsave",
            NodeCommand::Restore => "restore",
        }
    }
}

impl fmt::Display for NodeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reply to a [`NodeCommand`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandReply {
    Timestamp(u64),
    Accepted,
    Text(String),
}

impl CommandReply {
    pub fn timestamp(&self) -> Option<u64> {
        match self {
            CommandReply::Timestamp(value) => Some(*value),
            _ => None,
        }
    }
}

/// Per-node failure reported by a channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    #[error("node {node}: failed to start {program}: {reason}")]
    Spawn {
        node: NodeId,
        program: String,
        reason: String,
    },
    #[error("node {node}: {command} exited with {status}: {stderr}")]
    CommandFailed {
        node: NodeId,
        command: String,
        status: String,
        stderr: String,
    },
    #[error("node {node}: unexpected reply to {command}: {reply:?}")]
    UnexpectedReply {
        node: NodeId,
        command: String,
        reply: String,
    },
    #[error("node {node}: {command} did not finish within {limit:?}")]
    TimedOut {
        node: NodeId,
        command: String,
        limit: Duration,
    },
    #[error("node {node} is unreachable: {reason}")]
    Unreachable { node: NodeId, reason: String },
    #[error("node {node}: dump file {} does not exist", .path.display())]
    MissingDump { node: NodeId, path: PathBuf },
    #[error("node {node}: {operation} is not supported by the {channel} channel")]
    Unsupported {
        node: NodeId,
        operation: &'static str,
        channel: &'static str,
    },
    #[error("cluster formation failed: {0}")]
    Formation(String),
}

impl NodeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            NodeError::Spawn { .. } => ErrorCode::BackendPost,
            NodeError::CommandFailed { .. }
            | NodeError::UnexpectedReply { .. }
            | NodeError::Formation(_) => ErrorCode::BackendGeneral,
            NodeError::TimedOut { .. } => ErrorCode::Timeout,
            NodeError::Unreachable { .. } => ErrorCode::NoConnect,
            NodeError::MissingDump { .. } => ErrorCode::NoFile,
            NodeError::Unsupported { .. } => ErrorCode::NotImplemented,
        }
    }
}

/// Capability interface through which the orchestrator controls nodes.
///
/// One implementation exists per transport (local processes, remote re-entry,
/// simulation). The orchestrator never depends on a concrete transport.
#[async_trait]
pub trait NodeControlChannel: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Start the node process.
    async fn launch(&self, node: &ClusterNode) -> Result<(), NodeError>;

    /// Liveness check; `Ok(false)` means "not ready yet", errors mean the probe itself failed.
    async fn probe(&self, node: &ClusterNode) -> Result<bool, NodeError>;

    async fn exec(&self, node: &ClusterNode, command: NodeCommand)
        -> Result<CommandReply, NodeError>;

    /// Join the full node set into one cluster. Must be safe to repeat.
    async fn form_cluster(&self, nodes: &[ClusterNode], replicas: u32) -> Result<(), NodeError>;

    async fn shutdown(&self, node: &ClusterNode) -> Result<(), NodeError>;
}
