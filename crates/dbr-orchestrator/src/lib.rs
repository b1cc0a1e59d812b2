//! ---
//! dbr_section: "04-configuration-orchestration"
//! dbr_subsection: "module"
//! dbr_type: "source"
//! dbr_scope: "code"
//! dbr_description: "Cluster lifecycle orchestration for Data Broker backend nodes."
//! dbr_version: "v0.0.0-prealpha"
//! dbr_owner: "tbd"
//! ---
//! Every lifecycle phase is a fan-out of one action over the node set plus an
//! aggregation rule. Transports plug in through [`NodeControlChannel`].

pub mod allocation;
pub mod channel;
pub mod cluster;
pub mod fanout;
pub mod node;
pub mod poll;
pub mod process;
pub mod simulated;

pub use allocation::{
    local_rank_from_env, AllocationError, HostAllocation, HostfileLauncher, JobLauncher, NodeId,
    StaticLauncher,
};
pub use channel::{CommandReply, NodeCommand, NodeControlChannel, NodeError};
pub use cluster::{ClusterOrchestrator, OrchestratorError, Result, SaveReport};
pub use fanout::{fan_out, Aggregation, FanOutReport, NodeOutcome};
pub use node::{plan_nodes, ClusterNode, NodeLayout, NodeRole, NodeState};
pub use poll::{poll_until, BackoffPolicy, PollOutcome};
pub use process::{LocalProcessChannel, ReentrantChannel, SingleNodeAction};
pub use simulated::{Fault, SimulatedChannel};
