//! ---
//! dbr_section: "05-networking-external-interfaces"
//! dbr_subsection: "binary"
//! dbr_type: "source"
//! dbr_scope: "code"
//! dbr_description: "Re-entrant single-node commands executed on a node's own host."
//! dbr_version: "v0.0.0-prealpha"
//! dbr_owner: "tbd"
//! ---
use anyhow::{Context, Result};
use clap::Args;
use dbr_orchestrator::{
    local_rank_from_env, ClusterNode, CommandReply, LocalProcessChannel, NodeId, SingleNodeAction,
};
use tracing::info;

use crate::cluster::CommandContext;

/// Identity of the node a re-entered invocation acts on.
#[derive(Debug, Clone, Args)]
pub struct NodeArgs {
    /// Position of the host in the allocation.
    #[arg(long)]
    pub host_rank: u16,

    /// Slot on the host; read from the scheduler environment when omitted.
    #[arg(long)]
    pub local_rank: Option<u16>,

    /// Host name the node binds to.
    #[arg(long)]
    pub host: String,
}

pub async fn run(
    context: &CommandContext,
    args: &NodeArgs,
    action: SingleNodeAction,
) -> Result<()> {
    let local_rank = match args.local_rank {
        Some(rank) => rank,
        None => local_rank_from_env(&context.cluster)?,
    };
    let id = NodeId::new(args.host_rank, local_rank);
    let node = ClusterNode::new(id, &args.host, &context.cluster);
    let channel = LocalProcessChannel::new(context.cluster.clone());

    let reply = channel
        .run_single(&node, action)
        .await
        .with_context(|| format!("{} failed for node {id}", action.subcommand()))?;
    info!(
        node = %id,
        endpoint = %node.endpoint(),
        action = action.subcommand(),
        "single-node command complete"
    );
    match reply {
        CommandReply::Text(text) if !text.is_empty() => println!("{text}"),
        CommandReply::Timestamp(ts) => println!("{ts}"),
        _ => {}
    }
    Ok(())
}
