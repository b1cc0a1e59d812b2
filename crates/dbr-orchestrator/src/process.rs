//! ---
//! dbr_section: "04-configuration-orchestration"
//! dbr_subsection: "module"
//! dbr_type: "source"
//! dbr_scope: "code"
//! dbr_description: "Node control through local server processes and re-entrant remote invocations."
//! dbr_version: "v0.0.0-prealpha"
//! dbr_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dbr_common::ClusterConfig;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::allocation::NodeId;
use crate::channel::{CommandReply, NodeCommand, NodeControlChannel, NodeError};
use crate::node::ClusterNode;

/// Controls nodes by running the server and client tools directly.
///
/// Launch starts the server on the machine this process runs on; every other
/// operation talks to the node over the network through the client tool.
#[derive(Debug)]
pub struct LocalProcessChannel {
    config: Arc<ClusterConfig>,
    children: Mutex<HashMap<NodeId, Child>>,
}

impl LocalProcessChannel {
    pub fn new(config: Arc<ClusterConfig>) -> Self {
        Self {
            config,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Server command line for a node.
    pub fn server_args(&self, node: &ClusterNode) -> Vec<OsString> {
        let config = &self.config;
        let mut args: Vec<OsString> = Vec::new();
        let mut push = |flag: &str, value: OsString| {
            args.push(flag.into());
            args.push(value);
        };
        push("--bind", node.address.clone().into());
        push("--port", node.port.to_string().into());
        push("--cluster-enabled", "yes".into());
        push("--cluster-config-file", node.layout.config_file.clone().into());
        push(
            "--cluster-node-timeout",
            config.node_timeout.as_millis().to_string().into(),
        );
        push("--dir", config.data_dir.clone().into());
        push("--dbfilename", node.layout.dump_file_name().into());
        push("--logfile", node.layout.log_file.clone().into());
        push(
            "--daemonize",
            if config.daemonize { "yes" } else { "no" }.into(),
        );
        if let Some(password) = &config.password {
            push("--requirepass", password.clone().into());
            push("--masterauth", password.clone().into());
        }
        args
    }

    fn client(&self, node: &ClusterNode) -> Command {
        let mut command = Command::new(&self.config.tools.client);
        command
            .arg("--no-auth-warning")
            .arg("-h")
            .arg(&node.address)
            .arg("-p")
            .arg(node.port.to_string());
        if let Some(password) = &self.config.password {
            command.arg("-a").arg(password);
        }
        command
    }

    async fn query(&self, node: &ClusterNode, args: &[&str]) -> Result<String, NodeError> {
        let mut command = self.client(node);
        command.args(args);
        let output = run(node.id, command, &args.join(" "), None, self.config.command_timeout).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }

    async fn cluster_formed(&self, nodes: &[ClusterNode]) -> bool {
        let Some(first) = nodes.first() else {
            return false;
        };
        match self.query(first, &["cluster", "info"]).await {
            Ok(info) => {
                let field = |key: &str| {
                    info.lines()
                        .find_map(|line| line.trim().strip_prefix(key))
                        .map(str::to_owned)
                };
                field("cluster_state:").as_deref() == Some("ok")
                    && field("cluster_known_nodes:")
                        .and_then(|count| count.parse::<usize>().ok())
                        == Some(nodes.len())
            }
            Err(err) => {
                debug!(error = %err, "cluster info unavailable; forming cluster");
                false
            }
        }
    }

    async fn restore(&self, node: &ClusterNode) -> Result<CommandReply, NodeError> {
        let dump = node.layout.dump_file.clone();
        if !tokio::fs::try_exists(&dump).await.unwrap_or(false) {
            return Err(NodeError::MissingDump {
                node: node.id,
                path: dump,
            });
        }
        let mut convert = Command::new(&self.config.tools.rdb);
        convert.arg("--c").arg("protocol").arg(&dump);
        let protocol = run(node.id, convert, "rdb --c protocol", None, self.config.command_timeout).await?;
        if protocol.stdout.is_empty() {
            info!(node = %node.id, dump = %dump.display(), "no additional data to restore");
            return Ok(CommandReply::Accepted);
        }

        let mut load = self.client(node);
        load.arg("--pipe");
        let output = run(
            node.id,
            load,
            "--pipe",
            Some(protocol.stdout),
            self.config.command_timeout,
        ).await?;
        Ok(CommandReply::Text(
            String::from_utf8_lossy(&output.stdout).trim().to_owned(),
        ))
    }

    fn reap(&self, node: NodeId) -> Option<Child> {
        self.children.lock().remove(&node)
    }

    /// Carry out a re-entrant single-node command on the node this process owns.
    pub async fn run_single(
        &self,
        node: &ClusterNode,
        action: SingleNodeAction,
    ) -> Result<CommandReply, NodeError> {
        match action {
            SingleNodeAction::Launch => self.launch(node).await.map(|_| CommandReply::Accepted),
            SingleNodeAction::Save => self.exec(node, NodeCommand::BackgroundSave).await,
            SingleNodeAction::Restore => self.exec(node, NodeCommand::Restore).await,
            SingleNodeAction::Shutdown => {
                self.shutdown(node).await.map(|_| CommandReply::Accepted)
            }
        }
    }
}

/// Work a re-entered invocation performs against exactly one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingleNodeAction {
    Launch,
    Save,
    Restore,
    Shutdown,
}

impl SingleNodeAction {
    /// Subcommand name used on the remote command line.
    pub fn subcommand(self) -> &'static str {
        match self {
            SingleNodeAction::Launch => "launch-one-node",
            SingleNodeAction::Save => "save-one-node",
            SingleNodeAction::Restore => "restore-one-node",
            SingleNodeAction::Shutdown => "shutdown-one-node",
        }
    }
}

#[async_trait]
impl NodeControlChannel for LocalProcessChannel {
    fn name(&self) -> &'static str {
        "local-process"
    }

    async fn launch(&self, node: &ClusterNode) -> Result<(), NodeError> {
        tokio::fs::create_dir_all(&self.config.data_dir)
            .await
            .map_err(|err| NodeError::Spawn {
                node: node.id,
                program: self.config.data_dir.display().to_string(),
                reason: err.to_string(),
            })?;
        let mut command = Command::new(&self.config.tools.server);
        command.args(self.server_args(node));
        info!(node = %node.id, endpoint = %node.endpoint(), "launching server");

        if self.config.daemonize {
            run(node.id, command, "server", None, self.config.command_timeout).await?;
            return Ok(());
        }
        let child = command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| NodeError::Spawn {
                node: node.id,
                program: self.config.tools.server.display().to_string(),
                reason: err.to_string(),
            })?;
        self.children.lock().insert(node.id, child);
        Ok(())
    }

    async fn probe(&self, node: &ClusterNode) -> Result<bool, NodeError> {
        match self.query(node, &["ping"]).await {
            Ok(reply) => Ok(reply == "PONG"),
            Err(NodeError::CommandFailed { .. } | NodeError::TimedOut { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn exec(
        &self,
        node: &ClusterNode,
        command: NodeCommand,
    ) -> Result<CommandReply, NodeError> {
        match command {
            NodeCommand::LastSave => {
                let reply = self.query(node, &["lastsave"]).await?;
                parse_integer(&reply)
                    .map(CommandReply::Timestamp)
                    .ok_or_else(|| NodeError::UnexpectedReply {
                        node: node.id,
                        command: command.name().into(),
                        reply,
                    })
            }
            NodeCommand::BackgroundSave => {
                let reply = self.query(node, &["bgsave"]).await?;
                if reply.starts_with("ERR") {
                    return Err(NodeError::UnexpectedReply {
                        node: node.id,
                        command: command.name().into(),
                        reply,
                    });
                }
                Ok(CommandReply::Text(reply))
            }
            NodeCommand::Restore => self.restore(node).await,
        }
    }

    async fn form_cluster(&self, nodes: &[ClusterNode], replicas: u32) -> Result<(), NodeError> {
        if self.cluster_formed(nodes).await {
            info!(nodes = nodes.len(), "cluster already formed; skipping create");
            return Ok(());
        }
        let Some(first) = nodes.first() else {
            return Err(NodeError::Formation("empty node set".into()));
        };
        let mut command = Command::new(&self.config.tools.client);
        command.arg("--no-auth-warning").arg("--cluster").arg("create");
        command.args(nodes.iter().map(ClusterNode::endpoint));
        command
            .arg("--cluster-replicas")
            .arg(replicas.to_string())
            .arg("--cluster-yes");
        if let Some(password) = &self.config.password {
            command.arg("-a").arg(password);
        }
        info!(nodes = nodes.len(), replicas, "forming cluster");
        run(
            first.id,
            command,
            "--cluster create",
            Some(b"yes\n".to_vec()),
            self.config.command_timeout,
        )
            .await
            .map(|_| ())
            .map_err(|err| NodeError::Formation(err.to_string()))
    }

    async fn shutdown(&self, node: &ClusterNode) -> Result<(), NodeError> {
        let result = self.query(node, &["shutdown"]).await;
        if let Some(mut child) = self.reap(node.id) {
            if let Err(err) = child.wait().await {
                warn!(node = %node.id, error = %err, "failed to reap server process");
            }
        }
        match result {
            Ok(_) => Ok(()),
            // the server closes the connection instead of answering
            Err(NodeError::CommandFailed { stderr, .. })
                if stderr.contains("closed") || stderr.contains("lost") =>
            {
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

/// Runs single-node operations by re-entering this binary on the node's host.
///
/// The remote side executes `<exe> <subcommand> --host-rank H --local-rank L --host HOST`,
/// which drives a [`LocalProcessChannel`] there. Probes and cluster formation
/// are network operations and go through the local channel directly.
#[derive(Debug)]
pub struct ReentrantChannel {
    config: Arc<ClusterConfig>,
    program: PathBuf,
    local: LocalProcessChannel,
}

impl ReentrantChannel {
    pub fn new(config: Arc<ClusterConfig>, program: PathBuf) -> Self {
        Self {
            local: LocalProcessChannel::new(config.clone()),
            config,
            program,
        }
    }

    /// Command line executed for `subcommand` against `node`.
    pub fn remote_command(&self, node: &ClusterNode, action: SingleNodeAction) -> Vec<OsString> {
        let mut argv: Vec<OsString> = self
            .config
            .tools
            .remote_exec
            .iter()
            .map(OsString::from)
            .collect();
        argv.push(node.host.clone().into());
        argv.push(self.program.clone().into());
        argv.push(action.subcommand().into());
        argv.push("--host-rank".into());
        argv.push(node.id.host_rank.to_string().into());
        argv.push("--local-rank".into());
        argv.push(node.id.local_rank.to_string().into());
        argv.push("--host".into());
        argv.push(node.host.clone().into());
        argv
    }

    async fn reenter(
        &self,
        node: &ClusterNode,
        action: SingleNodeAction,
    ) -> Result<Output, NodeError> {
        let subcommand = action.subcommand();
        let argv = self.remote_command(node, action);
        let Some((program, args)) = argv.split_first() else {
            return Err(NodeError::Unsupported {
                node: node.id,
                operation: "remote exec",
                channel: "reentrant",
            });
        };
        let mut command = Command::new(program);
        command.args(args);
        debug!(node = %node.id, subcommand, "re-entering control binary");
        run(node.id, command, subcommand, None, self.config.command_timeout).await
    }
}

#[async_trait]
impl NodeControlChannel for ReentrantChannel {
    fn name(&self) -> &'static str {
        "reentrant"
    }

    async fn launch(&self, node: &ClusterNode) -> Result<(), NodeError> {
        self.reenter(node, SingleNodeAction::Launch).await.map(|_| ())
    }

    async fn probe(&self, node: &ClusterNode) -> Result<bool, NodeError> {
        self.local.probe(node).await
    }

    async fn exec(
        &self,
        node: &ClusterNode,
        command: NodeCommand,
    ) -> Result<CommandReply, NodeError> {
        match command {
            NodeCommand::BackgroundSave => {
                self.reenter(node, SingleNodeAction::Save).await?;
                Ok(CommandReply::Accepted)
            }
            NodeCommand::Restore => {
                self.reenter(node, SingleNodeAction::Restore).await?;
                Ok(CommandReply::Accepted)
            }
            NodeCommand::LastSave => self.local.exec(node, command).await,
        }
    }

    async fn form_cluster(&self, nodes: &[ClusterNode], replicas: u32) -> Result<(), NodeError> {
        self.local.form_cluster(nodes, replicas).await
    }

    async fn shutdown(&self, node: &ClusterNode) -> Result<(), NodeError> {
        self.reenter(node, SingleNodeAction::Shutdown).await.map(|_| ())
    }
}

/// Parse a client integer reply, with or without the interactive `(integer)` prefix.
pub fn parse_integer(reply: &str) -> Option<u64> {
    let reply = reply.trim();
    reply
        .strip_prefix("(integer)")
        .unwrap_or(reply)
        .trim()
        .parse()
        .ok()
}

async fn run(
    node: NodeId,
    mut command: Command,
    label: &str,
    input: Option<Vec<u8>>,
    limit: Duration,
) -> Result<Output, NodeError> {
    command
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let spawn_error = |err: std::io::Error| NodeError::Spawn {
        node,
        program: label.to_owned(),
        reason: err.to_string(),
    };
    let mut child = command.spawn().map_err(spawn_error)?;
    let finished = async move {
        if let (Some(bytes), Some(mut stdin)) = (input, child.stdin.take()) {
            if let Err(err) = stdin.write_all(&bytes).await {
                return Err(err);
            }
            drop(stdin);
        }
        child.wait_with_output().await
    };
    let output = match timeout(limit, finished).await {
        Ok(output) => output.map_err(spawn_error)?,
        Err(_) => {
            warn!(
                %node,
                command = label,
                limit_ms = limit.as_millis() as u64,
                "control command timed out; process killed"
            );
            return Err(NodeError::TimedOut {
                node,
                command: label.to_owned(),
                limit,
            });
        }
    };
    if output.status.success() {
        Ok(output)
    } else {
        Err(NodeError::CommandFailed {
            node,
            command: label.to_owned(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        })
    }
}
