//! ---
//! dbr_section: "04-configuration-orchestration"
//! dbr_subsection: "module"
//! dbr_type: "source"
//! dbr_scope: "code"
//! dbr_description: "Host allocations handed out by the external job scheduler."
//! dbr_version: "v0.0.0-prealpha"
//! dbr_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use dbr_common::{ClusterConfig, ErrorCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Failure to obtain or interpret a host allocation.
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("environment variable {0} is not set")]
    MissingEnv(String),
    #[error("failed to read host file {path}: {source}")]
    HostFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("host allocation contains no usable hosts")]
    Empty,
    #[error("nodes per host must be at least 1")]
    NoSlots,
    #[error("host allocation has {0} hosts; at most 65536 can be ranked")]
    TooManyHosts(usize),
    #[error("invalid rank {value:?}: {reason}")]
    InvalidRank { value: String, reason: String },
}

impl AllocationError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AllocationError::HostFile { .. } => ErrorCode::NoFile,
            AllocationError::MissingEnv(_) | AllocationError::InvalidRank { .. } => {
                ErrorCode::Invalid
            }
            AllocationError::Empty
            | AllocationError::NoSlots
            | AllocationError::TooManyHosts(_) => ErrorCode::InvalidOperation,
        }
    }
}

/// Deterministic identity of a node: host position in the allocation and slot on that host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    pub host_rank: u16,
    pub local_rank: u16,
}

impl NodeId {
    pub fn new(host_rank: u16, local_rank: u16) -> Self {
        Self {
            host_rank,
            local_rank,
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.host_rank, self.local_rank)
    }
}

/// Ordered hosts plus per-host node count. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAllocation {
    hosts: Vec<String>,
    nodes_per_host: u16,
}

impl HostAllocation {
    /// Build an allocation, dropping duplicate hosts while keeping first-seen order.
    pub fn new(hosts: Vec<String>, nodes_per_host: u16) -> Result<Self, AllocationError> {
        if nodes_per_host == 0 {
            return Err(AllocationError::NoSlots);
        }
        let mut seen = HashSet::with_capacity(hosts.len());
        let mut unique: Vec<String> = Vec::with_capacity(hosts.len());
        for host in hosts {
            if seen.insert(host.clone()) {
                unique.push(host);
            }
        }
        if unique.is_empty() {
            return Err(AllocationError::Empty);
        }
        // Host ranks are u16; the last rank must fit.
        if u16::try_from(unique.len() - 1).is_err() {
            return Err(AllocationError::TooManyHosts(unique.len()));
        }
        Ok(Self {
            hosts: unique,
            nodes_per_host,
        })
    }

    /// Parse a scheduler host file: one host per line, blank lines ignored,
    /// the launch node excluded.
    pub fn parse(
        contents: &str,
        launch_node: Option<&str>,
        nodes_per_host: u16,
    ) -> Result<Self, AllocationError> {
        let hosts = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter(|host| Some(*host) != launch_node)
            .map(str::to_owned)
            .collect();
        Self::new(hosts, nodes_per_host)
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn nodes_per_host(&self) -> u16 {
        self.nodes_per_host
    }

    pub fn node_count(&self) -> usize {
        self.hosts.len() * usize::from(self.nodes_per_host)
    }

    /// Every node slot, host-major.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        let per_host = self.nodes_per_host;
        (0..=u16::MAX)
            .take(self.hosts.len())
            .flat_map(move |host_rank| {
                (0..per_host).map(move |local_rank| NodeId::new(host_rank, local_rank))
            })
    }

    pub fn host(&self, id: NodeId) -> Option<&str> {
        if id.local_rank >= self.nodes_per_host {
            return None;
        }
        self.hosts.get(usize::from(id.host_rank)).map(String::as_str)
    }
}

/// External scheduler that hands out hosts. Consumed, never implemented here beyond
/// reading what the scheduler already published.
#[async_trait]
pub trait JobLauncher: Send + Sync {
    fn name(&self) -> &'static str;

    async fn allocate(&self, config: &ClusterConfig) -> Result<HostAllocation, AllocationError>;
}

/// Reads the host file the scheduler names in an environment variable.
#[derive(Debug, Clone, Default)]
pub struct HostfileLauncher {
    path: Option<PathBuf>,
}

impl HostfileLauncher {
    /// Use the path from `cluster.hostfile_env`.
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Use an explicit host file.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    fn resolve_path(&self, config: &ClusterConfig) -> Result<PathBuf, AllocationError> {
        match &self.path {
            Some(path) => Ok(path.clone()),
            None => std::env::var_os(&config.hostfile_env)
                .map(PathBuf::from)
                .ok_or_else(|| AllocationError::MissingEnv(config.hostfile_env.clone())),
        }
    }
}

#[async_trait]
impl JobLauncher for HostfileLauncher {
    fn name(&self) -> &'static str {
        "hostfile"
    }

    async fn allocate(&self, config: &ClusterConfig) -> Result<HostAllocation, AllocationError> {
        let path = self.resolve_path(config)?;
        debug!(path = %path.display(), "reading host file");
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| AllocationError::HostFile {
                path: path.clone(),
                source,
            })?;
        let allocation = HostAllocation::parse(
            &contents,
            config.launch_node.as_deref(),
            config.nodes_per_host,
        )?;
        info!(
            hosts = allocation.hosts().len(),
            nodes = allocation.node_count(),
            "host allocation obtained"
        );
        Ok(allocation)
    }
}

/// Fixed host list, for single-host runs and tests.
#[derive(Debug, Clone)]
pub struct StaticLauncher {
    hosts: Vec<String>,
}

impl StaticLauncher {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            hosts: hosts.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl JobLauncher for StaticLauncher {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn allocate(&self, config: &ClusterConfig) -> Result<HostAllocation, AllocationError> {
        HostAllocation::new(self.hosts.clone(), config.nodes_per_host)
    }
}

/// Local rank the scheduler assigned to this process.
pub fn local_rank_from_env(config: &ClusterConfig) -> Result<u16, AllocationError> {
    let value = std::env::var(&config.local_rank_env)
        .map_err(|_| AllocationError::MissingEnv(config.local_rank_env.clone()))?;
    parse_rank(&value)
}

pub fn parse_rank(value: &str) -> Result<u16, AllocationError> {
    value
        .trim()
        .parse::<u16>()
        .map_err(|err| AllocationError::InvalidRank {
            value: value.to_owned(),
            reason: err.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_file_rules() {
        let contents = "batch1\n\nnode-a\nnode-b\n  node-a  \nbatch1\nnode-c\n";
        let allocation = HostAllocation::parse(contents, Some("batch1"), 2).unwrap();
        assert_eq!(allocation.hosts(), ["node-a", "node-b", "node-c"]);
        assert_eq!(allocation.node_count(), 6);
        let ids: Vec<_> = allocation.node_ids().collect();
        assert_eq!(ids.first(), Some(&NodeId::new(0, 0)));
        assert_eq!(ids.last(), Some(&NodeId::new(2, 1)));
        assert_eq!(allocation.host(NodeId::new(1, 1)), Some("node-b"));
        assert_eq!(allocation.host(NodeId::new(1, 2)), None);
    }

    #[test]
    fn empty_allocations_are_rejected() {
        assert!(matches!(
            HostAllocation::parse("launch\n\n", Some("launch"), 1),
            Err(AllocationError::Empty)
        ));
        assert!(matches!(
            HostAllocation::new(vec!["h".into()], 0),
            Err(AllocationError::NoSlots)
        ));
    }

    #[test]
    fn host_ranks_must_fit_in_u16() {
        let hosts = |count: usize| (0..count).map(|i| format!("h{i}")).collect::<Vec<_>>();
        let widest = HostAllocation::new(hosts(65_536), 1).unwrap();
        assert_eq!(
            widest.node_ids().last(),
            Some(NodeId::new(u16::MAX, 0))
        );
        let err = HostAllocation::new(hosts(65_537), 1).unwrap_err();
        assert!(matches!(err, AllocationError::TooManyHosts(65_537)));
        assert_eq!(err.code(), ErrorCode::InvalidOperation);
    }

    #[test]
    fn rank_parsing() {
        assert_eq!(parse_rank(" 3 ").unwrap(), 3);
        let err = parse_rank("three").unwrap_err();
        assert_eq!(err.code(), ErrorCode::Invalid);
    }

    #[tokio::test]
    async fn hostfile_launcher_reads_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "h1\nh2\n").unwrap();
        let launcher = HostfileLauncher::with_path(&path);
        let allocation = launcher.allocate(&ClusterConfig::default()).await.unwrap();
        assert_eq!(allocation.hosts(), ["h1", "h2"]);

        let missing = HostfileLauncher::with_path(dir.path().join("absent"));
        let err = missing.allocate(&ClusterConfig::default()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoFile);
    }
}
