//! ---
//! dbr_section: "01-core-functionality"
//! dbr_subsection: "module"
//! dbr_type: "source"
//! dbr_scope: "code"
//! dbr_description: "Shared primitives and utilities for the Data Broker."
//! dbr_version: "v0.0.0-prealpha"
//! dbr_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::{debug, warn};

use crate::logging::LogFormat;

fn default_client_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_outstanding_tags() -> usize {
    1024
}

fn default_max_namespaces() -> usize {
    1024
}

fn default_base_port() -> u16 {
    1601
}

fn default_nodes_per_host() -> u16 {
    1
}

fn default_password() -> Option<String> {
    Some("foobared".to_owned())
}

fn default_node_timeout() -> Duration {
    Duration::from_millis(150_000)
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./")
}

fn default_hostfile_env() -> String {
    "LSB_DJOB_HOSTFILE".to_owned()
}

fn default_local_rank_env() -> String {
    "JSM_NAMESPACE_LOCAL_RANK".to_owned()
}

fn default_daemonize() -> bool {
    true
}

fn default_fanout_concurrency() -> usize {
    32
}

fn default_server_binary() -> PathBuf {
    PathBuf::from("redis-server")
}

fn default_client_binary() -> PathBuf {
    PathBuf::from("redis-cli")
}

fn default_rdb_binary() -> PathBuf {
    PathBuf::from("rdb")
}

fn default_remote_exec() -> Vec<String> {
    vec!["pdsh".to_owned(), "-w".to_owned()]
}

fn default_initial_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(30)
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_converge_deadline() -> Duration {
    Duration::from_secs(300)
}

fn default_save_deadline() -> Duration {
    Duration::from_secs(600)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

/// Primary configuration object for Data Broker clients and the cluster orchestrator.
///
/// Built once, validated, and then shared read-only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DbrConfig {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where a [`DbrConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedDbrConfig {
    pub config: DbrConfig,
    pub source: Option<PathBuf>,
}

impl DbrConfig {
    pub const ENV_CONFIG_PATH: &str = "DBR_CONFIG";

    /// Load configuration from disk, respecting the `DBR_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Self::load_with_source(candidates)?
            .map(|loaded| loaded.config)
            .ok_or_else(|| {
                anyhow!(
                    "no configuration files found. inspected: {}",
                    candidates
                        .iter()
                        .map(|p| p.as_ref().display().to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            })
    }

    /// Load configuration from the first existing source, or fall back to defaults.
    ///
    /// Environment overrides (`DBR_TIMEOUT`) are applied in both cases.
    pub fn load_or_default<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedDbrConfig> {
        let mut loaded = match Self::load_with_source(candidates)? {
            Some(loaded) => loaded,
            None => {
                debug!("no configuration file found; using defaults");
                LoadedDbrConfig {
                    config: DbrConfig::default(),
                    source: None,
                }
            }
        };
        loaded.config.client.apply_env();
        loaded.config.validate()?;
        Ok(loaded)
    }

    fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<Option<LoadedDbrConfig>> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(Some(LoadedDbrConfig {
                    config,
                    source: Some(path),
                }));
            }
        }

        for candidate in candidates {
            let path = candidate.as_ref();
            if path.exists() {
                let config = Self::from_path(path)?;
                return Ok(Some(LoadedDbrConfig {
                    config,
                    source: Some(path.to_path_buf()),
                }));
            }
        }
        Ok(None)
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<DbrConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.client.validate()?;
        self.cluster.validate()?;
        self.poll.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for DbrConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: DbrConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Tuple-space client settings.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Deadline for blocking `get`/`read`; zero disables the deadline.
    #[serde(default = "default_client_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub timeout: Duration,
    #[serde(default = "default_max_outstanding_tags")]
    pub max_outstanding_tags: usize,
    #[serde(default = "default_max_namespaces")]
    pub max_namespaces: usize,
}

impl ClientConfig {
    pub const ENV_TIMEOUT: &str = "DBR_TIMEOUT";

    /// Blocking deadline, or `None` when waits are unbounded.
    pub fn effective_timeout(&self) -> Option<Duration> {
        if self.timeout.is_zero() {
            None
        } else {
            Some(self.timeout)
        }
    }

    /// Apply the `DBR_TIMEOUT` environment override, if present.
    pub fn apply_env(&mut self) {
        let value = std::env::var(Self::ENV_TIMEOUT).ok();
        self.apply_timeout_override(value.as_deref());
    }

    /// Apply a timeout override expressed in whole seconds.
    pub fn apply_timeout_override(&mut self, value: Option<&str>) {
        let Some(raw) = value else {
            return;
        };
        match raw.trim().parse::<u64>() {
            Ok(seconds) => self.timeout = Duration::from_secs(seconds),
            Err(err) => warn!(
                value = %raw,
                error = %err,
                "ignoring malformed {} override",
                Self::ENV_TIMEOUT
            ),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_outstanding_tags == 0 {
            return Err(anyhow!("client.max_outstanding_tags must be at least 1"));
        }
        if self.max_namespaces == 0 {
            return Err(anyhow!("client.max_namespaces must be at least 1"));
        }
        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: default_client_timeout(),
            max_outstanding_tags: default_max_outstanding_tags(),
            max_namespaces: default_max_namespaces(),
        }
    }
}

/// Static description of how backend nodes are laid out and reached.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    #[serde(default = "default_nodes_per_host")]
    pub nodes_per_host: u16,
    #[serde(default = "default_password")]
    pub password: Option<String>,
    #[serde(default)]
    pub replicas: u32,
    #[serde(default = "default_node_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub node_timeout: Duration,
    /// Upper bound on any single external control command; the process is killed beyond it.
    #[serde(default = "default_command_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub command_timeout: Duration,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Network interface suffix appended to host names (`host-ib0`).
    #[serde(default)]
    pub interface_suffix: Option<String>,
    /// Host running the orchestrator itself; never receives a node.
    #[serde(default)]
    pub launch_node: Option<String>,
    #[serde(default = "default_hostfile_env")]
    pub hostfile_env: String,
    #[serde(default = "default_local_rank_env")]
    pub local_rank_env: String,
    #[serde(default = "default_daemonize")]
    pub daemonize: bool,
    #[serde(default = "default_fanout_concurrency")]
    pub fanout_concurrency: usize,
    #[serde(default)]
    pub tools: ToolConfig,
}

impl ClusterConfig {
    /// Listening port of the node with the given local rank.
    pub fn port_for(&self, local_rank: u16) -> u16 {
        self.base_port.saturating_add(local_rank)
    }

    /// Address a host is reached at, including the interface suffix.
    pub fn address_for(&self, host: &str) -> String {
        match &self.interface_suffix {
            Some(suffix) if !suffix.is_empty() => format!("{host}-{suffix}"),
            _ => host.to_owned(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.nodes_per_host == 0 {
            return Err(anyhow!("cluster.nodes_per_host must be at least 1"));
        }
        if u32::from(self.base_port) + u32::from(self.nodes_per_host) - 1 > u32::from(u16::MAX) {
            return Err(anyhow!(
                "cluster.base_port {} leaves no room for {} nodes per host",
                self.base_port,
                self.nodes_per_host
            ));
        }
        if self.fanout_concurrency == 0 {
            return Err(anyhow!("cluster.fanout_concurrency must be at least 1"));
        }
        if self.command_timeout.is_zero() {
            return Err(anyhow!("cluster.command_timeout must be positive"));
        }
        if self.hostfile_env.trim().is_empty() {
            return Err(anyhow!("cluster.hostfile_env must name an environment variable"));
        }
        Ok(())
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            base_port: default_base_port(),
            nodes_per_host: default_nodes_per_host(),
            password: default_password(),
            replicas: 0,
            node_timeout: default_node_timeout(),
            command_timeout: default_command_timeout(),
            data_dir: default_data_dir(),
            interface_suffix: None,
            launch_node: None,
            hostfile_env: default_hostfile_env(),
            local_rank_env: default_local_rank_env(),
            daemonize: default_daemonize(),
            fanout_concurrency: default_fanout_concurrency(),
            tools: ToolConfig::default(),
        }
    }
}

/// External programs used by process-backed node control.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    #[serde(default = "default_server_binary")]
    pub server: PathBuf,
    #[serde(default = "default_client_binary")]
    pub client: PathBuf,
    #[serde(default = "default_rdb_binary")]
    pub rdb: PathBuf,
    /// Command prefix used to run the control binary on a given host; the host is appended.
    #[serde(default = "default_remote_exec")]
    pub remote_exec: Vec<String>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            server: default_server_binary(),
            client: default_client_binary(),
            rdb: default_rdb_binary(),
            remote_exec: default_remote_exec(),
        }
    }
}

/// Backoff and deadline settings for convergence and snapshot polling.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_initial_backoff")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub initial_backoff: Duration,
    #[serde(default = "default_max_backoff")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_backoff: Duration,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default)]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub jitter: Duration,
    #[serde(default = "default_converge_deadline")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub converge_deadline: Duration,
    #[serde(default = "default_save_deadline")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub save_deadline: Duration,
}

impl PollConfig {
    pub fn validate(&self) -> Result<()> {
        if self.initial_backoff.is_zero() {
            return Err(anyhow!("poll.initial_backoff must be positive"));
        }
        if self.max_backoff < self.initial_backoff {
            return Err(anyhow!("poll.max_backoff must not be below poll.initial_backoff"));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(anyhow!("poll.multiplier must be a finite value >= 1.0"));
        }
        Ok(())
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            multiplier: default_multiplier(),
            jitter: Duration::ZERO,
            converge_deadline: default_converge_deadline(),
            save_deadline: default_save_deadline(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_deployment() {
        let config = DbrConfig::default();
        assert_eq!(config.cluster.base_port, 1601);
        assert_eq!(config.cluster.nodes_per_host, 1);
        assert_eq!(config.cluster.password.as_deref(), Some("foobared"));
        assert_eq!(config.cluster.node_timeout, Duration::from_millis(150_000));
        assert_eq!(config.client.timeout, Duration::from_secs(5));
        assert_eq!(config.client.max_outstanding_tags, 1024);
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn zero_timeout_disables_deadline() {
        let mut client = ClientConfig::default();
        client.apply_timeout_override(Some("0"));
        assert_eq!(client.effective_timeout(), None);
        client.apply_timeout_override(Some(" 12 "));
        assert_eq!(client.effective_timeout(), Some(Duration::from_secs(12)));
        client.apply_timeout_override(Some("soon"));
        assert_eq!(client.effective_timeout(), Some(Duration::from_secs(12)));
    }

    #[test]
    fn port_and_address_derivation() {
        let cluster = ClusterConfig {
            interface_suffix: Some("ib0".into()),
            ..ClusterConfig::default()
        };
        assert_eq!(cluster.port_for(0), 1601);
        assert_eq!(cluster.port_for(3), 1604);
        assert_eq!(cluster.address_for("c699c010"), "c699c010-ib0");
        assert_eq!(ClusterConfig::default().address_for("c699c010"), "c699c010");
    }

    #[test]
    fn rejects_port_overflow() {
        let cluster = ClusterConfig {
            base_port: u16::MAX,
            nodes_per_host: 2,
            ..ClusterConfig::default()
        };
        assert!(cluster.validate().is_err());
    }
}
