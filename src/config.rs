//! Configuration management
//!
//! Supports configuration via command line arguments, environment variables,
//! and configuration files (YAML/JSON). Values given on the command line win
//! over the file; the file wins over built-in defaults.

use crate::currency::CurrencyParameters;
use crate::miner::MinerConfig;
use crate::node::embedded::EmbeddedNodeConfig;
use crate::node::remote::RemoteNodeConfig;
use crate::{Error, Result};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Node backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeMode {
    /// JSON-over-HTTP client to an external daemon
    Remote,
    /// In-process node with its own storage and peer server
    Embedded,
}

impl fmt::Display for NodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeMode::Remote => write!(f, "remote"),
            NodeMode::Embedded => write!(f, "embedded"),
        }
    }
}

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Error => write!(f, "error"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Trace => write!(f, "trace"),
        }
    }
}

/// Console log formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Plain,
    Pretty,
    Json,
}

/// Complete configuration for the node and miner
#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[command(
    name = "hybrid-node-miner",
    version = env!("CARGO_PKG_VERSION"),
    about = "Node access layer and hybrid PoS/PoW miner",
    long_about = "Connects to a remote daemon or runs an embedded regtest node, \
                  and drives stake-weighted CPU mining"
)]
pub struct Config {
    /// Print the parsed configuration and exit
    #[arg(long)]
    #[serde(skip)]
    pub print_config: bool,

    /// Configuration file path (YAML or JSON)
    #[arg(long, value_name = "FILE")]
    #[serde(skip)]
    pub config_file: Option<PathBuf>,

    /// Node backend
    #[arg(short = 'm', long, default_value = "remote")]
    #[serde(default = "default_node_mode")]
    pub node: NodeMode,

    /// Remote daemon host
    #[arg(long, default_value = "127.0.0.1")]
    #[serde(default = "default_daemon_host")]
    pub daemon_host: String,

    /// Remote daemon RPC port
    #[arg(long, default_value = "32348")]
    #[serde(default = "default_daemon_port")]
    pub daemon_port: u16,

    /// Use TLS to connect to the daemon
    #[arg(short = 't', long)]
    #[serde(default)]
    pub tls: bool,

    /// Accept self-signed TLS certificates
    #[arg(short = 'x', long)]
    #[serde(default)]
    pub insecure: bool,

    /// Embedded node data directory
    #[arg(long, default_value = "data")]
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Embedded node peer listener address
    #[arg(long, default_value = "127.0.0.1:32347")]
    #[serde(default = "default_p2p_bind")]
    pub p2p_bind: String,

    /// Peers the embedded node connects to on start (repeatable)
    #[arg(long = "seed-peer", value_name = "ADDR")]
    #[serde(default)]
    pub seed_peers: Vec<String>,

    /// Rewind the embedded chain to this height on start
    #[arg(long)]
    #[serde(default)]
    pub rewind_to_height: Option<u32>,

    /// Address that receives mining rewards; mining starts when set
    #[arg(short = 'a', long)]
    #[serde(default)]
    pub mining_address: Option<String>,

    /// Number of mining threads
    #[arg(short = 'c', long, default_value_t = default_threads())]
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Ring size of stake transactions
    #[arg(long, default_value = "3")]
    #[serde(default = "default_stake_mixin")]
    pub stake_mixin: u32,

    /// Chosen stake in atomic units (defaults to the base stake)
    #[arg(long)]
    #[serde(default)]
    pub stake_amount: Option<u64>,

    /// Spendable balance of the built-in regtest wallet
    #[arg(long, default_value = "100000000000000")]
    #[serde(default = "default_regtest_balance")]
    pub regtest_balance: u64,

    /// Log level
    #[arg(short = 'l', long, default_value = "info")]
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    /// Console log format
    #[arg(long, default_value = "plain")]
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    /// Directory for daily rolling log files
    #[arg(long)]
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// HTTP request timeout
    #[arg(long, default_value = "10s")]
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,

    /// Remote daemon polling interval
    #[arg(long, default_value = "5s")]
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// Periodic block template refresh interval
    #[arg(long, default_value = "30s")]
    #[serde(default = "default_template_refresh_interval")]
    pub template_refresh_interval: String,

    /// Hash rate merge interval
    #[arg(long, default_value = "2s")]
    #[serde(default = "default_hashrate_interval")]
    pub hashrate_interval: String,

    /// Delay letting the wallet observe a new block before a template refresh
    #[arg(long, default_value = "5s")]
    #[serde(default = "default_wallet_settle_interval")]
    pub wallet_settle_interval: String,

    /// Bounded wait for worker threads on stop
    #[arg(long, default_value = "2s")]
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout: String,

    /// Consecutive template refresh failures tolerated before mining stops
    #[arg(long, default_value = "5")]
    #[serde(default = "default_max_template_failures")]
    pub max_template_failures: u32,

    /// Network constants (configuration file only)
    #[arg(skip)]
    #[serde(default)]
    pub currency: CurrencyParameters,
}

impl Config {
    /// Parse the command line, merge the configuration file and validate
    pub async fn load() -> Result<Self> {
        let mut config = Self::parse();

        if let Some(config_file) = &config.config_file {
            let file_config = Self::load_from_file(config_file).await?;
            config = config.merge_with_file(file_config);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    async fn load_from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;

        if path.extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::from_str(&content).map_err(Error::from)
        } else {
            serde_yaml::from_str(&content).map_err(Error::from)
        }
    }

    /// Merge CLI config with file config
    ///
    /// A CLI value still equal to its default is treated as unset.
    fn merge_with_file(mut self, file: Self) -> Self {
        fn pick<T: PartialEq>(cli: &mut T, file: T, default: T) {
            if *cli == default {
                *cli = file;
            }
        }

        pick(&mut self.node, file.node, default_node_mode());
        pick(&mut self.daemon_host, file.daemon_host, default_daemon_host());
        pick(&mut self.daemon_port, file.daemon_port, default_daemon_port());
        pick(&mut self.tls, file.tls, false);
        pick(&mut self.insecure, file.insecure, false);
        pick(&mut self.data_dir, file.data_dir, default_data_dir());
        pick(&mut self.p2p_bind, file.p2p_bind, default_p2p_bind());
        pick(&mut self.seed_peers, file.seed_peers, Vec::new());
        pick(&mut self.rewind_to_height, file.rewind_to_height, None);
        pick(&mut self.mining_address, file.mining_address, None);
        pick(&mut self.threads, file.threads, default_threads());
        pick(&mut self.stake_mixin, file.stake_mixin, default_stake_mixin());
        pick(&mut self.stake_amount, file.stake_amount, None);
        pick(&mut self.regtest_balance, file.regtest_balance, default_regtest_balance());
        pick(&mut self.log_level, file.log_level, default_log_level());
        pick(&mut self.log_format, file.log_format, default_log_format());
        pick(&mut self.log_dir, file.log_dir, None);
        pick(&mut self.request_timeout, file.request_timeout, default_request_timeout());
        pick(&mut self.poll_interval, file.poll_interval, default_poll_interval());
        pick(
            &mut self.template_refresh_interval,
            file.template_refresh_interval,
            default_template_refresh_interval(),
        );
        pick(&mut self.hashrate_interval, file.hashrate_interval, default_hashrate_interval());
        pick(
            &mut self.wallet_settle_interval,
            file.wallet_settle_interval,
            default_wallet_settle_interval(),
        );
        pick(&mut self.stop_timeout, file.stop_timeout, default_stop_timeout());
        pick(
            &mut self.max_template_failures,
            file.max_template_failures,
            default_max_template_failures(),
        );
        self.currency = file.currency;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.daemon_url())
            .map_err(|e| Error::config(format!("Invalid daemon URL: {}", e)))?;

        self.p2p_socket_addr()?;
        self.seed_peer_addrs()?;

        if self.threads == 0 {
            return Err(Error::config("Thread count must be greater than 0"));
        }
        if self.max_template_failures == 0 {
            return Err(Error::config("max_template_failures must be greater than 0"));
        }

        self.request_timeout_duration()?;
        self.poll_interval_duration()?;
        self.template_refresh_interval_duration()?;
        self.hashrate_interval_duration()?;
        self.wallet_settle_interval_duration()?;
        self.stop_timeout_duration()?;

        if let Some(address) = &self.mining_address {
            self.currency.parse_address(address)?;
        }

        Ok(())
    }

    /// Get daemon base URL
    pub fn daemon_url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.daemon_host, self.daemon_port)
    }

    /// Get peer listener socket address
    pub fn p2p_socket_addr(&self) -> Result<SocketAddr> {
        self.p2p_bind
            .parse()
            .map_err(|e| Error::config(format!("Invalid p2p bind address: {}", e)))
    }

    /// Get seed peer socket addresses
    pub fn seed_peer_addrs(&self) -> Result<Vec<SocketAddr>> {
        self.seed_peers
            .iter()
            .map(|peer| {
                peer.parse()
                    .map_err(|e| Error::config(format!("Invalid seed peer {}: {}", peer, e)))
            })
            .collect()
    }

    /// Get HTTP request timeout
    pub fn request_timeout_duration(&self) -> Result<Duration> {
        parse_duration("request_timeout", &self.request_timeout)
    }

    /// Get daemon polling interval
    pub fn poll_interval_duration(&self) -> Result<Duration> {
        parse_duration("poll_interval", &self.poll_interval)
    }

    /// Get template refresh interval
    pub fn template_refresh_interval_duration(&self) -> Result<Duration> {
        parse_duration("template_refresh_interval", &self.template_refresh_interval)
    }

    /// Get hash rate merge interval
    pub fn hashrate_interval_duration(&self) -> Result<Duration> {
        parse_duration("hashrate_interval", &self.hashrate_interval)
    }

    /// Get wallet settle interval
    pub fn wallet_settle_interval_duration(&self) -> Result<Duration> {
        parse_duration("wallet_settle_interval", &self.wallet_settle_interval)
    }

    /// Get worker stop timeout
    pub fn stop_timeout_duration(&self) -> Result<Duration> {
        parse_duration("stop_timeout", &self.stop_timeout)
    }

    /// Settings for [`crate::node::RemoteNode`]
    pub fn remote_node_config(&self) -> Result<RemoteNodeConfig> {
        Ok(RemoteNodeConfig {
            host: self.daemon_host.clone(),
            port: self.daemon_port,
            tls: self.tls,
            insecure: self.insecure,
            request_timeout: self.request_timeout_duration()?,
            poll_interval: self.poll_interval_duration()?,
        })
    }

    /// Settings for [`crate::node::EmbeddedNode`]
    pub fn embedded_node_config(&self) -> Result<EmbeddedNodeConfig> {
        Ok(EmbeddedNodeConfig {
            data_dir: self.data_dir.clone(),
            p2p_bind: self.p2p_socket_addr()?,
            seed_peers: self.seed_peer_addrs()?,
            rewind_to_height: self.rewind_to_height,
        })
    }

    /// Settings for [`crate::miner::Miner`]
    pub fn miner_config(&self) -> Result<MinerConfig> {
        Ok(MinerConfig {
            stake_mixin: self.stake_mixin,
            stake_amount: self.stake_amount,
            template_refresh_interval: self.template_refresh_interval_duration()?,
            hashrate_interval: self.hashrate_interval_duration()?,
            wallet_settle_interval: self.wallet_settle_interval_duration()?,
            stop_timeout: self.stop_timeout_duration()?,
            max_template_failures: self.max_template_failures,
            ..MinerConfig::default()
        })
    }
}

fn parse_duration(name: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| Error::config(format!("Invalid {} \"{}\": {}", name, value, e)))
}

// Default value functions for serde
fn default_node_mode() -> NodeMode { NodeMode::Remote }
fn default_daemon_host() -> String { "127.0.0.1".to_string() }
fn default_daemon_port() -> u16 { 32348 }
fn default_data_dir() -> PathBuf { PathBuf::from("data") }
fn default_p2p_bind() -> String { "127.0.0.1:32347".to_string() }
fn default_threads() -> usize { num_cpus::get().max(1) }
fn default_stake_mixin() -> u32 { 3 }
fn default_regtest_balance() -> u64 { 100_000_000_000_000 }
fn default_log_level() -> LogLevel { LogLevel::Info }
fn default_log_format() -> LogFormat { LogFormat::Plain }
fn default_request_timeout() -> String { "10s".to_string() }
fn default_poll_interval() -> String { "5s".to_string() }
fn default_template_refresh_interval() -> String { "30s".to_string() }
fn default_hashrate_interval() -> String { "2s".to_string() }
fn default_wallet_settle_interval() -> String { "5s".to_string() }
fn default_stop_timeout() -> String { "2s".to_string() }
fn default_max_template_failures() -> u32 { 5 }

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_defaults() {
        let config = Config::try_parse_from(["hybrid-node-miner"]).unwrap();

        assert_eq!(config.node, NodeMode::Remote);
        assert_eq!(config.daemon_port, 32348);
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.stake_mixin, 3);
        assert!(config.threads > 0);
        assert!(!config.tls);
        assert!(config.validate().is_ok());
        assert_eq!(config.daemon_url(), "http://127.0.0.1:32348");
    }

    #[test]
    fn test_duration_accessors() {
        let config = Config::try_parse_from([
            "hybrid-node-miner",
            "--template-refresh-interval",
            "1m",
            "--stop-timeout",
            "500ms",
        ])
        .unwrap();

        assert_eq!(
            config.template_refresh_interval_duration().unwrap(),
            Duration::from_secs(60)
        );
        assert_eq!(config.stop_timeout_duration().unwrap(), Duration::from_millis(500));

        let miner = config.miner_config().unwrap();
        assert_eq!(miner.template_refresh_interval, Duration::from_secs(60));
        assert_eq!(miner.max_template_failures, 5);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = Config::try_parse_from(["hybrid-node-miner"]).unwrap();
        config.threads = 0;
        assert!(config.validate().is_err());

        let mut config = Config::try_parse_from(["hybrid-node-miner"]).unwrap();
        config.poll_interval = "soon".to_string();
        assert!(matches!(config.validate(), Err(Error::Config { .. })));

        let mut config = Config::try_parse_from(["hybrid-node-miner"]).unwrap();
        config.seed_peers = vec!["nowhere".to_string()];
        assert!(config.validate().is_err());

        let mut config = Config::try_parse_from(["hybrid-node-miner"]).unwrap();
        config.mining_address = Some("00".to_string());
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_config_from_yaml() {
        let yaml_content = r#"
node: embedded
data_dir: "/tmp/regtest"
seed_peers: ["127.0.0.1:40000"]
threads: 3
poll_interval: "750ms"
currency:
  mined_money_unlock_window: 20
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let file = Config::load_from_file(temp_file.path()).await.unwrap();
        assert_eq!(file.node, NodeMode::Embedded);
        assert_eq!(file.currency.mined_money_unlock_window, 20);
        assert_eq!(file.currency.default_mixin, 3);

        let cli = Config::try_parse_from(["hybrid-node-miner", "--threads", "517"]).unwrap();
        let merged = cli.merge_with_file(file);

        assert_eq!(merged.node, NodeMode::Embedded);
        assert_eq!(merged.threads, 517);
        assert_eq!(merged.data_dir, PathBuf::from("/tmp/regtest"));
        assert_eq!(
            merged.poll_interval_duration().unwrap(),
            Duration::from_millis(750)
        );
        assert_eq!(merged.seed_peer_addrs().unwrap().len(), 1);
    }
}
