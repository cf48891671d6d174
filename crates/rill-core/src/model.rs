// Core configuration models
// Typed access to the layered configuration plus the runtime settings derived from it

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use rill_common::{DEFAULT_CLUSTER_NAME, DEFAULT_NODE_PORT, Result, RillError, local_ip};

use crate::service::member_lookup::FlatfileLookup;

/// Application configuration wrapper
/// Provides access to configuration values for cluster, rpc and storage settings
#[derive(Clone, Debug)]
pub struct Configuration {
    pub config: config::Config,
}

impl Configuration {
    /// Create a new configuration from a Config instance
    pub fn from_config(config: config::Config) -> Self {
        Self { config }
    }

    pub fn cluster_name(&self) -> String {
        self.config
            .get_string("rill.cluster.name")
            .unwrap_or_else(|_| DEFAULT_CLUSTER_NAME.to_string())
    }

    pub fn node_ip(&self) -> String {
        self.config
            .get_string("rill.node.ip")
            .unwrap_or_else(|_| local_ip())
    }

    pub fn node_port(&self) -> u16 {
        self.config
            .get_int("rill.node.port")
            .unwrap_or(DEFAULT_NODE_PORT as i64) as u16
    }

    /// Whether this process joins as an ephemeral client
    pub fn is_client(&self) -> bool {
        self.config.get_bool("rill.node.client").unwrap_or(false)
    }

    /// Whether this client's disappearance should stop the cluster
    pub fn is_controlling_client(&self) -> bool {
        self.is_client() && self.config.get_bool("rill.node.controlling").unwrap_or(false)
    }

    pub fn flatfile_path(&self) -> Option<String> {
        self.config.get_string("rill.cluster.flatfile").ok()
    }

    /// Comma separated member list; takes precedence over the flatfile
    pub fn member_list(&self) -> Vec<String> {
        self.config
            .get_string("rill.cluster.members")
            .map(|s| {
                s.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Minimum cloud size before the cloud may lock (0 = no minimum)
    pub fn expected_cloud_size(&self) -> usize {
        self.config
            .get_int("rill.cluster.expected-size")
            .unwrap_or(0)
            .max(0) as usize
    }

    // ===================== Heartbeat Configuration =====================

    /// Heartbeat broadcast interval in milliseconds (default: 1000ms)
    pub fn heartbeat_interval_ms(&self) -> u64 {
        self.config
            .get_int("rill.heartbeat.interval-ms")
            .unwrap_or(1000) as u64
    }

    /// Heartbeat timeout in milliseconds (default: 60000ms)
    pub fn heartbeat_timeout_ms(&self) -> u64 {
        self.config
            .get_int("rill.heartbeat.timeout-ms")
            .unwrap_or(60000) as u64
    }

    /// Client timeout in milliseconds (default: 20000ms); clients go after twice this
    pub fn client_timeout_ms(&self) -> u64 {
        self.config
            .get_int("rill.client.timeout-ms")
            .unwrap_or(20000) as u64
    }

    // ===================== RPC Configuration =====================

    /// Largest frame sent as a single datagram (default: 1400 bytes)
    pub fn rpc_mtu(&self) -> usize {
        self.config.get_int("rill.rpc.mtu").unwrap_or(1400) as usize
    }

    pub fn rpc_retry_initial_ms(&self) -> u64 {
        self.config
            .get_int("rill.rpc.retry-initial-ms")
            .unwrap_or(200) as u64
    }

    pub fn rpc_retry_max_ms(&self) -> u64 {
        self.config
            .get_int("rill.rpc.retry-max-ms")
            .unwrap_or(5000) as u64
    }

    pub fn worker_threads(&self) -> usize {
        self.config.get_int("rill.worker.threads").unwrap_or(64) as usize
    }

    pub fn worker_high_priority_threads(&self) -> usize {
        self.config
            .get_int("rill.worker.high-priority-threads")
            .unwrap_or(32) as usize
    }

    // ===================== Storage Configuration =====================

    pub fn persist_dir(&self) -> Option<String> {
        self.config.get_string("rill.persist.dir").ok()
    }

    pub fn build_version(&self) -> String {
        self.config
            .get_string("rill.build.version")
            .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string())
    }
}

/// Settings a [`crate::ClusterRuntime`] runs with
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    pub cluster_name: String,
    /// Address the node listens on and is known by
    pub address: SocketAddr,
    pub client: bool,
    pub controlling: bool,
    /// Candidate peers used in place of discovery
    pub flatfile: Vec<SocketAddr>,
    pub expected_size: usize,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub client_timeout: Duration,
    pub mtu: usize,
    pub retry_initial: Duration,
    pub retry_max: Duration,
    pub worker_threads: usize,
    pub high_priority_threads: usize,
    pub build_version: String,
    pub event_queue_size: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_name: DEFAULT_CLUSTER_NAME.to_string(),
            address: SocketAddr::new(IpAddr::from([127, 0, 0, 1]), DEFAULT_NODE_PORT),
            client: false,
            controlling: false,
            flatfile: Vec::new(),
            expected_size: 0,
            heartbeat_interval: Duration::from_millis(1000),
            heartbeat_timeout: Duration::from_millis(60000),
            client_timeout: Duration::from_millis(20000),
            mtu: 1400,
            retry_initial: Duration::from_millis(200),
            retry_max: Duration::from_millis(5000),
            worker_threads: 64,
            high_priority_threads: 32,
            build_version: env!("CARGO_PKG_VERSION").to_string(),
            event_queue_size: 1024,
        }
    }
}

impl ClusterConfig {
    pub fn from_configuration(config: &Configuration) -> Result<Self> {
        let ip: IpAddr = config.node_ip().parse().map_err(|e| {
            RillError::ConfigError(format!("invalid node ip '{}': {}", config.node_ip(), e))
        })?;
        let port = config.node_port();
        let flatfile = FlatfileLookup::new(config.clone()).load()?;

        Ok(Self {
            cluster_name: config.cluster_name(),
            address: SocketAddr::new(ip, port),
            client: config.is_client(),
            controlling: config.is_controlling_client(),
            flatfile,
            expected_size: config.expected_cloud_size(),
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms()),
            heartbeat_timeout: Duration::from_millis(config.heartbeat_timeout_ms()),
            client_timeout: Duration::from_millis(config.client_timeout_ms()),
            mtu: config.rpc_mtu(),
            retry_initial: Duration::from_millis(config.rpc_retry_initial_ms()),
            retry_max: Duration::from_millis(config.rpc_retry_max_ms()),
            worker_threads: config.worker_threads().max(1),
            high_priority_threads: config.worker_high_priority_threads().max(1),
            build_version: config.build_version(),
            ..Default::default()
        })
    }

    /// Silence longer than this marks a peer suspect
    pub fn suspect_after(&self) -> Duration {
        self.heartbeat_timeout + Duration::from_millis(500)
    }

    /// Silence longer than this evicts a client
    pub fn client_eviction_after(&self) -> Duration {
        self.client_timeout * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Configuration {
        let config = config::Config::builder()
            .set_default("rill.cluster.name", "test-cloud")
            .unwrap()
            .set_default("rill.node.ip", "10.0.0.1")
            .unwrap()
            .set_default("rill.node.port", 6000)
            .unwrap()
            .set_default("rill.cluster.members", "10.0.0.1:6000, 10.0.0.2:6000,,10.0.0.3")
            .unwrap()
            .set_default("rill.heartbeat.interval-ms", 250)
            .unwrap()
            .build()
            .unwrap();
        Configuration::from_config(config)
    }

    #[test]
    fn test_configuration_defaults() {
        let config = Configuration::from_config(config::Config::builder().build().unwrap());
        assert_eq!(config.cluster_name(), DEFAULT_CLUSTER_NAME);
        assert_eq!(config.node_port(), DEFAULT_NODE_PORT);
        assert!(!config.is_client());
        assert!(!config.is_controlling_client());
        assert_eq!(config.rpc_retry_initial_ms(), 200);
        assert_eq!(config.rpc_retry_max_ms(), 5000);
        assert!(config.member_list().is_empty());
    }

    #[test]
    fn test_member_list_parsing() {
        let config = test_config();
        assert_eq!(
            config.member_list(),
            vec!["10.0.0.1:6000", "10.0.0.2:6000", "10.0.0.3"]
        );
    }

    #[test]
    fn test_cluster_config_from_configuration() {
        let cluster = ClusterConfig::from_configuration(&test_config()).unwrap();
        assert_eq!(cluster.cluster_name, "test-cloud");
        assert_eq!(cluster.address, "10.0.0.1:6000".parse().unwrap());
        assert_eq!(cluster.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(cluster.flatfile.len(), 3);
        // bare ip takes the node port
        assert!(cluster.flatfile.contains(&"10.0.0.3:6000".parse().unwrap()));
    }

    #[test]
    fn test_invalid_ip_is_config_error() {
        let config = config::Config::builder()
            .set_default("rill.node.ip", "not-an-ip")
            .unwrap()
            .build()
            .unwrap();
        let err = ClusterConfig::from_configuration(&Configuration::from_config(config));
        assert!(matches!(err, Err(RillError::ConfigError(_))));
    }

    #[test]
    fn test_thresholds() {
        let cluster = ClusterConfig::default();
        assert!(cluster.suspect_after() > cluster.heartbeat_timeout);
        assert_eq!(cluster.client_eviction_after(), Duration::from_secs(40));
    }
}
