//! Agent configuration.
//!
//! An [`AgentConfig`] is built once at startup, validated, and shared as
//! `Arc<AgentConfig>` with every component.

use std::time::Duration;

use metal_agent_client::{ApiVersion, ClientConfig};
use metal_agent_core::HostName;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DriverError, Result};

/// Configuration for the bare-metal agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// This agent's host name.
    pub host: HostName,
    /// Hypervisor type whose live hosts form the ring.
    pub hypervisor_type: String,
    /// Shard this agent serves. Overrides group and peer scoping.
    pub shard: Option<String>,
    /// Conductor group this agent serves.
    pub conductor_group: Option<String>,
    /// Hosts allowed to share the conductor group.
    pub peer_list: Vec<HostName>,
    /// Attempts for the unprovision wait and lifecycle polls.
    pub api_max_retries: u32,
    /// Delay between lifecycle polls.
    pub api_retry_interval: Duration,
    /// Age after which the node cache is refreshed on read.
    pub cache_ttl: Duration,
    /// Hard bound on waiting for a console mode change.
    pub serial_console_state_timeout: Duration,
    /// Initial console poll delay.
    pub console_poll_interval: Duration,
    /// Optional hard bound on provisioning, power and rescue waits.
    pub lifecycle_timeout: Option<Duration>,
    /// Report in-use nodes without reserving their capacity.
    pub skip_reserve_in_use_nodes: bool,
    /// Interval of the background ring and cache refresh.
    pub refresh_interval: Duration,
    /// Base URL of the control plane.
    pub control_plane_url: String,
    /// Highest API microversion this agent speaks.
    pub control_plane_api_version: ApiVersion,
    /// Agent hosts seeded into the in-memory service registry.
    pub service_hosts: Vec<HostName>,
    /// Address the health server listens on.
    pub listen_addr: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host: HostName::localhost(),
            hypervisor_type: "ironic".to_string(),
            shard: None,
            conductor_group: None,
            peer_list: Vec::new(),
            api_max_retries: 60,
            api_retry_interval: Duration::from_secs(2),
            cache_ttl: Duration::from_secs(60),
            serial_console_state_timeout: Duration::from_secs(10),
            console_poll_interval: Duration::from_secs(1),
            lifecycle_timeout: None,
            skip_reserve_in_use_nodes: false,
            refresh_interval: Duration::from_secs(60),
            control_plane_url: "http://localhost:6385".to_string(),
            control_plane_api_version: ApiVersion::SHARDS,
            service_hosts: Vec::new(),
            listen_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl AgentConfig {
    /// Create a config for the given host with every other value defaulted.
    #[must_use]
    pub fn for_host(host: HostName) -> Self {
        Self {
            host,
            ..Default::default()
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Supported environment variables:
    /// - `AGENT_HOST`: this agent's host name
    /// - `HYPERVISOR_TYPE`: hypervisor type of ring members
    /// - `AGENT_SHARD`: shard served by this agent
    /// - `CONDUCTOR_GROUP`: conductor group served by this agent
    /// - `PEER_LIST`: comma-separated hosts sharing the conductor group
    /// - `API_MAX_RETRIES`: attempts for lifecycle polls
    /// - `API_RETRY_INTERVAL_SECS`: delay between lifecycle polls
    /// - `CACHE_TTL_SECS`: node cache freshness bound
    /// - `SERIAL_CONSOLE_STATE_TIMEOUT_SECS`: console mode change bound
    /// - `CONSOLE_POLL_INTERVAL_MS`: initial console poll delay
    /// - `LIFECYCLE_TIMEOUT_SECS`: hard bound on lifecycle waits
    /// - `SKIP_RESERVE_IN_USE_NODES`: `true` to skip reserving in-use nodes
    /// - `REFRESH_INTERVAL_SECS`: background refresh interval
    /// - `CONTROL_PLANE_URL`: control plane base URL
    /// - `CONTROL_PLANE_API_VERSION`: highest microversion, e.g. `1.82`
    /// - `SERVICE_HOSTS`: comma-separated agent hosts for the service registry
    /// - `LISTEN_ADDR`: health server address
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(host) = env_parse::<HostName>("AGENT_HOST") {
            config.host = host;
        }
        if let Ok(val) = std::env::var("HYPERVISOR_TYPE") {
            config.hypervisor_type = val;
        }
        config.shard = env_non_empty("AGENT_SHARD");
        config.conductor_group = env_non_empty("CONDUCTOR_GROUP");
        if let Ok(val) = std::env::var("PEER_LIST") {
            config.peer_list = parse_host_list(&val);
        }
        if let Some(n) = env_parse("API_MAX_RETRIES") {
            config.api_max_retries = n;
        }
        if let Some(secs) = env_parse("API_RETRY_INTERVAL_SECS") {
            config.api_retry_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("CACHE_TTL_SECS") {
            config.cache_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("SERIAL_CONSOLE_STATE_TIMEOUT_SECS") {
            config.serial_console_state_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse("CONSOLE_POLL_INTERVAL_MS") {
            config.console_poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse("LIFECYCLE_TIMEOUT_SECS") {
            config.lifecycle_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(skip) = env_parse("SKIP_RESERVE_IN_USE_NODES") {
            config.skip_reserve_in_use_nodes = skip;
        }
        if let Some(secs) = env_parse("REFRESH_INTERVAL_SECS") {
            config.refresh_interval = Duration::from_secs(secs);
        }
        if let Ok(val) = std::env::var("CONTROL_PLANE_URL") {
            config.control_plane_url = val;
        }
        if let Some(version) = env_parse("CONTROL_PLANE_API_VERSION") {
            config.control_plane_api_version = version;
        }
        if let Ok(val) = std::env::var("SERVICE_HOSTS") {
            config.service_hosts = parse_host_list(&val);
        }
        if let Ok(val) = std::env::var("LISTEN_ADDR") {
            config.listen_addr = val;
        }

        config
    }

    /// Validate the configuration.
    ///
    /// Must run before the first refresh.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::InvalidPeerList` if a conductor group is configured
    /// without a shard and the peer list is empty or omits this host, and
    /// `DriverError::Config` for other unusable values.
    pub fn validate(&self) -> Result<()> {
        if self.hypervisor_type.trim().is_empty() {
            return Err(DriverError::Config("hypervisor_type must not be empty".into()));
        }
        if self.api_max_retries == 0 {
            return Err(DriverError::Config("api_max_retries must be at least 1".into()));
        }
        self.check_peer_list()
    }

    /// Check the peer list against the group and shard settings.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::InvalidPeerList` if the list is unusable.
    pub fn check_peer_list(&self) -> Result<()> {
        if let Some(shard) = &self.shard {
            if !self.peer_list.is_empty() {
                debug!(
                    shard = %shard,
                    peers = self.peer_list.len(),
                    "Shard configured, ignoring peer list"
                );
            }
            return Ok(());
        }
        if self.conductor_group.is_none() {
            return Ok(());
        }
        if self.peer_list.is_empty() {
            return Err(DriverError::InvalidPeerList(
                "peer_list must not be empty when conductor_group is set".into(),
            ));
        }
        if !self.peer_list.contains(&self.host) {
            return Err(DriverError::InvalidPeerList(format!(
                "peer_list must include this host ({})",
                self.host
            )));
        }
        Ok(())
    }

    /// Build the control-plane client configuration.
    #[must_use]
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            base_url: self.control_plane_url.clone(),
            api_version: self.control_plane_api_version,
            ..ClientConfig::default()
        }
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparsable environment variable");
            None
        }
    }
}

fn parse_host_list(raw: &str) -> Vec<HostName> {
    let mut hosts: Vec<HostName> = raw
        .split(',')
        .filter_map(|h| HostName::new(h).ok())
        .collect();
    hosts.sort();
    hosts.dedup();
    hosts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(name: &str) -> HostName {
        HostName::new(name).unwrap()
    }

    #[test]
    fn defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.api_max_retries, 60);
        assert_eq!(config.api_retry_interval, Duration::from_secs(2));
        assert_eq!(config.serial_console_state_timeout, Duration::from_secs(10));
        assert_eq!(config.hypervisor_type, "ironic");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn group_requires_peer_list_with_self() {
        let mut config = AgentConfig::for_host(host("compute-1"));
        config.conductor_group = Some("rack-a".into());

        assert!(matches!(
            config.validate(),
            Err(DriverError::InvalidPeerList(_))
        ));

        config.peer_list = vec![host("compute-2")];
        assert!(matches!(
            config.validate(),
            Err(DriverError::InvalidPeerList(_))
        ));

        config.peer_list = vec![host("COMPUTE-1"), host("compute-2")];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn shard_overrides_peer_list() {
        let mut config = AgentConfig::for_host(host("compute-1"));
        config.conductor_group = Some("rack-a".into());
        config.shard = Some("shard-1".into());
        config.peer_list = vec![host("compute-2")];

        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_retries_rejected() {
        let config = AgentConfig {
            api_max_retries: 0,
            ..AgentConfig::default()
        };
        assert!(matches!(config.validate(), Err(DriverError::Config(_))));
    }

    #[test]
    fn host_list_parsing() {
        let hosts = parse_host_list(" Compute-2, compute-1,,COMPUTE-2 ");
        assert_eq!(hosts, vec![host("compute-1"), host("compute-2")]);
    }
}
