//! Consistent-hash partitioning of nodes across live agents.
//!
//! Every agent builds the same ring from the same set of live hosts, so all
//! agents agree on which of them owns each node without talking to each
//! other. Each host is placed at [`PARTITIONS_PER_HOST`] points on a 64-bit
//! ring; a node belongs to the first host point at or after the node's own
//! hash.
//!
//! The [`HashPartitioner`] decides which hosts are candidates (shard, conductor
//! group + peer list, or every host of the hypervisor type), filters them by
//! liveness and publishes a new [`HashRing`] atomically.

use std::collections::BTreeSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use metal_agent_client::{ApiVersion, RemoteControlClient};
use metal_agent_core::HostName;
use tracing::{debug, warn};

use crate::config::AgentConfig;
use crate::error::Result;
use crate::registry::ServiceRegistry;

/// Ring points per host.
pub const PARTITIONS_PER_HOST: u32 = 32;

// ============================================================================
// Ring
// ============================================================================

/// An immutable consistent-hash ring over host names.
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    points: Vec<(u64, HostName)>,
    hosts: BTreeSet<HostName>,
}

impl HashRing {
    /// Build a ring with [`PARTITIONS_PER_HOST`] points per host.
    #[must_use]
    pub fn new(hosts: impl IntoIterator<Item = HostName>) -> Self {
        Self::with_partitions(hosts, PARTITIONS_PER_HOST)
    }

    /// Build a ring with `partitions` points per host.
    #[must_use]
    pub fn with_partitions(hosts: impl IntoIterator<Item = HostName>, partitions: u32) -> Self {
        let hosts: BTreeSet<HostName> = hosts.into_iter().collect();
        let mut points: Vec<(u64, HostName)> = hosts
            .iter()
            .flat_map(|host| {
                (0..partitions.max(1))
                    .map(move |i| (position(format!("{host}-{i}").as_bytes()), host.clone()))
            })
            .collect();
        points.sort();
        Self { points, hosts }
    }

    /// Return the host owning `key`, or `None` for an empty ring.
    #[must_use]
    pub fn owner(&self, key: &str) -> Option<&HostName> {
        if self.points.is_empty() {
            return None;
        }
        let hash = position(key.as_bytes());
        let idx = self.points.partition_point(|(p, _)| *p < hash);
        let (_, host) = &self.points[idx % self.points.len()];
        Some(host)
    }

    /// Check whether `host` owns `key`.
    #[must_use]
    pub fn owns(&self, host: &HostName, key: &str) -> bool {
        self.owner(key) == Some(host)
    }

    /// Return the ring members.
    #[must_use]
    pub fn hosts(&self) -> &BTreeSet<HostName> {
        &self.hosts
    }

    /// Get the number of ring members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    /// Check if the ring has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

fn position(bytes: &[u8]) -> u64 {
    let hash = blake3::hash(bytes);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_be_bytes(prefix)
}

// ============================================================================
// Partitioner
// ============================================================================

/// Query scoping the control plane accepts for this agent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RingScope {
    /// Conductor group filter, when configured and supported.
    pub conductor_group: Option<String>,
    /// Shard filter, when configured and supported.
    pub shard: Option<String>,
}

/// Maintains the ring of agents sharing the node pool.
pub struct HashPartitioner {
    config: Arc<AgentConfig>,
    client: Arc<dyn RemoteControlClient>,
    services: Arc<dyn ServiceRegistry>,
    ring: ArcSwap<HashRing>,
}

impl HashPartitioner {
    /// Create a partitioner whose ring initially holds only this host.
    #[must_use]
    pub fn new(
        config: Arc<AgentConfig>,
        client: Arc<dyn RemoteControlClient>,
        services: Arc<dyn ServiceRegistry>,
    ) -> Self {
        let ring = HashRing::new([config.host.clone()]);
        Self {
            config,
            client,
            services,
            ring: ArcSwap::from_pointee(ring),
        }
    }

    /// Return the current ring.
    #[must_use]
    pub fn ring(&self) -> Arc<HashRing> {
        self.ring.load_full()
    }

    /// Check whether this agent owns `key` in the current ring.
    #[must_use]
    pub fn is_local(&self, key: &str) -> bool {
        self.ring.load().owns(&self.config.host, key)
    }

    /// Rebuild the ring from live hosts and publish it.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::Registry` if the hosts cannot be listed.
    pub async fn refresh(&self) -> Result<Arc<HashRing>> {
        let hosts = self.live_hosts().await?;
        debug!(members = ?hosts, "Hash ring members");
        let ring = Arc::new(HashRing::new(hosts));
        self.ring.store(Arc::clone(&ring));
        Ok(ring)
    }

    /// Negotiate which scoping filters may be sent when listing nodes.
    ///
    /// Negotiation failures drop the filter rather than failing.
    pub async fn list_scope(&self) -> RingScope {
        let conductor_group = match &self.config.conductor_group {
            Some(group) if self.can_send(ApiVersion::CONDUCTOR_GROUPS).await => {
                Some(group.clone())
            }
            _ => None,
        };
        let shard = match &self.config.shard {
            Some(shard) if self.can_send(ApiVersion::SHARDS).await => Some(shard.clone()),
            _ => None,
        };
        RingScope {
            conductor_group,
            shard,
        }
    }

    async fn live_hosts(&self) -> Result<BTreeSet<HostName>> {
        let services = self
            .services
            .list_hosts_of_type(&self.config.hypervisor_type)
            .await?;

        let candidates: Vec<HostName> = if let Some(shard) = &self.config.shard {
            let mut same_shard = Vec::new();
            for host in services {
                match self.services.host_shard(&host).await {
                    Ok(Some(theirs)) if theirs == *shard => same_shard.push(host),
                    Ok(_) => debug!(host = %host, "Excluding host from another shard"),
                    Err(e) => {
                        warn!(host = %host, error = %e, "Shard lookup failed, excluding host");
                    }
                }
            }
            same_shard
        } else if self.config.conductor_group.is_some()
            && self.can_send(ApiVersion::CONDUCTOR_GROUPS).await
        {
            services
                .into_iter()
                .filter(|h| self.config.peer_list.contains(h))
                .collect()
        } else {
            services
        };

        let mut hosts = BTreeSet::from([self.config.host.clone()]);
        for host in candidates {
            match self.services.is_alive(&host).await {
                Ok(true) => {
                    hosts.insert(host);
                }
                Ok(false) => debug!(host = %host, "Excluding dead host from hash ring"),
                Err(e) => warn!(host = %host, error = %e, "Liveness check failed, excluding host"),
            }
        }
        Ok(hosts)
    }

    async fn can_send(&self, version: ApiVersion) -> bool {
        match self.client.supports_version(version).await {
            Ok(true) => true,
            Ok(false) => {
                warn!(version = %version, "Control plane does not support API version, ignoring scoping");
                false
            }
            Err(e) => {
                warn!(version = %version, error = %e, "API version negotiation failed, ignoring scoping");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(names: &[&str]) -> Vec<HostName> {
        names.iter().map(|n| HostName::new(n).unwrap()).collect()
    }

    #[test]
    fn owner_is_deterministic() {
        let a = HashRing::new(hosts(&["host1", "host2", "host3"]));
        let b = HashRing::new(hosts(&["host3", "host1", "host2"]));
        for i in 0..200 {
            let key = format!("node-{i}");
            assert_eq!(a.owner(&key), b.owner(&key));
            assert_eq!(a.owner(&key), a.owner(&key));
        }
    }

    #[test]
    fn case_insensitive_members() {
        let upper = HashRing::new(hosts(&["Host1", "HOST2"]));
        let lower = HashRing::new(hosts(&["host1", "host2"]));
        for i in 0..100 {
            let key = format!("node-{i}");
            assert_eq!(upper.owner(&key), lower.owner(&key));
        }
        assert_eq!(upper.len(), 2);
    }

    #[test]
    fn every_host_gets_nodes() {
        let ring = HashRing::new(hosts(&["host1", "host2", "host3"]));
        let owners: BTreeSet<&HostName> = (0..500)
            .filter_map(|i| ring.owner(&format!("node-{i}")))
            .collect();
        assert_eq!(owners.len(), 3);
    }

    #[test]
    fn empty_ring_has_no_owner() {
        let ring = HashRing::default();
        assert!(ring.is_empty());
        assert!(ring.owner("node-1").is_none());
    }

    #[test]
    fn single_host_owns_everything() {
        let ring = HashRing::new(hosts(&["only"]));
        let only = HostName::new("only").unwrap();
        assert!((0..50).all(|i| ring.owns(&only, &format!("node-{i}"))));
    }
}
