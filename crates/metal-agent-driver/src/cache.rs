//! Cache of the nodes this agent manages.
//!
//! A refresh builds a complete [`NodeCacheSnapshot`] and publishes it in one
//! swap; readers always see either the previous snapshot or the new one. A
//! failed refresh publishes nothing.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use metal_agent_client::{NodeListFilter, RemoteControlClient};
use metal_agent_core::{InstanceId, Node, NodeId};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::AgentConfig;
use crate::error::{DriverError, Result};
use crate::hash_ring::HashPartitioner;
use crate::registry::WorkloadRegistry;

/// An immutable view of the managed nodes.
#[derive(Debug, Clone, Default)]
pub struct NodeCacheSnapshot {
    nodes: BTreeMap<NodeId, Node>,
    refreshed_at: Option<Instant>,
    generation: u64,
}

impl NodeCacheSnapshot {
    /// Get a cached node.
    #[must_use]
    pub fn get(&self, node_id: &NodeId) -> Option<&Node> {
        self.nodes.get(node_id)
    }

    /// Check if a node is cached.
    #[must_use]
    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Find the cached node bound to a workload.
    #[must_use]
    pub fn find_by_instance(&self, instance_id: &InstanceId) -> Option<&Node> {
        self.nodes.values().find(|n| n.is_bound_to(instance_id))
    }

    /// Iterate over cached nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Get all cached node ids.
    #[must_use]
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().cloned().collect()
    }

    /// Get the workloads bound to cached nodes.
    #[must_use]
    pub fn instance_ids(&self) -> Vec<InstanceId> {
        self.nodes.values().filter_map(|n| n.instance_id).collect()
    }

    /// Get the number of cached nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the snapshot is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// When the snapshot was built; `None` if never built or invalidated.
    #[must_use]
    pub fn refreshed_at(&self) -> Option<Instant> {
        self.refreshed_at
    }

    /// Number of refreshes published before and including this snapshot.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// The node cache.
pub struct NodeCache {
    config: Arc<AgentConfig>,
    client: Arc<dyn RemoteControlClient>,
    workloads: Arc<dyn WorkloadRegistry>,
    partitioner: Arc<HashPartitioner>,
    snapshot: ArcSwap<NodeCacheSnapshot>,
}

impl NodeCache {
    /// Create an empty, never-refreshed cache.
    #[must_use]
    pub fn new(
        config: Arc<AgentConfig>,
        client: Arc<dyn RemoteControlClient>,
        workloads: Arc<dyn WorkloadRegistry>,
        partitioner: Arc<HashPartitioner>,
    ) -> Self {
        Self {
            config,
            client,
            workloads,
            partitioner,
            snapshot: ArcSwap::from_pointee(NodeCacheSnapshot::default()),
        }
    }

    /// Return the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<NodeCacheSnapshot> {
        self.snapshot.load_full()
    }

    /// Read a node from the current snapshot without a network call.
    #[must_use]
    pub fn get(&self, node_id: &NodeId) -> Option<Node> {
        self.snapshot.load().get(node_id).cloned()
    }

    /// Check whether at least one refresh has been published.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.snapshot.load().generation > 0
    }

    /// Refresh the ring, then rebuild and publish the snapshot.
    ///
    /// A node is kept when it is bound to a workload on this host, or when it
    /// is unbound and this host owns it in the ring. Nodes bound to any other
    /// workload are never taken over.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::DriverNotReady` if the control plane cannot be
    /// listed, or a registry error. The previous snapshot stays published.
    pub async fn refresh(&self) -> Result<Arc<NodeCacheSnapshot>> {
        let ring = self.partitioner.refresh().await?;
        let ours: BTreeSet<InstanceId> = self
            .workloads
            .instance_ids_on_host(&self.config.host)
            .await?;

        let scope = self.partitioner.list_scope().await;
        let filter = NodeListFilter {
            conductor_group: scope.conductor_group,
            shard: scope.shard,
            ..NodeListFilter::minimal()
        };
        let listed = self
            .client
            .list_nodes(&filter)
            .await
            .map_err(DriverError::from_listing)?;

        let total = listed.len();
        let nodes: BTreeMap<NodeId, Node> = listed
            .into_iter()
            .filter(|node| match &node.instance_id {
                Some(instance_id) => ours.contains(instance_id),
                None => ring.owns(&self.config.host, node.id.as_str()),
            })
            .map(|node| (node.id.clone(), node))
            .collect();

        let previous = self.snapshot.load();
        let snapshot = Arc::new(NodeCacheSnapshot {
            nodes,
            refreshed_at: Some(Instant::now()),
            generation: previous.generation + 1,
        });
        self.snapshot.store(Arc::clone(&snapshot));

        info!(
            managed = snapshot.len(),
            listed = total,
            ring_members = ring.len(),
            "Refreshed node cache"
        );
        Ok(snapshot)
    }

    /// Refresh if the snapshot is older than the configured TTL.
    ///
    /// # Errors
    ///
    /// Returns the refresh error when a refresh was needed and failed.
    pub async fn refresh_if_stale(&self) -> Result<Arc<NodeCacheSnapshot>> {
        let current = self.snapshot();
        match current.refreshed_at {
            Some(at) if at.elapsed() < self.config.cache_ttl => Ok(current),
            _ => {
                debug!("Node cache is stale, refreshing");
                self.refresh().await
            }
        }
    }

    /// Read a node from the snapshot, falling back to a direct fetch.
    ///
    /// A fetched node is returned without being added to the snapshot.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::NodeNotFound` if the node does not exist, or
    /// `DriverError::DriverNotReady` if the control plane is unreachable.
    pub async fn get_or_fetch(&self, node_id: &NodeId) -> Result<Node> {
        if let Some(node) = self.get(node_id) {
            return Ok(node);
        }
        debug!(node_id = %node_id, "Node not cached, fetching directly");
        self.client
            .get_node(node_id, Node::FIELDS)
            .await
            .map_err(|e| match e {
                e if e.is_not_found() => DriverError::NodeNotFound(node_id.to_string()),
                e => DriverError::from_listing(e),
            })
    }

    /// Mark the snapshot stale so the next TTL check refreshes it.
    pub fn invalidate(&self) {
        self.snapshot.rcu(|current| {
            Arc::new(NodeCacheSnapshot {
                nodes: current.nodes.clone(),
                refreshed_at: None,
                generation: current.generation,
            })
        });
    }

    /// Publish a snapshot without `node_id`.
    pub fn evict(&self, node_id: &NodeId) {
        if !self.snapshot.load().contains(node_id) {
            return;
        }
        self.snapshot.rcu(|current| {
            let mut nodes = current.nodes.clone();
            nodes.remove(node_id);
            Arc::new(NodeCacheSnapshot {
                nodes,
                refreshed_at: current.refreshed_at,
                generation: current.generation,
            })
        });
        debug!(node_id = %node_id, "Evicted node from cache");
    }
}
