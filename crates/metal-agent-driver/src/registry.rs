//! Registries the driver consults but does not own.
//!
//! - [`ServiceRegistry`] answers which agent hosts of a hypervisor type exist
//!   and which of them are alive.
//! - [`WorkloadRegistry`] answers which workloads the orchestrator has placed
//!   on a host and what state each one is in.
//!
//! Both come with in-memory implementations, used by the binary when no
//! external registry is configured and by tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use metal_agent_core::{HostName, InstanceId, NodeId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::Result;

// ============================================================================
// Workloads
// ============================================================================

/// Orchestrator-side state of a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    /// Being created.
    #[default]
    Building,
    /// Running.
    Active,
    /// Powered off by request.
    Stopped,
    /// In rescue mode.
    Rescued,
    /// Failed.
    Error,
    /// Removed.
    Deleted,
}

/// Orchestrator-side task in progress on a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Deploying onto a node.
    Spawning,
    /// Redeploying after a rebuild request.
    RebuildSpawning,
    /// Rebooting.
    Rebooting,
    /// Entering rescue mode.
    Rescuing,
    /// Leaving rescue mode.
    Unrescuing,
    /// Being torn down.
    Deleting,
}

/// A workload placed by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    /// Workload identifier; bound to a node as its `instance_id`.
    pub id: InstanceId,
    /// Display name.
    pub name: String,
    /// Agent host the workload was placed on.
    pub host: Option<HostName>,
    /// Node chosen for the workload.
    pub node: Option<NodeId>,
    /// Current state.
    pub vm_state: VmState,
    /// Task in progress, if any.
    pub task_state: Option<TaskState>,
}

impl Workload {
    /// Create a building workload placed on `node` via `host`.
    #[must_use]
    pub fn new(id: InstanceId, name: impl Into<String>, host: HostName, node: NodeId) -> Self {
        Self {
            id,
            name: name.into(),
            host: Some(host),
            node: Some(node),
            vm_state: VmState::Building,
            task_state: Some(TaskState::Spawning),
        }
    }

    /// Check whether the workload is being torn down.
    #[must_use]
    pub fn is_deleting(&self) -> bool {
        self.task_state == Some(TaskState::Deleting) || self.vm_state == VmState::Deleted
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Liveness and membership of agent hosts.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// List hosts running an agent for `hypervisor_type`.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::Registry` if the registry cannot be queried.
    async fn list_hosts_of_type(&self, hypervisor_type: &str) -> Result<Vec<HostName>>;

    /// Check whether an agent host is alive.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::Registry` if the registry cannot be queried.
    async fn is_alive(&self, host: &HostName) -> Result<bool>;

    /// Return the shard a host serves, if it reports one.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::Registry` if the registry cannot be queried.
    async fn host_shard(&self, _host: &HostName) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Workloads known to the orchestrator.
#[async_trait]
pub trait WorkloadRegistry: Send + Sync {
    /// Return the ids of workloads placed on `host`.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::Registry` if the registry cannot be queried.
    async fn instance_ids_on_host(&self, host: &HostName) -> Result<BTreeSet<InstanceId>>;

    /// Fetch a workload's current state; `None` once it no longer exists.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::Registry` if the registry cannot be queried.
    async fn get_workload(&self, id: &InstanceId) -> Result<Option<Workload>>;
}

// ============================================================================
// In-memory implementations
// ============================================================================

#[derive(Debug, Clone)]
struct ServiceRecord {
    hypervisor_type: String,
    alive: bool,
    shard: Option<String>,
}

/// In-memory [`ServiceRegistry`].
#[derive(Debug, Default)]
pub struct InMemoryServiceRegistry {
    services: RwLock<BTreeMap<HostName, ServiceRecord>>,
}

impl InMemoryServiceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with every host alive and of `hypervisor_type`.
    #[must_use]
    pub fn with_hosts<'a>(hypervisor_type: &str, hosts: impl IntoIterator<Item = &'a HostName>) -> Self {
        let registry = Self::new();
        for host in hosts {
            registry.register(host.clone(), hypervisor_type);
        }
        registry
    }

    /// Register a live host.
    pub fn register(&self, host: HostName, hypervisor_type: &str) {
        self.services.write().insert(
            host,
            ServiceRecord {
                hypervisor_type: hypervisor_type.to_string(),
                alive: true,
                shard: None,
            },
        );
    }

    /// Mark a host alive or dead.
    pub fn set_alive(&self, host: &HostName, alive: bool) {
        if let Some(record) = self.services.write().get_mut(host) {
            record.alive = alive;
        }
    }

    /// Set the shard a host reports.
    pub fn set_shard(&self, host: &HostName, shard: Option<&str>) {
        if let Some(record) = self.services.write().get_mut(host) {
            record.shard = shard.map(ToString::to_string);
        }
    }

    /// Remove a host.
    pub fn remove(&self, host: &HostName) {
        self.services.write().remove(host);
    }
}

#[async_trait]
impl ServiceRegistry for InMemoryServiceRegistry {
    async fn list_hosts_of_type(&self, hypervisor_type: &str) -> Result<Vec<HostName>> {
        Ok(self
            .services
            .read()
            .iter()
            .filter(|(_, r)| r.hypervisor_type == hypervisor_type)
            .map(|(h, _)| h.clone())
            .collect())
    }

    async fn is_alive(&self, host: &HostName) -> Result<bool> {
        Ok(self.services.read().get(host).is_some_and(|r| r.alive))
    }

    async fn host_shard(&self, host: &HostName) -> Result<Option<String>> {
        Ok(self.services.read().get(host).and_then(|r| r.shard.clone()))
    }
}

/// In-memory [`WorkloadRegistry`].
#[derive(Debug, Default)]
pub struct InMemoryWorkloadRegistry {
    workloads: RwLock<HashMap<InstanceId, Workload>>,
}

impl InMemoryWorkloadRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a workload.
    pub fn insert(&self, workload: Workload) {
        self.workloads.write().insert(workload.id, workload);
    }

    /// Remove a workload.
    pub fn remove(&self, id: &InstanceId) -> Option<Workload> {
        self.workloads.write().remove(id)
    }

    /// Mutate a stored workload in place.
    pub fn update(&self, id: &InstanceId, f: impl FnOnce(&mut Workload)) {
        if let Some(workload) = self.workloads.write().get_mut(id) {
            f(workload);
        }
    }
}

#[async_trait]
impl WorkloadRegistry for InMemoryWorkloadRegistry {
    async fn instance_ids_on_host(&self, host: &HostName) -> Result<BTreeSet<InstanceId>> {
        Ok(self
            .workloads
            .read()
            .values()
            .filter(|w| w.host.as_ref() == Some(host))
            .map(|w| w.id)
            .collect())
    }

    async fn get_workload(&self, id: &InstanceId) -> Result<Option<Workload>> {
        Ok(self.workloads.read().get(id).cloned())
    }
}
