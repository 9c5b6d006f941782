//! The bare-metal compute driver.
//!
//! This module provides the `ComputeDriver` trait and `BareMetalDriver`, the
//! implementation the orchestrator calls for every workload operation. Each
//! mutation is sent to the control plane and then awaited with a
//! [`WaitLoop`] until the node converges.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metal_agent_client::{
    ClientError, NewVolumeTarget, NodeListFilter, NodeValidation, PatchOp, PowerAction,
    ProvisionArgs, ProvisionTarget, RemoteControlClient,
};
use metal_agent_core::{InstanceId, Node, NodeId, PowerState, ProvisionState};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::cache::NodeCache;
use crate::config::AgentConfig;
use crate::console::{parse_serial_endpoint, ConsoleSessionController, SerialEndpoint};
use crate::error::{DriverError, Result};
use crate::hash_ring::HashPartitioner;
use crate::inventory::{node_is_unavailable, InventoryMapper, NodeProperties, NodeResource, ProviderTree};
use crate::lifecycle::{
    deploy_aborted, deploy_failure, is_unprovisioned, needs_unprovision, never_abort,
    power_settled, rescue_failure, unrescue_failure, WaitLoop,
};
use crate::registry::{ServiceRegistry, Workload, WorkloadRegistry};
use crate::types::{
    DriverCapabilities, InstanceInfo, InstancePowerState, RebootKind, SpawnRequest, Vif,
    VolumeConnectorInfo,
};

/// Interfaces that must validate before a deploy.
const DEPLOY_INTERFACES: [&str; 3] = ["deploy", "power", "storage"];

/// Trait defining the operations the orchestrator drives on this host.
#[async_trait]
pub trait ComputeDriver: Send + Sync {
    // =========================================================================
    // Host and inventory
    // =========================================================================

    /// Verify configuration and build the first ring and cache.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::InvalidPeerList` for an unusable peer list, or
    /// the first refresh error.
    async fn init_host(&self) -> Result<()>;

    /// List the nodes this host manages.
    ///
    /// With `refresh` the cache is rebuilt first; otherwise only when stale.
    async fn get_available_nodes(&self, refresh: bool) -> Result<Vec<NodeId>>;

    /// Check whether a node exists and may be reported by this host.
    async fn node_is_available(&self, node_id: &NodeId) -> Result<bool>;

    /// Describe a node's resources.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::NodeNotFound` if the node does not exist.
    async fn get_available_resource(&self, node_id: &NodeId) -> Result<NodeResource>;

    /// Replace a node's inventory and traits in `tree`.
    async fn update_provider_tree(&self, tree: &mut ProviderTree, node_id: &NodeId)
        -> Result<()>;

    // =========================================================================
    // Workload queries
    // =========================================================================

    /// Check whether a node is bound to the workload.
    async fn instance_exists(&self, workload: &Workload) -> Result<bool>;

    /// List the names of workloads on managed nodes.
    async fn list_instances(&self) -> Result<Vec<String>>;

    /// List the ids of workloads on managed nodes.
    async fn list_instance_ids(&self) -> Result<Vec<InstanceId>>;

    /// Report a workload's power state; a workload with no node has none.
    async fn get_info(&self, workload: &Workload, use_cache: bool) -> Result<InstanceInfo>;

    // =========================================================================
    // Provisioning
    // =========================================================================

    /// Reserve the workload's node before a deploy.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::ComputeResourcesUnavailable` if the node cannot
    /// take a workload, or `DriverError::DeployFailure` if another agent
    /// reserved it first.
    async fn prepare_for_spawn(&self, workload: &Workload) -> Result<()>;

    /// Undo a reservation after a failed deploy.
    async fn failed_spawn_cleanup(&self, workload: &Workload) -> Result<()>;

    /// Deploy a workload onto its node and wait for it to become active.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::Validation` if the node's interfaces do not
    /// validate, `DriverError::VifPlugFailure` if an interface cannot be
    /// attached, or `DriverError::DeployFailure` if the deploy fails.
    async fn spawn(&self, workload: &Workload, request: &SpawnRequest) -> Result<()>;

    /// Tear a workload down and release its node.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::GaveUp` if the node never finishes unprovisioning.
    async fn destroy(&self, workload: &Workload, vifs: &[Vif]) -> Result<()>;

    // =========================================================================
    // Power
    // =========================================================================

    /// Reboot a workload.
    async fn reboot(&self, workload: &Workload, kind: RebootKind) -> Result<()>;

    /// Power a workload off, gracefully first when `timeout` is non-zero.
    async fn power_off(&self, workload: &Workload, timeout: Option<Duration>) -> Result<()>;

    /// Power a workload on.
    async fn power_on(&self, workload: &Workload) -> Result<()>;

    /// Inject a non-maskable interrupt into a workload's node.
    async fn trigger_crash_dump(&self, workload: &Workload) -> Result<()>;

    // =========================================================================
    // Rescue
    // =========================================================================

    /// Boot a workload's node into the rescue ramdisk.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::RescueFailure` for any failure.
    async fn rescue(&self, workload: &Workload, password: &str) -> Result<()>;

    /// Return a workload's node from rescue mode.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::UnrescueFailure` for any failure.
    async fn unrescue(&self, workload: &Workload) -> Result<()>;

    // =========================================================================
    // Networking, storage, console
    // =========================================================================

    /// Attach interfaces to a workload's node.
    async fn plug_vifs(&self, workload: &Workload, vifs: &[Vif]) -> Result<()>;

    /// Detach interfaces from a workload's node.
    async fn unplug_vifs(&self, workload: &Workload, vifs: &[Vif]) -> Result<()>;

    /// Reset the node's console and return its serial endpoint.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::ConsoleTypeUnavailable` if no serial console
    /// can be provided.
    async fn get_serial_console(&self, workload: &Workload) -> Result<SerialEndpoint>;

    /// Describe how storage reaches a workload's node.
    async fn get_volume_connector(
        &self,
        workload: &Workload,
        vifs: &[Vif],
    ) -> Result<VolumeConnectorInfo>;

    /// Report what the driver supports.
    fn capabilities(&self) -> DriverCapabilities;
}

/// The bare-metal driver implementation.
pub struct BareMetalDriver {
    config: Arc<AgentConfig>,
    client: Arc<dyn RemoteControlClient>,
    workloads: Arc<dyn WorkloadRegistry>,
    partitioner: Arc<HashPartitioner>,
    cache: Arc<NodeCache>,
    console: ConsoleSessionController,
    inventory: InventoryMapper,
}

impl BareMetalDriver {
    /// Create a driver and its components from one configuration.
    #[must_use]
    pub fn new(
        config: Arc<AgentConfig>,
        client: Arc<dyn RemoteControlClient>,
        services: Arc<dyn ServiceRegistry>,
        workloads: Arc<dyn WorkloadRegistry>,
    ) -> Self {
        let partitioner = Arc::new(HashPartitioner::new(
            Arc::clone(&config),
            Arc::clone(&client),
            services,
        ));
        let cache = Arc::new(NodeCache::new(
            Arc::clone(&config),
            Arc::clone(&client),
            Arc::clone(&workloads),
            Arc::clone(&partitioner),
        ));
        let console = ConsoleSessionController::new(
            Arc::clone(&client),
            config.serial_console_state_timeout,
            config.console_poll_interval,
        );
        let inventory = InventoryMapper::new(config.skip_reserve_in_use_nodes);

        Self {
            config,
            client,
            workloads,
            partitioner,
            cache,
            console,
            inventory,
        }
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Get the node cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<NodeCache> {
        &self.cache
    }

    /// Get the partitioner.
    #[must_use]
    pub fn partitioner(&self) -> &Arc<HashPartitioner> {
        &self.partitioner
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    fn wait_loop(&self, what: String) -> WaitLoop {
        WaitLoop::new(what, self.config.api_retry_interval)
            .with_timeout(self.config.lifecycle_timeout)
    }

    fn assigned_node(workload: &Workload) -> Result<&NodeId> {
        workload.node.as_ref().ok_or_else(|| {
            DriverError::Validation(format!("instance {} has no node assigned", workload.id))
        })
    }

    async fn get_node(&self, node_id: &NodeId) -> Result<Node> {
        self.client
            .get_node(node_id, Node::FIELDS)
            .await
            .map_err(|e| match e {
                e if e.is_not_found() => DriverError::NodeNotFound(node_id.to_string()),
                e => DriverError::from_listing(e),
            })
    }

    /// Find the node bound to a workload, if any.
    async fn node_for_instance(&self, instance_id: InstanceId) -> Result<Option<Node>> {
        let mut nodes = self
            .client
            .list_nodes(&NodeListFilter::for_instance(instance_id))
            .await
            .map_err(DriverError::from_listing)?;
        match nodes.len() {
            0 => Ok(None),
            1 => Ok(nodes.pop()),
            n => Err(DriverError::InstanceNotFound(format!(
                "instance {instance_id} is bound to {n} nodes"
            ))),
        }
    }

    async fn validate_instance_and_node(&self, instance_id: InstanceId) -> Result<Node> {
        self.node_for_instance(instance_id)
            .await?
            .ok_or_else(|| DriverError::InstanceNotFound(instance_id.to_string()))
    }

    // =========================================================================
    // Deploy helpers
    // =========================================================================

    async fn add_volume_targets(&self, node_id: &NodeId, request: &SpawnRequest) -> Result<()> {
        for volume in &request.volumes {
            let target = NewVolumeTarget {
                boot_index: volume.boot_index,
                properties: volume.properties.clone(),
                ..NewVolumeTarget::new(node_id, volume.volume_id.clone(), volume.volume_type.clone())
            };
            let created = self.client.create_volume_target(&target).await?;
            debug!(node_id = %node_id, target = %created.uuid, volume_id = %volume.volume_id, "Added volume target");
        }
        Ok(())
    }

    async fn cleanup_volume_targets(&self, node_id: &NodeId) {
        let targets = match self.client.list_volume_targets(node_id).await {
            Ok(targets) => targets,
            Err(e) => {
                warn!(node_id = %node_id, error = %e, "Failed to list volume targets for cleanup");
                return;
            }
        };
        for target in targets {
            match self.client.delete_volume_target(&target.uuid).await {
                Ok(()) => debug!(node_id = %node_id, target = %target.uuid, "Removed volume target"),
                Err(e) if e.is_not_found() => {
                    debug!(node_id = %node_id, target = %target.uuid, "Volume target already removed");
                }
                Err(e) => {
                    warn!(node_id = %node_id, target = %target.uuid, error = %e, "Failed to remove volume target");
                }
            }
        }
    }

    async fn plug_vifs_on_node(&self, node_id: &NodeId, vifs: &[Vif]) -> Result<()> {
        for vif in vifs {
            match self.client.attach_vif(node_id, &vif.id, false).await {
                Ok(()) => debug!(node_id = %node_id, vif_id = %vif.id, "Attached VIF"),
                Err(ClientError::Conflict(_)) => {
                    debug!(node_id = %node_id, vif_id = %vif.id, "VIF already attached");
                }
                Err(e) => {
                    error!(node_id = %node_id, vif_id = %vif.id, error = %e, "Cannot attach VIF");
                    return Err(DriverError::VifPlugFailure(format!(
                        "Cannot attach VIF {} to node {node_id}: {e}",
                        vif.id
                    )));
                }
            }
        }
        Ok(())
    }

    async fn unplug_vifs_on_node(&self, node_id: &NodeId, vifs: &[Vif]) {
        for vif in vifs {
            match self.client.detach_vif(node_id, &vif.id).await {
                Ok(()) => debug!(node_id = %node_id, vif_id = %vif.id, "Detached VIF"),
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(node_id = %node_id, vif_id = %vif.id, error = %e, "Failed to detach VIF");
                }
            }
        }
    }

    async fn remove_instance_info(&self, node_id: &NodeId) {
        let patch = [
            PatchOp::remove("/instance_info"),
            PatchOp::remove("/instance_uuid"),
        ];
        if let Err(e) = self.client.update_node_fields(node_id, &patch).await {
            warn!(node_id = %node_id, error = %e, "Failed to remove instance info from node");
        }
    }

    async fn cleanup_deploy(&self, node_id: &NodeId, vifs: &[Vif], remove_instance_info: bool) {
        self.cleanup_volume_targets(node_id).await;
        self.unplug_vifs_on_node(node_id, vifs).await;
        if remove_instance_info {
            self.remove_instance_info(node_id).await;
        }
    }

    async fn wait_for_active(&self, workload: &Workload) -> Result<()> {
        let id = workload.id;
        let workloads = &self.workloads;
        let this = self;

        let polls = self
            .wait_loop(format!("instance {id} to become active"))
            .wait_for_node(
                move || async move {
                    let current = workloads.get_workload(&id).await?;
                    Ok(deploy_aborted(current.as_ref()).then(|| {
                        DriverError::DeployFailure(format!(
                            "Instance {id} provisioning was aborted"
                        ))
                    }))
                },
                move || async move {
                    if let Some(node) = this.node_for_instance(id).await? {
                        return Ok(Some(node));
                    }
                    let current = workloads.get_workload(&id).await?;
                    if current.is_some_and(|w| w.is_deleting()) {
                        debug!(instance_id = %id, "Node released while the instance is being deleted");
                        Ok(None)
                    } else {
                        Err(DriverError::InstanceNotFound(id.to_string()))
                    }
                },
                |node| node.provision_state == Some(ProvisionState::Active),
                |node| deploy_failure(node, &id),
            )
            .await?;

        debug!(instance_id = %id, polls, "Deploy wait finished");
        Ok(())
    }

    async fn wait_for_power_state(&self, workload: &Workload) -> Result<Node> {
        let id = workload.id;
        let this = self;
        self.wait_loop(format!("power state of instance {id} to settle"))
            .wait_for_node(
                never_abort,
                move || async move { this.validate_instance_and_node(id).await.map(Some) },
                power_settled,
                |_| None,
            )
            .await?;
        self.validate_instance_and_node(id).await
    }

    async fn unprovision(&self, workload: &Workload, node: &Node) -> Result<()> {
        self.client
            .set_provision_state(&node.id, ProvisionTarget::Deleted, &ProvisionArgs::default())
            .await?;

        let id = workload.id;
        let this = self;
        let result = self
            .wait_loop(format!("node {} to unprovision", node.id))
            .with_max_attempts(self.config.api_max_retries)
            .wait_for_node(
                never_abort,
                move || async move { this.node_for_instance(id).await },
                is_unprovisioned,
                |_| None,
            )
            .await;

        match result {
            Ok(polls) => {
                debug!(node_id = %node.id, instance_id = %id, polls, "Node unprovisioned");
                Ok(())
            }
            Err(e) => {
                error!(node_id = %node.id, instance_id = %id, error = %e, "Error destroying the instance on node");
                Err(e)
            }
        }
    }

    async fn set_power(&self, node_id: &NodeId, soft: PowerAction, hard: PowerAction, timeout: Option<Duration>) -> Result<()> {
        match self.client.set_power_state(node_id, soft, timeout).await {
            Err(ClientError::BadRequest(reason)) if soft.is_soft() => {
                warn!(
                    node_id = %node_id,
                    action = soft.as_str(),
                    reason = %reason,
                    "Soft power action not supported, falling back to {}",
                    hard.as_str()
                );
                self.client.set_power_state(node_id, hard, None).await?;
                Ok(())
            }
            other => Ok(other?),
        }
    }

    async fn connector_ip_from_mac(
        &self,
        node_id: &NodeId,
        mac: Option<&String>,
        vifs: &[Vif],
    ) -> Result<Option<String>> {
        let Some(mac) = mac else {
            return Ok(None);
        };

        let groups = self.client.list_port_groups(node_id).await?;
        let vif_id = match groups
            .iter()
            .find(|g| g.address.as_deref().is_some_and(|a| a.eq_ignore_ascii_case(mac)))
        {
            Some(group) => group.vif_id().map(ToString::to_string),
            None => self
                .client
                .list_ports(node_id)
                .await?
                .iter()
                .find(|p| p.address.eq_ignore_ascii_case(mac))
                .and_then(|p| p.vif_id().map(ToString::to_string)),
        };

        Ok(vif_id
            .and_then(|id| vifs.iter().find(|v| v.id == id))
            .and_then(|vif| vif.fixed_ips.first().cloned()))
    }
}

/// Build the instance info patch written before a deploy.
fn instance_info_patch(node: &Node, workload: &Workload, request: &SpawnRequest) -> Vec<PatchOp> {
    let props = NodeProperties::parse(node);
    let mut patch = vec![
        PatchOp::add("/instance_info/image_source", Value::from(request.image_source.as_str())),
        PatchOp::add("/instance_info/root_gb", Value::from(request.root_gb.to_string())),
        PatchOp::add("/instance_info/swap_mb", Value::from(request.swap_mb.to_string())),
        PatchOp::add("/instance_info/display_name", Value::from(workload.name.as_str())),
        PatchOp::add("/instance_info/vcpus", Value::from(request.vcpus.to_string())),
        PatchOp::add("/instance_info/memory_mb", Value::from(request.memory_mb.to_string())),
        PatchOp::add("/instance_info/local_gb", Value::from(props.local_gb.to_string())),
    ];
    if let Some(host) = &workload.host {
        patch.push(PatchOp::add("/instance_info/host_id", Value::from(host.as_str())));
    }
    patch.extend(
        request
            .extra
            .iter()
            .map(|(key, value)| PatchOp::add(format!("/instance_info/{key}"), value.clone())),
    );
    patch
}

/// Describe failed deploy interfaces, or `None` if all passed.
fn validation_failure(node_id: &NodeId, validation: &NodeValidation) -> Option<String> {
    if DEPLOY_INTERFACES.iter().all(|iface| validation.passed(iface)) {
        return None;
    }
    let describe = |iface: &str| {
        if validation.passed(iface) {
            "No Error".to_string()
        } else {
            validation.reason(iface).unwrap_or("None").to_string()
        }
    };
    Some(format!(
        "Node {node_id} failed to validate (deploy: {}, power: {}, storage: {})",
        describe("deploy"),
        describe("power"),
        describe("storage")
    ))
}

#[async_trait]
impl ComputeDriver for BareMetalDriver {
    async fn init_host(&self) -> Result<()> {
        self.config.check_peer_list()?;
        let snapshot = self.cache.refresh().await?;
        info!(
            host = %self.config.host,
            managed = snapshot.len(),
            ring_members = self.partitioner.ring().len(),
            "Host initialized"
        );
        Ok(())
    }

    async fn get_available_nodes(&self, refresh: bool) -> Result<Vec<NodeId>> {
        let snapshot = if refresh {
            self.cache.refresh().await?
        } else {
            self.cache.refresh_if_stale().await?
        };
        Ok(snapshot.node_ids())
    }

    async fn node_is_available(&self, node_id: &NodeId) -> Result<bool> {
        if self.cache.snapshot().contains(node_id) {
            return Ok(true);
        }
        if self.cache.refresh_if_stale().await?.contains(node_id) {
            return Ok(true);
        }
        match self.client.get_node(node_id, Node::FIELDS).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(DriverError::from_listing(e)),
        }
    }

    async fn get_available_resource(&self, node_id: &NodeId) -> Result<NodeResource> {
        let node = self.cache.get_or_fetch(node_id).await?;
        Ok(NodeResource::from_node(&node))
    }

    async fn update_provider_tree(
        &self,
        tree: &mut ProviderTree,
        node_id: &NodeId,
    ) -> Result<()> {
        let node = self.cache.get_or_fetch(node_id).await?;
        tree.update_inventory(node_id.as_str(), self.inventory.map(&node));
        tree.update_traits(node_id.as_str(), node.traits.clone());
        Ok(())
    }

    async fn instance_exists(&self, workload: &Workload) -> Result<bool> {
        match self.node_for_instance(workload.id).await {
            Ok(node) => Ok(node.is_some()),
            Err(DriverError::InstanceNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn list_instances(&self) -> Result<Vec<String>> {
        let snapshot = self.cache.refresh_if_stale().await?;
        let mut names = Vec::new();
        for id in snapshot.instance_ids() {
            match self.workloads.get_workload(&id).await? {
                Some(workload) => names.push(workload.name),
                None => debug!(instance_id = %id, "Node bound to an unknown instance"),
            }
        }
        Ok(names)
    }

    async fn list_instance_ids(&self) -> Result<Vec<InstanceId>> {
        Ok(self.cache.refresh_if_stale().await?.instance_ids())
    }

    async fn get_info(&self, workload: &Workload, use_cache: bool) -> Result<InstanceInfo> {
        if use_cache {
            if let Some(node) = self.cache.snapshot().find_by_instance(&workload.id) {
                return Ok(InstanceInfo {
                    state: node.power_state.into(),
                });
            }
        }
        let state = match self.node_for_instance(workload.id).await? {
            Some(node) => node.power_state.into(),
            None => InstancePowerState::NoState,
        };
        Ok(InstanceInfo { state })
    }

    async fn prepare_for_spawn(&self, workload: &Workload) -> Result<()> {
        let node_id = Self::assigned_node(workload)?;
        let node = self.get_node(node_id).await?;

        if node_is_unavailable(&node) || node.instance_id.is_some_and(|id| id != workload.id) {
            return Err(DriverError::ComputeResourcesUnavailable(format!(
                "node {node_id} is not available for instance {}",
                workload.id
            )));
        }

        match self
            .client
            .set_instance_association(node_id, Some(workload.id), false)
            .await
        {
            Ok(_) => {
                info!(node_id = %node_id, instance_id = %workload.id, "Reserved node");
                Ok(())
            }
            Err(ClientError::Conflict(reason)) => {
                warn!(node_id = %node_id, instance_id = %workload.id, reason = %reason, "Node was reserved concurrently");
                Err(DriverError::DeployFailure(format!(
                    "Failed to reserve node {node_id} for instance {}: {reason}",
                    workload.id
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn failed_spawn_cleanup(&self, workload: &Workload) -> Result<()> {
        let Some(node) = self.node_for_instance(workload.id).await? else {
            debug!(instance_id = %workload.id, "No node bound after failed spawn");
            return Ok(());
        };
        self.cleanup_deploy(&node.id, &[], true).await;
        info!(node_id = %node.id, instance_id = %workload.id, "Cleaned up after failed spawn");
        Ok(())
    }

    async fn spawn(&self, workload: &Workload, request: &SpawnRequest) -> Result<()> {
        let node_id = Self::assigned_node(workload)?;
        let node = self.get_node(node_id).await?;

        if let Err(e) = self.add_volume_targets(node_id, request).await {
            error!(node_id = %node_id, instance_id = %workload.id, error = %e, "Error preparing deploy");
            self.cleanup_deploy(node_id, &[], true).await;
            return Err(e);
        }

        let patch = instance_info_patch(&node, workload, request);
        if let Err(e) = self.client.update_node_fields(node_id, &patch).await {
            error!(node_id = %node_id, instance_id = %workload.id, error = %e, "Failed to add instance info to node");
            self.cleanup_deploy(node_id, &[], true).await;
            return Err(e.into());
        }

        let validation = self.client.validate_node(node_id, None).await?;
        if let Some(message) = validation_failure(node_id, &validation) {
            error!(node_id = %node_id, instance_id = %workload.id, "{message}");
            self.cleanup_deploy(node_id, &[], true).await;
            return Err(DriverError::Validation(message));
        }

        if let Err(e) = self.plug_vifs_on_node(node_id, &request.vifs).await {
            self.cleanup_deploy(node_id, &request.vifs, true).await;
            return Err(e);
        }

        let args = ProvisionArgs {
            config_drive: request.config_drive.clone(),
            ..ProvisionArgs::default()
        };
        if let Err(e) = self
            .client
            .set_provision_state(node_id, ProvisionTarget::Active, &args)
            .await
        {
            error!(node_id = %node_id, instance_id = %workload.id, error = %e, "Failed to request deploy");
            self.cleanup_deploy(node_id, &request.vifs, true).await;
            return Err(e.into());
        }

        self.wait_for_active(workload).await.map_err(|e| {
            error!(node_id = %node_id, instance_id = %workload.id, error = %e, "Error deploying instance");
            e
        })?;

        info!(node_id = %node_id, instance_id = %workload.id, "Successfully provisioned");
        Ok(())
    }

    async fn destroy(&self, workload: &Workload, vifs: &[Vif]) -> Result<()> {
        let Some(node) = self.node_for_instance(workload.id).await? else {
            warn!(instance_id = %workload.id, "Destroy called on an instance with no node");
            return Ok(());
        };

        if needs_unprovision(&node) {
            self.unprovision(workload, &node).await?;
        } else {
            self.remove_instance_info(&node.id).await;
        }
        self.cleanup_deploy(&node.id, vifs, false).await;
        self.cache.evict(&node.id);

        info!(node_id = %node.id, instance_id = %workload.id, "Successfully unprovisioned");
        Ok(())
    }

    async fn reboot(&self, workload: &Workload, kind: RebootKind) -> Result<()> {
        let node = self.validate_instance_and_node(workload.id).await?;
        match kind {
            RebootKind::Soft => {
                self.set_power(&node.id, PowerAction::SoftReboot, PowerAction::Reboot, None)
                    .await?;
            }
            RebootKind::Hard => {
                self.client
                    .set_power_state(&node.id, PowerAction::Reboot, None)
                    .await?;
            }
        }
        self.wait_for_power_state(workload).await?;
        info!(node_id = %node.id, instance_id = %workload.id, ?kind, "Successfully rebooted");
        Ok(())
    }

    async fn power_off(&self, workload: &Workload, timeout: Option<Duration>) -> Result<()> {
        let node = self.validate_instance_and_node(workload.id).await?;

        if let Some(timeout) = timeout.filter(|t| !t.is_zero()) {
            match self
                .client
                .set_power_state(&node.id, PowerAction::SoftPowerOff, Some(timeout))
                .await
            {
                Ok(()) => {
                    let settled = self.wait_for_power_state(workload).await?;
                    if settled.power_state == Some(PowerState::PowerOff) {
                        info!(node_id = %node.id, instance_id = %workload.id, "Successfully soft powered off");
                        return Ok(());
                    }
                    warn!(node_id = %node.id, instance_id = %workload.id, "Soft power off did not stop the node, forcing");
                }
                Err(ClientError::BadRequest(reason)) => {
                    warn!(node_id = %node.id, reason = %reason, "Soft power off not supported, forcing");
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.client
            .set_power_state(&node.id, PowerAction::PowerOff, None)
            .await?;
        self.wait_for_power_state(workload).await?;
        info!(node_id = %node.id, instance_id = %workload.id, "Successfully powered off");
        Ok(())
    }

    async fn power_on(&self, workload: &Workload) -> Result<()> {
        let node = self.validate_instance_and_node(workload.id).await?;
        self.client
            .set_power_state(&node.id, PowerAction::PowerOn, None)
            .await?;
        self.wait_for_power_state(workload).await?;
        info!(node_id = %node.id, instance_id = %workload.id, "Successfully powered on");
        Ok(())
    }

    async fn trigger_crash_dump(&self, workload: &Workload) -> Result<()> {
        let node = self.validate_instance_and_node(workload.id).await?;
        self.client.inject_nmi(&node.id).await?;
        info!(node_id = %node.id, instance_id = %workload.id, "Triggered crash dump");
        Ok(())
    }

    async fn rescue(&self, workload: &Workload, password: &str) -> Result<()> {
        let id = workload.id;
        let node_id = Self::assigned_node(workload)?;
        let args = ProvisionArgs {
            rescue_password: Some(password.to_string()),
            ..ProvisionArgs::default()
        };
        self.client
            .set_provision_state(node_id, ProvisionTarget::Rescue, &args)
            .await
            .map_err(|e| DriverError::RescueFailure(format!("Failed to rescue instance {id}: {e}")))?;

        let this = self;
        self.wait_loop(format!("instance {id} to enter rescue"))
            .wait_for_node(
                never_abort,
                move || async move { this.validate_instance_and_node(id).await.map(Some) },
                |node| node.provision_state == Some(ProvisionState::Rescue),
                rescue_failure,
            )
            .await
            .map_err(|e| match e {
                DriverError::RescueFailure(_) => e,
                other => DriverError::RescueFailure(format!("Failed to rescue instance {id}: {other}")),
            })?;

        info!(node_id = %node_id, instance_id = %id, "Successfully rescued");
        Ok(())
    }

    async fn unrescue(&self, workload: &Workload) -> Result<()> {
        let id = workload.id;
        let node_id = Self::assigned_node(workload)?;
        self.client
            .set_provision_state(node_id, ProvisionTarget::Unrescue, &ProvisionArgs::default())
            .await
            .map_err(|e| {
                DriverError::UnrescueFailure(format!("Failed to unrescue instance {id}: {e}"))
            })?;

        let this = self;
        self.wait_loop(format!("instance {id} to leave rescue"))
            .wait_for_node(
                never_abort,
                move || async move { this.validate_instance_and_node(id).await.map(Some) },
                |node| node.provision_state == Some(ProvisionState::Active),
                unrescue_failure,
            )
            .await
            .map_err(|e| match e {
                DriverError::UnrescueFailure(_) => e,
                other => DriverError::UnrescueFailure(format!(
                    "Failed to unrescue instance {id}: {other}"
                )),
            })?;

        info!(node_id = %node_id, instance_id = %id, "Successfully unrescued");
        Ok(())
    }

    async fn plug_vifs(&self, workload: &Workload, vifs: &[Vif]) -> Result<()> {
        if vifs.is_empty() {
            return Ok(());
        }
        let node_id = Self::assigned_node(workload)?;
        self.plug_vifs_on_node(node_id, vifs).await
    }

    async fn unplug_vifs(&self, workload: &Workload, vifs: &[Vif]) -> Result<()> {
        if vifs.is_empty() {
            return Ok(());
        }
        let node_id = Self::assigned_node(workload)?;
        let node = self.get_node(node_id).await?;
        self.unplug_vifs_on_node(&node.id, vifs).await;
        Ok(())
    }

    async fn get_serial_console(&self, workload: &Workload) -> Result<SerialEndpoint> {
        let node = self.validate_instance_and_node(workload.id).await?;
        let info = match self.console.acquire(&node.id).await {
            Ok(info) => info,
            Err(DriverError::ConsoleNotAvailable(reason)) => {
                debug!(node_id = %node.id, instance_id = %workload.id, reason = %reason, "Console is not available");
                return Err(DriverError::ConsoleTypeUnavailable("serial".to_string()));
            }
            Err(e) => return Err(e),
        };
        parse_serial_endpoint(&node.id, &info)
    }

    async fn get_volume_connector(
        &self,
        workload: &Workload,
        vifs: &[Vif],
    ) -> Result<VolumeConnectorInfo> {
        let node_id = Self::assigned_node(workload)?;
        let node = self.get_node(node_id).await?;
        let props = NodeProperties::parse(&node);

        let connectors = self.client.list_volume_connectors(node_id).await?;
        let mut values: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for connector in &connectors {
            values
                .entry(connector.connector_type.as_str())
                .or_default()
                .push(connector.connector_id.clone());
        }

        let ip = match values.get("ip").and_then(|v| v.first()) {
            Some(ip) => Some(ip.clone()),
            None => {
                self.connector_ip_from_mac(node_id, values.get("mac").and_then(|v| v.first()), vifs)
                    .await?
            }
        };

        Ok(VolumeConnectorInfo {
            initiator: values.get("iqn").and_then(|v| v.first()).cloned(),
            host: ip.clone().unwrap_or_else(|| workload.name.clone()),
            ip,
            multipath: false,
            wwnns: values.remove("wwnn").unwrap_or_default(),
            wwpns: values.remove("wwpn").unwrap_or_default(),
            os_type: "baremetal".to_string(),
            platform: props.raw_cpu_arch,
        })
    }

    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_message_lists_each_interface() {
        let node_id = NodeId::new("n1").unwrap();
        let mut validation = NodeValidation::default();
        validation.insert("deploy", false, None);
        validation.insert("power", false, Some("OVERVOLT"));
        validation.insert("storage", true, None);

        let message = validation_failure(&node_id, &validation).unwrap();
        assert!(message.contains("deploy: None, power: OVERVOLT, storage: No Error"));

        let mut ok = NodeValidation::default();
        for iface in DEPLOY_INTERFACES {
            ok.insert(iface, true, None);
        }
        assert!(validation_failure(&node_id, &ok).is_none());
    }

    #[test]
    fn instance_info_includes_extra() {
        let mut node = Node::new(NodeId::new("n1").unwrap());
        node.properties.insert("local_gb".into(), Value::from(100));
        let workload = Workload::new(
            InstanceId::generate(),
            "web-1",
            metal_agent_core::HostName::localhost(),
            node.id.clone(),
        );
        let request = SpawnRequest {
            image_source: "image-1".into(),
            root_gb: 10,
            extra: BTreeMap::from([("project_id".to_string(), Value::from("p1"))]),
            ..SpawnRequest::default()
        };

        let patch = instance_info_patch(&node, &workload, &request);
        let paths: Vec<&str> = patch.iter().map(PatchOp::path).collect();
        assert!(paths.contains(&"/instance_info/image_source"));
        assert!(paths.contains(&"/instance_info/local_gb"));
        assert!(paths.contains(&"/instance_info/host_id"));
        assert!(paths.contains(&"/instance_info/project_id"));
    }
}
