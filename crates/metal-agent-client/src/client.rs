//! The control-plane client interface.

use std::time::Duration;

use async_trait::async_trait;
use metal_agent_core::{InstanceId, Node, NodeId};

use crate::error::Result;
use crate::types::{
    ConsoleState, NewVolumeTarget, NodeListFilter, NodeValidation, PatchOp, Port, PortGroup,
    PowerAction, ProvisionArgs, ProvisionTarget, VolumeConnector, VolumeTarget,
};
use crate::version::ApiVersion;

/// Trait for bare-metal control-plane communication.
///
/// This trait abstracts the control-plane interface, allowing the driver to
/// run against the HTTP client in production and a scripted fake in tests.
#[async_trait]
pub trait RemoteControlClient: Send + Sync {
    /// Check whether the control plane accepts requests at `version`.
    ///
    /// # Errors
    ///
    /// Returns an error if version discovery fails.
    async fn supports_version(&self, version: ApiVersion) -> Result<bool>;

    /// List nodes matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the filter is rejected.
    async fn list_nodes(&self, filter: &NodeListFilter) -> Result<Vec<Node>>;

    /// Fetch a single node.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::NotFound` if the node does not exist.
    async fn get_node(&self, node_id: &NodeId, fields: &[&str]) -> Result<Node>;

    /// Apply JSON-patch operations to a node.
    ///
    /// # Errors
    ///
    /// Returns an error if the patch is rejected or the node is locked.
    async fn update_node_fields(&self, node_id: &NodeId, patch: &[PatchOp]) -> Result<Node>;

    /// Bind a workload to a node, or clear the binding with `None`.
    ///
    /// With `retry_on_conflict == false` a conflict is returned immediately,
    /// which is how two agents racing for the same node find out.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Conflict` if the node is bound elsewhere or locked.
    async fn set_instance_association(
        &self,
        node_id: &NodeId,
        instance_id: Option<InstanceId>,
        retry_on_conflict: bool,
    ) -> Result<Node>;

    /// Request a provisioning transition.
    ///
    /// # Errors
    ///
    /// Returns an error if the transition is rejected.
    async fn set_provision_state(
        &self,
        node_id: &NodeId,
        target: ProvisionTarget,
        args: &ProvisionArgs,
    ) -> Result<()>;

    /// Request a power transition.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::BadRequest` if the action is unsupported by the node.
    async fn set_power_state(
        &self,
        node_id: &NodeId,
        action: PowerAction,
        timeout: Option<Duration>,
    ) -> Result<()>;

    /// Attach a virtual network interface.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Conflict` if the interface is already attached.
    async fn attach_vif(&self, node_id: &NodeId, vif_id: &str, retry_on_conflict: bool)
        -> Result<()>;

    /// Detach a virtual network interface.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::NotFound` if the interface is not attached.
    async fn detach_vif(&self, node_id: &NodeId, vif_id: &str) -> Result<()>;

    /// List the node's physical ports.
    async fn list_ports(&self, node_id: &NodeId) -> Result<Vec<Port>>;

    /// List the node's port groups.
    async fn list_port_groups(&self, node_id: &NodeId) -> Result<Vec<PortGroup>>;

    /// List the node's storage connectors.
    async fn list_volume_connectors(&self, node_id: &NodeId) -> Result<Vec<VolumeConnector>>;

    /// List the node's volume targets.
    async fn list_volume_targets(&self, node_id: &NodeId) -> Result<Vec<VolumeTarget>>;

    /// Create a volume target.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Conflict` if the boot index is already taken.
    async fn create_volume_target(&self, target: &NewVolumeTarget) -> Result<VolumeTarget>;

    /// Delete a volume target.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::NotFound` if the target does not exist.
    async fn delete_volume_target(&self, target_id: &str) -> Result<()>;

    /// Read the node's console mode and endpoint.
    async fn get_console(&self, node_id: &NodeId) -> Result<ConsoleState>;

    /// Request the console be enabled. Completion is asynchronous.
    async fn enable_console(&self, node_id: &NodeId) -> Result<()>;

    /// Request the console be disabled. Completion is asynchronous.
    async fn disable_console(&self, node_id: &NodeId) -> Result<()>;

    /// Inject a non-maskable interrupt.
    async fn inject_nmi(&self, node_id: &NodeId) -> Result<()>;

    /// Validate the node's driver interfaces.
    ///
    /// When `required` is given, a failure of any listed interface is
    /// returned as `ClientError::BadRequest`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or a required interface fails.
    async fn validate_node(
        &self,
        node_id: &NodeId,
        required: Option<&[&str]>,
    ) -> Result<NodeValidation>;
}

/// Check `validation` against the `required` interfaces.
///
/// # Errors
///
/// Returns `ClientError::BadRequest` naming every failed required interface.
pub fn check_required(validation: &NodeValidation, required: Option<&[&str]>) -> Result<()> {
    let Some(required) = required else {
        return Ok(());
    };
    let failed: Vec<String> = required
        .iter()
        .filter(|iface| !validation.passed(iface))
        .map(|iface| format!("{iface}: {}", validation.reason(iface).unwrap_or("unknown")))
        .collect();
    if failed.is_empty() {
        Ok(())
    } else {
        Err(crate::ClientError::BadRequest(format!(
            "validation failed for required interfaces: {}",
            failed.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_interfaces_are_enforced() {
        let mut validation = NodeValidation::default();
        validation.insert("deploy", false, Some("no image"));
        validation.insert("power", true, None);

        assert!(check_required(&validation, None).is_ok());
        assert!(check_required(&validation, Some(&["power"])).is_ok());

        let err = check_required(&validation, Some(&["deploy", "power"])).unwrap_err();
        assert!(err.to_string().contains("deploy: no image"));
    }
}
