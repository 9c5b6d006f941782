//! Request and response types for the control-plane API.

use std::collections::BTreeMap;

use metal_agent_core::{InstanceId, Node, NodeId};
use serde::{Deserialize, Serialize};

/// Filters applied when listing nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeListFilter {
    /// Fields to return; empty means every field.
    pub fields: Vec<String>,
    /// Only nodes bound to this workload.
    pub instance_id: Option<InstanceId>,
    /// Only nodes managed by this conductor group.
    pub conductor_group: Option<String>,
    /// Only nodes in this shard.
    pub shard: Option<String>,
    /// Only nodes with (`true`) or without (`false`) a workload.
    pub associated: Option<bool>,
}

impl NodeListFilter {
    /// A filter returning the minimal field set the agent works with.
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            fields: Node::FIELDS.iter().map(ToString::to_string).collect(),
            ..Self::default()
        }
    }

    /// A minimal-field filter for the node bound to `instance_id`.
    #[must_use]
    pub fn for_instance(instance_id: InstanceId) -> Self {
        Self {
            instance_id: Some(instance_id),
            ..Self::minimal()
        }
    }

    /// Render the filter as query parameters.
    #[must_use]
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if !self.fields.is_empty() {
            pairs.push(("fields", self.fields.join(",")));
        }
        if let Some(instance_id) = &self.instance_id {
            pairs.push(("instance_uuid", instance_id.to_string()));
        }
        if let Some(group) = &self.conductor_group {
            pairs.push(("conductor_group", group.clone()));
        }
        if let Some(shard) = &self.shard {
            pairs.push(("shard", shard.clone()));
        }
        if let Some(associated) = self.associated {
            pairs.push(("associated", associated.to_string()));
        }
        pairs
    }
}

/// A JSON-patch operation against a node document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    /// Add or overwrite a value.
    Add {
        /// JSON pointer of the field.
        path: String,
        /// New value.
        value: serde_json::Value,
    },
    /// Replace an existing value.
    Replace {
        /// JSON pointer of the field.
        path: String,
        /// New value.
        value: serde_json::Value,
    },
    /// Remove a value.
    Remove {
        /// JSON pointer of the field.
        path: String,
    },
}

impl PatchOp {
    /// Build an `add` operation.
    #[must_use]
    pub fn add(path: impl Into<String>, value: serde_json::Value) -> Self {
        Self::Add {
            path: path.into(),
            value,
        }
    }

    /// Build a `remove` operation.
    #[must_use]
    pub fn remove(path: impl Into<String>) -> Self {
        Self::Remove { path: path.into() }
    }

    /// Return the JSON pointer this operation targets.
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::Add { path, .. } | Self::Replace { path, .. } | Self::Remove { path } => path,
        }
    }
}

/// Provisioning verbs accepted by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionTarget {
    /// Deploy the node.
    Active,
    /// Tear the deployment down.
    Deleted,
    /// Boot into the rescue ramdisk.
    Rescue,
    /// Leave rescue mode.
    Unrescue,
}

impl ProvisionTarget {
    /// Return the wire representation of this verb.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Deleted => "deleted",
            Self::Rescue => "rescue",
            Self::Unrescue => "unrescue",
        }
    }
}

/// Optional arguments for a provisioning request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionArgs {
    /// Config drive contents (or URL) for deployments.
    pub config_drive: Option<String>,
    /// Password for the rescue ramdisk.
    pub rescue_password: Option<String>,
}

/// Power actions accepted by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PowerAction {
    /// Power the node on.
    #[serde(rename = "power on")]
    PowerOn,
    /// Hard power off.
    #[serde(rename = "power off")]
    PowerOff,
    /// Hard reboot.
    #[serde(rename = "rebooting")]
    Reboot,
    /// Graceful reboot.
    #[serde(rename = "soft rebooting")]
    SoftReboot,
    /// Graceful power off.
    #[serde(rename = "soft power off")]
    SoftPowerOff,
}

impl PowerAction {
    /// Return the wire representation of this action.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PowerOn => "power on",
            Self::PowerOff => "power off",
            Self::Reboot => "rebooting",
            Self::SoftReboot => "soft rebooting",
            Self::SoftPowerOff => "soft power off",
        }
    }

    /// Check if this is a graceful variant that may be unsupported.
    #[must_use]
    pub const fn is_soft(&self) -> bool {
        matches!(self, Self::SoftReboot | Self::SoftPowerOff)
    }
}

/// Validation outcome of one driver interface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceValidation {
    /// `Some(true)` when the interface validated; `None` when unsupported.
    #[serde(default)]
    pub result: Option<bool>,
    /// Reason for a failed or skipped validation.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Per-interface validation results for a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeValidation {
    /// Results keyed by interface name (`deploy`, `power`, `storage`, ...).
    pub interfaces: BTreeMap<String, InterfaceValidation>,
}

impl NodeValidation {
    /// Check whether an interface passed. Interfaces that were not reported pass.
    #[must_use]
    pub fn passed(&self, interface: &str) -> bool {
        self.interfaces
            .get(interface)
            .map_or(true, |v| v.result == Some(true))
    }

    /// Return the failure reason reported for an interface.
    #[must_use]
    pub fn reason(&self, interface: &str) -> Option<&str> {
        self.interfaces
            .get(interface)
            .and_then(|v| v.reason.as_deref())
    }

    /// Record a result for an interface.
    pub fn insert(&mut self, interface: impl Into<String>, result: bool, reason: Option<&str>) {
        self.interfaces.insert(
            interface.into(),
            InterfaceValidation {
                result: Some(result),
                reason: reason.map(ToString::to_string),
            },
        );
    }
}

/// Key in `internal_info` naming the tenant VIF bound to a port.
const TENANT_VIF_KEY: &str = "tenant_vif_port_id";

/// A network port on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    /// Port identifier.
    pub uuid: String,
    /// MAC address.
    pub address: String,
    /// Control-plane bookkeeping, including the bound VIF.
    #[serde(default)]
    pub internal_info: BTreeMap<String, serde_json::Value>,
}

impl Port {
    /// Create a port with no bound VIF.
    #[must_use]
    pub fn new(uuid: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            address: address.into(),
            internal_info: BTreeMap::new(),
        }
    }

    /// Bind a tenant VIF.
    #[must_use]
    pub fn with_vif(mut self, vif_id: &str) -> Self {
        self.internal_info
            .insert(TENANT_VIF_KEY.to_string(), serde_json::Value::from(vif_id));
        self
    }

    /// Return the tenant VIF bound to this port.
    #[must_use]
    pub fn vif_id(&self) -> Option<&str> {
        self.internal_info.get(TENANT_VIF_KEY).and_then(serde_json::Value::as_str)
    }
}

/// A bonded group of ports on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortGroup {
    /// Port group identifier.
    pub uuid: String,
    /// MAC address, if one was assigned.
    #[serde(default)]
    pub address: Option<String>,
    /// Control-plane bookkeeping, including the bound VIF.
    #[serde(default)]
    pub internal_info: BTreeMap<String, serde_json::Value>,
}

impl PortGroup {
    /// Create a port group with no bound VIF.
    #[must_use]
    pub fn new(uuid: impl Into<String>, address: Option<&str>) -> Self {
        Self {
            uuid: uuid.into(),
            address: address.map(ToString::to_string),
            internal_info: BTreeMap::new(),
        }
    }

    /// Bind a tenant VIF.
    #[must_use]
    pub fn with_vif(mut self, vif_id: &str) -> Self {
        self.internal_info
            .insert(TENANT_VIF_KEY.to_string(), serde_json::Value::from(vif_id));
        self
    }

    /// Return the tenant VIF bound to this port group.
    #[must_use]
    pub fn vif_id(&self) -> Option<&str> {
        self.internal_info.get(TENANT_VIF_KEY).and_then(serde_json::Value::as_str)
    }
}

/// A storage connector registered on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeConnector {
    /// Connector kind: `ip`, `iqn`, `wwpn` or `wwnn`.
    #[serde(rename = "type")]
    pub connector_type: String,
    /// Connector value.
    pub connector_id: String,
}

/// A volume attached as a boot or data target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeTarget {
    /// Target identifier.
    pub uuid: String,
    /// Owning node.
    pub node_uuid: String,
    /// Backing volume.
    pub volume_id: String,
    /// Transport, e.g. `iscsi`.
    pub volume_type: String,
    /// Boot order.
    pub boot_index: u32,
    /// Transport-specific connection properties.
    #[serde(default)]
    pub properties: serde_json::Value,
}

/// Request body for creating a volume target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewVolumeTarget {
    /// Owning node.
    pub node_uuid: String,
    /// Backing volume.
    pub volume_id: String,
    /// Transport, e.g. `iscsi`.
    pub volume_type: String,
    /// Boot order.
    pub boot_index: u32,
    /// Transport-specific connection properties.
    pub properties: serde_json::Value,
}

impl NewVolumeTarget {
    /// Create a target request for `node_id`.
    #[must_use]
    pub fn new(node_id: &NodeId, volume_id: impl Into<String>, volume_type: impl Into<String>) -> Self {
        Self {
            node_uuid: node_id.to_string(),
            volume_id: volume_id.into(),
            volume_type: volume_type.into(),
            boot_index: 0,
            properties: serde_json::Value::Object(serde_json::Map::new()),
        }
    }
}

/// Console endpoint advertised by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleInfo {
    /// Console kind, e.g. `socat` or `shellinabox`.
    #[serde(rename = "type")]
    pub console_type: String,
    /// Connection URL.
    pub url: String,
}

/// Reported console mode of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleState {
    /// Whether the console is enabled.
    pub console_enabled: bool,
    /// Endpoint, present once the console is enabled.
    #[serde(default)]
    pub console_info: Option<ConsoleInfo>,
}
