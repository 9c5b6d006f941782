//! Request and response types for driver operations.

use std::collections::BTreeMap;

use metal_agent_core::PowerState;
use serde::{Deserialize, Serialize};

/// How to reboot a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebootKind {
    /// Ask the OS to restart, falling back to hard if unsupported.
    Soft,
    /// Power cycle.
    Hard,
}

/// Power state of a workload as seen by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstancePowerState {
    /// Powered on.
    Running,
    /// Powered off.
    Shutdown,
    /// Unknown or no node.
    NoState,
}

impl From<Option<PowerState>> for InstancePowerState {
    fn from(state: Option<PowerState>) -> Self {
        match state {
            Some(PowerState::PowerOn) => Self::Running,
            Some(PowerState::PowerOff) => Self::Shutdown,
            _ => Self::NoState,
        }
    }
}

/// Runtime information about a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    /// Current power state.
    pub state: InstancePowerState,
}

/// A virtual network interface to attach to a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vif {
    /// Interface identifier.
    pub id: String,
    /// MAC address, if known.
    #[serde(default)]
    pub address: Option<String>,
    /// Fixed IP addresses assigned to the interface.
    #[serde(default)]
    pub fixed_ips: Vec<String>,
}

impl Vif {
    /// Create an interface with no address information.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

/// A volume to expose to a node as a boot or data target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeAttachment {
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

/// Everything needed to deploy a workload onto its node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpawnRequest {
    /// Image to deploy.
    pub image_source: String,
    /// Root disk size in GiB.
    pub root_gb: u64,
    /// Swap size in MiB.
    #[serde(default)]
    pub swap_mb: u64,
    /// Requested CPU count.
    #[serde(default)]
    pub vcpus: u64,
    /// Requested memory in MiB.
    #[serde(default)]
    pub memory_mb: u64,
    /// Config drive contents or URL.
    #[serde(default)]
    pub config_drive: Option<String>,
    /// Interfaces to attach before deploying.
    #[serde(default)]
    pub vifs: Vec<Vif>,
    /// Volumes to attach before deploying.
    #[serde(default)]
    pub volumes: Vec<VolumeAttachment>,
    /// Additional instance info written to the node verbatim.
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Storage connector properties of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeConnectorInfo {
    /// iSCSI initiator name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initiator: Option<String>,
    /// IP address storage traffic originates from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Host identity presented to storage.
    pub host: String,
    /// Whether multipath is in use.
    pub multipath: bool,
    /// Fibre Channel node names.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub wwnns: Vec<String>,
    /// Fibre Channel port names.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub wwpns: Vec<String>,
    /// Always `baremetal`.
    pub os_type: String,
    /// CPU architecture of the node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

/// What the driver supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct DriverCapabilities {
    /// Images are cached on the host.
    pub has_imagecache: bool,
    /// Workloads can be evacuated to another host.
    pub supports_evacuate: bool,
    /// Workloads can migrate onto the host they run on.
    pub supports_migrate_to_same_host: bool,
    /// Interfaces can be attached to a running workload.
    pub supports_attach_interface: bool,
    /// Workloads can be booted from volumes.
    pub supports_volume_boot: bool,
    /// Rescue mode is available.
    pub supports_rescue: bool,
    /// Serial consoles are available.
    pub supports_serial_console: bool,
    /// A crash dump can be triggered.
    pub supports_crash_dump: bool,
}

impl Default for DriverCapabilities {
    fn default() -> Self {
        Self {
            has_imagecache: false,
            supports_evacuate: false,
            supports_migrate_to_same_host: false,
            supports_attach_interface: true,
            supports_volume_boot: true,
            supports_rescue: true,
            supports_serial_console: true,
            supports_crash_dump: true,
        }
    }
}
