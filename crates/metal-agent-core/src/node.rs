//! The node record fetched from the control plane.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Deserializer, Serialize};

use crate::ids::{InstanceId, NodeId};
use crate::states::{PowerState, ProvisionState};

/// A physical machine as reported by the control plane.
///
/// Optional fields are explicit: a node with no pending power transition has
/// `target_power_state == None`, a node not bound to a workload has
/// `instance_id == None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Control-plane identifier.
    #[serde(rename = "uuid")]
    pub id: NodeId,

    /// Current power state.
    #[serde(default)]
    pub power_state: Option<PowerState>,

    /// Power state the node is transitioning to.
    #[serde(default)]
    pub target_power_state: Option<PowerState>,

    /// Current provisioning state.
    #[serde(default)]
    pub provision_state: Option<ProvisionState>,

    /// Provisioning state the node is transitioning to.
    #[serde(default)]
    pub target_provision_state: Option<ProvisionState>,

    /// Workload currently bound to the node.
    #[serde(default, rename = "instance_uuid")]
    pub instance_id: Option<InstanceId>,

    /// Raw hardware facts (`cpus`, `memory_mb`, `local_gb`, `cpu_arch`, `capabilities`).
    #[serde(default, deserialize_with = "null_as_default")]
    pub properties: BTreeMap<String, serde_json::Value>,

    /// Custom resource class, if the operator assigned one.
    #[serde(default)]
    pub resource_class: Option<String>,

    /// Scheduler traits advertised by the node.
    #[serde(default, deserialize_with = "null_as_default")]
    pub traits: BTreeSet<String>,

    /// Whether the node is in maintenance mode.
    #[serde(default, rename = "maintenance")]
    pub is_maintenance: bool,

    /// Last error recorded by the control plane.
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Node {
    /// Fields requested from the control plane when listing or fetching nodes.
    pub const FIELDS: &'static [&'static str] = &[
        "uuid",
        "power_state",
        "target_power_state",
        "provision_state",
        "target_provision_state",
        "last_error",
        "maintenance",
        "properties",
        "instance_uuid",
        "traits",
        "resource_class",
    ];

    /// Create a node with the given ID and every other field empty.
    #[must_use]
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            power_state: None,
            target_power_state: None,
            provision_state: None,
            target_provision_state: None,
            instance_id: None,
            properties: BTreeMap::new(),
            resource_class: None,
            traits: BTreeSet::new(),
            is_maintenance: false,
            last_error: None,
        }
    }

    /// Check whether a workload is bound to this node.
    #[must_use]
    pub const fn is_associated(&self) -> bool {
        self.instance_id.is_some()
    }

    /// Check whether the node is bound to the given workload.
    #[must_use]
    pub fn is_bound_to(&self, instance_id: &InstanceId) -> bool {
        self.instance_id.as_ref() == Some(instance_id)
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
