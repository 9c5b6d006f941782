//! Scheduler inventory derived from node hardware facts.
//!
//! Mapping is pure: a [`Node`] goes in, [`InventoryRecord`]s and traits come
//! out. Capacity of a node that cannot be scheduled is reported in full but
//! reserved in full, so it stays visible without being allocatable.

use std::collections::{BTreeMap, BTreeSet};

use metal_agent_core::{Node, NodeId, PowerState, ProvisionState};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Legacy CPU dimension.
pub const VCPU: &str = "VCPU";
/// Legacy memory dimension, in MiB.
pub const MEMORY_MB: &str = "MEMORY_MB";
/// Legacy disk dimension, in GiB.
pub const DISK_GB: &str = "DISK_GB";

const CUSTOM_PREFIX: &str = "CUSTOM_";

// ============================================================================
// Property parsing
// ============================================================================

/// Hardware facts parsed from a node's raw properties.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeProperties {
    /// CPU count.
    pub cpus: u64,
    /// Memory in MiB.
    pub memory_mb: u64,
    /// Local disk in GiB.
    pub local_gb: u64,
    /// Canonical CPU architecture, `None` if missing or unrecognized.
    pub cpu_arch: Option<String>,
    /// Architecture exactly as reported.
    pub raw_cpu_arch: Option<String>,
    /// Parsed `capabilities` entries.
    pub capabilities: BTreeMap<String, String>,
}

impl NodeProperties {
    /// Parse the properties of `node`.
    ///
    /// Malformed values never fail the parse: they become zero or are
    /// skipped, with a warning.
    #[must_use]
    pub fn parse(node: &Node) -> Self {
        let props = &node.properties;
        let raw_cpu_arch = props
            .get("cpu_arch")
            .and_then(serde_json::Value::as_str)
            .map(ToString::to_string);
        let cpu_arch = raw_cpu_arch.as_deref().and_then(|raw| {
            let canonical = canonical_arch(raw);
            if canonical.is_none() {
                warn!(node_id = %node.id, cpu_arch = raw, "Unknown CPU architecture");
            }
            canonical
        });
        let capabilities = match props.get("capabilities") {
            Some(serde_json::Value::String(caps)) => parse_capabilities(&node.id, caps),
            _ => BTreeMap::new(),
        };

        Self {
            cpus: parse_count(&node.id, props, "cpus"),
            memory_mb: parse_count(&node.id, props, "memory_mb"),
            local_gb: parse_count(&node.id, props, "local_gb"),
            cpu_arch,
            raw_cpu_arch,
            capabilities,
        }
    }
}

fn parse_count(
    node_id: &NodeId,
    props: &BTreeMap<String, serde_json::Value>,
    key: &str,
) -> u64 {
    let parsed = match props.get(key) {
        None | Some(serde_json::Value::Null) => return 0,
        Some(serde_json::Value::Number(n)) => n.as_u64(),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        Some(_) => None,
    };
    parsed.unwrap_or_else(|| {
        warn!(
            node_id = %node_id,
            property = key,
            value = %props.get(key).unwrap_or(&serde_json::Value::Null),
            "Node property is not a valid count, using 0"
        );
        0
    })
}

fn parse_capabilities(node_id: &NodeId, caps: &str) -> BTreeMap<String, String> {
    caps.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match entry.split_once(':') {
            Some((key, value)) if !key.trim().is_empty() && !value.trim().is_empty() => {
                Some((key.trim().to_string(), value.trim().to_string()))
            }
            _ => {
                warn!(node_id = %node_id, capability = entry, "Ignoring malformed capability");
                None
            }
        })
        .collect()
}

/// Canonicalize a CPU architecture name.
#[must_use]
pub fn canonical_arch(raw: &str) -> Option<String> {
    let lower = raw.trim().to_ascii_lowercase();
    let arch = match lower.as_str() {
        "amd64" | "x64" | "x86-64" | "x86_64" => "x86_64",
        "i386" | "i486" | "i586" | "i686" | "x86" => "i686",
        "arm64" | "aarch64" => "aarch64",
        "armv6l" | "armv7l" | "armv7b" | "ppc" | "ppc64" | "ppc64le" | "s390" | "s390x"
        | "mips" | "mipsel" | "mips64" | "mips64el" | "riscv64" | "sparc" | "sparc64" => {
            lower.as_str()
        }
        _ => return None,
    };
    Some(arch.to_string())
}

// ============================================================================
// Availability
// ============================================================================

/// Check whether a node's capacity must not be allocated.
///
/// Maintenance, an unknown or failed power state, and any provisioning state
/// other than available count as unavailable. Nodes carrying a workload are
/// judged by [`node_is_used`] instead of their provisioning state.
#[must_use]
pub fn node_is_unavailable(node: &Node) -> bool {
    let bad_power = matches!(
        node.power_state,
        None | Some(PowerState::Error | PowerState::Unknown)
    );
    let bad_provision = !node_is_used(node)
        && !matches!(
            node.provision_state,
            None | Some(ProvisionState::Available)
        );
    node.is_maintenance || bad_power || bad_provision
}

/// Check whether a node is occupied by a workload.
#[must_use]
pub fn node_is_used(node: &Node) -> bool {
    node.instance_id.is_some()
        && !matches!(
            node.provision_state,
            None | Some(
                ProvisionState::Available
                    | ProvisionState::Cleaning
                    | ProvisionState::CleanWait
                    | ProvisionState::CleanFail
                    | ProvisionState::Deleted
            )
        )
}

// ============================================================================
// Resources
// ============================================================================

/// A node's resources as reported to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeResource {
    /// Node described.
    pub node_id: NodeId,
    /// CPU count.
    pub vcpus: u64,
    /// CPUs in use.
    pub vcpus_used: u64,
    /// Memory in MiB.
    pub memory_mb: u64,
    /// Memory in use.
    pub memory_mb_used: u64,
    /// Local disk in GiB.
    pub local_gb: u64,
    /// Disk in use.
    pub local_gb_used: u64,
    /// Architectures a workload may be built for.
    pub supported_archs: Vec<String>,
    /// Raw architecture and capabilities.
    pub stats: BTreeMap<String, String>,
    /// Custom resource class, if assigned.
    pub resource_class: Option<String>,
}

impl NodeResource {
    /// Describe `node`. Used amounts equal totals when the node is used or
    /// unavailable.
    #[must_use]
    pub fn from_node(node: &Node) -> Self {
        let props = NodeProperties::parse(node);
        let consumed = node_is_used(node) || node_is_unavailable(node);
        let used = |total: u64| if consumed { total } else { 0 };

        let mut stats = props.capabilities.clone();
        if let Some(raw) = &props.raw_cpu_arch {
            stats.insert("cpu_arch".to_string(), raw.clone());
        }

        Self {
            node_id: node.id.clone(),
            vcpus: props.cpus,
            vcpus_used: used(props.cpus),
            memory_mb: props.memory_mb,
            memory_mb_used: used(props.memory_mb),
            local_gb: props.local_gb,
            local_gb_used: used(props.local_gb),
            supported_archs: props.cpu_arch.into_iter().collect(),
            stats,
            resource_class: node.resource_class.clone(),
        }
    }
}

/// Inventory of one resource class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryRecord {
    /// Total capacity.
    pub total: u64,
    /// Capacity that may not be allocated.
    pub reserved: u64,
    /// Smallest allocation.
    pub min_unit: u64,
    /// Largest allocation.
    pub max_unit: u64,
    /// Allocation granularity.
    pub step_size: u64,
    /// Overcommit ratio.
    pub allocation_ratio: f64,
}

impl InventoryRecord {
    /// A whole-unit record of `total`, of which `reserved` is held back.
    #[must_use]
    pub fn new(total: u64, reserved: u64) -> Self {
        Self {
            total,
            reserved: reserved.min(total),
            min_unit: 1,
            max_unit: total,
            step_size: 1,
            allocation_ratio: 1.0,
        }
    }
}

/// Inventory keyed by resource class.
pub type Inventory = BTreeMap<String, InventoryRecord>;

/// Normalize a resource class name into the custom namespace.
///
/// `iron-nfv` becomes `CUSTOM_IRON_NFV`; names already prefixed are kept.
#[must_use]
pub fn normalize_resource_class(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len() + CUSTOM_PREFIX.len());
    let mut in_gap = false;
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            normalized.push(c.to_ascii_uppercase());
            in_gap = false;
        } else if !in_gap {
            normalized.push('_');
            in_gap = true;
        }
    }
    if normalized.starts_with(CUSTOM_PREFIX) {
        normalized
    } else {
        format!("{CUSTOM_PREFIX}{normalized}")
    }
}

/// Maps nodes to inventory.
#[derive(Debug, Clone, Copy, Default)]
pub struct InventoryMapper {
    skip_reserve_in_use_nodes: bool,
}

impl InventoryMapper {
    /// Create a mapper; `skip_reserve_in_use_nodes` stops in-use capacity
    /// from being reserved.
    #[must_use]
    pub const fn new(skip_reserve_in_use_nodes: bool) -> Self {
        Self {
            skip_reserve_in_use_nodes,
        }
    }

    /// Build the inventory of `node`.
    ///
    /// Legacy dimensions are emitted for every non-zero total; a custom
    /// resource class adds one record of total 1.
    #[must_use]
    pub fn map(&self, node: &Node) -> Inventory {
        let resource = NodeResource::from_node(node);
        let unavailable = node_is_unavailable(node);
        let used = node_is_used(node);

        let reserved = |total: u64, used_amount: u64| {
            if unavailable {
                total
            } else if used && !self.skip_reserve_in_use_nodes {
                used_amount
            } else {
                0
            }
        };

        let mut inventory = Inventory::new();
        for (class, total, used_amount) in [
            (VCPU, resource.vcpus, resource.vcpus_used),
            (MEMORY_MB, resource.memory_mb, resource.memory_mb_used),
            (DISK_GB, resource.local_gb, resource.local_gb_used),
        ] {
            if total > 0 {
                inventory.insert(
                    class.to_string(),
                    InventoryRecord::new(total, reserved(total, used_amount)),
                );
            }
        }

        if let Some(class) = resource.resource_class.as_deref().filter(|c| !c.trim().is_empty()) {
            let occupied = u64::from(used);
            inventory.insert(
                normalize_resource_class(class),
                InventoryRecord::new(1, reserved(1, occupied)),
            );
        }

        inventory
    }
}

// ============================================================================
// Provider tree
// ============================================================================

/// Inventory and traits of one provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderData {
    /// Current inventory.
    pub inventory: Inventory,
    /// Current traits.
    pub traits: BTreeSet<String>,
}

/// Scheduler-side view of resource providers, one per node.
#[derive(Debug, Clone, Default)]
pub struct ProviderTree {
    providers: BTreeMap<String, ProviderData>,
}

impl ProviderTree {
    /// Create an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a provider's inventory.
    pub fn update_inventory(&mut self, name: &str, inventory: Inventory) {
        self.providers.entry(name.to_string()).or_default().inventory = inventory;
    }

    /// Replace a provider's traits.
    pub fn update_traits(&mut self, name: &str, traits: BTreeSet<String>) {
        self.providers.entry(name.to_string()).or_default().traits = traits;
    }

    /// Get a provider.
    #[must_use]
    pub fn data(&self, name: &str) -> Option<&ProviderData> {
        self.providers.get(name)
    }

    /// Check if a provider exists.
    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use metal_agent_core::InstanceId;
    use serde_json::json;

    use super::*;

    fn node(props: serde_json::Value) -> Node {
        let mut node = Node::new(NodeId::new("n1").unwrap());
        node.power_state = Some(PowerState::PowerOff);
        node.provision_state = Some(ProvisionState::Available);
        if let serde_json::Value::Object(map) = props {
            node.properties = map.into_iter().collect();
        }
        node
    }

    fn sized() -> Node {
        node(json!({"cpus": 24, "memory_mb": "1024", "local_gb": 100, "cpu_arch": "x86_64"}))
    }

    fn used(mut node: Node) -> Node {
        node.instance_id = Some(InstanceId::generate());
        node.provision_state = Some(ProvisionState::Active);
        node.power_state = Some(PowerState::PowerOn);
        node
    }

    fn reserved(inventory: &Inventory) -> Vec<(String, u64, u64)> {
        inventory
            .iter()
            .map(|(class, r)| (class.clone(), r.total, r.reserved))
            .collect()
    }

    #[test]
    fn parses_numbers_and_strings() {
        let props = NodeProperties::parse(&sized());
        assert_eq!((props.cpus, props.memory_mb, props.local_gb), (24, 1024, 100));
        assert_eq!(props.cpu_arch.as_deref(), Some("x86_64"));
    }

    #[test]
    fn invalid_counts_become_zero() {
        let props = NodeProperties::parse(&node(json!({"cpus": "many", "memory_mb": -5})));
        assert_eq!(props.cpus, 0);
        assert_eq!(props.memory_mb, 0);
        assert_eq!(props.local_gb, 0);
    }

    #[test]
    fn architecture_is_canonicalized() {
        let props = NodeProperties::parse(&node(json!({"cpu_arch": "i386"})));
        assert_eq!(props.cpu_arch.as_deref(), Some("i686"));
        assert_eq!(props.raw_cpu_arch.as_deref(), Some("i386"));

        let unknown = NodeProperties::parse(&node(json!({"cpu_arch": "z80"})));
        assert!(unknown.cpu_arch.is_none());
        assert!(NodeResource::from_node(&node(json!({}))).supported_archs.is_empty());
    }

    #[test]
    fn capabilities_skip_malformed_entries() {
        let props = NodeProperties::parse(&node(
            json!({"capabilities": "test:capability, :no_key,no_val:, test2:value2"}),
        ));
        assert_eq!(
            props.capabilities,
            BTreeMap::from([
                ("test".to_string(), "capability".to_string()),
                ("test2".to_string(), "value2".to_string()),
            ])
        );
        let resource = NodeResource::from_node(&node(json!({"capabilities": null})));
        assert!(resource.stats.is_empty());
    }

    #[test]
    fn unavailable_states() {
        let mut maintenance = sized();
        maintenance.is_maintenance = true;
        assert!(node_is_unavailable(&maintenance));

        let mut no_power = sized();
        no_power.power_state = None;
        assert!(node_is_unavailable(&no_power));

        for state in [
            ProvisionState::Manageable,
            ProvisionState::Cleaning,
            ProvisionState::CleanWait,
            ProvisionState::Deleting,
            ProvisionState::Deleted,
        ] {
            let mut n = sized();
            n.provision_state = Some(state);
            assert!(node_is_unavailable(&n), "{state:?}");
        }

        let mut no_state = sized();
        no_state.provision_state = None;
        assert!(!node_is_unavailable(&no_state));
        assert!(!node_is_unavailable(&sized()));
        assert!(!node_is_unavailable(&used(sized())));
    }

    #[test]
    fn used_requires_workload_and_occupied_state() {
        assert!(node_is_used(&used(sized())));
        assert!(!node_is_used(&sized()));

        let mut cleaning = used(sized());
        cleaning.provision_state = Some(ProvisionState::Cleaning);
        assert!(!node_is_used(&cleaning));
    }

    #[test]
    fn maintenance_reserves_everything() {
        let mut n = sized();
        n.is_maintenance = true;
        let inventory = InventoryMapper::new(false).map(&n);
        assert_eq!(
            reserved(&inventory),
            vec![
                (DISK_GB.to_string(), 100, 100),
                (MEMORY_MB.to_string(), 1024, 1024),
                (VCPU.to_string(), 24, 24),
            ]
        );
    }

    #[test]
    fn used_node_reserves_used_amounts() {
        let inventory = InventoryMapper::new(false).map(&used(sized()));
        assert!(inventory.values().all(|r| r.reserved == r.total));
        assert_eq!(inventory[VCPU].reserved, 24);
    }

    #[test]
    fn skip_reserve_workaround() {
        let inventory = InventoryMapper::new(true).map(&used(sized()));
        assert_eq!(inventory.len(), 3);
        assert!(inventory.values().all(|r| r.reserved == 0));
    }

    #[test]
    fn custom_resource_class() {
        let mut n = node(json!({}));
        n.resource_class = Some("iron-nfv".into());
        let inventory = InventoryMapper::new(false).map(&n);
        assert_eq!(inventory.len(), 1);
        assert_eq!(inventory["CUSTOM_IRON_NFV"], InventoryRecord::new(1, 0));

        let mut occupied = used(sized());
        occupied.resource_class = Some("iron-nfv".into());
        let inventory = InventoryMapper::new(false).map(&occupied);
        assert_eq!(inventory.len(), 4);
        assert_eq!(inventory["CUSTOM_IRON_NFV"].reserved, 1);

        let inventory = InventoryMapper::new(true).map(&occupied);
        assert_eq!(inventory["CUSTOM_IRON_NFV"].reserved, 0);

        occupied.is_maintenance = true;
        let inventory = InventoryMapper::new(true).map(&occupied);
        assert_eq!(inventory["CUSTOM_IRON_NFV"].reserved, 1);
    }

    #[test]
    fn resource_class_normalization() {
        assert_eq!(normalize_resource_class("iron-nfv"), "CUSTOM_IRON_NFV");
        assert_eq!(normalize_resource_class("baremetal gold"), "CUSTOM_BAREMETAL_GOLD");
        assert_eq!(normalize_resource_class("a..b"), "CUSTOM_A_B");
        assert_eq!(normalize_resource_class("CUSTOM_GOLD"), "CUSTOM_GOLD");
    }

    #[test]
    fn traits_are_replaced() {
        let mut tree = ProviderTree::new();
        tree.update_traits("n1", BTreeSet::from(["trait1".into(), "trait2".into()]));
        tree.update_traits("n1", BTreeSet::from(["trait7".into()]));
        assert_eq!(tree.data("n1").unwrap().traits, BTreeSet::from(["trait7".into()]));
        assert!(!tree.exists("n2"));
    }
}
