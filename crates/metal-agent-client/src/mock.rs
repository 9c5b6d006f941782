//! In-memory control plane for tests.
//!
//! [`FakeControlClient`] keeps nodes in a map, applies the state transitions a
//! real control plane would eventually report, records every call, and lets a
//! test queue failures per operation or freeze node state entirely.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use metal_agent_core::{InstanceId, Node, NodeId, PowerState, ProvisionState};
use parking_lot::Mutex;

use crate::client::{check_required, RemoteControlClient};
use crate::error::{ClientError, Result};
use crate::types::{
    ConsoleInfo, ConsoleState, NewVolumeTarget, NodeListFilter, NodeValidation, PatchOp, Port,
    PortGroup, PowerAction, ProvisionArgs, ProvisionTarget, VolumeConnector, VolumeTarget,
};
use crate::version::ApiVersion;

/// Operation kinds, used to queue failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// `supports_version`
    SupportsVersion,
    /// `list_nodes`
    ListNodes,
    /// `get_node`
    GetNode,
    /// `update_node_fields`
    UpdateNode,
    /// `set_instance_association`
    SetInstanceAssociation,
    /// `set_provision_state`
    SetProvisionState,
    /// `set_power_state`
    SetPowerState,
    /// `attach_vif`
    AttachVif,
    /// `detach_vif`
    DetachVif,
    /// `list_ports`
    ListPorts,
    /// `list_port_groups`
    ListPortGroups,
    /// `list_volume_connectors`
    ListVolumeConnectors,
    /// `list_volume_targets`
    ListVolumeTargets,
    /// `create_volume_target`
    CreateVolumeTarget,
    /// `delete_volume_target`
    DeleteVolumeTarget,
    /// `get_console`
    GetConsole,
    /// `enable_console`
    EnableConsole,
    /// `disable_console`
    DisableConsole,
    /// `inject_nmi`
    InjectNmi,
    /// `validate_node`
    ValidateNode,
}

/// A recorded call.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum Call {
    SupportsVersion(ApiVersion),
    ListNodes(NodeListFilter),
    GetNode(NodeId),
    UpdateNode(NodeId, Vec<PatchOp>),
    SetInstanceAssociation {
        node_id: NodeId,
        instance_id: Option<InstanceId>,
        retry_on_conflict: bool,
    },
    SetProvisionState(NodeId, ProvisionTarget, ProvisionArgs),
    SetPowerState(NodeId, PowerAction, Option<Duration>),
    AttachVif {
        node_id: NodeId,
        vif_id: String,
        retry_on_conflict: bool,
    },
    DetachVif(NodeId, String),
    ListPorts(NodeId),
    ListPortGroups(NodeId),
    ListVolumeConnectors(NodeId),
    ListVolumeTargets(NodeId),
    CreateVolumeTarget(NewVolumeTarget),
    DeleteVolumeTarget(String),
    GetConsole(NodeId),
    EnableConsole(NodeId),
    DisableConsole(NodeId),
    InjectNmi(NodeId),
    ValidateNode(NodeId),
}

impl Call {
    /// Return the operation kind of this call.
    #[must_use]
    pub const fn op(&self) -> Op {
        match self {
            Self::SupportsVersion(_) => Op::SupportsVersion,
            Self::ListNodes(_) => Op::ListNodes,
            Self::GetNode(_) => Op::GetNode,
            Self::UpdateNode(..) => Op::UpdateNode,
            Self::SetInstanceAssociation { .. } => Op::SetInstanceAssociation,
            Self::SetProvisionState(..) => Op::SetProvisionState,
            Self::SetPowerState(..) => Op::SetPowerState,
            Self::AttachVif { .. } => Op::AttachVif,
            Self::DetachVif(..) => Op::DetachVif,
            Self::ListPorts(_) => Op::ListPorts,
            Self::ListPortGroups(_) => Op::ListPortGroups,
            Self::ListVolumeConnectors(_) => Op::ListVolumeConnectors,
            Self::ListVolumeTargets(_) => Op::ListVolumeTargets,
            Self::CreateVolumeTarget(_) => Op::CreateVolumeTarget,
            Self::DeleteVolumeTarget(_) => Op::DeleteVolumeTarget,
            Self::GetConsole(_) => Op::GetConsole,
            Self::EnableConsole(_) => Op::EnableConsole,
            Self::DisableConsole(_) => Op::DisableConsole,
            Self::InjectNmi(_) => Op::InjectNmi,
            Self::ValidateNode(_) => Op::ValidateNode,
        }
    }
}

#[derive(Debug, Clone)]
struct FakeConsole {
    enabled: bool,
    info: ConsoleInfo,
}

impl Default for FakeConsole {
    fn default() -> Self {
        Self {
            enabled: false,
            info: ConsoleInfo {
                console_type: "socat".to_string(),
                url: "tcp://127.0.0.1:10000".to_string(),
            },
        }
    }
}

struct State {
    nodes: BTreeMap<NodeId, Node>,
    calls: Vec<Call>,
    failures: HashMap<Op, VecDeque<ClientError>>,
    frozen: bool,
    max_version: ApiVersion,
    consoles: HashMap<NodeId, FakeConsole>,
    console_follows_requests: bool,
    validations: HashMap<NodeId, NodeValidation>,
    instance_info: HashMap<NodeId, BTreeMap<String, serde_json::Value>>,
    vifs: HashMap<NodeId, BTreeSet<String>>,
    ports: HashMap<NodeId, Vec<Port>>,
    port_groups: HashMap<NodeId, Vec<PortGroup>>,
    connectors: HashMap<NodeId, Vec<VolumeConnector>>,
    targets: BTreeMap<String, VolumeTarget>,
    next_target: u32,
}

impl Default for State {
    fn default() -> Self {
        Self {
            nodes: BTreeMap::new(),
            calls: Vec::new(),
            failures: HashMap::new(),
            frozen: false,
            max_version: ApiVersion::new(1, 87),
            consoles: HashMap::new(),
            console_follows_requests: true,
            validations: HashMap::new(),
            instance_info: HashMap::new(),
            vifs: HashMap::new(),
            ports: HashMap::new(),
            port_groups: HashMap::new(),
            connectors: HashMap::new(),
            targets: BTreeMap::new(),
            next_target: 0,
        }
    }
}

impl State {
    fn record(&mut self, call: Call) -> Result<()> {
        let op = call.op();
        self.calls.push(call);
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn node_mut(&mut self, node_id: &NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(node_id)
            .ok_or_else(|| ClientError::NotFound(format!("node {node_id}")))
    }
}

/// A scripted, in-memory [`RemoteControlClient`].
#[derive(Default)]
pub struct FakeControlClient {
    state: Mutex<State>,
}

impl FakeControlClient {
    /// Create an empty fake control plane.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a node.
    pub fn insert_node(&self, node: Node) {
        self.state.lock().nodes.insert(node.id.clone(), node);
    }

    /// Remove a node.
    pub fn remove_node(&self, node_id: &NodeId) -> Option<Node> {
        self.state.lock().nodes.remove(node_id)
    }

    /// Return the current copy of a node.
    #[must_use]
    pub fn node(&self, node_id: &NodeId) -> Option<Node> {
        self.state.lock().nodes.get(node_id).cloned()
    }

    /// Mutate a stored node in place.
    pub fn update_node(&self, node_id: &NodeId, f: impl FnOnce(&mut Node)) {
        if let Some(node) = self.state.lock().nodes.get_mut(node_id) {
            f(node);
        }
    }

    /// Stop applying transitions for mutation calls; nodes keep their state.
    pub fn freeze(&self) {
        self.state.lock().frozen = true;
    }

    /// Queue an error to be returned by the next call of `op`.
    pub fn fail_next(&self, op: Op, error: ClientError) {
        self.state
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Queue an error for each of the next `times` calls of `op`.
    pub fn fail_times(&self, op: Op, times: usize, error: &ClientError) {
        for _ in 0..times {
            self.fail_next(op, error.clone());
        }
    }

    /// Set the highest API version the fake accepts.
    pub fn set_max_version(&self, version: ApiVersion) {
        self.state.lock().max_version = version;
    }

    /// Set the reported console state of a node.
    pub fn set_console(&self, node_id: &NodeId, enabled: bool, console_type: &str, url: &str) {
        self.state.lock().consoles.insert(
            node_id.clone(),
            FakeConsole {
                enabled,
                info: ConsoleInfo {
                    console_type: console_type.to_string(),
                    url: url.to_string(),
                },
            },
        );
    }

    /// When `false`, enable/disable calls succeed but never change the reported mode.
    pub fn set_console_follows_requests(&self, follows: bool) {
        self.state.lock().console_follows_requests = follows;
    }

    /// Set the validation result reported for a node.
    pub fn set_validation(&self, node_id: &NodeId, validation: NodeValidation) {
        self.state
            .lock()
            .validations
            .insert(node_id.clone(), validation);
    }

    /// Set the ports of a node.
    pub fn set_ports(&self, node_id: &NodeId, ports: Vec<Port>) {
        self.state.lock().ports.insert(node_id.clone(), ports);
    }

    /// Set the port groups of a node.
    pub fn set_port_groups(&self, node_id: &NodeId, groups: Vec<PortGroup>) {
        self.state.lock().port_groups.insert(node_id.clone(), groups);
    }

    /// Set the storage connectors of a node.
    pub fn set_volume_connectors(&self, node_id: &NodeId, connectors: Vec<VolumeConnector>) {
        self.state
            .lock()
            .connectors
            .insert(node_id.clone(), connectors);
    }

    /// Mark a VIF as already attached.
    pub fn attach_existing_vif(&self, node_id: &NodeId, vif_id: &str) {
        self.state
            .lock()
            .vifs
            .entry(node_id.clone())
            .or_default()
            .insert(vif_id.to_string());
    }

    /// Return the VIFs attached to a node.
    #[must_use]
    pub fn vifs(&self, node_id: &NodeId) -> BTreeSet<String> {
        self.state
            .lock()
            .vifs
            .get(node_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Return the instance info stored on a node.
    #[must_use]
    pub fn instance_info(&self, node_id: &NodeId) -> BTreeMap<String, serde_json::Value> {
        self.state
            .lock()
            .instance_info
            .get(node_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Return the volume targets currently stored.
    #[must_use]
    pub fn volume_targets(&self) -> Vec<VolumeTarget> {
        self.state.lock().targets.values().cloned().collect()
    }

    /// Return every recorded call.
    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    /// Return the recorded calls of one operation kind.
    #[must_use]
    pub fn calls_of(&self, op: Op) -> Vec<Call> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.op() == op)
            .cloned()
            .collect()
    }

    /// Count the recorded calls of one operation kind.
    #[must_use]
    pub fn count(&self, op: Op) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.op() == op)
            .count()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }
}

fn apply_patch(state: &mut State, node_id: &NodeId, patch: &[PatchOp]) -> Result<Node> {
    let mut info = state.instance_info.remove(node_id).unwrap_or_default();
    let node = state.node_mut(node_id)?;
    for op in patch {
        let path = op.path();
        let value = match op {
            PatchOp::Add { value, .. } | PatchOp::Replace { value, .. } => Some(value),
            PatchOp::Remove { .. } => None,
        };
        if path == "/instance_uuid" {
            node.instance_id = match value.and_then(|v| v.as_str()) {
                Some(raw) => Some(
                    raw.parse()
                        .map_err(|_| ClientError::BadRequest(format!("invalid instance {raw}")))?,
                ),
                None => None,
            };
        } else if path == "/instance_info" {
            info.clear();
        } else if let Some(key) = path.strip_prefix("/instance_info/") {
            match value {
                Some(value) => {
                    info.insert(key.to_string(), value.clone());
                }
                None => {
                    info.remove(key);
                }
            }
        } else {
            return Err(ClientError::BadRequest(format!("unsupported patch path {path}")));
        }
    }
    let node = node.clone();
    if !info.is_empty() {
        state.instance_info.insert(node_id.clone(), info);
    }
    Ok(node)
}

#[async_trait]
impl RemoteControlClient for FakeControlClient {
    async fn supports_version(&self, version: ApiVersion) -> Result<bool> {
        let mut state = self.state.lock();
        state.record(Call::SupportsVersion(version))?;
        Ok(version <= state.max_version)
    }

    async fn list_nodes(&self, filter: &NodeListFilter) -> Result<Vec<Node>> {
        let mut state = self.state.lock();
        state.record(Call::ListNodes(filter.clone()))?;
        Ok(state
            .nodes
            .values()
            .filter(|n| filter.instance_id.map_or(true, |id| n.is_bound_to(&id)))
            .filter(|n| filter.associated.map_or(true, |a| n.is_associated() == a))
            .cloned()
            .collect())
    }

    async fn get_node(&self, node_id: &NodeId, _fields: &[&str]) -> Result<Node> {
        let mut state = self.state.lock();
        state.record(Call::GetNode(node_id.clone()))?;
        state.node_mut(node_id).map(|n| n.clone())
    }

    async fn update_node_fields(&self, node_id: &NodeId, patch: &[PatchOp]) -> Result<Node> {
        let mut state = self.state.lock();
        state.record(Call::UpdateNode(node_id.clone(), patch.to_vec()))?;
        apply_patch(&mut state, node_id, patch)
    }

    async fn set_instance_association(
        &self,
        node_id: &NodeId,
        instance_id: Option<InstanceId>,
        retry_on_conflict: bool,
    ) -> Result<Node> {
        let mut state = self.state.lock();
        state.record(Call::SetInstanceAssociation {
            node_id: node_id.clone(),
            instance_id,
            retry_on_conflict,
        })?;
        let node = state.node_mut(node_id)?;
        if let (Some(current), Some(requested)) = (node.instance_id, instance_id) {
            if current != requested {
                return Err(ClientError::Conflict(format!(
                    "node {node_id} is already associated with instance {current}"
                )));
            }
        }
        node.instance_id = instance_id;
        Ok(node.clone())
    }

    async fn set_provision_state(
        &self,
        node_id: &NodeId,
        target: ProvisionTarget,
        args: &ProvisionArgs,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.record(Call::SetProvisionState(node_id.clone(), target, args.clone()))?;
        let frozen = state.frozen;
        let node = state.node_mut(node_id)?;
        if frozen {
            return Ok(());
        }
        node.target_provision_state = None;
        match target {
            ProvisionTarget::Active | ProvisionTarget::Unrescue => {
                node.provision_state = Some(ProvisionState::Active);
            }
            ProvisionTarget::Rescue => node.provision_state = Some(ProvisionState::Rescue),
            ProvisionTarget::Deleted => {
                node.provision_state = Some(ProvisionState::Available);
                node.instance_id = None;
            }
        }
        Ok(())
    }

    async fn set_power_state(
        &self,
        node_id: &NodeId,
        action: PowerAction,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.record(Call::SetPowerState(node_id.clone(), action, timeout))?;
        let frozen = state.frozen;
        let node = state.node_mut(node_id)?;
        if frozen {
            return Ok(());
        }
        node.target_power_state = None;
        node.power_state = Some(match action {
            PowerAction::PowerOff | PowerAction::SoftPowerOff => PowerState::PowerOff,
            PowerAction::PowerOn | PowerAction::Reboot | PowerAction::SoftReboot => {
                PowerState::PowerOn
            }
        });
        Ok(())
    }

    async fn attach_vif(
        &self,
        node_id: &NodeId,
        vif_id: &str,
        retry_on_conflict: bool,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.record(Call::AttachVif {
            node_id: node_id.clone(),
            vif_id: vif_id.to_string(),
            retry_on_conflict,
        })?;
        state.node_mut(node_id)?;
        let attached = state.vifs.entry(node_id.clone()).or_default();
        if attached.insert(vif_id.to_string()) {
            Ok(())
        } else {
            Err(ClientError::Conflict(format!(
                "VIF {vif_id} is already attached to node {node_id}"
            )))
        }
    }

    async fn detach_vif(&self, node_id: &NodeId, vif_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.record(Call::DetachVif(node_id.clone(), vif_id.to_string()))?;
        let removed = state
            .vifs
            .get_mut(node_id)
            .is_some_and(|set| set.remove(vif_id));
        if removed {
            Ok(())
        } else {
            Err(ClientError::NotFound(format!(
                "VIF {vif_id} is not attached to node {node_id}"
            )))
        }
    }

    async fn list_ports(&self, node_id: &NodeId) -> Result<Vec<Port>> {
        let mut state = self.state.lock();
        state.record(Call::ListPorts(node_id.clone()))?;
        Ok(state.ports.get(node_id).cloned().unwrap_or_default())
    }

    async fn list_port_groups(&self, node_id: &NodeId) -> Result<Vec<PortGroup>> {
        let mut state = self.state.lock();
        state.record(Call::ListPortGroups(node_id.clone()))?;
        Ok(state.port_groups.get(node_id).cloned().unwrap_or_default())
    }

    async fn list_volume_connectors(&self, node_id: &NodeId) -> Result<Vec<VolumeConnector>> {
        let mut state = self.state.lock();
        state.record(Call::ListVolumeConnectors(node_id.clone()))?;
        Ok(state.connectors.get(node_id).cloned().unwrap_or_default())
    }

    async fn list_volume_targets(&self, node_id: &NodeId) -> Result<Vec<VolumeTarget>> {
        let mut state = self.state.lock();
        state.record(Call::ListVolumeTargets(node_id.clone()))?;
        Ok(state
            .targets
            .values()
            .filter(|t| t.node_uuid == node_id.as_str())
            .cloned()
            .collect())
    }

    async fn create_volume_target(&self, target: &NewVolumeTarget) -> Result<VolumeTarget> {
        let mut state = self.state.lock();
        state.record(Call::CreateVolumeTarget(target.clone()))?;
        state.next_target += 1;
        let created = VolumeTarget {
            uuid: format!("target-{}", state.next_target),
            node_uuid: target.node_uuid.clone(),
            volume_id: target.volume_id.clone(),
            volume_type: target.volume_type.clone(),
            boot_index: target.boot_index,
            properties: target.properties.clone(),
        };
        state.targets.insert(created.uuid.clone(), created.clone());
        Ok(created)
    }

    async fn delete_volume_target(&self, target_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.record(Call::DeleteVolumeTarget(target_id.to_string()))?;
        state
            .targets
            .remove(target_id)
            .map(|_| ())
            .ok_or_else(|| ClientError::NotFound(format!("volume target {target_id}")))
    }

    async fn get_console(&self, node_id: &NodeId) -> Result<ConsoleState> {
        let mut state = self.state.lock();
        state.record(Call::GetConsole(node_id.clone()))?;
        state.node_mut(node_id)?;
        let console = state.consoles.get(node_id).cloned().unwrap_or_default();
        Ok(ConsoleState {
            console_enabled: console.enabled,
            console_info: console.enabled.then_some(console.info),
        })
    }

    async fn enable_console(&self, node_id: &NodeId) -> Result<()> {
        let mut state = self.state.lock();
        state.record(Call::EnableConsole(node_id.clone()))?;
        state.node_mut(node_id)?;
        if state.console_follows_requests {
            state.consoles.entry(node_id.clone()).or_default().enabled = true;
        }
        Ok(())
    }

    async fn disable_console(&self, node_id: &NodeId) -> Result<()> {
        let mut state = self.state.lock();
        state.record(Call::DisableConsole(node_id.clone()))?;
        state.node_mut(node_id)?;
        if state.console_follows_requests {
            state.consoles.entry(node_id.clone()).or_default().enabled = false;
        }
        Ok(())
    }

    async fn inject_nmi(&self, node_id: &NodeId) -> Result<()> {
        let mut state = self.state.lock();
        state.record(Call::InjectNmi(node_id.clone()))?;
        state.node_mut(node_id).map(|_| ())
    }

    async fn validate_node(
        &self,
        node_id: &NodeId,
        required: Option<&[&str]>,
    ) -> Result<NodeValidation> {
        let mut state = self.state.lock();
        state.record(Call::ValidateNode(node_id.clone()))?;
        state.node_mut(node_id)?;
        let validation = state.validations.get(node_id).cloned().unwrap_or_else(|| {
            let mut ok = NodeValidation::default();
            for iface in ["boot", "deploy", "power", "storage"] {
                ok.insert(iface, true, None);
            }
            ok
        });
        check_required(&validation, required)?;
        Ok(validation)
    }
}
