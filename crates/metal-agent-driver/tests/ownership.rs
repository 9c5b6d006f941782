//! Node ownership across agent hosts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metal_agent_client::{ClientError, FakeControlClient, Op};
use metal_agent_core::{HostName, InstanceId, Node, NodeId, ProvisionState};
use metal_agent_driver::{
    AgentConfig, BareMetalDriver, ComputeDriver, DriverError, HashRing, InMemoryServiceRegistry,
    InMemoryWorkloadRegistry, ServiceRegistry, Workload,
};

fn host(name: &str) -> HostName {
    HostName::new(name).unwrap()
}

fn nid(id: &str) -> NodeId {
    NodeId::new(id).unwrap()
}

struct Harness {
    fake: Arc<FakeControlClient>,
    services: Arc<InMemoryServiceRegistry>,
    workloads: Arc<InMemoryWorkloadRegistry>,
    driver: BareMetalDriver,
}

fn harness(config: AgentConfig) -> Harness {
    let fake = Arc::new(FakeControlClient::new());
    let services = Arc::new(InMemoryServiceRegistry::with_hosts(
        &config.hypervisor_type,
        [&config.host],
    ));
    let workloads = Arc::new(InMemoryWorkloadRegistry::new());
    let driver = BareMetalDriver::new(
        Arc::new(config),
        fake.clone(),
        services.clone(),
        workloads.clone(),
    );
    Harness {
        fake,
        services,
        workloads,
        driver,
    }
}

fn add_unbound_nodes(fake: &FakeControlClient, count: usize) {
    for i in 0..count {
        let mut node = Node::new(nid(&format!("node-{i}")));
        node.provision_state = Some(ProvisionState::Available);
        fake.insert_node(node);
    }
}

#[tokio::test]
async fn single_host_manages_every_unbound_node() {
    let h = harness(AgentConfig::for_host(host("compute-1")));
    add_unbound_nodes(&h.fake, 10);

    h.driver.init_host().await.unwrap();

    assert_eq!(h.driver.get_available_nodes(false).await.unwrap().len(), 10);
    assert!(h.driver.cache().is_ready());
}

#[tokio::test]
async fn unbound_nodes_split_by_ring_owner() {
    let h = harness(AgentConfig::for_host(host("compute-1")));
    h.services.register(host("compute-2"), "ironic");
    add_unbound_nodes(&h.fake, 40);

    let managed = h.driver.get_available_nodes(true).await.unwrap();

    let ring = HashRing::new([host("compute-1"), host("compute-2")]);
    let expected: Vec<NodeId> = (0..40)
        .map(|i| nid(&format!("node-{i}")))
        .filter(|id| ring.owns(&host("compute-1"), id.as_str()))
        .collect();
    let mut managed_sorted = managed.clone();
    managed_sorted.sort();
    let mut expected_sorted = expected;
    expected_sorted.sort();
    assert_eq!(managed_sorted, expected_sorted);
    assert!(!managed.is_empty());
    assert!(managed.len() < 40);
}

#[tokio::test]
async fn dead_hosts_leave_the_ring() {
    let h = harness(AgentConfig::for_host(host("compute-1")));
    h.services.register(host("compute-2"), "ironic");
    h.services.set_alive(&host("compute-2"), false);
    add_unbound_nodes(&h.fake, 20);

    let managed = h.driver.get_available_nodes(true).await.unwrap();

    assert_eq!(managed.len(), 20);
    assert_eq!(h.driver.partitioner().ring().len(), 1);
}

#[tokio::test]
async fn bound_nodes_follow_their_workload() {
    let h = harness(AgentConfig::for_host(host("compute-1")));
    h.services.register(host("compute-2"), "ironic");

    let ours = Workload::new(InstanceId::generate(), "ours", host("compute-1"), nid("bound-ours"));
    let theirs = Workload::new(InstanceId::generate(), "theirs", host("compute-2"), nid("bound-theirs"));
    h.workloads.insert(ours.clone());
    h.workloads.insert(theirs.clone());

    for (node_id, instance_id) in [("bound-ours", ours.id), ("bound-theirs", theirs.id)] {
        let mut node = Node::new(nid(node_id));
        node.provision_state = Some(ProvisionState::Active);
        node.instance_id = Some(instance_id);
        h.fake.insert_node(node);
    }

    let managed = h.driver.get_available_nodes(true).await.unwrap();

    assert!(managed.contains(&nid("bound-ours")));
    assert!(!managed.contains(&nid("bound-theirs")));
    assert_eq!(h.driver.list_instance_ids().await.unwrap(), vec![ours.id]);
    assert_eq!(h.driver.list_instances().await.unwrap(), vec!["ours".to_string()]);
}

#[tokio::test]
async fn failed_refresh_keeps_previous_snapshot() {
    let h = harness(AgentConfig::for_host(host("compute-1")));
    add_unbound_nodes(&h.fake, 3);
    h.driver.init_host().await.unwrap();

    h.fake.fail_next(Op::ListNodes, ClientError::Unavailable("down".into()));
    let err = h.driver.get_available_nodes(true).await.unwrap_err();

    assert!(matches!(err, DriverError::DriverNotReady(_)));
    let snapshot = h.driver.cache().snapshot();
    assert_eq!(snapshot.len(), 3);
    assert_eq!(snapshot.generation(), 1);
}

#[tokio::test(start_paused = true)]
async fn stale_cache_is_refreshed_on_read() {
    let mut config = AgentConfig::for_host(host("compute-1"));
    config.cache_ttl = Duration::from_secs(30);
    let h = harness(config);
    add_unbound_nodes(&h.fake, 2);
    h.driver.init_host().await.unwrap();

    add_unbound_nodes(&h.fake, 4);
    assert_eq!(h.driver.get_available_nodes(false).await.unwrap().len(), 2);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(h.driver.get_available_nodes(false).await.unwrap().len(), 4);
}

#[tokio::test]
async fn node_availability_falls_back_to_the_control_plane() {
    let h = harness(AgentConfig::for_host(host("compute-1")));
    h.services.register(host("compute-2"), "ironic");
    add_unbound_nodes(&h.fake, 40);
    h.driver.init_host().await.unwrap();

    let ring = HashRing::new([host("compute-1"), host("compute-2")]);
    let foreign = (0..40)
        .map(|i| nid(&format!("node-{i}")))
        .find(|id| !ring.owns(&host("compute-1"), id.as_str()))
        .unwrap();

    let listed = h.fake.count(Op::ListNodes);
    assert!(h.driver.node_is_available(&foreign).await.unwrap());
    for _ in 0..5 {
        assert!(!h.driver.node_is_available(&nid("missing")).await.unwrap());
    }
    assert_eq!(h.fake.count(Op::GetNode), 6);
    assert_eq!(h.fake.count(Op::ListNodes), listed);
}

#[tokio::test]
async fn node_availability_refreshes_an_empty_cache() {
    let h = harness(AgentConfig::for_host(host("compute-1")));
    add_unbound_nodes(&h.fake, 3);

    assert!(h.driver.node_is_available(&nid("node-1")).await.unwrap());
    assert_eq!(h.fake.count(Op::ListNodes), 1);
    assert_eq!(h.fake.count(Op::GetNode), 0);
}

#[tokio::test]
async fn unreachable_control_plane_on_direct_fetch_is_not_ready() {
    let h = harness(AgentConfig::for_host(host("compute-1")));
    add_unbound_nodes(&h.fake, 2);
    h.driver.init_host().await.unwrap();

    h.fake.fail_next(
        Op::GetNode,
        ClientError::Unavailable("connection refused".into()),
    );
    let err = h
        .driver
        .get_available_resource(&nid("uncached"))
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::DriverNotReady(_)));

    h.fake.fail_next(Op::GetNode, ClientError::Unauthorized("token expired".into()));
    let err = h.driver.node_is_available(&nid("uncached")).await.unwrap_err();
    assert!(matches!(err, DriverError::DriverNotReady(_)));
}

#[tokio::test]
async fn unreachable_control_plane_on_instance_lookup_is_not_ready() {
    let h = harness(AgentConfig::for_host(host("compute-1")));
    let workload = Workload::new(InstanceId::generate(), "vm", host("compute-1"), nid("node-0"));
    h.workloads.insert(workload.clone());

    h.fake.fail_next(
        Op::ListNodes,
        ClientError::Unavailable("connection refused".into()),
    );
    let err = h.driver.destroy(&workload, &[]).await.unwrap_err();

    assert!(matches!(err, DriverError::DriverNotReady(_)));
}

#[tokio::test]
async fn conductor_group_requires_a_peer_list() {
    let mut config = AgentConfig::for_host(host("compute-1"));
    config.conductor_group = Some("rack-a".into());
    let h = harness(config);

    let err = h.driver.init_host().await.unwrap_err();

    assert!(matches!(err, DriverError::InvalidPeerList(_)));
    assert_eq!(h.fake.count(Op::ListNodes), 0);
}

#[tokio::test]
async fn conductor_group_limits_ring_to_peers() {
    let mut config = AgentConfig::for_host(host("compute-1"));
    config.conductor_group = Some("rack-a".into());
    config.peer_list = vec![host("compute-1"), host("compute-2")];
    let h = harness(config);
    h.services.register(host("compute-2"), "ironic");
    h.services.register(host("compute-3"), "ironic");

    h.driver.init_host().await.unwrap();

    let ring = h.driver.partitioner().ring();
    assert_eq!(ring.len(), 2);
    assert!(!ring.hosts().contains(&host("compute-3")));

    let listed = h.fake.calls_of(Op::ListNodes);
    assert!(listed.iter().any(|call| matches!(
        call,
        metal_agent_client::Call::ListNodes(filter) if filter.conductor_group.as_deref() == Some("rack-a")
    )));
}

#[tokio::test]
async fn shard_limits_ring_to_same_shard_hosts() {
    let mut config = AgentConfig::for_host(host("compute-1"));
    config.shard = Some("shard-1".into());
    let h = harness(config);
    h.services.register(host("compute-2"), "ironic");
    h.services.register(host("compute-3"), "ironic");
    h.services.set_shard(&host("compute-2"), Some("shard-1"));
    h.services.set_shard(&host("compute-3"), Some("shard-2"));

    h.driver.init_host().await.unwrap();

    let ring = h.driver.partitioner().ring();
    assert!(ring.hosts().contains(&host("compute-2")));
    assert!(!ring.hosts().contains(&host("compute-3")));
}

/// Registry whose shard lookups fail for one host.
struct BrokenShardLookup {
    inner: InMemoryServiceRegistry,
    broken: HostName,
}

#[async_trait]
impl ServiceRegistry for BrokenShardLookup {
    async fn list_hosts_of_type(&self, hypervisor_type: &str) -> metal_agent_driver::Result<Vec<HostName>> {
        self.inner.list_hosts_of_type(hypervisor_type).await
    }

    async fn is_alive(&self, host: &HostName) -> metal_agent_driver::Result<bool> {
        self.inner.is_alive(host).await
    }

    async fn host_shard(&self, host: &HostName) -> metal_agent_driver::Result<Option<String>> {
        if *host == self.broken {
            return Err(DriverError::Registry("shard lookup timed out".into()));
        }
        self.inner.host_shard(host).await
    }
}

#[tokio::test]
async fn failed_shard_lookup_excludes_only_that_host() {
    let mut config = AgentConfig::for_host(host("compute-1"));
    config.shard = Some("shard-1".into());
    let inner = InMemoryServiceRegistry::with_hosts(&config.hypervisor_type, [&config.host]);
    for name in ["compute-2", "compute-3"] {
        inner.register(host(name), "ironic");
        inner.set_shard(&host(name), Some("shard-1"));
    }
    let services = Arc::new(BrokenShardLookup {
        inner,
        broken: host("compute-2"),
    });
    let fake = Arc::new(FakeControlClient::new());
    add_unbound_nodes(&fake, 5);
    let driver = BareMetalDriver::new(
        Arc::new(config),
        fake,
        services,
        Arc::new(InMemoryWorkloadRegistry::new()),
    );

    driver.init_host().await.unwrap();

    let ring = driver.partitioner().ring();
    assert!(ring.hosts().contains(&host("compute-1")));
    assert!(ring.hosts().contains(&host("compute-3")));
    assert!(!ring.hosts().contains(&host("compute-2")));
}
