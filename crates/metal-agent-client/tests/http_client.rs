//! HTTP client tests against a mock control plane.

use std::time::Duration;

use metal_agent_client::{
    ApiVersion, ClientConfig, ClientError, HttpControlClient, NodeListFilter, PowerAction,
    ProvisionArgs, ProvisionTarget, RemoteControlClient,
};
use metal_agent_core::{NodeId, PowerState, ProvisionState};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> HttpControlClient {
    HttpControlClient::new(ClientConfig {
        base_url: server.uri(),
        max_retries: 2,
        retry_interval: Duration::from_millis(10),
        ..ClientConfig::default()
    })
    .unwrap()
}

fn node_json(id: &str) -> serde_json::Value {
    json!({
        "uuid": id,
        "power_state": "power on",
        "target_power_state": null,
        "provision_state": "active",
        "target_provision_state": null,
        "instance_uuid": null,
        "properties": {"cpus": 8},
        "maintenance": false,
        "traits": null,
        "resource_class": "baremetal",
        "last_error": null
    })
}

fn fault(message: &str) -> serde_json::Value {
    json!({
        "error_message": json!({"faultstring": message, "debuginfo": null}).to_string()
    })
}

#[tokio::test]
async fn list_nodes_follows_pagination() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/nodes"))
        .and(query_param("marker", "n2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "nodes": [node_json("n3")]
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1/nodes"))
        .and(query_param("conductor_group", "rack-a"))
        .and(header("X-OpenStack-Ironic-API-Version", "1.82"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "nodes": [node_json("n1"), node_json("n2")],
            "next": format!("{}/v1/nodes?marker=n2", server.uri())
        })))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let filter = NodeListFilter {
        conductor_group: Some("rack-a".into()),
        ..NodeListFilter::minimal()
    };
    let nodes = client.list_nodes(&filter).await.unwrap();

    let ids: Vec<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
    assert_eq!(ids, ["n1", "n2", "n3"]);
    assert_eq!(nodes[0].power_state, Some(PowerState::PowerOn));
    assert_eq!(nodes[0].provision_state, Some(ProvisionState::Active));
    assert!(nodes[0].traits.is_empty());
}

#[tokio::test]
async fn get_node_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/nodes/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_json(fault("Node missing could not be found.")))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client
        .get_node(&NodeId::new("missing").unwrap(), &["uuid"])
        .await
        .unwrap_err();

    assert_eq!(
        err,
        ClientError::NotFound("Node missing could not be found.".into())
    );
}

#[tokio::test]
async fn locked_node_is_retried() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/v1/nodes/n1/states/power"))
        .respond_with(ResponseTemplate::new(409).set_body_json(fault("Node n1 is locked")))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("PUT"))
        .and(path("/v1/nodes/n1/states/power"))
        .and(body_json(json!({"target": "soft power off", "timeout": 30})))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    client
        .set_power_state(
            &NodeId::new("n1").unwrap(),
            PowerAction::SoftPowerOff,
            Some(Duration::from_secs(30)),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn conflict_without_retry_returns_immediately() {
    let server = MockServer::start().await;

    Mock::given(method("PATCH"))
        .and(path("/v1/nodes/n1"))
        .respond_with(ResponseTemplate::new(409).set_body_json(fault("Node n1 is associated")))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client
        .set_instance_association(
            &NodeId::new("n1").unwrap(),
            Some(metal_agent_core::InstanceId::generate()),
            false,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::Conflict(_)));
}

#[tokio::test]
async fn unavailable_exhausts_retries() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/v1/nodes/n1/management/inject_nmi"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client
        .inject_nmi(&NodeId::new("n1").unwrap())
        .await
        .unwrap_err();

    assert!(err.is_retriable());
}

#[tokio::test]
async fn provision_request_body() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/v1/nodes/n1/states/provision"))
        .and(body_json(json!({"target": "active", "configdrive": "H4sI"})))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    client
        .set_provision_state(
            &NodeId::new("n1").unwrap(),
            ProvisionTarget::Active,
            &ProvisionArgs {
                config_drive: Some("H4sI".into()),
                rescue_password: None,
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn version_discovery_is_cached() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "default_version": {"id": "v1", "version": "1.50", "min_version": "1.1"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    assert!(client.supports_version(ApiVersion::CONDUCTOR_GROUPS).await.unwrap());
    assert!(!client.supports_version(ApiVersion::SHARDS).await.unwrap());
}

#[tokio::test]
async fn validation_of_required_interfaces() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/nodes/n1/validate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "deploy": {"result": true, "reason": null},
            "power": {"result": false, "reason": "no BMC credentials"}
        })))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let node = NodeId::new("n1").unwrap();

    let validation = client.validate_node(&node, None).await.unwrap();
    assert!(!validation.passed("power"));

    let err = client
        .validate_node(&node, Some(&["power"]))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::BadRequest(msg) if msg.contains("no BMC credentials")));
}

fn impatient_client_for(server: &MockServer) -> HttpControlClient {
    HttpControlClient::new(ClientConfig {
        base_url: server.uri(),
        timeout: Duration::from_millis(100),
        max_retries: 2,
        retry_interval: Duration::from_millis(10),
        ..ClientConfig::default()
    })
    .unwrap()
}

#[tokio::test]
async fn timed_out_provision_request_is_not_resent() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/v1/nodes/n1/states/provision"))
        .respond_with(ResponseTemplate::new(202).set_delay(Duration::from_millis(500)))
        .expect(1)
        .mount(&server)
        .await;

    let client = impatient_client_for(&server);
    let err = client
        .set_provision_state(
            &NodeId::new("n1").unwrap(),
            ProvisionTarget::Active,
            &ProvisionArgs::default(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::Unavailable(_)));
}

#[tokio::test]
async fn timed_out_read_is_retried() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/nodes/n1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(node_json("n1"))
                .set_delay(Duration::from_millis(500)),
        )
        .expect(3)
        .mount(&server)
        .await;

    let client = impatient_client_for(&server);
    let err = client
        .get_node(&NodeId::new("n1").unwrap(), &["uuid"])
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::Unavailable(_)));
}

#[tokio::test]
async fn repeated_next_link_stops_listing() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/nodes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "nodes": [node_json("n1")],
            "next": format!("{}/v1/nodes?marker=n1", server.uri())
        })))
        .expect(2)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client
        .list_nodes(&NodeListFilter::minimal())
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::InvalidResponse(msg) if msg.contains("marker=n1")));
}
