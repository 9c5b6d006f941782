//! HTTP implementation of [`RemoteControlClient`].
//!
//! Speaks the bare-metal REST API: every request carries the configured
//! microversion header, list calls follow `next` pagination links, and
//! conflict / unavailable responses are retried a bounded number of times.
//! Transport failures are retried for reads and for requests that never
//! connected.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use metal_agent_core::{InstanceId, Node, NodeId};
use parking_lot::Mutex;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::client::{check_required, RemoteControlClient};
use crate::error::{ClientError, Result};
use crate::types::{
    ConsoleState, NewVolumeTarget, NodeListFilter, NodeValidation, PatchOp, Port, PortGroup,
    PowerAction, ProvisionArgs, ProvisionTarget, VolumeConnector, VolumeTarget,
};
use crate::version::ApiVersion;

/// Header carrying the requested API microversion.
pub const VERSION_HEADER: &str = "X-OpenStack-Ironic-API-Version";

/// Header carrying the authentication token.
pub const AUTH_HEADER: &str = "X-Auth-Token";

/// Configuration for [`HttpControlClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the control plane, e.g. `http://ironic:6385`.
    pub base_url: String,
    /// Highest microversion this client speaks.
    pub api_version: ApiVersion,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Retries for conflict / unavailable responses.
    pub max_retries: u32,
    /// Delay between retries.
    pub retry_interval: Duration,
    /// Optional authentication token.
    pub auth_token: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:6385".to_string(),
            api_version: ApiVersion::SHARDS,
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            max_retries: 6,
            retry_interval: Duration::from_secs(2),
            auth_token: None,
        }
    }
}

/// HTTP client for the bare-metal control plane.
#[derive(Debug)]
pub struct HttpControlClient {
    client: reqwest::Client,
    config: ClientConfig,
    server_max: Mutex<Option<ApiVersion>>,
}

impl HttpControlClient {
    /// Create a new client.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::InvalidResponse` if the HTTP client cannot be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ClientError::InvalidResponse(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(client, config))
    }

    /// Create a new client with a custom reqwest client.
    #[must_use]
    pub fn with_client(client: reqwest::Client, mut config: ClientConfig) -> Self {
        config.base_url = config.base_url.trim_end_matches('/').to_string();
        Self {
            client,
            config,
            server_max: Mutex::new(None),
        }
    }

    /// Get the base URL of the control plane.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.request_url(method, &format!("{}{path}", self.config.base_url))
    }

    fn request_url(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header(VERSION_HEADER, self.config.api_version.to_string());
        match &self.config.auth_token {
            Some(token) => builder.header(AUTH_HEADER, token),
            None => builder,
        }
    }

    async fn execute<F>(&self, build: F, retry_on_conflict: bool) -> Result<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder + Send + Sync,
    {
        // A request that may have reached the server is only resent when
        // repeating it cannot change state.
        let safe = build().build().is_ok_and(|request| request.method().is_safe());
        let mut attempt = 0;
        loop {
            let (error, retry) = match build().send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let error = error_from_response(response).await;
                    let retry = match &error {
                        ClientError::Conflict(_) => retry_on_conflict,
                        ClientError::Unavailable(_) => true,
                        _ => false,
                    };
                    (error, retry)
                }
                Err(e) => (
                    ClientError::Unavailable(format!("request failed: {e}")),
                    safe || e.is_connect(),
                ),
            };
            if !retry || attempt >= self.config.max_retries {
                return Err(error);
            }

            attempt += 1;
            warn!(
                attempt,
                max_retries = self.config.max_retries,
                error = %error,
                "Retrying control plane request"
            );
            tokio::time::sleep(self.config.retry_interval).await;
        }
    }

    async fn list<T>(&self, path: &str, key: &str, query: &[(&str, String)]) -> Result<Vec<T>>
    where
        T: DeserializeOwned + Send,
    {
        let mut items = Vec::new();
        let mut seen = HashSet::new();
        let mut next: Option<String> = None;
        loop {
            let response = match &next {
                None => {
                    self.execute(|| self.request(Method::GET, path).query(query), true)
                        .await?
                }
                Some(url) => self.execute(|| self.request_url(Method::GET, url), true).await?,
            };
            let mut page: serde_json::Map<String, serde_json::Value> =
                response.json().await.map_err(decode_error)?;
            let batch = page
                .remove(key)
                .unwrap_or_else(|| serde_json::Value::Array(Vec::new()));
            let batch: Vec<T> = serde_json::from_value(batch).map_err(decode_error)?;
            items.extend(batch);

            next = page
                .remove("next")
                .and_then(|v| v.as_str().map(ToString::to_string));
            match &next {
                None => return Ok(items),
                Some(url) if !seen.insert(url.clone()) => {
                    return Err(ClientError::InvalidResponse(format!(
                        "pagination repeated next link {url}"
                    )));
                }
                Some(_) => {}
            }
        }
    }

    async fn put_json<B>(&self, path: &str, body: &B, retry_on_conflict: bool) -> Result<()>
    where
        B: Serialize + Sync,
    {
        self.execute(|| self.request(Method::PUT, path).json(body), retry_on_conflict)
            .await?;
        Ok(())
    }

    async fn server_max_version(&self) -> Result<ApiVersion> {
        let cached = *self.server_max.lock();
        if let Some(version) = cached {
            return Ok(version);
        }

        let response = self.execute(|| self.request(Method::GET, "/"), false).await?;
        let root: RootDocument = response.json().await.map_err(decode_error)?;
        let version = root.default_version.version;
        debug!(version = %version, "Discovered control plane maximum API version");
        *self.server_max.lock() = Some(version);
        Ok(version)
    }
}

#[derive(Debug, Deserialize)]
struct RootDocument {
    default_version: VersionDocument,
}

#[derive(Debug, Deserialize)]
struct VersionDocument {
    version: ApiVersion,
}

#[derive(Debug, Serialize)]
struct ProvisionBody<'a> {
    target: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    configdrive: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rescue_password: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct PowerBody {
    target: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout: Option<u64>,
}

#[derive(Debug, Serialize)]
struct VifBody<'a> {
    id: &'a str,
}

#[derive(Debug, Serialize)]
struct ConsoleBody {
    enabled: bool,
}

/// Error payload: `error_message` is itself a JSON document with a `faultstring`.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error_message: String,
}

#[derive(Debug, Deserialize)]
struct Fault {
    faultstring: String,
}

fn extract_fault(body: &str) -> Option<String> {
    let outer: ErrorBody = serde_json::from_str(body).ok()?;
    Some(
        serde_json::from_str::<Fault>(&outer.error_message)
            .map_or(outer.error_message, |fault| fault.faultstring),
    )
}

async fn error_from_response(response: reqwest::Response) -> ClientError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let message = extract_fault(&body).unwrap_or_else(|| {
        if body.is_empty() {
            format!("control plane returned status {status}")
        } else {
            body
        }
    });
    ClientError::from_status(status, message)
}

#[allow(clippy::needless_pass_by_value)]
fn decode_error(e: impl std::fmt::Display) -> ClientError {
    ClientError::InvalidResponse(format!("failed to decode response: {e}"))
}

#[async_trait]
impl RemoteControlClient for HttpControlClient {
    async fn supports_version(&self, version: ApiVersion) -> Result<bool> {
        let negotiated = self.server_max_version().await?.min(self.config.api_version);
        Ok(version <= negotiated)
    }

    async fn list_nodes(&self, filter: &NodeListFilter) -> Result<Vec<Node>> {
        self.list("/v1/nodes", "nodes", &filter.query_pairs()).await
    }

    async fn get_node(&self, node_id: &NodeId, fields: &[&str]) -> Result<Node> {
        let path = format!("/v1/nodes/{node_id}");
        let query: Vec<(&str, String)> = if fields.is_empty() {
            Vec::new()
        } else {
            vec![("fields", fields.join(","))]
        };
        let response = self
            .execute(|| self.request(Method::GET, &path).query(&query), true)
            .await?;
        response.json().await.map_err(decode_error)
    }

    async fn update_node_fields(&self, node_id: &NodeId, patch: &[PatchOp]) -> Result<Node> {
        let path = format!("/v1/nodes/{node_id}");
        let response = self
            .execute(|| self.request(Method::PATCH, &path).json(patch), true)
            .await?;
        response.json().await.map_err(decode_error)
    }

    async fn set_instance_association(
        &self,
        node_id: &NodeId,
        instance_id: Option<InstanceId>,
        retry_on_conflict: bool,
    ) -> Result<Node> {
        let path = format!("/v1/nodes/{node_id}");
        let patch = match instance_id {
            Some(id) => vec![PatchOp::add("/instance_uuid", serde_json::json!(id.to_string()))],
            None => vec![PatchOp::remove("/instance_uuid")],
        };
        let response = self
            .execute(
                || self.request(Method::PATCH, &path).json(&patch),
                retry_on_conflict,
            )
            .await?;
        response.json().await.map_err(decode_error)
    }

    async fn set_provision_state(
        &self,
        node_id: &NodeId,
        target: ProvisionTarget,
        args: &ProvisionArgs,
    ) -> Result<()> {
        let body = ProvisionBody {
            target: target.as_str(),
            configdrive: args.config_drive.as_deref(),
            rescue_password: args.rescue_password.as_deref(),
        };
        self.put_json(&format!("/v1/nodes/{node_id}/states/provision"), &body, true)
            .await
    }

    async fn set_power_state(
        &self,
        node_id: &NodeId,
        action: PowerAction,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let body = PowerBody {
            target: action.as_str(),
            timeout: timeout.map(|t| t.as_secs()),
        };
        self.put_json(&format!("/v1/nodes/{node_id}/states/power"), &body, true)
            .await
    }

    async fn attach_vif(
        &self,
        node_id: &NodeId,
        vif_id: &str,
        retry_on_conflict: bool,
    ) -> Result<()> {
        let path = format!("/v1/nodes/{node_id}/vifs");
        let body = VifBody { id: vif_id };
        self.execute(
            || self.request(Method::POST, &path).json(&body),
            retry_on_conflict,
        )
        .await?;
        Ok(())
    }

    async fn detach_vif(&self, node_id: &NodeId, vif_id: &str) -> Result<()> {
        let path = format!("/v1/nodes/{node_id}/vifs/{vif_id}");
        self.execute(|| self.request(Method::DELETE, &path), true)
            .await?;
        Ok(())
    }

    async fn list_ports(&self, node_id: &NodeId) -> Result<Vec<Port>> {
        let query = [
            ("node", node_id.to_string()),
            ("fields", "uuid,address,internal_info".to_string()),
        ];
        self.list("/v1/ports", "ports", &query).await
    }

    async fn list_port_groups(&self, node_id: &NodeId) -> Result<Vec<PortGroup>> {
        let query = [
            ("node", node_id.to_string()),
            ("fields", "uuid,address,internal_info".to_string()),
        ];
        self.list("/v1/portgroups", "portgroups", &query).await
    }

    async fn list_volume_connectors(&self, node_id: &NodeId) -> Result<Vec<VolumeConnector>> {
        let query = [("node", node_id.to_string()), ("detail", "true".to_string())];
        self.list("/v1/volume/connectors", "connectors", &query)
            .await
    }

    async fn list_volume_targets(&self, node_id: &NodeId) -> Result<Vec<VolumeTarget>> {
        let query = [("node", node_id.to_string()), ("detail", "true".to_string())];
        self.list("/v1/volume/targets", "targets", &query).await
    }

    async fn create_volume_target(&self, target: &NewVolumeTarget) -> Result<VolumeTarget> {
        let response = self
            .execute(
                || self.request(Method::POST, "/v1/volume/targets").json(target),
                true,
            )
            .await?;
        response.json().await.map_err(decode_error)
    }

    async fn delete_volume_target(&self, target_id: &str) -> Result<()> {
        let path = format!("/v1/volume/targets/{target_id}");
        self.execute(|| self.request(Method::DELETE, &path), true)
            .await?;
        Ok(())
    }

    async fn get_console(&self, node_id: &NodeId) -> Result<ConsoleState> {
        let path = format!("/v1/nodes/{node_id}/states/console");
        let response = self
            .execute(|| self.request(Method::GET, &path), true)
            .await?;
        response.json().await.map_err(decode_error)
    }

    async fn enable_console(&self, node_id: &NodeId) -> Result<()> {
        self.put_json(
            &format!("/v1/nodes/{node_id}/states/console"),
            &ConsoleBody { enabled: true },
            true,
        )
        .await
    }

    async fn disable_console(&self, node_id: &NodeId) -> Result<()> {
        self.put_json(
            &format!("/v1/nodes/{node_id}/states/console"),
            &ConsoleBody { enabled: false },
            true,
        )
        .await
    }

    async fn inject_nmi(&self, node_id: &NodeId) -> Result<()> {
        self.put_json(
            &format!("/v1/nodes/{node_id}/management/inject_nmi"),
            &serde_json::json!({}),
            true,
        )
        .await
    }

    async fn validate_node(
        &self,
        node_id: &NodeId,
        required: Option<&[&str]>,
    ) -> Result<NodeValidation> {
        let path = format!("/v1/nodes/{node_id}/validate");
        let response = self
            .execute(|| self.request(Method::GET, &path), true)
            .await?;
        let validation: NodeValidation = response.json().await.map_err(decode_error)?;
        check_required(&validation, required)?;
        Ok(validation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_client_creation() {
        let client = HttpControlClient::new(ClientConfig {
            base_url: "http://localhost:6385/".to_string(),
            ..ClientConfig::default()
        })
        .unwrap();
        assert_eq!(client.base_url(), "http://localhost:6385");
    }

    #[test]
    fn fault_extraction() {
        let body = r#"{"error_message": "{\"faultstring\": \"Node abc is locked\", \"debuginfo\": null}"}"#;
        assert_eq!(extract_fault(body).as_deref(), Some("Node abc is locked"));

        let plain = r#"{"error_message": "plain text"}"#;
        assert_eq!(extract_fault(plain).as_deref(), Some("plain text"));

        assert!(extract_fault("<html>bad gateway</html>").is_none());
    }
}
