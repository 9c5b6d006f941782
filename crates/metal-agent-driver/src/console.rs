//! Serial console sessions.
//!
//! Console mode changes complete asynchronously on the control plane, so the
//! controller never trusts the mutation call: it polls the reported mode with
//! backoff until it matches, bounded by an overall timeout.
//!
//! Acquiring a session resets the console: disable, then enable, then poll
//! until enabled. The reset gives a fresh endpoint regardless of the mode the
//! node started in.

use std::sync::Arc;
use std::time::Duration;

use metal_agent_client::{ConsoleInfo, RemoteControlClient};
use metal_agent_core::NodeId;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{DriverError, Result};
use crate::lifecycle::{Backoff, WaitLoop};

/// Jitter applied to console poll delays.
const POLL_JITTER: f64 = 0.5;

/// Console type served as a serial endpoint.
const SOCAT_CONSOLE: &str = "socat";

/// A TCP endpoint for a serial console.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialEndpoint {
    /// Host name or IP address, IPv6 literals without brackets.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

/// Drives console mode transitions for nodes.
pub struct ConsoleSessionController {
    client: Arc<dyn RemoteControlClient>,
    state_timeout: Duration,
    poll_interval: Duration,
}

impl ConsoleSessionController {
    /// Create a controller.
    #[must_use]
    pub fn new(
        client: Arc<dyn RemoteControlClient>,
        state_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            client,
            state_timeout,
            poll_interval,
        }
    }

    /// Reset the console and return its endpoint once enabled.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::ConsoleNotAvailable` if either mode change is
    /// rejected, the console state cannot be read, or the console does not
    /// become enabled in time.
    pub async fn acquire(&self, node_id: &NodeId) -> Result<ConsoleInfo> {
        let disabled = self.client.disable_console(node_id).await;
        if let Err(e) = &disabled {
            error!(node_id = %node_id, error = %e, "Failed to set console mode to disabled");
        }
        let enabled = self.client.enable_console(node_id).await;
        if let Err(e) = &enabled {
            error!(node_id = %node_id, error = %e, "Failed to set console mode to enabled");
        }
        if disabled.is_err() || enabled.is_err() {
            return Err(DriverError::ConsoleNotAvailable(format!(
                "Failed to set console mode for node {node_id}"
            )));
        }

        let info = self.await_mode(node_id, true).await?;
        let info = info.ok_or_else(|| {
            DriverError::ConsoleNotAvailable(format!(
                "Console for node {node_id} is enabled but reports no endpoint"
            ))
        })?;
        info!(node_id = %node_id, console_type = %info.console_type, "Console enabled");
        Ok(info)
    }

    /// Disable the console and wait until the node reports it disabled.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::ConsoleNotAvailable` if the request is rejected
    /// or the console does not become disabled in time.
    pub async fn release(&self, node_id: &NodeId) -> Result<()> {
        self.client.disable_console(node_id).await.map_err(|e| {
            error!(node_id = %node_id, error = %e, "Failed to set console mode to disabled");
            DriverError::ConsoleNotAvailable(format!(
                "Failed to set console mode for node {node_id}"
            ))
        })?;
        self.await_mode(node_id, false).await?;
        Ok(())
    }

    async fn await_mode(&self, node_id: &NodeId, enabled: bool) -> Result<Option<ConsoleInfo>> {
        let client = &self.client;
        let wait = WaitLoop::new(
            format!("console of node {node_id} to become {}", mode_name(enabled)),
            self.poll_interval,
        )
        .with_backoff(Backoff::exponential(
            self.poll_interval,
            self.state_timeout,
            POLL_JITTER,
        ))
        .with_timeout(Some(self.state_timeout));

        let result = wait
            .poll_until(move || async move {
                let state = client.get_console(node_id).await.map_err(|e| {
                    error!(node_id = %node_id, error = %e, "Failed to acquire console information");
                    DriverError::ConsoleNotAvailable(format!(
                        "Failed to acquire console information for node {node_id}: {e}"
                    ))
                })?;
                Ok((state.console_enabled == enabled).then_some(state.console_info))
            })
            .await;

        match result {
            Err(DriverError::WaitTimeout(_)) => {
                error!(
                    node_id = %node_id,
                    timeout = ?self.state_timeout,
                    "Timeout while waiting for console mode to be set to {}",
                    mode_name(enabled)
                );
                Err(DriverError::ConsoleNotAvailable(format!(
                    "Timeout while waiting for console mode of node {node_id}"
                )))
            }
            other => other,
        }
    }
}

const fn mode_name(enabled: bool) -> &'static str {
    if enabled {
        "enabled"
    } else {
        "disabled"
    }
}

/// Extract a serial endpoint from a console description.
///
/// # Errors
///
/// Returns `DriverError::ConsoleTypeUnavailable` for anything but a `socat`
/// console with a `tcp://host:port` URL.
pub fn parse_serial_endpoint(node_id: &NodeId, info: &ConsoleInfo) -> Result<SerialEndpoint> {
    if info.console_type != SOCAT_CONSOLE {
        warn!(
            node_id = %node_id,
            console_type = %info.console_type,
            "Console type is not supported as a serial console"
        );
        return Err(DriverError::ConsoleTypeUnavailable(info.console_type.clone()));
    }

    let invalid = |reason: &str| {
        warn!(node_id = %node_id, url = %info.url, reason, "Invalid Socat console URL");
        DriverError::ConsoleTypeUnavailable(format!("Invalid Socat console URL: {}", info.url))
    };

    let url = Url::parse(&info.url).map_err(|_| invalid("unparsable"))?;
    if url.scheme() != "tcp" {
        warn!(node_id = %node_id, scheme = url.scheme(), "Socat console URL has unsupported scheme");
        return Err(DriverError::ConsoleTypeUnavailable(format!(
            "unsupported scheme {}",
            url.scheme()
        )));
    }
    let host = match url.host_str() {
        Some(host) if !host.is_empty() => host.trim_start_matches('[').trim_end_matches(']'),
        _ => return Err(invalid("missing host")),
    };
    let port = url.port().ok_or_else(|| invalid("missing port"))?;

    Ok(SerialEndpoint {
        host: host.to_string(),
        port,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use metal_agent_client::{FakeControlClient, Op};
    use metal_agent_core::Node;

    use super::*;

    fn socat(url: &str) -> ConsoleInfo {
        ConsoleInfo {
            console_type: "socat".into(),
            url: url.into(),
        }
    }

    fn node_id() -> NodeId {
        NodeId::new("n1").unwrap()
    }

    fn controller(client: &Arc<FakeControlClient>) -> ConsoleSessionController {
        ConsoleSessionController::new(
            Arc::clone(client) as Arc<dyn RemoteControlClient>,
            Duration::from_secs(10),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn parses_ipv4_endpoint() {
        let endpoint = parse_serial_endpoint(&node_id(), &socat("tcp://127.0.0.1:10000")).unwrap();
        assert_eq!(endpoint.host, "127.0.0.1");
        assert_eq!(endpoint.port, 10000);
    }

    #[test]
    fn parses_ipv6_endpoint_without_brackets() {
        let endpoint = parse_serial_endpoint(&node_id(), &socat("tcp://[::1]:10000")).unwrap();
        assert_eq!(endpoint.host, "::1");
        assert_eq!(endpoint.port, 10000);
    }

    #[test]
    fn rejects_other_consoles() {
        let shellinabox = ConsoleInfo {
            console_type: "shellinabox".into(),
            url: "http://127.0.0.1:4201".into(),
        };
        assert!(matches!(
            parse_serial_endpoint(&node_id(), &shellinabox),
            Err(DriverError::ConsoleTypeUnavailable(_))
        ));
        assert!(parse_serial_endpoint(&node_id(), &socat("http://127.0.0.1:10000")).is_err());
        assert!(parse_serial_endpoint(&node_id(), &socat("tcp://127.0.0.1")).is_err());
        assert!(parse_serial_endpoint(&node_id(), &socat("not a url")).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_resets_console() {
        let client = Arc::new(FakeControlClient::new());
        client.insert_node(Node::new(node_id()));
        client.set_console(&node_id(), true, "socat", "tcp://10.0.0.5:8023");

        let info = controller(&client).acquire(&node_id()).await.unwrap();

        assert_eq!(info.url, "tcp://10.0.0.5:8023");
        assert_eq!(client.count(Op::DisableConsole), 1);
        assert_eq!(client.count(Op::EnableConsole), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_times_out_when_console_never_enables() {
        let client = Arc::new(FakeControlClient::new());
        client.insert_node(Node::new(node_id()));
        client.set_console_follows_requests(false);

        let err = controller(&client).acquire(&node_id()).await.unwrap_err();

        assert!(matches!(err, DriverError::ConsoleNotAvailable(msg) if msg.contains("Timeout")));
        assert_eq!(client.count(Op::DisableConsole), 1);
        assert_eq!(client.count(Op::EnableConsole), 1);
        assert!(client.count(Op::GetConsole) > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_mode_change_is_reported() {
        let client = Arc::new(FakeControlClient::new());
        client.insert_node(Node::new(node_id()));
        client.fail_next(
            Op::EnableConsole,
            metal_agent_client::ClientError::BadRequest("no console interface".into()),
        );

        let err = controller(&client).acquire(&node_id()).await.unwrap_err();

        assert!(matches!(err, DriverError::ConsoleNotAvailable(_)));
        assert_eq!(client.count(Op::DisableConsole), 1);
        assert_eq!(client.count(Op::GetConsole), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn release_waits_for_disabled() {
        let client = Arc::new(FakeControlClient::new());
        client.insert_node(Node::new(node_id()));
        client.set_console(&node_id(), true, "socat", "tcp://10.0.0.5:8023");

        controller(&client).release(&node_id()).await.unwrap();

        assert!(!client.get_console(&node_id()).await.unwrap().console_enabled);
    }
}
