//! Control-plane client for metal-agent.
//!
//! The driver never talks HTTP directly. It goes through the
//! [`RemoteControlClient`] trait, which has two implementations:
//!
//! - [`HttpControlClient`]: the REST client used in production. It sends the
//!   negotiated microversion on every request, follows pagination and retries
//!   locked / unavailable responses.
//! - `FakeControlClient` (behind the `test-utils` feature): an in-memory
//!   control plane that records calls and can be scripted to fail.
//!
//! # Example
//!
//! ```no_run
//! use metal_agent_client::{ClientConfig, HttpControlClient, NodeListFilter, RemoteControlClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpControlClient::new(ClientConfig {
//!     base_url: "http://ironic:6385".into(),
//!     ..ClientConfig::default()
//! })?;
//!
//! for node in client.list_nodes(&NodeListFilter::minimal()).await? {
//!     println!("{} -> {:?}", node.id, node.provision_state);
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod client;
pub mod error;
pub mod http;
pub mod types;
pub mod version;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use client::RemoteControlClient;
pub use error::{ClientError, Result};
pub use http::{ClientConfig, HttpControlClient};
pub use types::{
    ConsoleInfo, ConsoleState, InterfaceValidation, NewVolumeTarget, NodeListFilter,
    NodeValidation, PatchOp, Port, PortGroup, PowerAction, ProvisionArgs, ProvisionTarget,
    VolumeConnector, VolumeTarget,
};
pub use version::{ApiVersion, ParseVersionError};

#[cfg(any(test, feature = "test-utils"))]
pub use mock::{Call, FakeControlClient, Op};
