//! Bare-metal compute driver for metal-agent.
//!
//! This crate decides which bare-metal nodes each agent host manages and
//! drives workloads through their lifecycle on those nodes:
//!
//! - [`HashPartitioner`]: consistent-hash ring over the live agent hosts
//! - [`NodeCache`]: atomically published view of the nodes this host owns
//! - [`WaitLoop`]: bounded polling until a node converges
//! - [`ConsoleSessionController`]: serial console resets and endpoint parsing
//! - [`InventoryMapper`]: node properties to schedulable inventory
//! - [`BareMetalDriver`]: the [`ComputeDriver`] tying them together
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use metal_agent_client::HttpControlClient;
//! use metal_agent_driver::{
//!     AgentConfig, BareMetalDriver, ComputeDriver, InMemoryServiceRegistry,
//!     InMemoryWorkloadRegistry,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Arc::new(AgentConfig::from_env());
//! let client = Arc::new(HttpControlClient::new(config.client_config())?);
//! let services = Arc::new(InMemoryServiceRegistry::with_hosts(
//!     &config.hypervisor_type,
//!     [&config.host],
//! ));
//! let workloads = Arc::new(InMemoryWorkloadRegistry::new());
//!
//! let driver = BareMetalDriver::new(config, client, services, workloads);
//! driver.init_host().await?;
//! for node_id in driver.get_available_nodes(false).await? {
//!     println!("managing {node_id}");
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod cache;
pub mod config;
pub mod console;
pub mod driver;
pub mod error;
pub mod hash_ring;
pub mod inventory;
pub mod lifecycle;
pub mod refresh;
pub mod registry;
pub mod types;

pub use cache::{NodeCache, NodeCacheSnapshot};
pub use config::AgentConfig;
pub use console::{parse_serial_endpoint, ConsoleSessionController, SerialEndpoint};
pub use driver::{BareMetalDriver, ComputeDriver};
pub use error::{DriverError, Result};
pub use hash_ring::{HashPartitioner, HashRing, RingScope};
pub use inventory::{
    normalize_resource_class, Inventory, InventoryMapper, InventoryRecord, NodeProperties,
    NodeResource, ProviderData, ProviderTree,
};
pub use lifecycle::{Backoff, WaitLoop};
pub use refresh::RefreshTask;
pub use registry::{
    InMemoryServiceRegistry, InMemoryWorkloadRegistry, ServiceRegistry, TaskState, VmState,
    Workload, WorkloadRegistry,
};
pub use types::{
    DriverCapabilities, InstanceInfo, InstancePowerState, RebootKind, SpawnRequest, Vif,
    VolumeAttachment, VolumeConnectorInfo,
};
