//! Core types for metal-agent.
//!
//! This crate provides the foundational types shared by the control-plane
//! client and the driver:
//!
//! - **Identifiers**: [`NodeId`], [`InstanceId`] and case-folded [`HostName`]
//! - **Node model**: the [`Node`] record with explicit optional fields
//! - **States**: [`PowerState`] and [`ProvisionState`]
//! - **Error types**: [`CoreError`]
//!
//! # Example
//!
//! ```
//! use metal_agent_core::{HostName, Node, NodeId, ProvisionState};
//!
//! let host = HostName::new("Compute-1").unwrap();
//! assert_eq!(host.as_str(), "compute-1");
//!
//! let mut node = Node::new(NodeId::new("node-1").unwrap());
//! node.provision_state = Some(ProvisionState::Available);
//! assert!(!node.is_associated());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod ids;
pub mod node;
pub mod states;

pub use error::{CoreError, Result};
pub use ids::{HostName, IdError, InstanceId, NodeId};
pub use node::Node;
pub use states::{PowerState, ProvisionState};
