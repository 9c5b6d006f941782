//! Identifier types for the bare-metal agent.
//!
//! Nodes are identified by opaque strings assigned by the control plane,
//! workloads by UUIDs, and agent hosts by case-folded host names.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque identifier of a physical node, as assigned by the control plane.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(String);

impl NodeId {
    /// Create a `NodeId` from a string.
    ///
    /// # Errors
    ///
    /// Returns `IdError::Empty` if the string is empty or only whitespace.
    pub fn new(id: impl Into<String>) -> Result<Self, IdError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(IdError::Empty);
        }
        Ok(Self(id))
    }

    /// Return the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodeId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for NodeId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A 16-byte workload (instance) identifier based on UUID v4.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstanceId(uuid::Uuid);

impl InstanceId {
    /// Create a new `InstanceId` from a UUID.
    #[must_use]
    pub const fn from_uuid(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }

    /// Generate a new random `InstanceId`.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Return the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl FromStr for InstanceId {
    type Err = IdError;

    /// Parse an `InstanceId` from a UUID string.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = uuid::Uuid::parse_str(s).map_err(|_| IdError::InvalidUuid)?;
        Ok(Self(uuid))
    }
}

impl fmt::Debug for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceId({})", self.0)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for InstanceId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<InstanceId> for String {
    fn from(id: InstanceId) -> Self {
        id.0.to_string()
    }
}

/// Name of an agent host, case-folded on construction.
///
/// `Host1` and `host1` produce equal values, so every comparison and every
/// hash over host names is case-insensitive by construction.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HostName(String);

impl HostName {
    /// Create a normalized `HostName`.
    ///
    /// Surrounding whitespace is trimmed and the name is lowercased.
    ///
    /// # Errors
    ///
    /// Returns `IdError::Empty` if nothing remains after trimming.
    pub fn new(name: &str) -> Result<Self, IdError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(IdError::Empty);
        }
        Ok(Self(name.to_lowercase()))
    }

    /// The `localhost` host name.
    #[must_use]
    pub fn localhost() -> Self {
        Self("localhost".to_string())
    }

    /// Return the normalized name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for HostName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostName({})", self.0)
    }
}

impl fmt::Display for HostName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for HostName {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for HostName {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<HostName> for String {
    fn from(name: HostName) -> Self {
        name.0
    }
}

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The input was empty.
    #[error("identifier must not be empty")]
    Empty,

    /// The input is not a valid UUID.
    #[error("invalid UUID format")]
    InvalidUuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_name_is_case_folded() {
        let a = HostName::new("Host1").unwrap();
        let b = HostName::new("host1").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "host1");
    }

    #[test]
    fn host_name_trims_and_rejects_empty() {
        assert_eq!(HostName::new("  COMPUTE-2 ").unwrap().as_str(), "compute-2");
        assert!(matches!(HostName::new("   "), Err(IdError::Empty)));
    }

    #[test]
    fn node_id_rejects_empty() {
        assert!(matches!(NodeId::new(""), Err(IdError::Empty)));
        assert_eq!(NodeId::new("node-a").unwrap().as_str(), "node-a");
    }

    #[test]
    fn node_id_keeps_case() {
        let id = NodeId::new("Node-A").unwrap();
        assert_eq!(id.to_string(), "Node-A");
    }

    #[test]
    fn instance_id_invalid_uuid() {
        let result = InstanceId::from_str("not-a-uuid");
        assert!(matches!(result, Err(IdError::InvalidUuid)));
    }

    #[test]
    fn instance_id_serde_json() {
        let id = InstanceId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let parsed: InstanceId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn host_name_deserializes_normalized() {
        let parsed: HostName = serde_json::from_str("\"CONDUCTOR-1\"").unwrap();
        assert_eq!(parsed.as_str(), "conductor-1");
    }
}
