//! Error types for the driver crate.

use metal_agent_client::ClientError;
use thiserror::Error;

/// Errors surfaced by driver operations.
///
/// Transport failures from the control-plane client are folded into these
/// domain kinds at component boundaries; `Client` carries whatever is left
/// over unchanged.
#[derive(Error, Debug)]
pub enum DriverError {
    /// The node does not exist on the control plane.
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// No node is bound to the workload.
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    /// The control plane could not be listed; no node data is usable.
    #[error("Driver not ready: {0}")]
    DriverNotReady(String),

    /// Deployment failed or was aborted.
    #[error("Deploy failure: {0}")]
    DeployFailure(String),

    /// The node cannot accept a workload.
    #[error("Compute resources unavailable: {0}")]
    ComputeResourcesUnavailable(String),

    /// The node failed driver-interface validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A network interface could not be attached.
    #[error("VIF plug failure: {0}")]
    VifPlugFailure(String),

    /// Rescue failed.
    #[error("Rescue failure: {0}")]
    RescueFailure(String),

    /// Leaving rescue mode failed.
    #[error("Unrescue failure: {0}")]
    UnrescueFailure(String),

    /// The console could not be brought into the requested mode.
    #[error("Console not available: {0}")]
    ConsoleNotAvailable(String),

    /// The console exists but is of an unsupported type or endpoint.
    #[error("Console type unavailable: {0}")]
    ConsoleTypeUnavailable(String),

    /// The configured peer list is unusable.
    #[error("Invalid peer list: {0}")]
    InvalidPeerList(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A bounded retry loop ran out of attempts.
    #[error("Gave up after {attempts} attempts: {message}")]
    GaveUp {
        /// Attempts made.
        attempts: u32,
        /// What was being waited for.
        message: String,
    },

    /// A lifecycle wait exceeded its time bound.
    #[error("Timed out waiting: {0}")]
    WaitTimeout(String),

    /// Service or workload registry failure.
    #[error("Registry error: {0}")]
    Registry(String),

    /// Control-plane error with no more specific meaning.
    #[error("Control plane error: {0}")]
    Client(#[from] ClientError),
}

impl DriverError {
    /// Classify a failure to list or fetch nodes.
    ///
    /// Credential and connectivity failures mean the agent has no usable view
    /// of the control plane and become [`DriverError::DriverNotReady`].
    #[must_use]
    pub fn from_listing(error: ClientError) -> Self {
        match error {
            ClientError::Unauthorized(msg)
            | ClientError::Unavailable(msg)
            | ClientError::InvalidResponse(msg) => Self::DriverNotReady(msg),
            other => Self::Client(other),
        }
    }

    /// Check if this error is retriable.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::DriverNotReady(_) | Self::WaitTimeout(_) | Self::Registry(_) => true,
            Self::Client(e) => e.is_retriable(),
            _ => false,
        }
    }

    /// Get the HTTP status code for this error.
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        match self {
            Self::NodeNotFound(_) | Self::InstanceNotFound(_) => 404,
            Self::Validation(_)
            | Self::InvalidPeerList(_)
            | Self::Config(_)
            | Self::ConsoleTypeUnavailable(_) => 400,
            Self::ComputeResourcesUnavailable(_) => 409,
            Self::DeployFailure(_)
            | Self::VifPlugFailure(_)
            | Self::RescueFailure(_)
            | Self::UnrescueFailure(_)
            | Self::GaveUp { .. } => 500,
            Self::DriverNotReady(_)
            | Self::ConsoleNotAvailable(_)
            | Self::WaitTimeout(_)
            | Self::Registry(_) => 503,
            Self::Client(e) => e.http_status_code(),
        }
    }
}

/// A specialized Result type for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;
