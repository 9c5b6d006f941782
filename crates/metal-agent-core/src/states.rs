//! Power and provisioning states reported by the control plane.
//!
//! The "no state" value of either dimension is modeled as `None` on the
//! owning [`Node`](crate::Node) field rather than as an enum variant.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Power state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PowerState {
    /// Powered on.
    #[serde(rename = "power on")]
    PowerOn,
    /// Powered off.
    #[serde(rename = "power off")]
    PowerOff,
    /// Hard reboot in progress.
    #[serde(rename = "rebooting")]
    Rebooting,
    /// Soft reboot in progress.
    #[serde(rename = "soft rebooting")]
    SoftRebooting,
    /// Soft power off in progress.
    #[serde(rename = "soft power off")]
    SoftPowerOff,
    /// The control plane could not determine the power state.
    #[serde(rename = "error")]
    Error,
    /// A state this agent does not recognize.
    #[serde(other)]
    Unknown,
}

impl PowerState {
    /// Return the wire representation of this state.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PowerOn => "power on",
            Self::PowerOff => "power off",
            Self::Rebooting => "rebooting",
            Self::SoftRebooting => "soft rebooting",
            Self::SoftPowerOff => "soft power off",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provisioning state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProvisionState {
    /// Registered but not yet managed.
    #[serde(rename = "enroll")]
    Enroll,
    /// Managed but not offered for deployment.
    #[serde(rename = "manageable")]
    Manageable,
    /// Hardware inspection in progress.
    #[serde(rename = "inspecting")]
    Inspecting,
    /// Waiting on out-of-band inspection.
    #[serde(rename = "inspect wait")]
    InspectWait,
    /// Inspection failed.
    #[serde(rename = "inspect failed")]
    InspectFail,
    /// Cleaning in progress.
    #[serde(rename = "cleaning")]
    Cleaning,
    /// Waiting for a clean step to finish.
    #[serde(rename = "clean wait")]
    CleanWait,
    /// Cleaning failed.
    #[serde(rename = "clean failed")]
    CleanFail,
    /// Ready for deployment.
    #[serde(rename = "available")]
    Available,
    /// Deployment in progress.
    #[serde(rename = "deploying")]
    Deploying,
    /// Waiting for the deploy ramdisk to call back.
    #[serde(rename = "wait call-back")]
    DeployWait,
    /// Deployment failed.
    #[serde(rename = "deploy failed")]
    DeployFail,
    /// Deployed and running a workload.
    #[serde(rename = "active")]
    Active,
    /// Tear-down in progress.
    #[serde(rename = "deleting")]
    Deleting,
    /// Tear-down finished.
    #[serde(rename = "deleted")]
    Deleted,
    /// Tear-down failed.
    #[serde(rename = "error")]
    Error,
    /// Redeployment in progress.
    #[serde(rename = "rebuild")]
    Rebuild,
    /// Rescue in progress.
    #[serde(rename = "rescuing")]
    Rescuing,
    /// Waiting for the rescue ramdisk.
    #[serde(rename = "rescue wait")]
    RescueWait,
    /// Rescue failed.
    #[serde(rename = "rescue failed")]
    RescueFail,
    /// Booted into the rescue ramdisk.
    #[serde(rename = "rescue")]
    Rescue,
    /// Leaving rescue mode.
    #[serde(rename = "unrescuing")]
    Unrescuing,
    /// Leaving rescue mode failed.
    #[serde(rename = "unrescue failed")]
    UnrescueFail,
    /// A state this agent does not recognize.
    #[serde(other)]
    Unknown,
}

impl ProvisionState {
    /// Return the wire representation of this state.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Enroll => "enroll",
            Self::Manageable => "manageable",
            Self::Inspecting => "inspecting",
            Self::InspectWait => "inspect wait",
            Self::InspectFail => "inspect failed",
            Self::Cleaning => "cleaning",
            Self::CleanWait => "clean wait",
            Self::CleanFail => "clean failed",
            Self::Available => "available",
            Self::Deploying => "deploying",
            Self::DeployWait => "wait call-back",
            Self::DeployFail => "deploy failed",
            Self::Active => "active",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
            Self::Error => "error",
            Self::Rebuild => "rebuild",
            Self::Rescuing => "rescuing",
            Self::RescueWait => "rescue wait",
            Self::RescueFail => "rescue failed",
            Self::Rescue => "rescue",
            Self::Unrescuing => "unrescuing",
            Self::UnrescueFail => "unrescue failed",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
