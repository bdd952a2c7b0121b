//! Device provisioning error types.

use thiserror::Error;

/// Errors that can occur while provisioning or wiring hosting devices.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("provisioning failed: {0}")]
    ProvisioningFailure(String),

    #[error("{0} not found")]
    ResourceNotFound(String),

    #[error("no binding for hosting device {0}")]
    NoSuchHostingDevice(String),

    #[error("management network unavailable: {0}")]
    ManagementNetworkUnavailable(String),

    #[error("plugging driver error: {0}")]
    Plugging(String),

    #[error("no free VLAN left on hosting device {0}")]
    VlanExhausted(String),

    #[error("state store error: {0}")]
    State(#[from] svcvm_state::StateError),

    #[error("collaborator error: {0}")]
    Collaborator(anyhow::Error),
}

impl From<anyhow::Error> for DeviceError {
    /// Upstream "not found" errors keep their identity so callers can
    /// treat them as already-done.
    fn from(e: anyhow::Error) -> Self {
        match e.downcast_ref::<crate::network::NotFound>() {
            Some(nf) => DeviceError::ResourceNotFound(format!("{} {}", nf.kind, nf.id)),
            None => DeviceError::Collaborator(e),
        }
    }
}

impl DeviceError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DeviceError::ResourceNotFound(_))
    }
}

pub type DeviceResult<T> = Result<T, DeviceError>;
