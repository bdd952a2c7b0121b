//! Scheduler error types.

use thiserror::Error;

use svcvm_devices::DeviceError;
use svcvm_notify::NotifyError;
use svcvm_state::{BindingStatus, StateError};

/// Errors that can occur during scheduling operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A concurrent operation moved the binding first.
    #[error("conflict on {resource_id}: expected {expected}, found {actual}")]
    Conflict {
        resource_id: String,
        expected: BindingStatus,
        actual: BindingStatus,
    },

    #[error("router not found: {0}")]
    RouterNotFound(String),

    #[error("floating IP not found: {0}")]
    FloatingIpNotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("management network unavailable: {0}")]
    ManagementNetworkUnavailable(String),

    #[error("state store error: {0}")]
    State(StateError),

    #[error("device error: {0}")]
    Device(DeviceError),

    #[error("notification error: {0}")]
    Notify(#[from] NotifyError),
}

impl From<StateError> for SchedulerError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::StaleBindingState {
                resource_id,
                expected,
                actual,
            } => SchedulerError::Conflict {
                resource_id,
                expected,
                actual,
            },
            other => SchedulerError::State(other),
        }
    }
}

impl From<DeviceError> for SchedulerError {
    fn from(e: DeviceError) -> Self {
        match e {
            DeviceError::State(state) => state.into(),
            DeviceError::ManagementNetworkUnavailable(msg) => {
                SchedulerError::ManagementNetworkUnavailable(msg)
            }
            other => SchedulerError::Device(other),
        }
    }
}

impl SchedulerError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, SchedulerError::Conflict { .. })
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
