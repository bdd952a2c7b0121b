//! Error types for the svcvm binding store.

use thiserror::Error;

use crate::types::BindingStatus;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("resource {0} is already bound")]
    AlreadyBound(String),

    #[error("no binding for resource {0}")]
    NoSuchBinding(String),

    #[error("stale binding state for {resource_id}: expected {expected}, found {actual}")]
    StaleBindingState {
        resource_id: String,
        expected: BindingStatus,
        actual: BindingStatus,
    },

    #[error("invalid transition for {resource_id}: {from} -> {to}")]
    InvalidTransition {
        resource_id: String,
        from: BindingStatus,
        to: BindingStatus,
    },

    #[error("binding for {resource_id} is {status}, not PENDING_DELETE")]
    BindingInUse {
        resource_id: String,
        status: BindingStatus,
    },

    #[error("management port {port_id} already belongs to hosting device {hosting_device_id}")]
    DuplicateManagementPort {
        port_id: String,
        hosting_device_id: String,
    },

    #[error("hosting device {0} already has a binding")]
    DeviceBindingExists(String),
}

impl StateError {
    /// True for optimistic-concurrency conflicts the caller may retry.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StateError::StaleBindingState { .. })
    }
}
