//! Notification error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("failed to deliver {method} to {target}: {reason}")]
    Delivery {
        method: String,
        target: String,
        reason: String,
    },

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type NotifyResult<T> = Result<T, NotifyError>;
