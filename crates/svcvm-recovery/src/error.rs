//! Recovery error types.

use thiserror::Error;

use svcvm_scheduler::SchedulerError;
use svcvm_state::StateError;

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

pub type RecoveryResult<T> = Result<T, RecoveryError>;
