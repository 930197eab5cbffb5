//! Transaction Coordinator Error Types

use thiserror::Error;

use crate::core_types::GrantId;
use crate::storage::StorageError;

/// Coordinator error types
///
/// Grant errors are consistency faults: the caller retrieved a grant the
/// coordinator never handed out, or one already superseded.
#[derive(Error, Debug, Clone)]
pub enum CoordinatorError {
    #[error("Requestor id must not be empty")]
    EmptyRequestorId,

    #[error("No grant pending (retrieving {grant})")]
    NoPendingGrant { grant: GrantId },

    #[error("Grant mismatch: retrieving {grant}, pending {pending}")]
    GrantMismatch { grant: GrantId, pending: GrantId },

    #[error("Dispatcher could not be started: {0}")]
    Dispatcher(String),

    #[error("Coordinator storage error: {0}")]
    Storage(#[from] StorageError),
}

impl CoordinatorError {
    pub fn code(&self) -> &'static str {
        match self {
            CoordinatorError::EmptyRequestorId => "EMPTY_REQUESTOR_ID",
            CoordinatorError::NoPendingGrant { .. } => "NO_PENDING_GRANT",
            CoordinatorError::GrantMismatch { .. } => "GRANT_MISMATCH",
            CoordinatorError::Dispatcher(_) => "DISPATCHER_ERROR",
            CoordinatorError::Storage(_) => "COORDINATOR_STORAGE_ERROR",
        }
    }
}
