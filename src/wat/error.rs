//! WAT Error Types

use thiserror::Error;

use crate::adapters::LedgerError;
use crate::coordinator::CoordinatorError;
use crate::core_types::TransactionId;
use crate::history::TransactionLogError;
use crate::storage::StorageError;

/// Transfer saga error types
///
/// Refused or invalid requests are not errors; they come back as `false`
/// (or a failed [`TransferOutcome`](super::TransferOutcome)).
#[derive(Error, Debug, Clone)]
pub enum WatError {
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error(transparent)]
    Log(#[from] TransactionLogError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Transaction {0} not found in the log")]
    TransactionNotFound(TransactionId),

    #[error("Background task failed: {0}")]
    TaskFailed(String),
}

impl WatError {
    pub fn code(&self) -> &'static str {
        match self {
            WatError::Coordinator(e) => e.code(),
            WatError::Log(e) => e.code(),
            WatError::Ledger(e) => e.code(),
            WatError::Storage(e) => e.code(),
            WatError::TransactionNotFound(_) => "TRANSACTION_NOT_FOUND",
            WatError::TaskFailed(_) => "TASK_FAILED",
        }
    }
}
