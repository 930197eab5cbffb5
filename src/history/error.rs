//! Transaction Log Error Types

use thiserror::Error;

use crate::core_types::{TransactionId, TransactionKind};
use crate::storage::StorageError;

/// Transaction log error types
///
/// `AlreadyLogged` and `UnknownTransaction` are caller contract violations;
/// they carry the offending record.
#[derive(Error, Debug, Clone)]
pub enum TransactionLogError {
    #[error("Transaction {transaction_id} already logged: {record}")]
    AlreadyLogged {
        transaction_id: TransactionId,
        record: String,
    },

    #[error("Unknown transaction {transaction_id}: {record}")]
    UnknownTransaction {
        transaction_id: TransactionId,
        record: String,
    },

    #[error("No transaction log registered for {0}")]
    UnregisteredKind(TransactionKind),

    #[error("Transaction log storage error: {0}")]
    Storage(#[from] StorageError),
}

impl TransactionLogError {
    pub fn code(&self) -> &'static str {
        match self {
            TransactionLogError::AlreadyLogged { .. } => "ALREADY_LOGGED",
            TransactionLogError::UnknownTransaction { .. } => "UNKNOWN_TRANSACTION",
            TransactionLogError::UnregisteredKind(_) => "UNREGISTERED_KIND",
            TransactionLogError::Storage(_) => "STORAGE_ERROR",
        }
    }
}
