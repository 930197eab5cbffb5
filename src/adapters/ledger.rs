//! Credit ledger seam

use thiserror::Error;

use crate::core_types::TransactionId;
use crate::money::{AccountCategory, Amounts};
use crate::storage::{ScopedTransaction, StorageError};

/// Ledger error types
#[derive(Error, Debug, Clone)]
pub enum LedgerError {
    #[error("Insufficient {category} balance: requested {requested}, available {available}")]
    InsufficientFunds {
        category: AccountCategory,
        requested: u64,
        available: u64,
    },

    #[error("{category} balance would overflow")]
    Overflow { category: AccountCategory },

    #[error("Ledger storage error: {0}")]
    Storage(#[from] StorageError),
}

impl LedgerError {
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            LedgerError::Overflow { .. } => "OVERFLOW",
            LedgerError::Storage(_) => "LEDGER_STORAGE_ERROR",
        }
    }
}

/// The EGM credit ledger
///
/// `debit`/`credit` stage their effect in `scope`; nothing is visible until
/// the scope commits. `correlation` is the transaction id that justifies the
/// mutation.
pub trait Ledger: Send + Sync {
    /// Committed balance of one category
    fn balance(&self, category: AccountCategory) -> u64;

    fn debit(
        &self,
        scope: &mut ScopedTransaction,
        category: AccountCategory,
        amount: u64,
        correlation: TransactionId,
    ) -> Result<(), LedgerError>;

    fn credit(
        &self,
        scope: &mut ScopedTransaction,
        category: AccountCategory,
        amount: u64,
        correlation: TransactionId,
    ) -> Result<(), LedgerError>;

    /// Committed balances of every category
    fn balances(&self) -> Amounts {
        let mut amounts = Amounts::ZERO;
        for category in AccountCategory::ALL {
            amounts.set(category, self.balance(category));
        }
        amounts
    }
}
