//! Transaction record base

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::core_types::{DeviceId, LogSequence, ReservationToken, TransactionId, TransactionKind};
use crate::wat::{WatOffTransaction, WatOnTransaction};

/// Fields shared by every logged transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionBase {
    /// Assigned by the log on add; 0 until then
    pub transaction_id: TransactionId,
    /// Assigned by the log on add; monotonic per kind
    pub log_sequence: LogSequence,
    pub device_id: DeviceId,
    /// Creation time (millis since UNIX epoch)
    pub timestamp: i64,
    /// Reservation under which the ledger is mutated
    pub bank_transaction_id: Option<ReservationToken>,
    /// The saga requested the reservation itself and must release it
    pub owns_bank_transaction: bool,
    pub associated_transactions: Vec<TransactionId>,
    /// Opaque correlation token supplied by the caller
    pub trace_id: Option<Ulid>,
}

impl TransactionBase {
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            transaction_id: 0,
            log_sequence: 0,
            device_id,
            timestamp: chrono::Utc::now().timestamp_millis(),
            bank_transaction_id: None,
            owns_bank_transaction: false,
            associated_transactions: Vec::new(),
            trace_id: None,
        }
    }
}

/// A record kind with its own transaction log
pub trait LoggedTransaction:
    Clone + Serialize + DeserializeOwned + fmt::Display + Send + Sync + 'static
{
    const KIND: TransactionKind;

    fn base(&self) -> &TransactionBase;

    fn base_mut(&mut self) -> &mut TransactionBase;

    fn into_entry(self) -> TransactionEntry;
}

/// A record of any kind, as returned by cross-kind recalls
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionEntry {
    WatOff(WatOffTransaction),
    WatOn(WatOnTransaction),
}

impl TransactionEntry {
    pub fn kind(&self) -> TransactionKind {
        match self {
            TransactionEntry::WatOff(_) => TransactionKind::WatOff,
            TransactionEntry::WatOn(_) => TransactionKind::WatOn,
        }
    }

    pub fn base(&self) -> &TransactionBase {
        match self {
            TransactionEntry::WatOff(t) => &t.base,
            TransactionEntry::WatOn(t) => &t.base,
        }
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.base().transaction_id
    }
}

impl fmt::Display for TransactionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionEntry::WatOff(t) => t.fmt(f),
            TransactionEntry::WatOn(t) => t.fmt(f),
        }
    }
}
