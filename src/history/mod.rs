//! Transaction History
//!
//! Directory of per-kind transaction logs sharing one id provider.
//!
//! ```text
//!                  TransactionHistory
//!                         │
//!        ┌────────────────┼────────────────┐
//!        ▼                ▼                ▼
//!  TransactionLog   TransactionLog   TransactionIdProvider
//!    <WatOff>          <WatOn>        (ids unique across kinds)
//! ```

pub mod error;
pub mod ids;
pub mod log;
pub mod record;

pub use error::TransactionLogError;
pub use ids::TransactionIdProvider;
pub use log::TransactionLog;
pub use record::{LoggedTransaction, TransactionBase, TransactionEntry};

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use self::log::ErasedLog;
use crate::adapters::EventBus;
use crate::core_types::{TransactionId, TransactionKind};
use crate::storage::PersistentStorage;

pub struct TransactionHistory {
    storage: Arc<dyn PersistentStorage>,
    ids: Arc<TransactionIdProvider>,
    events: Arc<dyn EventBus>,
    logs: RwLock<BTreeMap<TransactionKind, Arc<dyn ErasedLog>>>,
}

impl TransactionHistory {
    pub fn open(
        storage: Arc<dyn PersistentStorage>,
        events: Arc<dyn EventBus>,
    ) -> Result<Self, TransactionLogError> {
        let ids = Arc::new(TransactionIdProvider::open(storage.as_ref())?);
        Ok(Self {
            storage,
            ids,
            events,
            logs: RwLock::new(BTreeMap::new()),
        })
    }

    /// Open (or return the already open) log for kind `T`
    pub fn register<T: LoggedTransaction>(
        &self,
        capacity: usize,
    ) -> Result<Arc<TransactionLog<T>>, TransactionLogError> {
        if let Ok(log) = self.log::<T>() {
            return Ok(log);
        }

        let log = Arc::new(TransactionLog::<T>::open(
            self.storage.clone(),
            self.ids.clone(),
            self.events.clone(),
            capacity,
        )?);
        self.logs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(T::KIND, log.clone());
        debug!(kind = %T::KIND, "Transaction log registered");
        Ok(log)
    }

    pub fn log<T: LoggedTransaction>(&self) -> Result<Arc<TransactionLog<T>>, TransactionLogError> {
        let erased = self
            .logs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&T::KIND)
            .cloned()
            .ok_or(TransactionLogError::UnregisteredKind(T::KIND))?;
        erased
            .as_any()
            .downcast::<TransactionLog<T>>()
            .map_err(|_| TransactionLogError::UnregisteredKind(T::KIND))
    }

    pub fn add<T: LoggedTransaction>(&self, record: T) -> Result<T, TransactionLogError> {
        self.log::<T>()?.add(record)
    }

    pub fn update<T: LoggedTransaction>(&self, record: &T) -> Result<(), TransactionLogError> {
        self.log::<T>()?.update(record)
    }

    pub fn overwrite<T: LoggedTransaction>(
        &self,
        old_id: TransactionId,
        record: T,
    ) -> Result<(), TransactionLogError> {
        self.log::<T>()?.overwrite(old_id, record)
    }

    pub fn recall_all_of<T: LoggedTransaction>(&self) -> Result<Vec<T>, TransactionLogError> {
        Ok(self.log::<T>()?.recall_all())
    }

    pub fn recall_kind(&self, kind: TransactionKind) -> Result<Vec<TransactionEntry>, TransactionLogError> {
        self.logs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map(|log| log.recall_entries())
            .ok_or(TransactionLogError::UnregisteredKind(kind))
    }

    /// Every record of every kind, ordered by transaction id
    pub fn recall_all(&self) -> Vec<TransactionEntry> {
        let logs: Vec<_> = self
            .logs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut entries: Vec<TransactionEntry> =
            logs.iter().flat_map(|log| log.recall_entries()).collect();
        entries.sort_by_key(TransactionEntry::transaction_id);
        entries
    }

    pub fn kinds(&self) -> Vec<TransactionKind> {
        self.logs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|log| log.kind())
            .collect()
    }

    pub fn last_transaction_id(&self) -> TransactionId {
        self.ids.last()
    }
}
