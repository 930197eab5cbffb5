//! Transaction Log
//!
//! Fixed-capacity ring buffer of one record kind, persisted slot by slot.
//!
//! # Block layout (`TransactionLog.{kind}`)
//!
//! ```text
//! Capacity        u64    fixed when the block is first created
//! Cursor          u64    next slot to write
//! NextSequence    u64    next log sequence to assign
//! Slot{n}         T      record in slot n (absent until first written)
//! ```

use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, error, info, warn};

use super::error::TransactionLogError;
use super::ids::TransactionIdProvider;
use super::record::{LoggedTransaction, TransactionEntry};
use crate::adapters::{EventBus, WatEvent};
use crate::core_types::{LogSequence, TransactionId, TransactionKind};
use crate::storage::{PersistentStorage, ScopedTransaction, read_value};

const CAPACITY_KEY: &str = "Capacity";
const CURSOR_KEY: &str = "Cursor";
const SEQUENCE_KEY: &str = "NextSequence";

fn slot_key(slot: usize) -> String {
    format!("Slot{}", slot)
}

struct LogState<T> {
    slots: Vec<Option<T>>,
    cursor: usize,
    next_sequence: LogSequence,
}

impl<T: LoggedTransaction> LogState<T> {
    fn position(&self, transaction_id: TransactionId) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.as_ref()
                .is_some_and(|r| r.base().transaction_id == transaction_id)
        })
    }
}

/// Bounded, persisted history of one transaction kind
pub struct TransactionLog<T: LoggedTransaction> {
    block: String,
    storage: Arc<dyn PersistentStorage>,
    ids: Arc<TransactionIdProvider>,
    events: Arc<dyn EventBus>,
    state: Arc<Mutex<LogState<T>>>,
}

impl<T: LoggedTransaction> TransactionLog<T> {
    pub fn block_name() -> String {
        format!("TransactionLog.{}", T::KIND)
    }

    /// Open the log, creating its block on first use
    ///
    /// The capacity of an existing block wins over `capacity`.
    pub fn open(
        storage: Arc<dyn PersistentStorage>,
        ids: Arc<TransactionIdProvider>,
        events: Arc<dyn EventBus>,
        capacity: usize,
    ) -> Result<Self, TransactionLogError> {
        let block = Self::block_name();
        storage.create_block(&block)?;

        let capacity = match read_value::<u64>(storage.as_ref(), &block, CAPACITY_KEY)? {
            Some(persisted) => {
                if persisted as usize != capacity {
                    warn!(
                        kind = %T::KIND,
                        persisted = persisted,
                        configured = capacity,
                        "Keeping persisted transaction log capacity"
                    );
                }
                persisted as usize
            }
            None => {
                let capacity = capacity.max(1);
                let mut scope = ScopedTransaction::new(storage.clone());
                scope.write(&block, CAPACITY_KEY, &(capacity as u64))?;
                scope.write(&block, CURSOR_KEY, &0u64)?;
                scope.write(&block, SEQUENCE_KEY, &1u64)?;
                scope.commit()?;
                capacity
            }
        };

        let cursor = read_value::<u64>(storage.as_ref(), &block, CURSOR_KEY)?.unwrap_or(0) as usize;
        let next_sequence =
            read_value::<LogSequence>(storage.as_ref(), &block, SEQUENCE_KEY)?.unwrap_or(1);

        let mut slots = Vec::with_capacity(capacity);
        for slot in 0..capacity {
            let record: Option<T> = read_value(storage.as_ref(), &block, &slot_key(slot))?;
            if let Some(record) = &record {
                ids.observe(record.base().transaction_id);
            }
            slots.push(record);
        }

        info!(
            kind = %T::KIND,
            capacity = capacity,
            count = slots.iter().filter(|s| s.is_some()).count(),
            "Transaction log opened"
        );

        Ok(Self {
            block,
            storage,
            ids,
            events,
            state: Arc::new(Mutex::new(LogState {
                slots,
                cursor: cursor % capacity,
                next_sequence,
            })),
        })
    }

    pub fn kind(&self) -> TransactionKind {
        T::KIND
    }

    pub fn capacity(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn len(&self) -> usize {
        self.lock().slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LogState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a new record, evicting the oldest once the ring is full
    ///
    /// Returns the record with its transaction id and log sequence assigned.
    pub fn add(&self, mut record: T) -> Result<T, TransactionLogError> {
        let assigned = record.base().transaction_id;
        if assigned != 0 {
            error!(transaction_id = assigned, record = %record, "Add of an already logged transaction");
            return Err(TransactionLogError::AlreadyLogged {
                transaction_id: assigned,
                record: record.to_string(),
            });
        }

        let mut state = self.lock();
        let capacity = state.slots.len();
        let slot = state.cursor;
        let sequence = state.next_sequence;

        let mut scope = ScopedTransaction::new(self.storage.clone());
        let transaction_id = self.ids.next(&mut scope)?;
        record.base_mut().transaction_id = transaction_id;
        record.base_mut().log_sequence = sequence;

        scope.write(&self.block, &slot_key(slot), &record)?;
        scope.write(&self.block, CURSOR_KEY, &(((slot + 1) % capacity) as u64))?;
        scope.write(&self.block, SEQUENCE_KEY, &(sequence + 1))?;
        scope.commit()?;

        if let Some(evicted) = state.slots[slot].replace(record.clone()) {
            debug!(
                kind = %T::KIND,
                evicted_id = evicted.base().transaction_id,
                "Ring buffer overwrote oldest transaction"
            );
        }
        state.cursor = (slot + 1) % capacity;
        state.next_sequence = sequence + 1;
        drop(state);

        debug!(kind = %T::KIND, transaction_id, sequence, "Transaction saved");
        self.events.publish(WatEvent::TransactionSaved {
            kind: T::KIND,
            transaction_id,
        });
        Ok(record)
    }

    /// Replace the record with the same transaction id and persist its slot
    pub fn update(&self, record: &T) -> Result<(), TransactionLogError> {
        let mut scope = ScopedTransaction::new(self.storage.clone());
        self.update_in(&mut scope, record)?;
        scope.commit()?;
        Ok(())
    }

    /// Stage [`update`](Self::update) in the caller's durable scope
    pub fn update_in(
        &self,
        scope: &mut ScopedTransaction,
        record: &T,
    ) -> Result<(), TransactionLogError> {
        self.stage_replace(scope, record.base().transaction_id, record)
    }

    /// Replace the record currently logged under `old_id`
    ///
    /// The replacement may carry a new id, but not one already held by
    /// another record in the ring.
    pub fn overwrite(&self, old_id: TransactionId, record: T) -> Result<(), TransactionLogError> {
        let new_id = record.base().transaction_id;
        if new_id != old_id && self.lock().position(new_id).is_some() {
            error!(transaction_id = new_id, record = %record, "Overwrite onto an id already logged");
            return Err(TransactionLogError::AlreadyLogged {
                transaction_id: new_id,
                record: record.to_string(),
            });
        }
        let mut scope = ScopedTransaction::new(self.storage.clone());
        self.stage_replace(&mut scope, old_id, &record)?;
        scope.commit()?;
        Ok(())
    }

    fn stage_replace(
        &self,
        scope: &mut ScopedTransaction,
        locate_id: TransactionId,
        record: &T,
    ) -> Result<(), TransactionLogError> {
        let slot = match self.lock().position(locate_id) {
            Some(slot) => slot,
            None => {
                error!(transaction_id = locate_id, record = %record, "Update of an unknown transaction");
                return Err(TransactionLogError::UnknownTransaction {
                    transaction_id: locate_id,
                    record: record.to_string(),
                });
            }
        };

        scope.write(&self.block, &slot_key(slot), record)?;

        let state = Arc::clone(&self.state);
        let record = record.clone();
        scope.on_commit(move || {
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = state.slots.get_mut(slot) {
                // the ring may have moved on while the scope was open
                if entry
                    .as_ref()
                    .is_some_and(|r| r.base().transaction_id == locate_id)
                {
                    *entry = Some(record);
                }
            }
        });
        Ok(())
    }

    pub fn get(&self, transaction_id: TransactionId) -> Option<T> {
        let state = self.lock();
        state
            .position(transaction_id)
            .and_then(|slot| state.slots[slot].clone())
    }

    /// Most recently logged record matching `predicate`
    pub fn find(&self, predicate: impl Fn(&T) -> bool) -> Option<T> {
        let state = self.lock();
        state
            .slots
            .iter()
            .flatten()
            .filter(|r| predicate(r))
            .max_by_key(|r| r.base().log_sequence)
            .cloned()
    }

    /// Deep copies of every record, oldest first
    pub fn recall_all(&self) -> Vec<T> {
        let state = self.lock();
        let mut records: Vec<T> = state.slots.iter().flatten().cloned().collect();
        records.sort_by_key(|r| r.base().log_sequence);
        records
    }
}

/// Kind-erased view used by the history directory
pub(crate) trait ErasedLog: Send + Sync {
    fn kind(&self) -> TransactionKind;

    fn recall_entries(&self) -> Vec<TransactionEntry>;

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: LoggedTransaction> ErasedLog for TransactionLog<T> {
    fn kind(&self) -> TransactionKind {
        T::KIND
    }

    fn recall_entries(&self) -> Vec<TransactionEntry> {
        self.recall_all()
            .into_iter()
            .map(LoggedTransaction::into_entry)
            .collect()
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
