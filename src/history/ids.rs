//! Process-wide transaction id provider

use std::sync::{Mutex, PoisonError};

use crate::core_types::TransactionId;
use crate::storage::{PersistentStorage, ScopedTransaction, StorageError, read_value};

const ID_BLOCK: &str = "TransactionIdProvider";
const LAST_ID_KEY: &str = "LastTransactionId";

/// Hands out monotonic transaction ids shared by every log
///
/// The persisted value can lag behind when two logs commit out of order, so
/// each log reports its highest id on open through [`observe`](Self::observe).
pub struct TransactionIdProvider {
    last: Mutex<TransactionId>,
}

impl TransactionIdProvider {
    pub fn open(storage: &dyn PersistentStorage) -> Result<Self, StorageError> {
        storage.create_block(ID_BLOCK)?;
        let last: TransactionId = read_value(storage, ID_BLOCK, LAST_ID_KEY)?.unwrap_or(0);
        Ok(Self {
            last: Mutex::new(last),
        })
    }

    /// Allocate the next id and stage its persistence in `scope`
    pub(crate) fn next(&self, scope: &mut ScopedTransaction) -> Result<TransactionId, StorageError> {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let id = *last + 1;
        scope.write(ID_BLOCK, LAST_ID_KEY, &id)?;
        *last = id;
        Ok(id)
    }

    /// Never hand out `id` or anything below it
    pub(crate) fn observe(&self, id: TransactionId) {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if id > *last {
            *last = id;
        }
    }

    pub fn last(&self) -> TransactionId {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::sync::Arc;

    #[test]
    fn test_ids_survive_reopen() {
        let storage: Arc<dyn PersistentStorage> = Arc::new(MemoryStorage::new());
        let ids = TransactionIdProvider::open(storage.as_ref()).unwrap();

        let mut scope = ScopedTransaction::new(storage.clone());
        assert_eq!(ids.next(&mut scope).unwrap(), 1);
        assert_eq!(ids.next(&mut scope).unwrap(), 2);
        scope.commit().unwrap();

        let reopened = TransactionIdProvider::open(storage.as_ref()).unwrap();
        assert_eq!(reopened.last(), 2);
    }

    #[test]
    fn test_observe_only_moves_forward() {
        let storage = MemoryStorage::new();
        let ids = TransactionIdProvider::open(&storage).unwrap();
        ids.observe(10);
        ids.observe(4);
        assert_eq!(ids.last(), 10);
    }
}
