//! In-process storage backend

use std::sync::{Mutex, PoisonError};

use rustc_hash::FxHashMap;

use super::{BlockWrite, PersistentStorage, StorageError};

type Block = FxHashMap<String, Vec<u8>>;

/// Storage backend that lives as long as the process
///
/// Share one instance (behind an `Arc`) between two system instances to
/// simulate a restart over the same persisted state.
#[derive(Default)]
pub struct MemoryStorage {
    blocks: Mutex<FxHashMap<String, Block>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys held in a block (0 when the block is missing)
    pub fn key_count(&self, block: &str) -> usize {
        let blocks = self.blocks.lock().unwrap_or_else(PoisonError::into_inner);
        blocks.get(block).map(|b| b.len()).unwrap_or(0)
    }
}

impl PersistentStorage for MemoryStorage {
    fn create_block(&self, name: &str) -> Result<(), StorageError> {
        let mut blocks = self.blocks.lock().unwrap_or_else(PoisonError::into_inner);
        blocks.entry(name.to_string()).or_default();
        Ok(())
    }

    fn block_exists(&self, name: &str) -> bool {
        let blocks = self.blocks.lock().unwrap_or_else(PoisonError::into_inner);
        blocks.contains_key(name)
    }

    fn read(&self, block: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let blocks = self.blocks.lock().unwrap_or_else(PoisonError::into_inner);
        let block = blocks
            .get(block)
            .ok_or_else(|| StorageError::BlockNotFound(block.to_string()))?;
        Ok(block.get(key).cloned())
    }

    fn commit(&self, writes: Vec<BlockWrite>) -> Result<(), StorageError> {
        let mut blocks = self.blocks.lock().unwrap_or_else(PoisonError::into_inner);

        // Validate the whole batch before touching anything
        if let Some(missing) = writes.iter().find(|w| !blocks.contains_key(&w.block)) {
            return Err(StorageError::BlockNotFound(missing.block.clone()));
        }

        for write in writes {
            if let Some(block) = blocks.get_mut(&write.block) {
                block.insert(write.key, write.value);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_block_is_idempotent() {
        let storage = MemoryStorage::new();
        storage.create_block("a").unwrap();
        storage
            .commit(vec![BlockWrite {
                block: "a".into(),
                key: "k".into(),
                value: vec![1],
            }])
            .unwrap();
        storage.create_block("a").unwrap();
        assert_eq!(storage.read("a", "k").unwrap(), Some(vec![1]));
        assert_eq!(storage.key_count("a"), 1);
    }

    #[test]
    fn test_read_missing_block() {
        let storage = MemoryStorage::new();
        assert!(!storage.block_exists("nope"));
        assert!(matches!(
            storage.read("nope", "k"),
            Err(StorageError::BlockNotFound(_))
        ));
    }
}
