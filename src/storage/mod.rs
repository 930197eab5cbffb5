//! Persistent Storage
//!
//! Named blocks of keyed values, written through all-or-nothing scopes.
//!
//! # Durable scope
//!
//! ```text
//! ScopedTransaction::new(storage)
//!     .write(block, key, value)     -- staged, nothing visible yet
//!     .on_commit(hook)              -- in-memory mirror update
//!     .commit()                     -- batch persisted, then hooks run
//! ```
//!
//! Dropping a scope without committing discards every staged write and hook.
//! Components keep their in-memory state in sync by registering hooks, so
//! memory never runs ahead of what a restart would load.

pub mod file;
pub mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Storage error types
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("Block not found: {0}")]
    BlockNotFound(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Corrupt block {0}: checksum mismatch")]
    Corrupt(String),

    #[error("Storage at {0} halted after a partial commit; reopen to replay")]
    Halted(String),
}

impl StorageError {
    pub fn code(&self) -> &'static str {
        match self {
            StorageError::BlockNotFound(_) => "BLOCK_NOT_FOUND",
            StorageError::Encoding(_) => "ENCODING_ERROR",
            StorageError::Io(_) => "IO_ERROR",
            StorageError::Corrupt(_) => "CORRUPT_BLOCK",
            StorageError::Halted(_) => "STORAGE_HALTED",
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

impl From<bincode::Error> for StorageError {
    fn from(e: bincode::Error) -> Self {
        StorageError::Encoding(e.to_string())
    }
}

/// One staged keyed write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockWrite {
    pub block: String,
    pub key: String,
    pub value: Vec<u8>,
}

/// Storage engine contract
///
/// `commit` must apply the whole batch or none of it.
pub trait PersistentStorage: Send + Sync {
    /// Create a block if it does not exist yet
    fn create_block(&self, name: &str) -> Result<(), StorageError>;

    fn block_exists(&self, name: &str) -> bool;

    /// Read the raw bytes stored under `key`
    fn read(&self, block: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Persist a batch atomically
    fn commit(&self, writes: Vec<BlockWrite>) -> Result<(), StorageError>;
}

/// Read and decode a value written through a [`ScopedTransaction`]
pub fn read_value<T: DeserializeOwned>(
    storage: &dyn PersistentStorage,
    block: &str,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match storage.read(block, key)? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}

type CommitHook = Box<dyn FnOnce() + Send>;

/// All-or-nothing write region
pub struct ScopedTransaction {
    storage: Arc<dyn PersistentStorage>,
    writes: Vec<BlockWrite>,
    hooks: Vec<CommitHook>,
}

impl ScopedTransaction {
    pub fn new(storage: Arc<dyn PersistentStorage>) -> Self {
        Self {
            storage,
            writes: Vec::new(),
            hooks: Vec::new(),
        }
    }

    /// Stage an encoded value; a later write to the same key wins
    pub fn write<T: Serialize + ?Sized>(
        &mut self,
        block: &str,
        key: &str,
        value: &T,
    ) -> Result<(), StorageError> {
        let value = bincode::serialize(value)?;
        self.writes.push(BlockWrite {
            block: block.to_string(),
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    /// Run `hook` once the batch is durable
    pub fn on_commit(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.hooks.push(Box::new(hook));
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.hooks.is_empty()
    }

    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    /// Persist every staged write, then run the hooks in registration order
    pub fn commit(self) -> Result<(), StorageError> {
        if !self.writes.is_empty() {
            self.storage.commit(self.writes)?;
        }
        for hook in self.hooks {
            hook();
        }
        Ok(())
    }
}
