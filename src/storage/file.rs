//! File-backed storage backend
//!
//! # Directory layout
//!
//! ```text
//! data_dir/
//! ├── {block}.blk        # framed bincode image of one block
//! ├── {block}.tmp        # transient, replaced by rename
//! └── commit.journal     # framed batch, present only mid-commit
//! ```
//!
//! # Frame (8-byte header)
//!
//! ```text
//! ┌────────────┬─────────┬──────────────────────────┐
//! │ payload_len│ 4 bytes │ little endian            │
//! │ checksum   │ 4 bytes │ CRC32 of payload         │
//! └────────────┴─────────┴──────────────────────────┘
//! ```
//!
//! A commit first makes the whole batch durable in the journal, then rewrites
//! the affected block images, then deletes the journal. Opening the store
//! replays a complete journal and discards a torn one, so a batch is either
//! fully applied or not at all.
//!
//! If rewriting the images fails once the journal is durable, the store halts:
//! every further commit is refused until it is reopened and the journal
//! replayed. A later batch can therefore never retire the journal of a
//! half-applied one.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use crc32fast::Hasher;
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, warn};

use super::{BlockWrite, PersistentStorage, StorageError};

const BLOCK_EXT: &str = "blk";
const JOURNAL_FILE: &str = "commit.journal";
const FRAME_HEADER_SIZE: usize = 8;

type Block = BTreeMap<String, Vec<u8>>;

#[inline]
fn crc32_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Write `payload` framed, via temp file + fsync + rename
fn write_frame_atomic(path: &Path, payload: &[u8]) -> Result<(), StorageError> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&(payload.len() as u32).to_le_bytes())?;
        file.write_all(&crc32_checksum(payload).to_le_bytes())?;
        file.write_all(payload)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    sync_parent_dir(path)
}

/// Make a rename in the containing directory durable
#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> Result<(), StorageError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    File::open(parent)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> Result<(), StorageError> {
    Ok(())
}

/// Read a framed payload; `None` when the frame is torn or fails its checksum
fn read_frame(path: &Path) -> Result<Option<Vec<u8>>, StorageError> {
    let bytes = fs::read(path)?;
    if bytes.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let checksum = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let payload = &bytes[FRAME_HEADER_SIZE..];
    if payload.len() != len || crc32_checksum(payload) != checksum {
        return Ok(None);
    }
    Ok(Some(payload.to_vec()))
}

/// Storage backend persisting each block as a checksummed file
pub struct FileStorage {
    dir: PathBuf,
    blocks: Mutex<FxHashMap<String, Block>>,
    /// Set when a journaled batch could not be fully applied
    halted: AtomicBool,
}

impl FileStorage {
    /// Open (or create) a store rooted at `dir`, replaying any pending journal
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut blocks: FxHashMap<String, Block> = FxHashMap::default();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension() != Some(OsStr::new(BLOCK_EXT)) {
                continue;
            }
            let name = match path.file_stem() {
                Some(stem) => stem.to_string_lossy().into_owned(),
                None => continue,
            };
            let payload = read_frame(&path)?.ok_or_else(|| StorageError::Corrupt(name.clone()))?;
            blocks.insert(name, bincode::deserialize(&payload)?);
        }

        let storage = Self {
            dir,
            blocks: Mutex::new(FxHashMap::default()),
            halted: AtomicBool::new(false),
        };
        storage.replay_journal(&mut blocks)?;

        info!(
            dir = %storage.dir.display(),
            block_count = blocks.len(),
            "File storage opened"
        );
        *storage.blocks.lock().unwrap_or_else(PoisonError::into_inner) = blocks;
        Ok(storage)
    }

    fn block_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", name, BLOCK_EXT))
    }

    fn journal_path(&self) -> PathBuf {
        self.dir.join(JOURNAL_FILE)
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Rewrite the block images of a journaled batch and retire the journal
    fn apply_journaled(&self, images: &BTreeMap<String, Block>) -> Result<(), StorageError> {
        for (name, image) in images {
            write_frame_atomic(&self.block_path(name), &bincode::serialize(image)?)?;
        }
        fs::remove_file(self.journal_path())?;
        Ok(())
    }

    fn replay_journal(&self, blocks: &mut FxHashMap<String, Block>) -> Result<(), StorageError> {
        let journal = self.journal_path();
        if !journal.exists() {
            return Ok(());
        }

        match read_frame(&journal)? {
            Some(payload) => {
                let writes: Vec<(String, String, Vec<u8>)> = bincode::deserialize(&payload)?;
                info!(write_count = writes.len(), "Replaying commit journal");
                let mut touched = Vec::new();
                for (block, key, value) in writes {
                    blocks.entry(block.clone()).or_default().insert(key, value);
                    if !touched.contains(&block) {
                        touched.push(block);
                    }
                }
                for name in touched {
                    if let Some(block) = blocks.get(&name) {
                        write_frame_atomic(&self.block_path(&name), &bincode::serialize(block)?)?;
                    }
                }
            }
            None => {
                // Batch never became durable
                warn!("Discarding torn commit journal");
            }
        }
        fs::remove_file(&journal)?;
        Ok(())
    }
}

impl PersistentStorage for FileStorage {
    fn create_block(&self, name: &str) -> Result<(), StorageError> {
        let mut blocks = self.blocks.lock().unwrap_or_else(PoisonError::into_inner);
        if blocks.contains_key(name) {
            return Ok(());
        }
        let block = Block::new();
        write_frame_atomic(&self.block_path(name), &bincode::serialize(&block)?)?;
        blocks.insert(name.to_string(), block);
        debug!(block = name, "Block created");
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

        if self.is_halted() {
            return Err(StorageError::Halted(self.dir.display().to_string()));
        }
        if let Some(missing) = writes.iter().find(|w| !blocks.contains_key(&w.block)) {
            return Err(StorageError::BlockNotFound(missing.block.clone()));
        }

        // 1. Build new images without touching the cache
        let mut images: BTreeMap<String, Block> = BTreeMap::new();
        for write in &writes {
            images
                .entry(write.block.clone())
                .or_insert_with(|| blocks.get(&write.block).cloned().unwrap_or_default())
                .insert(write.key.clone(), write.value.clone());
        }

        // 2. Journal the batch (the durability point)
        let journal: Vec<(&str, &str, &[u8])> = writes
            .iter()
            .map(|w| (w.block.as_str(), w.key.as_str(), w.value.as_slice()))
            .collect();
        write_frame_atomic(&self.journal_path(), &bincode::serialize(&journal)?)?;

        // 3. Rewrite block images, then retire the journal
        if let Err(e) = self.apply_journaled(&images) {
            self.halted.store(true, Ordering::SeqCst);
            error!(
                dir = %self.dir.display(),
                error = %e,
                "Journaled batch not fully applied; storage halted until reopened"
            );
            return Err(e);
        }

        for (name, image) in images {
            blocks.insert(name, image);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = PathBuf::from(format!("target/test_file_storage_{}_{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn write(block: &str, key: &str, value: u8) -> BlockWrite {
        BlockWrite {
            block: block.into(),
            key: key.into(),
            value: vec![value],
        }
    }

    #[test]
    fn test_values_survive_reopen() {
        let dir = temp_dir("reopen");
        {
            let storage = FileStorage::open(&dir).unwrap();
            storage.create_block("Ledger").unwrap();
            storage.create_block("Log.Off").unwrap();
            storage
                .commit(vec![write("Ledger", "cashable", 5), write("Log.Off", "slot.0", 9)])
                .unwrap();
        }

        let storage = FileStorage::open(&dir).unwrap();
        assert_eq!(storage.read("Ledger", "cashable").unwrap(), Some(vec![5]));
        assert_eq!(storage.read("Log.Off", "slot.0").unwrap(), Some(vec![9]));
        assert!(!dir.join(JOURNAL_FILE).exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_complete_journal_is_replayed() {
        let dir = temp_dir("replay");
        {
            let storage = FileStorage::open(&dir).unwrap();
            storage.create_block("Ledger").unwrap();
        }

        // Simulate a crash after the journal was written but before block images
        let journal: Vec<(&str, &str, &[u8])> = vec![("Ledger", "cashable", &[7u8][..])];
        write_frame_atomic(&dir.join(JOURNAL_FILE), &bincode::serialize(&journal).unwrap())
            .unwrap();

        let storage = FileStorage::open(&dir).unwrap();
        assert_eq!(storage.read("Ledger", "cashable").unwrap(), Some(vec![7]));
        assert!(!dir.join(JOURNAL_FILE).exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_torn_journal_is_discarded() {
        let dir = temp_dir("torn");
        {
            let storage = FileStorage::open(&dir).unwrap();
            storage.create_block("Ledger").unwrap();
        }
        fs::write(dir.join(JOURNAL_FILE), [1u8, 2, 3]).unwrap();

        let storage = FileStorage::open(&dir).unwrap();
        assert_eq!(storage.read("Ledger", "cashable").unwrap(), None);
        assert!(!dir.join(JOURNAL_FILE).exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_failed_apply_halts_until_reopen() {
        let dir = temp_dir("halt");
        let storage = FileStorage::open(&dir).unwrap();
        storage.create_block("Ledger").unwrap();
        storage.create_block("Log").unwrap();
        storage.create_block("Meters").unwrap();

        // A directory squatting on the temp path makes the second image write fail
        fs::create_dir(dir.join("Log.tmp")).unwrap();
        let err = storage
            .commit(vec![write("Ledger", "cashable", 1), write("Log", "slot.0", 2)])
            .unwrap_err();
        assert_eq!(err.code(), "IO_ERROR");
        assert!(storage.is_halted());
        assert!(dir.join(JOURNAL_FILE).exists());

        // A later batch must not retire the journal of the failed one
        let err = storage.commit(vec![write("Meters", "count", 3)]).unwrap_err();
        assert_eq!(err.code(), "STORAGE_HALTED");
        assert!(dir.join(JOURNAL_FILE).exists());
        drop(storage);

        fs::remove_dir(dir.join("Log.tmp")).unwrap();
        let storage = FileStorage::open(&dir).unwrap();
        assert_eq!(storage.read("Ledger", "cashable").unwrap(), Some(vec![1]));
        assert_eq!(storage.read("Log", "slot.0").unwrap(), Some(vec![2]));
        assert_eq!(storage.read("Meters", "count").unwrap(), None);
        assert!(!storage.is_halted());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_corrupt_block_is_reported() {
        let dir = temp_dir("corrupt");
        {
            let storage = FileStorage::open(&dir).unwrap();
            storage.create_block("Ledger").unwrap();
        }
        let path = dir.join("Ledger.blk");
        let mut bytes = fs::read(&path).unwrap();
        bytes.push(0xFF);
        fs::write(&path, bytes).unwrap();

        let result = FileStorage::open(&dir);
        assert!(matches!(result, Err(StorageError::Corrupt(name)) if name == "Ledger"));

        let _ = fs::remove_dir_all(&dir);
    }
}
