//! Processed-frame ledger
//!
//! Tracks every raw file the orchestrator has seen: its checksum, how many
//! reduction attempts were made and whether one succeeded. Task delivery is
//! at-least-once, so the ledger is what lets duplicate deliveries be skipped.

use crate::concurrency::LockManager;
use crate::error::{to_storage_data, StorageError};
use crate::types::{FrameId, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::path::Path;
use tracing::debug;

const TREE_LEDGER: &str = "processing_ledger";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub path: String,
    pub checksum: String,
    pub tries: u32,
    pub success: bool,
    pub frame_id: Option<FrameId>,
    pub updated_at: Timestamp,
}

pub struct ProcessingLedger {
    tree: Tree,
    locks: LockManager,
}

impl ProcessingLedger {
    pub fn new(db: &Db) -> Result<Self, StorageError> {
        Ok(Self {
            tree: db.open_tree(TREE_LEDGER)?,
            locks: LockManager::new(),
        })
    }

    pub fn get(&self, path: &Path) -> Result<Option<LedgerEntry>, StorageError> {
        let Some(raw) = self.tree.get(key(path).as_bytes())? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&raw).map_err(to_storage_data)?))
    }

    /// Whether the file at `path` should be reduced.
    ///
    /// A checksum different from the recorded one resets the entry. Otherwise
    /// a file is skipped once it succeeded or used up `max_tries`.
    pub fn need_to_process(
        &self,
        path: &Path,
        checksum: &str,
        max_tries: u32,
    ) -> Result<bool, StorageError> {
        self.locks.with_write_lock(&key(path), || -> Result<bool, StorageError> {
            match self.get(path)? {
                None => {
                    self.put(&new_entry(path, checksum))?;
                    Ok(true)
                }
                Some(entry) if entry.checksum != checksum => {
                    debug!(path = %path.display(), "Checksum changed, resetting ledger entry");
                    self.put(&new_entry(path, checksum))?;
                    Ok(true)
                }
                Some(entry) => Ok(!entry.success && entry.tries < max_tries),
            }
        })
    }

    /// Count one reduction attempt.
    pub fn increment_tries(&self, path: &Path, checksum: &str) -> Result<u32, StorageError> {
        self.modify(path, checksum, |entry| entry.tries += 1)
            .map(|entry| entry.tries)
    }

    pub fn mark_success(
        &self,
        path: &Path,
        checksum: &str,
        frame_id: &FrameId,
    ) -> Result<(), StorageError> {
        self.modify(path, checksum, |entry| {
            entry.success = true;
            entry.frame_id = Some(frame_id.clone());
        })?;
        Ok(())
    }

    fn modify<F>(&self, path: &Path, checksum: &str, apply: F) -> Result<LedgerEntry, StorageError>
    where
        F: FnOnce(&mut LedgerEntry),
    {
        self.locks.with_write_lock(&key(path), || -> Result<LedgerEntry, StorageError> {
            let mut entry = match self.get(path)? {
                Some(entry) if entry.checksum == checksum => entry,
                _ => new_entry(path, checksum),
            };
            apply(&mut entry);
            entry.updated_at = Utc::now();
            self.put(&entry)?;
            Ok(entry)
        })
    }

    fn put(&self, entry: &LedgerEntry) -> Result<(), StorageError> {
        let value = serde_json::to_vec(entry).map_err(to_storage_data)?;
        self.tree.insert(entry.path.as_bytes(), value)?;
        Ok(())
    }
}

fn key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn new_entry(path: &Path, checksum: &str) -> LedgerEntry {
    LedgerEntry {
        path: key(path),
        checksum: checksum.to_string(),
        tries: 0,
        success: false,
        frame_id: None,
        updated_at: Utc::now(),
    }
}
