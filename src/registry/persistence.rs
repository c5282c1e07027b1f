//! Persistence layer for the Calibration Registry

use crate::error::{to_storage_data, StorageError};
use crate::registry::{CalibrationRecord, CalibrationStore};
use crate::types::{FrameId, FrameType, InstrumentId};
use sled::transaction::{TransactionError, TransactionResult};
use sled::{Db, Transactional, Tree};
use std::path::Path;

const TREE_RECORDS: &str = "calibrations";
const TREE_INDEX: &str = "calibration_index";

/// Sled-based implementation of `CalibrationStore`
///
/// Records live in one tree keyed by frame identity, JSON-encoded so they stay
/// readable for audit. A second tree indexes identities by
/// `{TYPE}|{instrument}|{frame_id}` for per-type, per-instrument scans.
#[derive(Clone)]
pub struct SledCalibrationStore {
    db: Db,
    records: Tree,
    index: Tree,
}

impl SledCalibrationStore {
    /// Open a store inside an existing database.
    pub fn new(db: &Db) -> Result<Self, StorageError> {
        let records = db.open_tree(TREE_RECORDS)?;
        let index = db.open_tree(TREE_INDEX)?;
        Ok(Self {
            db: db.clone(),
            records,
            index,
        })
    }

    /// Open (or create) a database at `path` and the store inside it.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| {
            StorageError::Unavailable(format!("Failed to open sled database: {}", e))
        })?;
        Self::new(&db)
    }

    /// Get the underlying sled database
    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    fn index_prefix(frame_type: FrameType, instrument: &InstrumentId) -> String {
        format!("{}|{}|", frame_type.as_str(), instrument.key())
    }

    fn decode(raw: &[u8]) -> Result<CalibrationRecord, StorageError> {
        serde_json::from_slice(raw).map_err(to_storage_data)
    }
}

impl CalibrationStore for SledCalibrationStore {
    fn get(&self, frame_id: &FrameId) -> Result<Option<CalibrationRecord>, StorageError> {
        match self.records.get(frame_id.as_str().as_bytes())? {
            Some(raw) => Ok(Some(Self::decode(&raw)?)),
            None => Ok(None),
        }
    }

    fn put(&self, record: &CalibrationRecord) -> Result<(), StorageError> {
        let key = record.frame_id.as_str().as_bytes().to_vec();
        let value = serde_json::to_vec(record).map_err(to_storage_data)?;
        let index_key = format!(
            "{}{}",
            Self::index_prefix(record.frame_type, &record.instrument),
            record.frame_id
        );

        let result: TransactionResult<(), ()> =
            (&self.records, &self.index).transaction(|(records, index)| {
                records.insert(key.as_slice(), value.as_slice())?;
                index.insert(index_key.as_bytes(), Vec::<u8>::new())?;
                Ok(())
            });
        result.map_err(|e| match e {
            TransactionError::Storage(err) => StorageError::from(err),
            TransactionError::Abort(()) => {
                StorageError::Unavailable("calibration write aborted".to_string())
            }
        })
    }

    fn scan(
        &self,
        frame_type: FrameType,
        instrument: &InstrumentId,
    ) -> Result<Vec<CalibrationRecord>, StorageError> {
        let prefix = Self::index_prefix(frame_type, instrument);
        let mut records = Vec::new();
        for item in self.index.scan_prefix(prefix.as_bytes()) {
            let (key, _) = item?;
            let frame_id = &key[prefix.len()..];
            // An index entry without its record means a torn write; skip it.
            if let Some(raw) = self.records.get(frame_id)? {
                records.push(Self::decode(&raw)?);
            }
        }
        Ok(records)
    }

    fn list_all(&self) -> Result<Vec<CalibrationRecord>, StorageError> {
        let mut records = Vec::new();
        for item in self.records.iter() {
            let (_, value) = item?;
            records.push(Self::decode(&value)?);
        }
        Ok(records)
    }
}
