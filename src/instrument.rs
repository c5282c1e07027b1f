//! Known instruments and selection rules.

use crate::error::{to_storage_data, StorageError};
use crate::types::InstrumentId;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::sync::Arc;

const TREE_INSTRUMENTS: &str = "instruments";

/// One camera on one telescope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    pub id: InstrumentId,
    pub camera_type: String,
    pub schedulable: bool,
}

impl Instrument {
    pub fn new(id: InstrumentId, camera_type: impl Into<String>, schedulable: bool) -> Self {
        Self {
            id,
            camera_type: camera_type.into(),
            schedulable,
        }
    }
}

/// Rule deciding whether an instrument's frames are reduced at all
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstrumentCriterion {
    /// Camera type must contain the substring
    CameraTypeContains(String),
    /// Camera type must not contain the substring
    CameraTypeExcludes(String),
}

impl InstrumentCriterion {
    pub fn matches(&self, instrument: &Instrument) -> bool {
        let camera_type = instrument.camera_type.to_ascii_uppercase();
        match self {
            InstrumentCriterion::CameraTypeContains(s) => {
                camera_type.contains(&s.to_ascii_uppercase())
            }
            InstrumentCriterion::CameraTypeExcludes(s) => {
                !camera_type.contains(&s.to_ascii_uppercase())
            }
        }
    }
}

/// Criteria plus the schedulability override
#[derive(Debug, Clone, Default)]
pub struct InstrumentSelection {
    pub criteria: Vec<InstrumentCriterion>,
    pub ignore_schedulability: bool,
}

impl InstrumentSelection {
    pub fn accepts(&self, instrument: &Instrument) -> bool {
        if !self.ignore_schedulability && !instrument.schedulable {
            return false;
        }
        self.criteria.iter().all(|c| c.matches(instrument))
    }
}

/// Durable instrument table (one sled tree, JSON values)
#[derive(Clone)]
pub struct InstrumentTable {
    tree: Tree,
}

impl InstrumentTable {
    pub fn new(db: &Db) -> Result<Self, StorageError> {
        let tree = db.open_tree(TREE_INSTRUMENTS)?;
        Ok(Self { tree })
    }

    pub fn shared(db: &Db) -> Result<Arc<Self>, StorageError> {
        Ok(Arc::new(Self::new(db)?))
    }

    /// Insert or replace an instrument.
    pub fn add(&self, instrument: &Instrument) -> Result<(), StorageError> {
        let value = serde_json::to_vec(instrument).map_err(to_storage_data)?;
        self.tree.insert(instrument.id.key().as_bytes(), value)?;
        Ok(())
    }

    pub fn get(&self, id: &InstrumentId) -> Result<Option<Instrument>, StorageError> {
        let Some(raw) = self.tree.get(id.key().as_bytes())? else {
            return Ok(None);
        };
        let instrument = serde_json::from_slice(&raw).map_err(to_storage_data)?;
        Ok(Some(instrument))
    }

    pub fn list(&self) -> Result<Vec<Instrument>, StorageError> {
        let mut instruments = Vec::new();
        for item in self.tree.iter() {
            let (_, value) = item?;
            instruments.push(serde_json::from_slice(&value).map_err(to_storage_data)?);
        }
        Ok(instruments)
    }

    /// Instruments accepted by `selection`
    pub fn select(&self, selection: &InstrumentSelection) -> Result<Vec<Instrument>, StorageError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|i| selection.accepts(i))
            .collect())
    }
}
