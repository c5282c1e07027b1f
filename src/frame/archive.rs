//! Frame archive
//!
//! File-backed storage for raw inputs and reduced products. Products are
//! stored at `{root}/processed/{site}/{camera}/{YYYYMMDD}/{frame_id}-{digest}.frame`
//! where `digest` is the first 12 hex digits of the blake3 hash of the
//! serialized product. A product file is never overwritten with different
//! content.

use crate::error::{ReductionError, StorageError};
use crate::frame::{Frame, RawFrame};
use crate::types::FrameId;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// File extension of serialized frames
pub const FRAME_EXTENSION: &str = "frame";

/// Hex digits of the content digest kept in product file names
const PRODUCT_DIGEST_LEN: usize = 12;

/// Pixel storage used by the orchestrator and stages
pub trait FrameStore: Send + Sync {
    /// Read a frame from `location`.
    ///
    /// A missing file is `NotFound`; undecodable content is `CorruptFrame`.
    fn read(&self, location: &Path) -> Result<RawFrame, ReductionError>;

    /// Persist a reduced frame and return where it was written. Distinct
    /// content for the same frame lands at a distinct location.
    fn write(&self, frame: &Frame) -> Result<PathBuf, ReductionError>;

    /// Content checksum of the file at `location` (hex blake3).
    fn checksum(&self, location: &Path) -> Result<String, ReductionError>;
}

/// Filesystem `FrameStore` with atomic writes
pub struct FrameArchive {
    root: PathBuf,
}

impl FrameArchive {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        let processed = root.join("processed");
        fs::create_dir_all(&processed).map_err(|e| {
            StorageError::IoError(std::io::Error::new(
                e.kind(),
                format!("Failed to create archive directory at {:?}: {}", processed, e),
            ))
        })?;
        Ok(Self { root })
    }

    /// Path a reduced frame with serialized form `content` is stored under
    pub fn product_path(&self, frame: &Frame, content: &[u8]) -> PathBuf {
        let descriptor = &frame.descriptor;
        let digest = hex::encode(blake3::hash(content).as_bytes());
        self.root
            .join("processed")
            .join(&descriptor.instrument().site)
            .join(&descriptor.instrument().camera)
            .join(descriptor.observed_at().format("%Y%m%d").to_string())
            .join(format!(
                "{}-{}.{}",
                descriptor.frame_id(),
                &digest[..PRODUCT_DIGEST_LEN],
                FRAME_EXTENSION
            ))
    }

    /// Write a raw frame into `dir` as `{stem}.frame`.
    pub fn write_raw(dir: &Path, stem: &str, raw: &RawFrame) -> Result<PathBuf, StorageError> {
        let path = dir.join(format!("{}.{}", stem, FRAME_EXTENSION));
        write_atomic(&path, &serialize(raw)?)?;
        Ok(path)
    }

    /// All frame files under `dir`, sorted by path
    pub fn scan(dir: &Path) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = WalkDir::new(dir)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some(FRAME_EXTENSION))
            .collect();
        paths.sort();
        paths
    }

    /// File stem used as the fallback frame identity
    pub fn stem(location: &Path) -> String {
        location
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl FrameStore for FrameArchive {
    fn read(&self, location: &Path) -> Result<RawFrame, ReductionError> {
        let bytes = match fs::read(location) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ReductionError::NotFound(format!(
                    "frame file {}",
                    location.display()
                )))
            }
            Err(e) => return Err(StorageError::IoError(e).into()),
        };
        bincode::deserialize(&bytes).map_err(|e| {
            ReductionError::corrupt(
                &FrameId::new(Self::stem(location)),
                format!("cannot decode {}: {}", location.display(), e),
            )
        })
    }

    fn write(&self, frame: &Frame) -> Result<PathBuf, ReductionError> {
        let serialized = serialize(&frame.to_raw())?;
        let path = self.product_path(frame, &serialized);
        if path.is_file() {
            debug!(location = %path.display(), "Identical product already archived");
            return Ok(path);
        }
        write_atomic(&path, &serialized)?;
        Ok(path)
    }

    fn checksum(&self, location: &Path) -> Result<String, ReductionError> {
        let bytes = match fs::read(location) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ReductionError::NotFound(format!(
                    "frame file {}",
                    location.display()
                )))
            }
            Err(e) => return Err(StorageError::IoError(e).into()),
        };
        Ok(hex::encode(blake3::hash(&bytes).as_bytes()))
    }
}

fn serialize(raw: &RawFrame) -> Result<Vec<u8>, StorageError> {
    bincode::serialize(raw)
        .map_err(|e| StorageError::InvalidData(format!("Failed to serialize frame: {}", e)))
}

/// Write to `{path}.tmp`, then rename over `path`.
fn write_atomic(path: &Path, serialized: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            StorageError::IoError(std::io::Error::new(
                e.kind(),
                format!("Failed to create parent directory {:?}: {}", parent, e),
            ))
        })?;
    }

    let temp_path = path.with_extension("frame.tmp");
    fs::write(&temp_path, serialized).map_err(|e| {
        StorageError::IoError(std::io::Error::new(
            e.kind(),
            format!("Failed to write frame to {:?}: {}", temp_path, e),
        ))
    })?;

    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        StorageError::IoError(std::io::Error::new(
            e.kind(),
            format!("Failed to rename temp file to {:?}: {}", path, e),
        ))
    })?;

    Ok(())
}
