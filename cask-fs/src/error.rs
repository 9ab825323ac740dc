use std::io;
use std::path::PathBuf;

use cask_tarp::ColumnError;

#[derive(Debug, thiserror::Error)]
/// An error that can occur when reading or writing a column store.
pub enum StoreError {
    #[error("IO Error: {0}")]
    /// An IO error that occurred while attempting to complete
    /// the operation.
    Io(#[from] io::Error),
    #[error("Column Error: {0}")]
    /// The stored or provided columns violate a column invariant.
    Column(#[from] ColumnError),
    #[error("Header Error: {0}")]
    /// An array header could not be serialized.
    Header(#[from] serde_json::Error),
    #[error("Keys not found: {0:?}")]
    /// None of the requested columns exist in the store.
    KeyNotFound(Vec<String>),
    #[error("Location not found: {}", .0.display())]
    /// The store location does not exist.
    NotFound(PathBuf),
    #[error("Already exists: {}", .0.display())]
    /// The target of a write already exists and will not be overwritten.
    AlreadyExists(PathBuf),
    #[error("Store Corrupted ({}): {reason}", .path.display())]
    /// Some part of the persisted data is malformed or truncated.
    Corrupted { path: PathBuf, reason: String },
    #[error("Ambiguous category index: found {0:?}")]
    /// More than one category index exists in the same location.
    AmbiguousCategoryIndex(Vec<String>),
    #[error("Category Mismatch ({name}): {reason}")]
    /// A freshly computed category index does not match the persisted one.
    CategoryMismatch { name: String, reason: String },
    #[error("Invalid name: {0:?} cannot be used as a column or category name")]
    /// The name would collide with the store's own file naming.
    InvalidName(String),
}

impl StoreError {
    pub(crate) fn corrupted(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
