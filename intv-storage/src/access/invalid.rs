use std::time::SystemTime;

use super::{StorageAccess, StorageStream};
use crate::error::{Result, StorageError};

/// Capability carried by [`StorageLocation::invalid`]: nothing exists and
/// nothing can be opened.
///
/// [`StorageLocation::invalid`]: crate::StorageLocation::invalid
#[derive(Debug, Default)]
pub struct InvalidStorageAccess;

impl StorageAccess for InvalidStorageAccess {
    fn open(&self, path: &str) -> Result<Box<dyn StorageStream>> {
        Err(StorageError::InvalidLocation(path.to_string()))
    }

    fn exists(&self, _path: &str) -> bool {
        false
    }

    fn size(&self, path: &str) -> Result<u64> {
        Err(StorageError::InvalidLocation(path.to_string()))
    }

    fn last_modified(&self, path: &str) -> Result<SystemTime> {
        Err(StorageError::InvalidLocation(path.to_string()))
    }
}
