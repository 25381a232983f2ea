//! Locating paths that run through one or more archives.
//!
//! `/roms/collection.tar/games.zip/rom.bin` is reached by opening
//! `collection.tar` from the local provider, then `games.zip` from inside
//! it, and binding `rom.bin` to the innermost archive.

use std::sync::Arc;

use log::debug;

use super::{ArchiveAccess, ArchiveAccessMode, ArchiveBuilder};
use crate::access::{self, StorageAccess};
use crate::error::Result;
use crate::location::StorageLocation;
use crate::path;

/// The chain of archives opened to reach a path, outermost first.
pub struct Located {
    pub location: StorageLocation,
    pub archives: Vec<Arc<ArchiveAccess>>,
}

impl Located {
    pub fn innermost(&self) -> Option<&Arc<ArchiveAccess>> {
        self.archives.last()
    }
}

/// Walk `path` through every archive segment that has something after it.
///
/// The walk starts at `base` (the default provider when `None`) and stops at
/// the first segment that does not exist; the remainder is then addressed
/// through the last archive reached.
pub fn locate_from(path: &str, base: Option<Arc<dyn StorageAccess>>) -> Result<Located> {
    let path = path::normalize(path);
    let mut capability = access::resolve(base.as_ref())?;
    let mut archives = Vec::new();

    for prefix in path::archive_prefixes(&path) {
        if prefix.len() == path::trim_trailing_separator(&path).len() {
            break;
        }
        let container = StorageLocation::with_capability(prefix, Arc::clone(&capability));
        if !container.exists() {
            debug!("nested: {} does not exist, stopping", prefix);
            break;
        }
        let archive = Arc::new(
            ArchiveBuilder::new()
                .mode(ArchiveAccessMode::Read)
                .open_location(&container)?,
        );
        debug!("nested: opened {} ({} entries)", prefix, archive.entries()?.len());
        capability = Arc::clone(&archive) as Arc<dyn StorageAccess>;
        archives.push(archive);
    }

    Ok(Located {
        location: StorageLocation::with_capability(&path, capability),
        archives,
    })
}

/// A location for `path` bound to the innermost archive that contains it.
pub fn locate(path: &str) -> Result<StorageLocation> {
    Ok(locate_from(path, None)?.location)
}

/// The innermost archive containing `path`, if any.
pub fn locate_archive(path: &str) -> Result<Option<Arc<ArchiveAccess>>> {
    Ok(locate_from(path, None)?.archives.pop())
}
