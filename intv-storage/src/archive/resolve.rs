use crate::error::{Result, StorageError};
use crate::path;

/// Make `location_path` relative to an archive rooted at `root`.
///
/// Relative paths are already archive-relative and pass through. With no
/// root (archive opened from a bare stream) the innermost archive segment of
/// the path itself is taken as the root. The root followed by a single
/// separator denotes the archive's top level.
pub fn resolve_archive_path(location_path: &str, root: Option<&str>) -> Result<String> {
    let location_path = path::normalize(location_path);
    if !path::is_absolute(&location_path) {
        return Ok(location_path);
    }

    let root = match root.map(path::normalize).filter(|r| !r.is_empty()) {
        Some(root) => root,
        None => path::archive_prefixes(&location_path)
            .last()
            .map(|prefix| prefix.to_string())
            .ok_or_else(|| StorageError::IndeterminateRoot(location_path.clone()))?,
    };
    let root = path::trim_trailing_separator(&root);

    // A trailing separator after the root itself leaves an empty remainder.
    match path::strip_segment_prefix(&location_path, root) {
        Some(rest) => Ok(rest.trim_start_matches(path::SEPARATOR).to_string()),
        None => Err(StorageError::OutsideArchive {
            path: location_path.clone(),
            root: root.to_string(),
        }),
    }
}
