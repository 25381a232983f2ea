//! Extraction cache exposing archive entries as ordinary, seekable files.
//!
//! An entry is extracted at most once to a path derived from hashes of the
//! archive path and the entry's absolute location path:
//!
//! ```text
//! <extraction_root>/<hash(archive)>_<archive name>/<hash(location)>_<entry name>
//! ```
//!
//! The hashes cover path strings only, never data, so the same archive and
//! entry always map to the same file, including across process runs. A file
//! already present at the target is trusted.

use std::any::TypeId;
use std::fs::{self, File};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use log::{debug, warn};
use sha2::{Digest, Sha256};

use crate::access::FileSystemStorageAccess;
use crate::archive::nested;
use crate::config::StorageConfig;
use crate::error::{Result, StorageError};
use crate::location::StorageLocation;
use crate::memo::{FileMemo, MemoSource};
use crate::path;

/// First 16 hex digits of the SHA-256 of the case-folded path.
pub fn path_hash(path: &str) -> String {
    let digest = Sha256::digest(path::fold_case(&path::normalize(path)).as_bytes());
    hex::encode(&digest[..8])
}

struct Extractor {
    root: PathBuf,
    buffer_size: usize,
}

impl Extractor {
    /// Extraction target for `location`, derived from its absolute path.
    /// Plain local files have none.
    fn target(&self, location: &StorageLocation) -> Result<Option<PathBuf>> {
        let capability = location.capability()?;
        let absolute = capability
            .absolute_path(location.path())
            .map(|p| path::normalize(&p))
            .ok_or_else(|| StorageError::IndeterminateRoot(location.path().to_string()))?;
        let archive = match path::split_container(&absolute) {
            Some((archive, _)) => archive,
            None if is_local(location)? => return Ok(None),
            // An archive whose own name carries no archive extension.
            None => path::parent(&absolute).unwrap_or(absolute.as_str()),
        };
        let dir = format!("{}_{}", path_hash(archive), path::file_name(archive));
        let file = format!("{}_{}", path_hash(&absolute), path::file_name(&absolute));
        Ok(Some(self.root.join(dir).join(file)))
    }

    fn extract(&self, location: &StorageLocation, target: &Path) -> Result<()> {
        let directory = target
            .parent()
            .ok_or_else(|| StorageError::InvalidDestination(target.display().to_string()))?;
        fs::create_dir_all(directory)?;

        let mut reader = BufReader::with_capacity(self.buffer_size, location.open()?);
        let mut tmp = tempfile::NamedTempFile::new_in(directory)?;
        let copied = io::copy(&mut reader, &mut tmp)?;
        tmp.flush()?;
        match location.last_modified() {
            Ok(modified) => {
                if let Err(e) = tmp.as_file().set_modified(modified) {
                    warn!("could not preserve modification time of {}: {}", target.display(), e);
                }
            }
            Err(e) => debug!("no modification time for {}: {}", location, e),
        }
        tmp.persist(target).map_err(|e| StorageError::Io(e.error))?;
        debug!("extracted {} to {} ({} bytes)", location, target.display(), copied);
        Ok(())
    }
}

impl MemoSource for Extractor {
    type Value = PathBuf;
    type Aux = ();

    fn default_memo(&self) -> PathBuf {
        PathBuf::new()
    }

    fn is_valid_memo(&self, value: &PathBuf) -> bool {
        !value.as_os_str().is_empty()
    }

    fn compute_memo(&self, location: &StorageLocation, _aux: &()) -> Result<PathBuf> {
        let Some(target) = self.target(location)? else {
            return Ok(PathBuf::from(location.path()));
        };
        if target.is_file() {
            debug!("reusing extraction {}", target.display());
        } else {
            self.extract(location, &target)?;
        }
        Ok(target)
    }
}

fn is_local(location: &StorageLocation) -> Result<bool> {
    Ok(location.capability()?.provider_type() == TypeId::of::<FileSystemStorageAccess>())
}

/// Maps storage locations to plain files, extracting archive entries on demand.
pub struct EntryMemo {
    memo: FileMemo<Extractor>,
}

impl EntryMemo {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            memo: FileMemo::new(Extractor {
                root: config.extraction_root.clone(),
                buffer_size: config.archive.buffer_size.max(1),
            }),
        }
    }

    /// The cache configured from the environment.
    pub fn global() -> &'static EntryMemo {
        static MEMO: OnceLock<EntryMemo> = OnceLock::new();
        MEMO.get_or_init(|| EntryMemo::new(&StorageConfig::from_env()))
    }

    pub fn extraction_root(&self) -> &Path {
        &self.memo.source().root
    }

    /// Where `location` is (or would be) extracted. `None` for locations that
    /// are not inside an archive. Relative paths are resolved against the
    /// location's capability first; one that cannot be resolved is an error.
    pub fn target_path(&self, location: &StorageLocation) -> Result<Option<PathBuf>> {
        self.memo.source().target(location)
    }

    /// A plain file holding the data at `location`.
    ///
    /// Locations outside any archive are returned as they are. Locations
    /// bound to an archive capability are memoized on the entry's size and
    /// modification time; a cached extraction that has since been deleted is
    /// extracted again.
    pub fn path_for(&self, location: &StorageLocation) -> Result<PathBuf> {
        let Some(target) = self.target_path(location)? else {
            return Ok(PathBuf::from(location.path()));
        };

        // The local provider cannot see into archives, so such a location has
        // no identity to memoize on; walk the archive chain and trust the target.
        if is_local(location)? {
            if !target.is_file() {
                let located = nested::locate_from(location.path(), Some(location.capability()?))?;
                self.memo.source().extract(&located.location, &target)?;
            }
            return Ok(target);
        }

        if let Some(path) = self.memo.check_memo(location) {
            if path.is_file() {
                return Ok(path);
            }
            debug!("extraction {} disappeared, extracting again", path.display());
            self.memo.remove(location);
        }
        self.memo
            .check_add_memo(location, &())?
            .ok_or_else(|| StorageError::InvalidLocation(location.path().to_string()))
    }

    /// Open the extracted file for reading.
    pub fn open(&self, location: &StorageLocation) -> Result<File> {
        Ok(File::open(self.path_for(location)?)?)
    }

    pub fn forget(&self, location: &StorageLocation) -> bool {
        self.memo.remove(location)
    }

    pub fn len(&self) -> usize {
        self.memo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memo.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn hash_ignores_case_and_separators() {
        assert_eq!(path_hash("C:\\Roms\\Games.zip"), path_hash("c:/roms/games.ZIP"));
        assert_ne!(path_hash("/roms/a.zip"), path_hash("/roms/b.zip"));
        assert_eq!(path_hash("/roms/a.zip").len(), 16);
    }

    fn local(path: &str) -> StorageLocation {
        StorageLocation::with_capability(path, Arc::new(FileSystemStorageAccess::new()))
    }

    #[test]
    fn target_names_keep_base_names() {
        let config = StorageConfig {
            extraction_root: PathBuf::from("/cache"),
            ..StorageConfig::default()
        };
        let memo = EntryMemo::new(&config);
        let location = local("/roms/games.zip/sub/rom.bin");
        let target = memo.target_path(&location).unwrap().unwrap();
        let dir = target.parent().unwrap().file_name().unwrap().to_string_lossy().to_string();
        let file = target.file_name().unwrap().to_string_lossy().to_string();
        assert_eq!(dir, format!("{}_games.zip", path_hash("/roms/games.zip")));
        assert_eq!(file, format!("{}_rom.bin", path_hash("/roms/games.zip/sub/rom.bin")));

        assert!(memo.target_path(&local("/roms/rom.bin")).unwrap().is_none());
    }

    #[test]
    fn relative_local_paths_hash_like_absolute_ones() {
        let memo = EntryMemo::new(&StorageConfig::default());
        let relative = memo.target_path(&local("roms/games.zip/rom.bin")).unwrap().unwrap();
        let cwd = std::env::current_dir().unwrap();
        let absolute = path::join(&cwd.to_string_lossy(), "roms/games.zip/rom.bin");
        let expected = memo.target_path(&local(&absolute)).unwrap().unwrap();
        assert_eq!(relative, expected);
    }
}
