use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use crate::access::{self, InvalidStorageAccess, StorageAccess, StorageStream};
use crate::error::Result;
use crate::path;

/// A path within a storage capability.
///
/// A location without an explicit capability uses whichever provider is the
/// registry default at the time of each operation, so locations can be built
/// before any provider is registered.
///
/// Equality and ordering compare the path case-insensitively and the
/// capability by identity.
#[derive(Clone)]
pub struct StorageLocation {
    path: String,
    capability: Option<Arc<dyn StorageAccess>>,
}

impl StorageLocation {
    pub fn new(path: impl AsRef<str>) -> Self {
        Self {
            path: path::normalize(path.as_ref()),
            capability: None,
        }
    }

    pub fn with_capability(path: impl AsRef<str>, capability: Arc<dyn StorageAccess>) -> Self {
        Self {
            path: path::normalize(path.as_ref()),
            capability: Some(capability),
        }
    }

    /// Sentinel location whose capability fails every query.
    pub fn invalid() -> Self {
        static INVALID: OnceLock<Arc<dyn StorageAccess>> = OnceLock::new();
        let capability = INVALID.get_or_init(|| Arc::new(InvalidStorageAccess));
        Self {
            path: String::new(),
            capability: Some(Arc::clone(capability)),
        }
    }

    pub fn is_invalid(&self) -> bool {
        self.capability
            .as_ref()
            .is_some_and(|c| c.provider_type() == std::any::TypeId::of::<InvalidStorageAccess>())
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_empty(&self) -> bool {
        self.path.is_empty()
    }

    /// The explicit capability, if any. `None` means "registry default".
    pub fn explicit_capability(&self) -> Option<&Arc<dyn StorageAccess>> {
        self.capability.as_ref()
    }

    pub fn uses_default_capability(&self) -> bool {
        self.capability.is_none()
    }

    /// The capability that will service this location right now.
    pub fn capability(&self) -> Result<Arc<dyn StorageAccess>> {
        access::resolve(self.capability.as_ref())
    }

    pub fn open(&self) -> Result<Box<dyn StorageStream>> {
        self.capability()?.open(&self.path)
    }

    pub fn exists(&self) -> bool {
        self.capability().map(|c| c.exists(&self.path)).unwrap_or(false)
    }

    pub fn size(&self) -> Result<u64> {
        self.capability()?.size(&self.path)
    }

    pub fn last_modified(&self) -> Result<SystemTime> {
        self.capability()?.last_modified(&self.path)
    }

    /// A child location sharing this location's capability.
    pub fn join(&self, child: &str) -> Self {
        Self {
            path: path::normalize(&path::join(&self.path, child)),
            capability: self.capability.clone(),
        }
    }

    pub fn parent(&self) -> Option<Self> {
        path::parent(&self.path).map(|parent| Self {
            path: parent.to_string(),
            capability: self.capability.clone(),
        })
    }

    pub fn file_name(&self) -> &str {
        path::file_name(&self.path)
    }

    pub fn extension(&self) -> Option<&str> {
        path::extension(&self.path)
    }

    pub fn with_path(&self, path: impl AsRef<str>) -> Self {
        Self {
            path: path::normalize(path.as_ref()),
            capability: self.capability.clone(),
        }
    }

    fn capability_address(&self) -> usize {
        self.capability
            .as_ref()
            .map(|c| Arc::as_ptr(c) as *const () as usize)
            .unwrap_or(0)
    }
}

impl PartialEq for StorageLocation {
    fn eq(&self, other: &Self) -> bool {
        self.capability_address() == other.capability_address()
            && path::eq_ignore_case(&self.path, &other.path)
    }
}

impl Eq for StorageLocation {}

impl Hash for StorageLocation {
    fn hash<H: Hasher>(&self, state: &mut H) {
        path::fold_case(&self.path).hash(state);
        self.capability_address().hash(state);
    }
}

impl PartialOrd for StorageLocation {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StorageLocation {
    fn cmp(&self, other: &Self) -> Ordering {
        path::cmp_ignore_case(&self.path, &other.path)
            .then_with(|| self.capability_address().cmp(&other.capability_address()))
    }
}

impl fmt::Debug for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageLocation")
            .field("path", &self.path)
            .field(
                "capability",
                &self.capability.as_ref().map(|c| c.provider_name()).unwrap_or("<default>"),
            )
            .finish()
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::FileSystemStorageAccess;
    use std::collections::HashSet;

    #[test]
    fn equality_ignores_case_and_separators() {
        let a = StorageLocation::new("C:\\Roms\\Games.zip");
        let b = StorageLocation::new("c:/roms/games.ZIP");
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn capability_identity_matters() {
        let fs: Arc<dyn StorageAccess> = Arc::new(FileSystemStorageAccess::new());
        let other: Arc<dyn StorageAccess> = Arc::new(FileSystemStorageAccess::new());
        let a = StorageLocation::with_capability("/roms/a.bin", Arc::clone(&fs));
        let b = StorageLocation::with_capability("/roms/A.BIN", fs);
        let c = StorageLocation::with_capability("/roms/a.bin", other);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, StorageLocation::new("/roms/a.bin"));
    }

    #[test]
    fn ordering_is_case_insensitive() {
        let mut locations = vec![
            StorageLocation::new("/b.bin"),
            StorageLocation::new("/A.bin"),
            StorageLocation::new("/c.bin"),
        ];
        locations.sort();
        let paths: Vec<_> = locations.iter().map(|l| l.path()).collect();
        assert_eq!(paths, vec!["/A.bin", "/b.bin", "/c.bin"]);
    }

    #[test]
    fn invalid_location_fails_everything() {
        let invalid = StorageLocation::invalid();
        assert!(invalid.is_invalid());
        assert!(!invalid.exists());
        assert!(invalid.size().is_err());
        assert!(invalid.last_modified().is_err());
        assert!(invalid.open().is_err());
        assert_eq!(invalid, StorageLocation::invalid());
    }

    #[test]
    fn join_and_parent_share_capability() {
        let fs: Arc<dyn StorageAccess> = Arc::new(FileSystemStorageAccess::new());
        let root = StorageLocation::with_capability("/roms/games.zip", Arc::clone(&fs));
        let child = root.join("sub/rom.bin");
        assert_eq!(child.path(), "/roms/games.zip/sub/rom.bin");
        assert_eq!(child.parent().unwrap(), root.join("sub"));
        assert_eq!(child.file_name(), "rom.bin");
        assert_eq!(child.extension(), Some("bin"));
    }
}
