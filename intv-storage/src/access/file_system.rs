use std::fs::{self, File};
use std::path::Path;
use std::time::SystemTime;

use super::{StorageAccess, StorageStream};
use crate::error::Result;

/// Local disk provider.
///
/// Files are opened read/write when permitted, falling back to read-only,
/// so that archives opened through this provider can be updated in place.
#[derive(Debug, Default)]
pub struct FileSystemStorageAccess;

impl FileSystemStorageAccess {
    pub fn new() -> Self {
        Self
    }
}

impl StorageAccess for FileSystemStorageAccess {
    /// Relative paths are taken against the current directory.
    fn absolute_path(&self, path: &str) -> Option<String> {
        if crate::path::is_absolute(path) {
            return Some(path.to_string());
        }
        let absolute = std::path::absolute(path).ok()?;
        Some(crate::path::normalize(&absolute.to_string_lossy()))
    }

    fn open(&self, path: &str) -> Result<Box<dyn StorageStream>> {
        let file = match File::options().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(_) => File::open(path)?,
        };
        Ok(Box::new(file))
    }

    /// Missing parent directories are created.
    fn create(&self, path: &str) -> Result<Box<dyn StorageStream>> {
        let path = Path::new(path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Box::new(file))
    }

    fn exists(&self, path: &str) -> bool {
        Path::new(path).exists()
    }

    fn size(&self, path: &str) -> Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    fn last_modified(&self, path: &str) -> Result<SystemTime> {
        Ok(fs::metadata(path)?.modified()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn reports_metadata_and_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rom.bin");
        fs::write(&path, b"\x01\x02\x03").unwrap();
        let path = path.to_string_lossy().to_string();

        let access = FileSystemStorageAccess::new();
        assert!(access.exists(&path));
        assert_eq!(access.size(&path).unwrap(), 3);
        assert!(access.last_modified(&path).is_ok());

        let mut data = Vec::new();
        access.open(&path).unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, vec![1, 2, 3]);

        assert!(!access.exists(&format!("{path}.missing")));
        assert!(access.size(&format!("{path}.missing")).is_err());
    }

    #[test]
    fn create_makes_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out/archive.zip");
        let access = FileSystemStorageAccess::new();
        let mut stream = access.create(&path.to_string_lossy()).unwrap();
        stream.write_all(b"PK").unwrap();
        drop(stream);
        assert_eq!(fs::read(&path).unwrap(), b"PK");
    }
}
