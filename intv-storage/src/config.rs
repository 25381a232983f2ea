use std::env;
use std::path::PathBuf;

use crate::archive::ArchiveImplementation;

/// Environment variable overriding [`StorageConfig::extraction_root`].
pub const CACHE_DIR_ENV: &str = "INTV_STORAGE_CACHE_DIR";

/// Process-level settings for the storage layer.
#[derive(Clone, Debug)]
pub struct StorageConfig {
    /// Directory under which archive entries are extracted for seekable access.
    pub extraction_root: PathBuf,

    /// Implementation requested when callers do not name one.
    pub preferred_implementation: ArchiveImplementation,

    /// Options passed to archive backends.
    pub archive: ArchiveOptions,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            extraction_root: env::temp_dir().join("intv-storage").join("entries"),
            preferred_implementation: ArchiveImplementation::Any,
            archive: ArchiveOptions::default(),
        }
    }
}

impl StorageConfig {
    /// Defaults, with the extraction root taken from `INTV_STORAGE_CACHE_DIR` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(dir) = env::var_os(CACHE_DIR_ENV).filter(|v| !v.is_empty()) {
            config.extraction_root = PathBuf::from(dir);
        }
        config
    }
}

/// Settings consumed by archive backends when they write.
#[derive(Clone, Debug)]
pub struct ArchiveOptions {
    /// Deflate level for zip entries (0-9). `None` means store uncompressed.
    pub zip_level: Option<u32>,

    /// Deflate level for gzip members (0-9).
    pub gzip_level: u32,

    /// Buffer size for copying entry data.
    pub buffer_size: usize,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            zip_level: Some(6),
            gzip_level: 6,
            buffer_size: 64 * 1024,
        }
    }
}
