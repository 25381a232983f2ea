//! Path-addressable storage over plain files and zip, gzip and tar
//! archives, including archives nested inside other archives.

pub mod access;
pub mod archive;
pub mod config;
pub mod crc32;
pub mod entry_memo;
pub mod error;
pub mod location;
pub mod memo;
pub mod path;

pub use access::{FileSystemStorageAccess, StorageAccess, StorageStream};
pub use archive::{
    ArchiveAccess, ArchiveAccessMode, ArchiveBuilder, ArchiveEntry, ArchiveFormat,
    ArchiveImplementation,
};
pub use config::{ArchiveOptions, StorageConfig};
pub use crc32::{Crc32, Crc32Polynomial, FileCrcOptions};
pub use entry_memo::EntryMemo;
pub use error::{ErrorCategory, Result, StorageError};
pub use location::StorageLocation;
pub use memo::{FileMemo, MemoSource};
