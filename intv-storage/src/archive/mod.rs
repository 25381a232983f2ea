//! Archive containers exposed as path-addressable storage.
//!
//! An [`ArchiveAccess`] wraps one backend chosen through the
//! [`ArchiveFactoryRegistry`]. Backends exist for zip (native and buffered),
//! gzip (native single-member and buffered multi-member) and tar.

mod access;
mod backend;
mod entry;
mod factory;
mod gzip;
mod gzip_multi;
pub mod nested;
mod resolve;
mod tar_archive;
mod timestamp;
mod zip_buffered;
mod zip_native;

use std::io::{Read, SeekFrom};

use serde::Serialize;

use crate::access::StorageStream;
use crate::error::Result;
use crate::path;

pub use access::{ArchiveAccess, ArchiveBuilder, EntryStream, EntryWriter};
pub use backend::{ArchiveBackend, BackendContext};
pub use entry::{ArchiveEntry, EntryDetail, EntryTable};
pub use factory::{factories, ArchiveFactory, ArchiveFactoryRegistry, CompressedArchiveIdentifier};
pub use resolve::resolve_archive_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ArchiveFormat {
    Zip,
    GZip,
    Tar,
}

impl ArchiveFormat {
    pub const ALL: [ArchiveFormat; 3] = [Self::Zip, Self::GZip, Self::Tar];

    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            Self::Zip => &["zip"],
            Self::GZip => &["gz", "gzip", "tgz"],
            Self::Tar => &["tar"],
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|f| f.extensions().iter().any(|e| e.eq_ignore_ascii_case(ext)))
    }

    pub fn from_path(path: &str) -> Option<Self> {
        path::extension(path).and_then(Self::from_extension)
    }

    /// Identify a container from its leading bytes.
    pub fn sniff(header: &[u8]) -> Option<Self> {
        match infer::get(header)?.mime_type() {
            "application/zip" => Some(Self::Zip),
            "application/gzip" => Some(Self::GZip),
            "application/x-tar" => Some(Self::Tar),
            _ => None,
        }
    }

    /// Read enough of `stream` to sniff its format, then rewind it.
    pub fn sniff_stream(stream: &mut dyn StorageStream) -> Result<Option<Self>> {
        let start = stream.stream_position()?;
        let mut header = Vec::with_capacity(512);
        Read::take(&mut *stream, 512).read_to_end(&mut header)?;
        stream.seek(SeekFrom::Start(start))?;
        Ok(Self::sniff(&header))
    }

    pub fn supports_mode(self, mode: ArchiveAccessMode) -> bool {
        !matches!((self, mode), (Self::Tar, ArchiveAccessMode::Update))
    }
}

/// Which codec implementation realises a format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Default)]
pub enum ArchiveImplementation {
    /// Wildcard: whichever concrete implementation was registered first.
    #[default]
    Any,
    /// Streams directly against the underlying byte source.
    Native,
    /// Holds the container in memory and rewrites it on close. Requires a
    /// readable and writable source for every write mode.
    Buffered,
}

/// Fixed when the archive is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ArchiveAccessMode {
    Read,
    Create,
    Update,
}

impl ArchiveAccessMode {
    pub fn is_writable(self) -> bool {
        !matches!(self, Self::Read)
    }
}
