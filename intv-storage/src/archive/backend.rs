use std::time::SystemTime;

use super::{ArchiveAccessMode, ArchiveEntry};
use crate::access::StorageStream;
use crate::config::ArchiveOptions;
use crate::error::Result;
use crate::path;

/// What a factory knows about the archive it is constructing.
#[derive(Debug, Clone, Copy)]
pub struct BackendContext<'a> {
    pub mode: ArchiveAccessMode,
    pub options: &'a ArchiveOptions,
    /// Path of the archive itself when opened from a named location.
    pub root_path: Option<&'a str>,
}

impl BackendContext<'_> {
    /// Entry name for formats that may not record one (gzip): the archive's
    /// file name without its compression extension.
    pub fn implied_entry_name(&self) -> String {
        self.root_path
            .map(path::file_stem)
            .filter(|stem| !stem.is_empty())
            .unwrap_or("data")
            .to_string()
    }
}

/// One codec's realisation of an archive.
///
/// [`ArchiveAccess`](super::ArchiveAccess) validates the access mode,
/// resolves names, and serialises calls before they reach a backend.
/// The backend owns the byte stream until [`finish`](Self::finish) hands it
/// back.
pub trait ArchiveBackend: Send {
    /// Entries materialised at open time plus any created since.
    fn entries(&self) -> &[ArchiveEntry];

    /// Decompressed data of a file entry.
    fn read_entry(&mut self, entry: &ArchiveEntry) -> Result<Vec<u8>>;

    /// Register `name`. Directory markers (trailing `/`) are committed
    /// immediately; files are placeholders until [`commit_entry`](Self::commit_entry).
    fn create_entry(&mut self, name: &str) -> Result<ArchiveEntry>;

    /// Write the data of a file entry into the container.
    fn commit_entry(
        &mut self,
        name: &str,
        data: &[u8],
        modified: SystemTime,
    ) -> Result<ArchiveEntry>;

    fn delete_entry(&mut self, entry: &ArchiveEntry) -> Result<()>;

    /// Flush everything outstanding and release the codec handle, returning
    /// the underlying stream.
    fn finish(self: Box<Self>) -> Result<Box<dyn StorageStream>>;
}
