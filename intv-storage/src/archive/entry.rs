use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::path;

/// Backend-specific data carried by an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryDetail {
    /// Registered by `create_entry` but not yet written.
    Pending,
    Zip { compressed_size: u64, crc32: u32 },
    /// One gzip member: its position and compressed length in the container.
    GZip { member: usize, offset: u64, compressed_len: u64 },
    /// Position of the entry data within the tar stream.
    Tar { data_offset: u64 },
}

/// One item inside an archive.
///
/// Names are archive-relative and `/` separated. Zip directory entries keep
/// their trailing separator; tar directories are flagged by the header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveEntry {
    name: String,
    length: u64,
    last_modified: SystemTime,
    is_directory: bool,
    #[serde(skip)]
    detail: EntryDetail,
}

impl ArchiveEntry {
    pub fn new(
        name: impl Into<String>,
        length: u64,
        last_modified: SystemTime,
        is_directory: bool,
        detail: EntryDetail,
    ) -> Self {
        Self {
            name: name.into(),
            length,
            last_modified,
            is_directory,
            detail,
        }
    }

    pub(crate) fn pending(name: &str) -> Self {
        let is_directory = path::ends_with_separator(name);
        Self::new(name, 0, SystemTime::now(), is_directory, EntryDetail::Pending)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn last_modified(&self) -> SystemTime {
        self.last_modified
    }

    pub fn is_directory(&self) -> bool {
        self.is_directory
    }

    pub fn detail(&self) -> &EntryDetail {
        &self.detail
    }

    pub fn is_pending(&self) -> bool {
        self.detail == EntryDetail::Pending
    }

    /// Name without any trailing separator.
    pub fn trimmed_name(&self) -> &str {
        path::trim_trailing_separator(&self.name)
    }

    pub fn matches(&self, name: &str) -> bool {
        path::eq_ignore_case(self.trimmed_name(), path::trim_trailing_separator(name))
    }
}

impl Default for ArchiveEntry {
    fn default() -> Self {
        Self::new(String::new(), 0, UNIX_EPOCH, false, EntryDetail::Pending)
    }
}

/// Ordered entry list shared by the backends.
#[derive(Debug, Default, Clone)]
pub struct EntryTable {
    entries: Vec<ArchiveEntry>,
}

impl EntryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_slice(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, name: &str) -> Option<&ArchiveEntry> {
        self.entries.iter().find(|e| e.matches(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    /// Whether any entry lives below `dir`, making it an implicit directory.
    pub fn has_children(&self, dir: &str) -> bool {
        let dir = path::trim_trailing_separator(dir);
        self.entries
            .iter()
            .any(|e| !e.matches(dir) && path::starts_with_segment(e.name(), dir))
    }

    pub fn push(&mut self, entry: ArchiveEntry) {
        self.entries.push(entry);
    }

    /// Replace the entry with the same name, or append.
    pub fn upsert(&mut self, entry: ArchiveEntry) {
        match self.entries.iter_mut().find(|e| e.matches(entry.name())) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<ArchiveEntry> {
        let idx = self.entries.iter().position(|e| e.matches(name))?;
        Some(self.entries.remove(idx))
    }

    pub fn pending_names(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.is_pending())
            .map(|e| e.name().to_string())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ArchiveEntry> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ArchiveEntry> {
        self.entries.iter_mut()
    }
}
