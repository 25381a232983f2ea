//! Zip backend that loads the container into memory.
//!
//! Changes are kept as an overlay of added and deleted entries and the
//! container is rebuilt once, when the archive is closed.

use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::time::SystemTime;

use log::debug;
use zip::{ZipArchive, ZipWriter};

use super::backend::{ArchiveBackend, BackendContext};
use super::timestamp;
use super::zip_native::{file_options, load_entries};
use super::{ArchiveAccessMode, ArchiveEntry, ArchiveImplementation, EntryDetail, EntryTable};
use crate::access::StorageStream;
use crate::config::ArchiveOptions;
use crate::error::{Result, StorageError};
use crate::path;

struct Added {
    name: String,
    data: Vec<u8>,
    modified: SystemTime,
    is_directory: bool,
}

struct BufferedZip {
    stream: Box<dyn StorageStream>,
    original: Option<ZipArchive<Cursor<Vec<u8>>>>,
    added: Vec<Added>,
    /// Original entries that must not be copied into the rebuilt container.
    dropped: Vec<String>,
    entries: EntryTable,
    options: ArchiveOptions,
    dirty: bool,
}

pub(crate) fn open(
    mut stream: Box<dyn StorageStream>,
    ctx: BackendContext<'_>,
) -> Result<Box<dyn ArchiveBackend>> {
    let caps = stream.capabilities();
    if ctx.mode.is_writable() && !(caps.readable && caps.writable) {
        return Err(StorageError::StreamCapability {
            implementation: ArchiveImplementation::Buffered,
            reason: "buffered zip archives rewrite their source and need it readable and writable",
        });
    }

    let mut original = None;
    let mut entries = EntryTable::new();
    if ctx.mode != ArchiveAccessMode::Create {
        let mut bytes = Vec::new();
        stream.seek(SeekFrom::Start(0))?;
        stream.read_to_end(&mut bytes)?;
        if !bytes.is_empty() || ctx.mode == ArchiveAccessMode::Read {
            let mut archive = ZipArchive::new(Cursor::new(bytes))?;
            entries = load_entries(&mut archive)?;
            original = Some(archive);
        }
    }

    Ok(Box::new(BufferedZip {
        stream,
        original,
        added: Vec::new(),
        dropped: Vec::new(),
        entries,
        options: ctx.options.clone(),
        // Create always writes a container, even an empty one.
        dirty: ctx.mode == ArchiveAccessMode::Create,
    }))
}

fn same_name(a: &str, b: &str) -> bool {
    path::eq_ignore_case(path::trim_trailing_separator(a), path::trim_trailing_separator(b))
}

impl BufferedZip {
    fn drop_original(&mut self, name: &str) {
        let in_original = self
            .original
            .as_ref()
            .is_some_and(|archive| archive.file_names().any(|n| same_name(n, name)));
        if in_original && !self.dropped.iter().any(|n| same_name(n, name)) {
            self.dropped.push(name.to_string());
        }
    }

    fn rebuild(&mut self) -> Result<Vec<u8>> {
        let mut out = ZipWriter::new(Cursor::new(Vec::new()));
        if let Some(archive) = self.original.as_mut() {
            for i in 0..archive.len() {
                let file = archive.by_index_raw(i)?;
                if self.dropped.iter().any(|n| same_name(n, file.name())) {
                    continue;
                }
                out.raw_copy_file(file)?;
            }
        }
        for added in &self.added {
            let options = file_options(&self.options, added.modified);
            if added.is_directory {
                out.add_directory(added.name.as_str(), options)?;
            } else {
                out.start_file(added.name.as_str(), options)?;
                out.write_all(&added.data)?;
            }
        }
        Ok(out.finish()?.into_inner())
    }
}

impl ArchiveBackend for BufferedZip {
    fn entries(&self) -> &[ArchiveEntry] {
        self.entries.as_slice()
    }

    fn read_entry(&mut self, entry: &ArchiveEntry) -> Result<Vec<u8>> {
        if let Some(added) = self.added.iter().find(|a| same_name(&a.name, entry.name())) {
            return Ok(added.data.clone());
        }
        let archive = self
            .original
            .as_mut()
            .ok_or_else(|| StorageError::EntryNotFound(entry.name().to_string()))?;
        let mut file = archive.by_name(entry.name())?;
        let mut data = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut data)?;
        Ok(data)
    }

    fn create_entry(&mut self, name: &str) -> Result<ArchiveEntry> {
        let entry = ArchiveEntry::pending(name);
        if entry.is_directory() {
            let modified = timestamp::from_zip(timestamp::to_zip(SystemTime::now()));
            self.added.push(Added {
                name: name.to_string(),
                data: Vec::new(),
                modified,
                is_directory: true,
            });
            self.dirty = true;
            let detail = EntryDetail::Zip {
                compressed_size: 0,
                crc32: 0,
            };
            let entry = ArchiveEntry::new(name, 0, modified, true, detail);
            self.entries.push(entry.clone());
            return Ok(entry);
        }
        self.entries.push(entry.clone());
        Ok(entry)
    }

    fn commit_entry(
        &mut self,
        name: &str,
        data: &[u8],
        modified: SystemTime,
    ) -> Result<ArchiveEntry> {
        let name = self
            .entries
            .find(name)
            .map(|e| e.name().to_string())
            .unwrap_or_else(|| name.to_string());
        self.drop_original(&name);
        self.added.retain(|a| !same_name(&a.name, &name));
        self.added.push(Added {
            name: name.clone(),
            data: data.to_vec(),
            modified,
            is_directory: false,
        });
        self.dirty = true;

        let entry = ArchiveEntry::new(
            name,
            data.len() as u64,
            timestamp::from_zip(timestamp::to_zip(modified)),
            false,
            EntryDetail::Zip {
                compressed_size: data.len() as u64,
                crc32: crc32fast::hash(data),
            },
        );
        self.entries.upsert(entry.clone());
        Ok(entry)
    }

    fn delete_entry(&mut self, entry: &ArchiveEntry) -> Result<()> {
        self.drop_original(entry.name());
        self.added.retain(|a| !same_name(&a.name, entry.name()));
        self.entries.remove(entry.name());
        self.dirty = true;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<Box<dyn StorageStream>> {
        for name in self.entries.pending_names() {
            self.commit_entry(&name, &[], SystemTime::now())?;
        }
        if self.dirty {
            let bytes = self.rebuild()?;
            self.stream.seek(SeekFrom::Start(0))?;
            self.stream.write_all(&bytes)?;
            self.stream.truncate(bytes.len() as u64)?;
            debug!("buffered zip: wrote {} entries ({} bytes)", self.entries.len(), bytes.len());
        }
        Ok(self.stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::ReadOnlyStream;

    fn context(mode: ArchiveAccessMode, options: &ArchiveOptions) -> BackendContext<'_> {
        BackendContext { mode, options, root_path: None }
    }

    fn contents(mut stream: Box<dyn StorageStream>) -> Vec<u8> {
        let mut bytes = Vec::new();
        stream.seek(SeekFrom::Start(0)).unwrap();
        stream.read_to_end(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn write_modes_need_writable_source() {
        let options = ArchiveOptions::default();
        let stream = Box::new(ReadOnlyStream::from_bytes(Vec::new()));
        let err = open(stream, context(ArchiveAccessMode::Create, &options)).err().unwrap();
        assert!(matches!(
            err,
            StorageError::StreamCapability { implementation: ArchiveImplementation::Buffered, .. }
        ));
    }

    #[test]
    fn overlay_is_visible_before_close() {
        let options = ArchiveOptions::default();
        let stream = Box::new(Cursor::new(Vec::new()));
        let mut backend = open(stream, context(ArchiveAccessMode::Create, &options)).unwrap();
        backend.create_entry("a.bin").unwrap();
        let entry = backend.commit_entry("a.bin", b"alpha", SystemTime::now()).unwrap();
        assert_eq!(backend.read_entry(&entry).unwrap(), b"alpha");

        let bytes = contents(backend.finish().unwrap());
        let stream = Box::new(ReadOnlyStream::from_bytes(bytes));
        let mut backend = open(stream, context(ArchiveAccessMode::Read, &options)).unwrap();
        let entry = backend.entries()[0].clone();
        assert_eq!(backend.read_entry(&entry).unwrap(), b"alpha");
    }

    #[test]
    fn update_drops_replaced_and_deleted_originals() {
        let options = ArchiveOptions::default();
        let stream = Box::new(Cursor::new(Vec::new()));
        let mut backend = open(stream, context(ArchiveAccessMode::Create, &options)).unwrap();
        for (name, data) in [("a.bin", "one"), ("b.bin", "two")] {
            backend.create_entry(name).unwrap();
            backend.commit_entry(name, data.as_bytes(), SystemTime::now()).unwrap();
        }
        let bytes = contents(backend.finish().unwrap());

        let stream = Box::new(Cursor::new(bytes));
        let mut backend = open(stream, context(ArchiveAccessMode::Update, &options)).unwrap();
        backend.commit_entry("A.BIN", b"uno", SystemTime::now()).unwrap();
        let b = backend.entries()[1].clone();
        backend.delete_entry(&b).unwrap();
        let bytes = contents(backend.finish().unwrap());

        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 1);
        let mut data = String::new();
        archive.by_name("a.bin").unwrap().read_to_string(&mut data).unwrap();
        assert_eq!(data, "uno");
    }
}
