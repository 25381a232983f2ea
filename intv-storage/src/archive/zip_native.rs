//! Zip backend streaming directly against the archive's byte source.
//!
//! The `zip` crate reads and writes through separate types, so the backend
//! switches lazily between a reader and an appending writer. Deleting an
//! entry rewrites the container without it by raw-copying the survivors.

use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::time::SystemTime;

use log::{debug, trace};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::backend::{ArchiveBackend, BackendContext};
use super::timestamp;
use super::{ArchiveAccessMode, ArchiveEntry, EntryDetail, EntryTable};
use crate::access::StorageStream;
use crate::config::ArchiveOptions;
use crate::error::{Result, StorageError};
use crate::path;

type Stream = Box<dyn StorageStream>;

enum State {
    Reading(ZipArchive<Stream>),
    Writing(ZipWriter<Stream>),
}

struct NativeZip {
    state: Option<State>,
    entries: EntryTable,
    options: ArchiveOptions,
}

pub(crate) fn open(mut stream: Stream, ctx: BackendContext<'_>) -> Result<Box<dyn ArchiveBackend>> {
    let state = match ctx.mode {
        ArchiveAccessMode::Create => {
            stream.truncate(0)?;
            stream.seek(SeekFrom::Start(0))?;
            State::Writing(ZipWriter::new(stream))
        }
        ArchiveAccessMode::Update if stream.byte_len()? == 0 => {
            State::Writing(ZipWriter::new(stream))
        }
        ArchiveAccessMode::Read | ArchiveAccessMode::Update => {
            stream.seek(SeekFrom::Start(0))?;
            State::Reading(ZipArchive::new(stream)?)
        }
    };

    let mut backend = NativeZip {
        state: Some(state),
        entries: EntryTable::new(),
        options: ctx.options.clone(),
    };
    if let Some(State::Reading(archive)) = backend.state.as_mut() {
        backend.entries = load_entries(archive)?;
    }
    Ok(Box::new(backend))
}

pub(super) fn load_entries<R: Read + Seek>(archive: &mut ZipArchive<R>) -> Result<EntryTable> {
    let mut entries = EntryTable::new();
    for i in 0..archive.len() {
        let file = archive.by_index_raw(i)?;
        let modified = file
            .last_modified()
            .map(timestamp::from_zip)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        entries.push(ArchiveEntry::new(
            file.name(),
            file.size(),
            modified,
            file.is_dir(),
            EntryDetail::Zip {
                compressed_size: file.compressed_size(),
                crc32: file.crc32(),
            },
        ));
    }
    Ok(entries)
}

pub(super) fn file_options(options: &ArchiveOptions, modified: SystemTime) -> SimpleFileOptions {
    let base = SimpleFileOptions::default().last_modified_time(timestamp::to_zip(modified));
    match options.zip_level {
        Some(level) => base
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(i64::from(level.min(9)))),
        None => base.compression_method(CompressionMethod::Stored),
    }
}

impl NativeZip {
    fn take_state(&mut self) -> Result<State> {
        self.state
            .take()
            .ok_or_else(|| StorageError::invalid_operation("zip backend is in a failed state"))
    }

    fn reader(&mut self) -> Result<&mut ZipArchive<Stream>> {
        if matches!(self.state, Some(State::Writing(_))) {
            let stream = self.release()?;
            trace!("zip: switching to read");
            let mut archive = ZipArchive::new(stream)?;
            self.reload(&mut archive)?;
            self.state = Some(State::Reading(archive));
        }
        match self.state.as_mut() {
            Some(State::Reading(archive)) => Ok(archive),
            _ => Err(StorageError::invalid_operation("zip backend is in a failed state")),
        }
    }

    fn writer(&mut self) -> Result<&mut ZipWriter<Stream>> {
        if matches!(self.state, Some(State::Reading(_))) {
            let stream = self.release()?;
            trace!("zip: switching to append");
            self.state = Some(State::Writing(ZipWriter::new_append(stream)?));
        }
        match self.state.as_mut() {
            Some(State::Writing(writer)) => Ok(writer),
            _ => Err(StorageError::invalid_operation("zip backend is in a failed state")),
        }
    }

    /// Close whichever handle is open and rewind the stream.
    fn release(&mut self) -> Result<Stream> {
        let mut stream = match self.take_state()? {
            State::Writing(writer) => writer.finish()?,
            State::Reading(archive) => archive.into_inner(),
        };
        stream.seek(SeekFrom::Start(0))?;
        Ok(stream)
    }

    /// Refresh stored sizes from the central directory, keeping placeholders.
    fn reload(&mut self, archive: &mut ZipArchive<Stream>) -> Result<()> {
        let mut entries = load_entries(archive)?;
        for name in self.entries.pending_names() {
            entries.push(ArchiveEntry::pending(&name));
        }
        self.entries = entries;
        Ok(())
    }

    fn remove_from_container(&mut self, name: &str) -> Result<()> {
        let archive = self.reader()?;
        let mut rewritten = ZipWriter::new(Cursor::new(Vec::new()));
        for i in 0..archive.len() {
            let file = archive.by_index_raw(i)?;
            let existing = path::trim_trailing_separator(file.name());
            if path::eq_ignore_case(existing, path::trim_trailing_separator(name)) {
                continue;
            }
            rewritten.raw_copy_file(file)?;
        }
        let bytes = rewritten.finish()?.into_inner();

        let mut stream = self.release()?;
        stream.write_all(&bytes)?;
        stream.truncate(bytes.len() as u64)?;
        stream.seek(SeekFrom::Start(0))?;
        self.state = Some(State::Reading(ZipArchive::new(stream)?));
        debug!("zip: rewrote container without {} ({} bytes)", name, bytes.len());
        Ok(())
    }
}

impl ArchiveBackend for NativeZip {
    fn entries(&self) -> &[ArchiveEntry] {
        self.entries.as_slice()
    }

    fn read_entry(&mut self, entry: &ArchiveEntry) -> Result<Vec<u8>> {
        let archive = self.reader()?;
        let mut file = archive.by_name(entry.name())?;
        let mut data = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut data)?;
        Ok(data)
    }

    fn create_entry(&mut self, name: &str) -> Result<ArchiveEntry> {
        let entry = ArchiveEntry::pending(name);
        if entry.is_directory() {
            let now = SystemTime::now();
            let options = file_options(&self.options, now);
            self.writer()?.add_directory(name, options)?;
            let entry = ArchiveEntry::new(
                name,
                0,
                timestamp::from_zip(timestamp::to_zip(now)),
                true,
                EntryDetail::Zip { compressed_size: 0, crc32: 0 },
            );
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
        if self.entries.find(name).is_some_and(|e| !e.is_pending()) {
            self.remove_from_container(name)?;
        }
        let name = self
            .entries
            .find(name)
            .map(|e| e.name().to_string())
            .unwrap_or_else(|| name.to_string());

        let options = file_options(&self.options, modified);
        let writer = self.writer()?;
        writer.start_file(name.as_str(), options)?;
        writer.write_all(data)?;

        // Compressed size is known once the central directory is re-read.
        let entry = ArchiveEntry::new(
            name.as_str(),
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
        if !entry.is_pending() {
            self.remove_from_container(entry.name())?;
        }
        self.entries.remove(entry.name());
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<Box<dyn StorageStream>> {
        for name in self.entries.pending_names() {
            self.commit_entry(&name, &[], SystemTime::now())?;
        }
        self.release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::StreamCapabilities;

    fn context(mode: ArchiveAccessMode, options: &ArchiveOptions) -> BackendContext<'_> {
        BackendContext { mode, options, root_path: None }
    }

    fn build(files: &[(&str, &str)]) -> Vec<u8> {
        let options = ArchiveOptions::default();
        let stream: Stream = Box::new(Cursor::new(Vec::new()));
        let mut backend = open(stream, context(ArchiveAccessMode::Create, &options)).unwrap();
        for (name, data) in files {
            backend.create_entry(name).unwrap();
            backend.commit_entry(name, data.as_bytes(), SystemTime::now()).unwrap();
        }
        read_back(backend.finish().unwrap())
    }

    fn read_back(mut stream: Stream) -> Vec<u8> {
        let mut bytes = Vec::new();
        stream.seek(SeekFrom::Start(0)).unwrap();
        stream.read_to_end(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn create_then_read() {
        let bytes = build(&[("a.bin", "alpha"), ("sub/b.bin", "bravo")]);
        let options = ArchiveOptions::default();
        let stream = Box::new(Cursor::new(bytes));
        let mut backend = open(stream, context(ArchiveAccessMode::Read, &options)).unwrap();
        let names: Vec<_> = backend.entries().iter().map(|e| e.name().to_string()).collect();
        assert_eq!(names, vec!["a.bin", "sub/b.bin"]);
        let entry = backend.entries()[1].clone();
        assert_eq!(entry.length(), 5);
        assert_eq!(backend.read_entry(&entry).unwrap(), b"bravo");
    }

    #[test]
    fn update_replaces_and_deletes() {
        let bytes = build(&[("a.bin", "alpha"), ("b.bin", "bravo")]);
        let options = ArchiveOptions { zip_level: None, ..ArchiveOptions::default() };
        let stream: Stream = Box::new(Cursor::new(bytes));
        assert_eq!(stream.capabilities(), StreamCapabilities::READ_WRITE);
        let mut backend = open(stream, context(ArchiveAccessMode::Update, &options)).unwrap();

        backend.commit_entry("a.bin", b"replaced", SystemTime::now()).unwrap();
        let b = backend.entries().iter().find(|e| e.name() == "b.bin").cloned().unwrap();
        backend.delete_entry(&b).unwrap();
        let a = backend.entries().iter().find(|e| e.name() == "a.bin").cloned().unwrap();
        assert_eq!(backend.read_entry(&a).unwrap(), b"replaced");

        let bytes = read_back(backend.finish().unwrap());
        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 1);
        let mut data = String::new();
        archive.by_name("a.bin").unwrap().read_to_string(&mut data).unwrap();
        assert_eq!(data, "replaced");
    }

    #[test]
    fn uncommitted_placeholders_become_empty_files() {
        let options = ArchiveOptions::default();
        let stream = Box::new(Cursor::new(Vec::new()));
        let mut backend = open(stream, context(ArchiveAccessMode::Create, &options)).unwrap();
        backend.create_entry("dir/").unwrap();
        backend.create_entry("dir/empty.bin").unwrap();
        let bytes = read_back(backend.finish().unwrap());

        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 2);
        assert!(archive.by_name("dir/").unwrap().is_dir());
        assert_eq!(archive.by_name("dir/empty.bin").unwrap().size(), 0);
    }
}
