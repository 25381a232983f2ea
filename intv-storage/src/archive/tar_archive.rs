//! Tar backend.
//!
//! Supports reading and sequential creation only; tar has no central index
//! to rewrite, so Update mode is rejected before a backend is built and
//! deletion is not supported.
//!
//! The tar builder takes entry metadata from real files, so entry data is
//! staged in a private temporary directory and appended from there.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::SystemTime;

use log::{debug, warn};
use tar::{Archive, Builder, EntryType, Header};
use tempfile::TempDir;

use super::backend::{ArchiveBackend, BackendContext};
use super::timestamp;
use super::{ArchiveAccessMode, ArchiveEntry, ArchiveFormat, EntryDetail, EntryTable};
use crate::access::StorageStream;
use crate::error::{Result, StorageError};
use crate::path;

const BLOCK: u64 = 512;

enum State {
    Reading(Box<dyn StorageStream>),
    Writing(Builder<Box<dyn StorageStream>>),
}

struct TarBackend {
    state: State,
    entries: EntryTable,
    /// Created on the first commit, removed with the backend.
    staging: Option<TempDir>,
    staged: u64,
}

pub(crate) fn open(
    mut stream: Box<dyn StorageStream>,
    ctx: BackendContext<'_>,
) -> Result<Box<dyn ArchiveBackend>> {
    let (state, entries) = match ctx.mode {
        ArchiveAccessMode::Read => {
            let entries = load_entries(stream.as_mut())?;
            (State::Reading(stream), entries)
        }
        ArchiveAccessMode::Create => {
            stream.truncate(0)?;
            stream.seek(SeekFrom::Start(0))?;
            (State::Writing(Builder::new(stream)), EntryTable::new())
        }
        ArchiveAccessMode::Update => {
            return Err(StorageError::UnsupportedMode {
                format: ArchiveFormat::Tar,
                mode: ctx.mode,
            })
        }
    };
    Ok(Box::new(TarBackend {
        state,
        entries,
        staging: None,
        staged: 0,
    }))
}

fn load_entries(stream: &mut dyn StorageStream) -> Result<EntryTable> {
    stream.seek(SeekFrom::Start(0))?;
    let mut archive = Archive::new(stream);
    let mut entries = EntryTable::new();
    for entry in archive.entries_with_seek()? {
        let entry = entry?;
        let header = entry.header();
        let is_directory = header.entry_type().is_dir();
        let modified = timestamp::from_unix_secs(header.mtime().unwrap_or(0));
        let mut name = path::normalize(&entry.path()?.to_string_lossy());
        if is_directory && !path::ends_with_separator(&name) {
            name.push(path::SEPARATOR);
        }
        entries.push(ArchiveEntry::new(
            name,
            entry.size(),
            modified,
            is_directory,
            EntryDetail::Tar {
                data_offset: entry.raw_file_position(),
            },
        ));
    }
    Ok(entries)
}

fn directory_header(modified: SystemTime) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Directory);
    header.set_size(0);
    header.set_mtime(timestamp::to_unix_secs(modified));
    header.set_mode(0o755);
    header.set_cksum();
    header
}

fn read_range(stream: &mut dyn StorageStream, offset: u64, len: u64) -> Result<Vec<u8>> {
    stream.seek(SeekFrom::Start(offset))?;
    let mut data = Vec::with_capacity(len as usize);
    Read::take(&mut *stream, len).read_to_end(&mut data)?;
    if data.len() as u64 != len {
        return Err(StorageError::Corrupt("tar entry data is truncated".into()));
    }
    Ok(data)
}

impl TarBackend {
    fn builder(&mut self) -> Result<&mut Builder<Box<dyn StorageStream>>> {
        match &mut self.state {
            State::Writing(builder) => Ok(builder),
            State::Reading(_) => {
                Err(StorageError::invalid_operation("tar archive was opened read-only"))
            }
        }
    }

    /// Write `data` to a fresh file in the staging directory.
    fn stage(&mut self, data: &[u8], modified: SystemTime) -> Result<PathBuf> {
        let dir = match &self.staging {
            Some(dir) => dir.path().to_path_buf(),
            None => {
                let dir = tempfile::Builder::new().prefix("intv-tar-").tempdir()?;
                let path = dir.path().to_path_buf();
                self.staging = Some(dir);
                path
            }
        };
        self.staged += 1;
        let staged = dir.join(format!("entry-{}", self.staged));
        let mut file = File::create(&staged)?;
        file.write_all(data)?;
        if let Err(e) = file.set_modified(modified) {
            warn!("tar: could not set modification time on staged entry: {}", e);
        }
        Ok(staged)
    }
}

impl ArchiveBackend for TarBackend {
    fn entries(&self) -> &[ArchiveEntry] {
        self.entries.as_slice()
    }

    fn read_entry(&mut self, entry: &ArchiveEntry) -> Result<Vec<u8>> {
        let EntryDetail::Tar { data_offset } = *entry.detail() else {
            return Ok(Vec::new());
        };
        match &mut self.state {
            State::Reading(stream) => read_range(stream.as_mut(), data_offset, entry.length()),
            State::Writing(builder) => {
                let stream = builder.get_mut();
                let end = stream.stream_position()?;
                let data = read_range(stream.as_mut(), data_offset, entry.length());
                stream.seek(SeekFrom::Start(end))?;
                data
            }
        }
    }

    fn create_entry(&mut self, name: &str) -> Result<ArchiveEntry> {
        let entry = ArchiveEntry::pending(name);
        if entry.is_directory() {
            let now = SystemTime::now();
            let mut header = directory_header(now);
            self.builder()?.append_data(&mut header, name, io::empty())?;
            let modified = timestamp::from_unix_secs(timestamp::to_unix_secs(now));
            let detail = EntryDetail::Tar { data_offset: 0 };
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
        if self.entries.find(name).is_some_and(|e| !e.is_pending()) {
            return Err(StorageError::not_supported(format!(
                "tar entry {name} cannot be rewritten"
            )));
        }
        let name = self
            .entries
            .find(name)
            .map(|e| e.name().to_string())
            .unwrap_or_else(|| name.to_string());

        let staged = self.stage(data, modified)?;
        let builder = self.builder()?;
        builder.append_path_with_name(&staged, name.as_str())?;
        let end = builder.get_mut().stream_position()?;
        fs::remove_file(&staged)?;
        let data_offset = end - (data.len() as u64).div_ceil(BLOCK) * BLOCK;
        debug!("tar: appended {} ({} bytes)", name, data.len());

        let entry = ArchiveEntry::new(
            name,
            data.len() as u64,
            timestamp::from_unix_secs(timestamp::to_unix_secs(modified)),
            false,
            EntryDetail::Tar { data_offset },
        );
        self.entries.upsert(entry.clone());
        Ok(entry)
    }

    fn delete_entry(&mut self, entry: &ArchiveEntry) -> Result<()> {
        Err(StorageError::not_supported(format!(
            "cannot delete {} from a tar archive",
            entry.name()
        )))
    }

    fn finish(mut self: Box<Self>) -> Result<Box<dyn StorageStream>> {
        for name in self.entries.pending_names() {
            self.commit_entry(&name, &[], SystemTime::now())?;
        }
        match self.state {
            State::Reading(stream) => Ok(stream),
            State::Writing(builder) => Ok(builder.into_inner()?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArchiveOptions;
    use std::io::Cursor;

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
    fn create_then_read() {
        let options = ArchiveOptions::default();
        let stream = Box::new(Cursor::new(Vec::new()));
        let mut backend = open(stream, context(ArchiveAccessMode::Create, &options)).unwrap();
        backend.create_entry("roms/").unwrap();
        backend.create_entry("roms/a.int").unwrap();
        let a = backend.commit_entry("roms/a.int", b"intellivision", SystemTime::now()).unwrap();
        assert_eq!(backend.read_entry(&a).unwrap(), b"intellivision");
        backend.create_entry("roms/b.int").unwrap();
        let bytes = contents(backend.finish().unwrap());

        let stream = Box::new(Cursor::new(bytes));
        let mut backend = open(stream, context(ArchiveAccessMode::Read, &options)).unwrap();
        let entries = backend.entries().to_vec();
        let names: Vec<_> = entries.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["roms/", "roms/a.int", "roms/b.int"]);
        assert!(entries[0].is_directory());
        assert_eq!(backend.read_entry(&entries[1]).unwrap(), b"intellivision");
        assert_eq!(entries[2].length(), 0);
    }

    #[test]
    fn update_and_delete_are_rejected() {
        let options = ArchiveOptions::default();
        let stream = Box::new(Cursor::new(Vec::new()));
        let err = open(stream, context(ArchiveAccessMode::Update, &options)).err().unwrap();
        assert!(matches!(err, StorageError::UnsupportedMode { .. }));

        let stream = Box::new(Cursor::new(Vec::new()));
        let mut backend = open(stream, context(ArchiveAccessMode::Create, &options)).unwrap();
        let entry = backend.commit_entry("a.bin", b"x", SystemTime::now()).unwrap();
        assert!(matches!(backend.delete_entry(&entry), Err(StorageError::NotSupported(_))));
        assert!(matches!(
            backend.commit_entry("a.bin", b"y", SystemTime::now()),
            Err(StorageError::NotSupported(_))
        ));
    }
}
