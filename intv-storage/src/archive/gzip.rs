//! Single-member gzip backend.
//!
//! A gzip file holds exactly one entry. Its name comes from the header's
//! file name field, or from the archive's own name when the field is unset.
//! Only the first member is read. Its length is measured by decoding it, as
//! the ISIZE field at the end of the file belongs to the last member.

use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::time::SystemTime;

use flate2::bufread::GzDecoder;
use flate2::{Compression, GzBuilder};
use log::{debug, warn};

use super::backend::{ArchiveBackend, BackendContext};
use super::timestamp;
use super::{ArchiveAccessMode, ArchiveEntry, EntryDetail, EntryTable};
use crate::access::StorageStream;
use crate::error::{Result, StorageError};
use crate::path;

struct NativeGzip {
    stream: Box<dyn StorageStream>,
    entries: EntryTable,
    level: u32,
}

pub(crate) fn open(
    mut stream: Box<dyn StorageStream>,
    ctx: BackendContext<'_>,
) -> Result<Box<dyn ArchiveBackend>> {
    let mut entries = EntryTable::new();
    match ctx.mode {
        ArchiveAccessMode::Create => {
            stream.truncate(0)?;
            stream.seek(SeekFrom::Start(0))?;
        }
        _ if ctx.mode == ArchiveAccessMode::Update && stream.byte_len()? == 0 => {}
        _ => entries.push(read_member_entry(stream.as_mut(), &ctx.implied_entry_name())?),
    }
    Ok(Box::new(NativeGzip {
        stream,
        entries,
        level: ctx.options.gzip_level.min(9),
    }))
}

/// Header fields an entry is described by.
pub(super) struct MemberHeader {
    pub name: Option<String>,
    pub modified: SystemTime,
}

pub(super) fn parse_header<R: std::io::BufRead>(decoder: &GzDecoder<R>) -> Result<MemberHeader> {
    let header = decoder
        .header()
        .ok_or_else(|| StorageError::Corrupt("missing or truncated gzip header".into()))?;
    Ok(MemberHeader {
        name: header
            .filename()
            .map(|raw| String::from_utf8_lossy(raw).into_owned())
            .filter(|name| !name.is_empty()),
        modified: timestamp::from_unix_secs(u64::from(header.mtime())),
    })
}

fn read_member_entry(stream: &mut dyn StorageStream, implied_name: &str) -> Result<ArchiveEntry> {
    let total_len = stream.byte_len()?;
    if total_len < 18 {
        return Err(StorageError::Corrupt("gzip stream is too short".into()));
    }
    stream.seek(SeekFrom::Start(0))?;
    let (header, length, compressed_len) = {
        let mut decoder = GzDecoder::new(BufReader::new(&mut *stream));
        let header = parse_header(&decoder)?;
        let length = io::copy(&mut decoder, &mut io::sink())?;
        // Excludes whatever the reader buffered past the member.
        let member_end = decoder.into_inner().stream_position()?;
        (header, length, member_end)
    };
    if compressed_len < total_len {
        warn!(
            "gzip: {} trailing bytes after the first member are ignored; open with the buffered \
             implementation to read every member",
            total_len - compressed_len
        );
    }

    Ok(ArchiveEntry::new(
        header.name.unwrap_or_else(|| implied_name.to_string()),
        length,
        header.modified,
        false,
        EntryDetail::GZip {
            member: 0,
            offset: 0,
            compressed_len,
        },
    ))
}

/// Compress `data` as one complete gzip member.
pub(super) fn encode_member<W: Write>(
    out: W,
    name: &str,
    data: &[u8],
    modified: SystemTime,
    level: u32,
) -> Result<W> {
    let mut encoder = GzBuilder::new()
        .filename(path::file_name(name).as_bytes())
        .mtime(u32::try_from(timestamp::to_unix_secs(modified)).unwrap_or(0))
        .write(out, Compression::new(level));
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

impl NativeGzip {
    fn check_single(&self, name: &str) -> Result<()> {
        match self.entries.iter().next() {
            Some(existing) if !existing.matches(name) => Err(StorageError::not_supported(format!(
                "gzip archives hold a single entry ({} already present)",
                existing.name()
            ))),
            _ => Ok(()),
        }
    }
}

impl ArchiveBackend for NativeGzip {
    fn entries(&self) -> &[ArchiveEntry] {
        self.entries.as_slice()
    }

    fn read_entry(&mut self, _entry: &ArchiveEntry) -> Result<Vec<u8>> {
        self.stream.seek(SeekFrom::Start(0))?;
        let mut decoder = GzDecoder::new(BufReader::new(&mut *self.stream));
        let mut data = Vec::new();
        decoder.read_to_end(&mut data)?;
        Ok(data)
    }

    fn create_entry(&mut self, name: &str) -> Result<ArchiveEntry> {
        if path::ends_with_separator(name) {
            return Err(StorageError::not_supported("gzip archives cannot hold directories"));
        }
        self.check_single(name)?;
        let entry = ArchiveEntry::pending(name);
        self.entries.push(entry.clone());
        Ok(entry)
    }

    fn commit_entry(
        &mut self,
        name: &str,
        data: &[u8],
        modified: SystemTime,
    ) -> Result<ArchiveEntry> {
        self.check_single(name)?;
        let name = self
            .entries
            .find(name)
            .map(|e| e.name().to_string())
            .unwrap_or_else(|| name.to_string());

        self.stream.seek(SeekFrom::Start(0))?;
        encode_member(&mut self.stream, &name, data, modified, self.level)?;
        let compressed_len = self.stream.stream_position()?;
        self.stream.truncate(compressed_len)?;
        self.stream.flush()?;
        debug!("gzip: wrote {} ({} -> {} bytes)", name, data.len(), compressed_len);

        let entry = ArchiveEntry::new(
            name,
            data.len() as u64,
            timestamp::from_unix_secs(timestamp::to_unix_secs(modified)),
            false,
            EntryDetail::GZip {
                member: 0,
                offset: 0,
                compressed_len,
            },
        );
        self.entries.upsert(entry.clone());
        Ok(entry)
    }

    fn delete_entry(&mut self, entry: &ArchiveEntry) -> Result<()> {
        Err(StorageError::not_supported(format!(
            "cannot delete {} from a single-member gzip archive",
            entry.name()
        )))
    }

    fn finish(mut self: Box<Self>) -> Result<Box<dyn StorageStream>> {
        for name in self.entries.pending_names() {
            self.commit_entry(&name, &[], SystemTime::now())?;
        }
        Ok(self.stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArchiveOptions;
    use std::io::Cursor;

    fn context<'a>(
        mode: ArchiveAccessMode,
        options: &'a ArchiveOptions,
        root: Option<&'a str>,
    ) -> BackendContext<'a> {
        BackendContext { mode, options, root_path: root }
    }

    fn gzip(name: Option<&str>, data: &[u8]) -> Vec<u8> {
        let builder = match name {
            Some(name) => GzBuilder::new().filename(name),
            None => GzBuilder::new(),
        };
        let mut encoder = builder.write(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn lists_single_entry_from_header() {
        let options = ArchiveOptions::default();
        let stream = Box::new(Cursor::new(gzip(Some("rom.bin"), b"0123456789")));
        let mut backend = open(stream, context(ArchiveAccessMode::Read, &options, None)).unwrap();
        assert_eq!(backend.entries().len(), 1);
        let entry = backend.entries()[0].clone();
        assert_eq!(entry.name(), "rom.bin");
        assert_eq!(entry.length(), 10);
        assert_eq!(backend.read_entry(&entry).unwrap(), b"0123456789");
    }

    #[test]
    fn unnamed_member_takes_archive_name() {
        let options = ArchiveOptions::default();
        let stream = Box::new(Cursor::new(gzip(None, b"data")));
        let ctx = context(ArchiveAccessMode::Read, &options, Some("/roms/Astrosmash.int.gz"));
        let backend = open(stream, ctx).unwrap();
        assert_eq!(backend.entries()[0].name(), "Astrosmash.int");
    }

    #[test]
    fn length_covers_only_the_first_member() {
        let options = ArchiveOptions::default();
        let mut data = gzip(Some("rom.bin"), b"first member");
        let first_len = data.len() as u64;
        data.extend(gzip(Some("more.bin"), b"second member, longer"));
        let stream = Box::new(Cursor::new(data));
        let mut backend = open(stream, context(ArchiveAccessMode::Read, &options, None)).unwrap();

        assert_eq!(backend.entries().len(), 1);
        let entry = backend.entries()[0].clone();
        assert_eq!(entry.name(), "rom.bin");
        assert_eq!(entry.length(), 12);
        assert!(matches!(
            entry.detail(),
            EntryDetail::GZip { compressed_len, .. } if *compressed_len == first_len
        ));
        let read = backend.read_entry(&entry).unwrap();
        assert_eq!(read.len() as u64, entry.length());
        assert_eq!(read, b"first member");
    }

    #[test]
    fn second_entry_and_delete_are_not_supported() {
        let options = ArchiveOptions::default();
        let stream = Box::new(Cursor::new(Vec::new()));
        let mut backend = open(stream, context(ArchiveAccessMode::Create, &options, None)).unwrap();
        backend.create_entry("a.bin").unwrap();
        let entry = backend.commit_entry("a.bin", b"alpha", SystemTime::now()).unwrap();
        assert!(matches!(backend.create_entry("b.bin"), Err(StorageError::NotSupported(_))));
        assert!(matches!(backend.delete_entry(&entry), Err(StorageError::NotSupported(_))));
        assert!(matches!(backend.create_entry("dir/"), Err(StorageError::NotSupported(_))));

        // Rewriting the only entry is allowed.
        backend.commit_entry("a.bin", b"again", SystemTime::now()).unwrap();
        assert_eq!(backend.read_entry(&entry).unwrap(), b"again");
    }
}
