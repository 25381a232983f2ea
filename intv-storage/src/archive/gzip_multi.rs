//! Multi-member gzip backend.
//!
//! Each concatenated gzip member is one entry. The container is held in
//! memory as a list of encoded members and written back on close when it
//! changed.

use std::io::{Read, Seek, SeekFrom, Write};
use std::time::SystemTime;

use flate2::bufread::GzDecoder;
use log::debug;

use super::backend::{ArchiveBackend, BackendContext};
use super::gzip::{encode_member, parse_header};
use super::timestamp;
use super::{ArchiveAccessMode, ArchiveEntry, ArchiveImplementation, EntryDetail, EntryTable};
use crate::access::StorageStream;
use crate::error::{Result, StorageError};
use crate::path;

struct Member {
    name: String,
    length: u64,
    modified: SystemTime,
    encoded: Vec<u8>,
}

struct MultiGzip {
    stream: Box<dyn StorageStream>,
    members: Vec<Member>,
    entries: EntryTable,
    level: u32,
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
            reason: "buffered gzip archives rewrite their source and need it readable and writable",
        });
    }

    let mut members = Vec::new();
    if ctx.mode != ArchiveAccessMode::Create {
        let mut bytes = Vec::new();
        stream.seek(SeekFrom::Start(0))?;
        stream.read_to_end(&mut bytes)?;
        members = split_members(&bytes, &ctx.implied_entry_name())?;
    }

    let mut backend = MultiGzip {
        stream,
        members,
        entries: EntryTable::new(),
        level: ctx.options.gzip_level.min(9),
        dirty: ctx.mode == ArchiveAccessMode::Create,
    };
    backend.refresh();
    Ok(Box::new(backend))
}

/// Walk the concatenated members, inflating each once to find where it ends.
fn split_members(bytes: &[u8], implied_name: &str) -> Result<Vec<Member>> {
    let mut members = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        let mut decoder = GzDecoder::new(rest);
        let header = parse_header(&decoder)?;
        let mut data = Vec::new();
        decoder.read_to_end(&mut data)?;
        let remaining = decoder.into_inner();
        let consumed = rest.len() - remaining.len();
        if consumed == 0 {
            return Err(StorageError::Corrupt("gzip member did not advance".into()));
        }

        let index = members.len();
        let name = header.name.unwrap_or_else(|| match index {
            0 => implied_name.to_string(),
            n => format!("{implied_name}.{n}"),
        });
        members.push(Member {
            name,
            length: data.len() as u64,
            modified: header.modified,
            encoded: rest[..consumed].to_vec(),
        });
        rest = remaining;
    }
    Ok(members)
}

impl MultiGzip {
    /// Rebuild the entry table from the members, keeping placeholders.
    fn refresh(&mut self) {
        let pending = self.entries.pending_names();
        let mut entries = EntryTable::new();
        let mut offset = 0u64;
        for (index, member) in self.members.iter().enumerate() {
            let compressed_len = member.encoded.len() as u64;
            entries.push(ArchiveEntry::new(
                member.name.as_str(),
                member.length,
                member.modified,
                false,
                EntryDetail::GZip {
                    member: index,
                    offset,
                    compressed_len,
                },
            ));
            offset += compressed_len;
        }
        for name in pending {
            if !entries.contains(&name) {
                entries.push(ArchiveEntry::pending(&name));
            }
        }
        self.entries = entries;
    }

    fn position(&self, name: &str) -> Option<usize> {
        let name = path::trim_trailing_separator(name);
        self.members.iter().position(|m| path::eq_ignore_case(&m.name, name))
    }
}

impl ArchiveBackend for MultiGzip {
    fn entries(&self) -> &[ArchiveEntry] {
        self.entries.as_slice()
    }

    fn read_entry(&mut self, entry: &ArchiveEntry) -> Result<Vec<u8>> {
        let index = self
            .position(entry.name())
            .ok_or_else(|| StorageError::EntryNotFound(entry.name().to_string()))?;
        let mut decoder = GzDecoder::new(self.members[index].encoded.as_slice());
        let mut data = Vec::new();
        decoder.read_to_end(&mut data)?;
        Ok(data)
    }

    fn create_entry(&mut self, name: &str) -> Result<ArchiveEntry> {
        if path::ends_with_separator(name) {
            return Err(StorageError::not_supported("gzip archives cannot hold directories"));
        }
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
        let name = self
            .entries
            .find(name)
            .map(|e| e.name().to_string())
            .unwrap_or_else(|| name.to_string());
        let member = Member {
            name: name.clone(),
            length: data.len() as u64,
            modified: timestamp::from_unix_secs(timestamp::to_unix_secs(modified)),
            encoded: encode_member(Vec::new(), &name, data, modified, self.level)?,
        };
        match self.position(&name) {
            Some(index) => self.members[index] = member,
            None => self.members.push(member),
        }
        self.dirty = true;
        self.refresh();
        self.entries
            .find(&name)
            .cloned()
            .ok_or_else(|| StorageError::EntryNotFound(name))
    }

    fn delete_entry(&mut self, entry: &ArchiveEntry) -> Result<()> {
        if let Some(index) = self.position(entry.name()) {
            self.members.remove(index);
            self.dirty = true;
        }
        self.entries.remove(entry.name());
        self.refresh();
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<Box<dyn StorageStream>> {
        for name in self.entries.pending_names() {
            self.commit_entry(&name, &[], SystemTime::now())?;
        }
        if self.dirty {
            self.stream.seek(SeekFrom::Start(0))?;
            let mut written = 0u64;
            for member in &self.members {
                self.stream.write_all(&member.encoded)?;
                written += member.encoded.len() as u64;
            }
            self.stream.truncate(written)?;
            debug!("gzip: wrote {} members ({} bytes)", self.members.len(), written);
        }
        Ok(self.stream)
    }
}
