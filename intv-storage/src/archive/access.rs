use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use parking_lot::Mutex;

use super::backend::{ArchiveBackend, BackendContext};
use super::factory::{factories, ArchiveFactoryRegistry};
use super::resolve::resolve_archive_path;
use super::{ArchiveAccessMode, ArchiveEntry, ArchiveFormat, ArchiveImplementation};
use crate::access::{self, ReadOnlyStream, StorageAccess, StorageStream};
use crate::config::ArchiveOptions;
use crate::error::{Result, StorageError};
use crate::location::StorageLocation;
use crate::path;

/// An open archive.
///
/// The access mode is fixed at open. All backend calls are serialised by an
/// internal lock, so a shared `ArchiveAccess` can be used from several
/// threads. The archive always owns its byte stream; [`close`](Self::close)
/// (or drop) finalises the backend and then releases the stream.
pub struct ArchiveAccess {
    root: Option<StorageLocation>,
    format: ArchiveFormat,
    implementation: ArchiveImplementation,
    mode: ArchiveAccessMode,
    backend: Mutex<Option<Box<dyn ArchiveBackend>>>,
}

/// Options for opening an [`ArchiveAccess`].
pub struct ArchiveBuilder<'r> {
    format: Option<ArchiveFormat>,
    mode: ArchiveAccessMode,
    implementation: ArchiveImplementation,
    options: ArchiveOptions,
    root: Option<StorageLocation>,
    registry: Option<&'r ArchiveFactoryRegistry>,
}

impl<'r> ArchiveBuilder<'r> {
    pub fn new() -> Self {
        Self {
            format: None,
            mode: ArchiveAccessMode::Read,
            implementation: ArchiveImplementation::Any,
            options: ArchiveOptions::default(),
            root: None,
            registry: None,
        }
    }

    /// Without a format, it is taken from the root's extension or sniffed
    /// from the stream.
    pub fn format(mut self, format: ArchiveFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn mode(mut self, mode: ArchiveAccessMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn implementation(mut self, implementation: ArchiveImplementation) -> Self {
        self.implementation = implementation;
        self
    }

    pub fn options(mut self, options: ArchiveOptions) -> Self {
        self.options = options;
        self
    }

    /// Location of the archive itself; enables resolution of absolute paths.
    pub fn root(mut self, root: StorageLocation) -> Self {
        self.root = Some(root);
        self
    }

    pub fn registry(mut self, registry: &'r ArchiveFactoryRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Open over `stream`, which the archive takes ownership of.
    pub fn open(self, mut stream: Box<dyn StorageStream>) -> Result<ArchiveAccess> {
        let format = match self.format {
            Some(format) => format,
            None => self.detect_format(stream.as_mut())?,
        };
        if !format.supports_mode(self.mode) {
            return Err(StorageError::UnsupportedMode { format, mode: self.mode });
        }
        if self.mode.is_writable() && !stream.capabilities().writable {
            return Err(StorageError::StreamCapability {
                implementation: self.implementation,
                reason: "write modes need a writable stream",
            });
        }

        // Through a closure so the `'static` global shortens to `'r`.
        #[allow(clippy::redundant_closure)]
        let registry = self.registry.unwrap_or_else(|| factories());
        let (implementation, factory) = registry.lookup(format, self.implementation)?;
        let context = BackendContext {
            mode: self.mode,
            options: &self.options,
            root_path: self.root.as_ref().map(|r| r.path()),
        };
        let backend = factory(stream, context)?;
        debug!(
            "opened {:?} archive {} ({:?}, {:?}, {} entries)",
            format,
            self.root.as_ref().map(|r| r.path()).unwrap_or("<stream>"),
            implementation,
            self.mode,
            backend.entries().len()
        );

        Ok(ArchiveAccess {
            root: self.root,
            format,
            implementation,
            mode: self.mode,
            backend: Mutex::new(Some(backend)),
        })
    }

    /// Open the archive stored at `location`, through its capability.
    pub fn open_location(mut self, location: &StorageLocation) -> Result<ArchiveAccess> {
        let capability = location.capability()?;
        let stream = match self.mode {
            ArchiveAccessMode::Create => capability.create(location.path())?,
            _ => capability.open(location.path())?,
        };
        self.root = Some(location.clone());
        self.open(stream)
    }

    fn detect_format(&self, stream: &mut dyn StorageStream) -> Result<ArchiveFormat> {
        if let Some(format) = self.root.as_ref().and_then(|r| ArchiveFormat::from_path(r.path())) {
            return Ok(format);
        }
        if self.mode != ArchiveAccessMode::Create {
            if let Some(format) = ArchiveFormat::sniff_stream(stream)? {
                return Ok(format);
            }
        }
        Err(StorageError::InvalidArgument("cannot determine the archive format".into()))
    }
}

impl Default for ArchiveBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveAccess {
    pub fn builder<'r>() -> ArchiveBuilder<'r> {
        ArchiveBuilder::new()
    }

    pub fn open(
        stream: Box<dyn StorageStream>,
        format: ArchiveFormat,
        mode: ArchiveAccessMode,
    ) -> Result<Self> {
        ArchiveBuilder::new().format(format).mode(mode).open(stream)
    }

    pub fn open_location(location: &StorageLocation, mode: ArchiveAccessMode) -> Result<Self> {
        ArchiveBuilder::new().mode(mode).open_location(location)
    }

    /// Open a file on the local disk.
    pub fn open_path(path: impl AsRef<Path>, mode: ArchiveAccessMode) -> Result<Self> {
        let location =
            StorageLocation::with_capability(path.as_ref().to_string_lossy(), access::initialize());
        Self::open_location(&location, mode)
    }

    pub fn root(&self) -> Option<&StorageLocation> {
        self.root.as_ref()
    }

    pub fn format(&self) -> ArchiveFormat {
        self.format
    }

    pub fn implementation(&self) -> ArchiveImplementation {
        self.implementation
    }

    pub fn mode(&self) -> ArchiveAccessMode {
        self.mode
    }

    pub fn is_closed(&self) -> bool {
        self.backend.lock().is_none()
    }

    fn with_backend<T>(&self, f: impl FnOnce(&mut dyn ArchiveBackend) -> Result<T>) -> Result<T> {
        let mut guard = self.backend.lock();
        let backend = guard
            .as_mut()
            .ok_or_else(|| StorageError::invalid_operation("archive is closed"))?;
        f(backend.as_mut())
    }

    fn require_writable(&self) -> Result<()> {
        if self.mode.is_writable() {
            Ok(())
        } else {
            Err(StorageError::invalid_operation("archive was opened read-only"))
        }
    }

    /// Snapshot of the entry list. Fails once the archive is closed.
    pub fn entries(&self) -> Result<Vec<ArchiveEntry>> {
        self.with_backend(|b| Ok(b.entries().to_vec()))
    }

    /// Make `path` archive-relative. Absolute paths must lie under the root.
    pub fn resolve_path(&self, path: &str) -> Result<String> {
        resolve_archive_path(path, self.root.as_ref().map(|r| r.path()))
    }

    /// Look up an entry by archive-relative or absolute name.
    pub fn find_entry(&self, name: &str) -> Result<Option<ArchiveEntry>> {
        let relative = self.resolve_path(name)?;
        if relative.is_empty() {
            return Ok(None);
        }
        self.with_backend(|b| Ok(b.entries().iter().find(|e| e.matches(&relative)).cloned()))
    }

    fn lookup(&self, name: &str) -> Result<ArchiveEntry> {
        self.find_entry(name)?
            .ok_or_else(|| StorageError::EntryNotFound(name.to_string()))
    }

    fn has_children(&self, relative: &str) -> bool {
        let relative = path::trim_trailing_separator(relative);
        self.with_backend(|b| {
            Ok(b.entries()
                .iter()
                .any(|e| !e.matches(relative) && path::starts_with_segment(e.name(), relative)))
        })
        .unwrap_or(false)
    }

    /// Register a new entry. Names ending in `/` are directory markers.
    pub fn create_entry(&self, name: &str) -> Result<ArchiveEntry> {
        self.require_writable()?;
        let mut relative = self.resolve_path(name)?;
        if path::ends_with_separator(name) && !path::ends_with_separator(&relative) {
            relative.push(path::SEPARATOR);
        }
        if path::trim_trailing_separator(&relative).is_empty() {
            return Err(StorageError::InvalidArgument(format!("invalid entry name '{name}'")));
        }
        self.with_backend(|b| {
            if b.entries().iter().any(|e| e.matches(&relative)) {
                return Err(StorageError::EntryExists(relative.clone()));
            }
            b.create_entry(&relative)
        })
    }

    /// Open an entry in the archive's direction: a reader in `Read` mode, a
    /// committing writer in `Create` and `Update` modes.
    pub fn open_entry(&self, entry: &ArchiveEntry) -> Result<EntryStream<'_>> {
        let current = self.lookup(entry.name())?;
        if current.is_directory() {
            return Err(StorageError::invalid_operation(format!(
                "cannot open directory entry {}",
                current.name()
            )));
        }
        match self.mode {
            ArchiveAccessMode::Read => {
                let data = self.with_backend(|b| b.read_entry(&current))?;
                Ok(EntryStream::Reader(Box::new(ReadOnlyStream::from_bytes(data))))
            }
            ArchiveAccessMode::Create | ArchiveAccessMode::Update => {
                Ok(EntryStream::Writer(EntryWriter::new(self, current.name().to_string())))
            }
        }
    }

    /// Decompressed contents of a file entry, in any mode the backend can read.
    pub fn read_entry(&self, entry: &ArchiveEntry) -> Result<Vec<u8>> {
        let current = self.lookup(entry.name())?;
        if current.is_directory() {
            return Err(StorageError::invalid_operation(format!(
                "cannot read directory entry {}",
                current.name()
            )));
        }
        if current.is_pending() {
            return Ok(Vec::new());
        }
        self.with_backend(|b| b.read_entry(&current))
    }

    /// Create-or-replace `name` with `data` in one step.
    pub fn write_entry(&self, name: &str, data: &[u8]) -> Result<ArchiveEntry> {
        let entry = match self.find_entry(name)? {
            Some(entry) => entry,
            None => self.create_entry(name)?,
        };
        let mut writer = match self.open_entry(&entry)? {
            EntryStream::Writer(writer) => writer,
            EntryStream::Reader(_) => {
                return Err(StorageError::invalid_operation("archive was opened read-only"))
            }
        };
        writer.write_all(data)?;
        writer.commit()
    }

    fn commit(&self, name: &str, data: &[u8], modified: SystemTime) -> Result<ArchiveEntry> {
        self.require_writable()?;
        self.with_backend(|b| b.commit_entry(name, data, modified))
    }

    pub fn delete_entry(&self, entry: &ArchiveEntry) -> Result<()> {
        self.require_writable()?;
        let current = self.lookup(entry.name())?;
        self.with_backend(|b| b.delete_entry(&current))
    }

    /// Extract a file entry to a plain path on the local disk.
    ///
    /// The entry's modification time is applied to the new file when the
    /// platform allows it.
    pub fn extract_entry(
        &self,
        entry: &ArchiveEntry,
        destination: &Path,
        overwrite: bool,
    ) -> Result<()> {
        let current = self.lookup(entry.name())?;
        validate_destination(destination)?;
        let directory = destination
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        if !directory.is_dir() {
            return Err(StorageError::MissingDestinationDirectory(directory.display().to_string()));
        }
        if destination.exists() && !overwrite {
            return Err(StorageError::DestinationExists(destination.display().to_string()));
        }
        if current.is_directory() {
            return Err(StorageError::EntryIsDirectory(current.name().to_string()));
        }

        let data = self.read_entry(&current)?;
        let mut tmp = tempfile::NamedTempFile::new_in(directory)?;
        tmp.write_all(&data)?;
        tmp.flush()?;
        if let Err(e) = tmp.as_file().set_modified(current.last_modified()) {
            warn!("could not preserve modification time of {}: {}", destination.display(), e);
        }
        tmp.persist(destination).map_err(|e| StorageError::Io(e.error))?;
        debug!("extracted {} to {}", current.name(), destination.display());
        Ok(())
    }

    /// Whether `path` names something that can hold entries.
    ///
    /// A trailing separator, a directory entry, or an archive extension all
    /// count. A plausible path that does not exist may still report `true`.
    pub fn is_container_path(&self, path: &str) -> bool {
        if path::ends_with_separator(path) {
            return true;
        }
        if let Ok(relative) = self.resolve_path(path) {
            if relative.is_empty() {
                return true;
            }
            if let Ok(Some(entry)) = self.find_entry(&relative) {
                return entry.is_directory() || path::has_archive_extension(entry.name());
            }
            if self.has_children(&relative) {
                return true;
            }
        }
        path::has_archive_extension(path)
    }

    pub fn is_location_a_container(&self, location: &StorageLocation) -> bool {
        self.is_container_path(location.path())
    }

    /// Finalise the backend and release the stream. Further operations fail.
    pub fn close(&self) -> Result<()> {
        let backend = self.backend.lock().take();
        if let Some(backend) = backend {
            let mut stream = backend.finish()?;
            stream.flush()?;
            debug!(
                "closed {:?} archive {}",
                self.format,
                self.root.as_ref().map(|r| r.path()).unwrap_or("<stream>")
            );
        }
        Ok(())
    }
}

fn validate_destination(destination: &Path) -> Result<()> {
    let text = path::normalize(&destination.to_string_lossy());
    let invalid = || StorageError::InvalidDestination(destination.display().to_string());
    if text.is_empty() || path::ends_with_separator(&text) || destination.is_dir() {
        return Err(invalid());
    }
    let inside_archive = path::archive_prefixes(&text)
        .into_iter()
        .filter(|prefix| prefix.len() < text.len())
        .any(|prefix| Path::new(prefix).is_file());
    if inside_archive {
        return Err(invalid());
    }
    Ok(())
}

impl Drop for ArchiveAccess {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(
                "failed to finalise {:?} archive {}: {}",
                self.format,
                self.root.as_ref().map(|r| r.path()).unwrap_or("<stream>"),
                e
            );
        }
    }
}

impl fmt::Debug for ArchiveAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveAccess")
            .field("root", &self.root)
            .field("format", &self.format)
            .field("implementation", &self.implementation)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Archives are storage providers: absolute paths under the root address
/// their entries.
impl StorageAccess for ArchiveAccess {
    /// Relative paths name entries under the archive's root.
    fn absolute_path(&self, path: &str) -> Option<String> {
        let path = path::normalize(path);
        if path::is_absolute(&path) {
            return Some(path);
        }
        let root = self.root.as_ref()?;
        let root_path = root.capability().ok()?.absolute_path(root.path())?;
        Some(path::join(&root_path, &path))
    }

    fn open(&self, path: &str) -> Result<Box<dyn StorageStream>> {
        let entry = self.lookup(path)?;
        let data = self.read_entry(&entry)?;
        Ok(Box::new(ReadOnlyStream::from_bytes(data)))
    }

    fn exists(&self, path: &str) -> bool {
        match self.resolve_path(path) {
            Ok(relative) if relative.is_empty() => true,
            Ok(relative) => {
                matches!(self.find_entry(&relative), Ok(Some(_))) || self.has_children(&relative)
            }
            Err(_) => false,
        }
    }

    fn size(&self, path: &str) -> Result<u64> {
        let relative = self.resolve_path(path)?;
        if relative.is_empty() {
            return match &self.root {
                Some(root) => root.size(),
                None => Ok(0),
            };
        }
        match self.find_entry(&relative)? {
            Some(entry) => Ok(entry.length()),
            None if self.has_children(&relative) => Ok(0),
            None => Err(StorageError::EntryNotFound(path.to_string())),
        }
    }

    fn last_modified(&self, path: &str) -> Result<SystemTime> {
        let relative = self.resolve_path(path)?;
        if relative.is_empty() {
            return match &self.root {
                Some(root) => root.last_modified(),
                None => Ok(UNIX_EPOCH),
            };
        }
        match self.find_entry(&relative)? {
            Some(entry) => Ok(entry.last_modified()),
            None if self.has_children(&relative) => Ok(UNIX_EPOCH),
            None => Err(StorageError::EntryNotFound(path.to_string())),
        }
    }
}

/// Two-phase entry output: bytes are buffered and committed into the
/// container by [`commit`](Self::commit), or on drop.
pub struct EntryWriter<'a> {
    archive: &'a ArchiveAccess,
    name: String,
    modified: SystemTime,
    buffer: Vec<u8>,
    committed: bool,
}

impl<'a> EntryWriter<'a> {
    fn new(archive: &'a ArchiveAccess, name: String) -> Self {
        Self {
            archive,
            name,
            modified: SystemTime::now(),
            buffer: Vec::new(),
            committed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_modified(&mut self, modified: SystemTime) {
        self.modified = modified;
    }

    pub fn commit(mut self) -> Result<ArchiveEntry> {
        self.committed = true;
        self.archive.commit(&self.name, &self.buffer, self.modified)
    }
}

impl Write for EntryWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for EntryWriter<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(e) = self.archive.commit(&self.name, &self.buffer, self.modified) {
            warn!("failed to commit entry {}: {}", self.name, e);
        }
    }
}

/// Direction-dependent entry stream returned by [`ArchiveAccess::open_entry`].
pub enum EntryStream<'a> {
    Reader(Box<dyn StorageStream>),
    Writer(EntryWriter<'a>),
}

impl EntryStream<'_> {
    pub fn is_writer(&self) -> bool {
        matches!(self, Self::Writer(_))
    }

    /// Commit a writer; a reader is simply released.
    pub fn finish(self) -> Result<Option<ArchiveEntry>> {
        match self {
            Self::Reader(_) => Ok(None),
            Self::Writer(writer) => writer.commit().map(Some),
        }
    }
}

impl Read for EntryStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Reader(reader) => reader.read(buf),
            Self::Writer(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "entry opened for writing",
            )),
        }
    }
}

impl Write for EntryStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Reader(reader) => reader.write(buf),
            Self::Writer(writer) => writer.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Reader(reader) => reader.flush(),
            Self::Writer(writer) => writer.flush(),
        }
    }
}

impl Seek for EntryStream<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            Self::Reader(reader) => reader.seek(pos),
            Self::Writer(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "entry writers are not seekable",
            )),
        }
    }
}
