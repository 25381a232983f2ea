use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

/// What a [`StorageStream`] can actually do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamCapabilities {
    pub readable: bool,
    pub writable: bool,
}

impl StreamCapabilities {
    pub const READ_ONLY: Self = Self { readable: true, writable: false };
    pub const READ_WRITE: Self = Self { readable: true, writable: true };
}

/// Byte stream handed out by storage providers and consumed by archives.
///
/// Every stream is seekable. Writes on a read-only stream fail with
/// `io::ErrorKind::Unsupported`.
pub trait StorageStream: Read + Write + Seek + Send {
    fn capabilities(&self) -> StreamCapabilities;

    /// Discard everything past `len`.
    fn truncate(&mut self, len: u64) -> io::Result<()>;

    fn byte_len(&mut self) -> io::Result<u64> {
        let pos = self.stream_position()?;
        let len = self.seek(SeekFrom::End(0))?;
        self.seek(SeekFrom::Start(pos))?;
        Ok(len)
    }
}

impl StorageStream for File {
    fn capabilities(&self) -> StreamCapabilities {
        // `File` does not expose its open mode, so probe with a zero-length write.
        let mut probe = self;
        match probe.write(&[]) {
            Ok(_) => StreamCapabilities::READ_WRITE,
            Err(_) => StreamCapabilities::READ_ONLY,
        }
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

impl StorageStream for Cursor<Vec<u8>> {
    fn capabilities(&self) -> StreamCapabilities {
        StreamCapabilities::READ_WRITE
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        let len = usize::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "length too large"))?;
        self.get_mut().truncate(len);
        if self.position() > len as u64 {
            self.set_position(len as u64);
        }
        Ok(())
    }
}

impl StorageStream for Box<dyn StorageStream> {
    fn capabilities(&self) -> StreamCapabilities {
        (**self).capabilities()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        (**self).truncate(len)
    }
}

/// Wraps a readable, seekable source so that it can be handed out as a
/// [`StorageStream`] without granting write access.
pub struct ReadOnlyStream<R> {
    inner: R,
}

impl<R: Read + Seek + Send> ReadOnlyStream<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl ReadOnlyStream<Cursor<Vec<u8>>> {
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self::new(Cursor::new(data))
    }
}

impl<R: Read> Read for ReadOnlyStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<R: Seek> Seek for ReadOnlyStream<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

impl<R> Write for ReadOnlyStream<R> {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(read_only())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<R: Read + Seek + Send> StorageStream for ReadOnlyStream<R> {
    fn capabilities(&self) -> StreamCapabilities {
        StreamCapabilities::READ_ONLY
    }

    fn truncate(&mut self, _len: u64) -> io::Result<()> {
        Err(read_only())
    }
}

fn read_only() -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, "stream is read-only")
}
