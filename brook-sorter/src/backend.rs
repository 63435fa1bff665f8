use anyhow::{bail, Result};
use log::{error, warn};
use std::fs::{self, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use brook_core::error_bail;
use brook_core::event::Event;

use crate::config::FILE_BUFFER_SIZE;
use crate::error::SorterError;

/// Sanity bound on one serialized event. A length prefix beyond this is
/// treated as corruption rather than an allocation request.
const MAX_EVENT_BYTES: u32 = 64 * 1024 * 1024;

/// Storage for one sorted run.
///
/// A backend is writable until `flush()` commits the run and rewinds the read
/// cursor; after that it is read until end of run, then `reset()` by the pool
/// to become writable again. Exactly one task owns a backend at any moment.
pub enum SorterBackend {
    Memory(MemoryBackend),
    File(FileBackend),
}

impl SorterBackend {
    pub fn write_next(&mut self, event: Event) -> Result<()> {
        match self {
            SorterBackend::Memory(m) => {
                m.write_next(event);
                Ok(())
            }
            SorterBackend::File(f) => f.write_next(&event),
        }
    }

    /// Next event in stored order, or `None` at end of run.
    pub fn read_next(&mut self) -> Result<Option<Event>> {
        match self {
            SorterBackend::Memory(m) => Ok(m.read_next()),
            SorterBackend::File(f) => f.read_next(),
        }
    }

    /// Commit buffered writes and rewind to the start of the run. No writes
    /// are permitted afterwards until `reset()`.
    pub fn flush(&mut self) -> Result<()> {
        match self {
            SorterBackend::Memory(m) => {
                m.flush();
                Ok(())
            }
            SorterBackend::File(f) => f.flush(),
        }
    }

    /// Truncate to empty and make writable again.
    pub fn reset(&mut self) -> Result<()> {
        match self {
            SorterBackend::Memory(m) => {
                m.reset();
                Ok(())
            }
            SorterBackend::File(f) => f.reset(),
        }
    }

    /// Best-effort byte footprint. The memory variant is not counted and
    /// returns -1.
    pub fn size(&self) -> i64 {
        match self {
            SorterBackend::Memory(_) => -1,
            SorterBackend::File(f) => f.size(),
        }
    }
}

/// In-memory run storage. Events are kept as-is and handed back in insertion
/// order.
#[derive(Default)]
pub struct MemoryBackend {
    events: Vec<Event>,
    read_index: usize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn write_next(&mut self, event: Event) {
        self.events.push(event);
    }

    fn read_next(&mut self) -> Option<Event> {
        if self.read_index >= self.events.len() {
            return None;
        }
        let event = std::mem::take(&mut self.events[self.read_index]);
        self.read_index += 1;
        Some(event)
    }

    fn flush(&mut self) {
        self.read_index = 0;
    }

    fn reset(&mut self) {
        self.events.clear();
        self.read_index = 0;
    }
}

enum FileIo {
    Writing(BufWriter<fs::File>),
    Reading(BufReader<fs::File>),
    /// Transient while flipping phases; never observed by callers.
    Swapping,
}

/// Spill-file run storage.
///
/// Records are framed as `[u32 LE length][bincode payload]`. The file is
/// overwritten on reuse and is not required to survive a restart.
pub struct FileBackend {
    path: PathBuf,
    io: FileIo,
    size: i64,
    chunk_size_limit: u64,
    chunk_limit_warned: bool,
}

impl FileBackend {
    pub fn create(path: PathBuf, chunk_size_limit: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(SorterError::Alloc)?;

        log::debug!("new file backend created, path: {}", path.display());

        Ok(Self {
            path,
            io: FileIo::Writing(BufWriter::with_capacity(FILE_BUFFER_SIZE, file)),
            size: 0,
            chunk_size_limit,
            chunk_limit_warned: false,
        })
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn write_next(&mut self, event: &Event) -> Result<()> {
        let FileIo::Writing(writer) = &mut self.io else {
            error_bail!("write on a file backend that is not in write phase");
        };

        let payload = bincode::encode_to_vec(event, bincode::config::standard())?;
        let len = payload.len() as u32;

        writer
            .write_all(&len.to_le_bytes())
            .map_err(SorterError::BackendWrite)?;
        writer
            .write_all(&payload)
            .map_err(SorterError::BackendWrite)?;

        self.size += 4 + payload.len() as i64;
        if !self.chunk_limit_warned && self.size as u64 > self.chunk_size_limit {
            warn!(
                "run exceeds chunk size limit, path: {}, size: {}, limit: {}",
                self.path.display(),
                self.size,
                self.chunk_size_limit
            );
            self.chunk_limit_warned = true;
        }

        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.io, FileIo::Swapping) {
            FileIo::Writing(writer) => {
                let mut file = writer
                    .into_inner()
                    .map_err(|e| SorterError::BackendWrite(e.into_error()))?;
                file.seek(SeekFrom::Start(0))
                    .map_err(SorterError::BackendWrite)?;
                self.io = FileIo::Reading(BufReader::with_capacity(FILE_BUFFER_SIZE, file));
                Ok(())
            }
            other => {
                self.io = other;
                error_bail!("flush on a file backend that is not in write phase");
            }
        }
    }

    fn read_next(&mut self) -> Result<Option<Event>> {
        let FileIo::Reading(reader) = &mut self.io else {
            error_bail!("read on a file backend that is not in read phase");
        };

        let mut len_buf = [0u8; 4];
        let n = read_full(reader, &mut len_buf).map_err(SorterError::BackendRead)?;
        if n == 0 {
            // Clean end of run.
            return Ok(None);
        }
        if n < len_buf.len() {
            return Err(SorterError::CorruptRun {
                reason: format!("short length prefix, got {} of 4 bytes", n),
            }
            .into());
        }

        let len = u32::from_le_bytes(len_buf);
        if len > MAX_EVENT_BYTES {
            return Err(SorterError::CorruptRun {
                reason: format!("length prefix {} exceeds event size bound", len),
            }
            .into());
        }

        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload).map_err(|e| -> anyhow::Error {
            if e.kind() == ErrorKind::UnexpectedEof {
                SorterError::CorruptRun {
                    reason: format!("run truncated inside a {} byte record", len),
                }
                .into()
            } else {
                SorterError::BackendRead(e).into()
            }
        })?;

        let (event, _) = bincode::decode_from_slice::<Event, _>(
            &payload,
            bincode::config::standard(),
        )
        .map_err(|e| SorterError::CorruptRun {
            reason: format!("undecodable payload: {}", e),
        })?;

        Ok(Some(event))
    }

    fn reset(&mut self) -> Result<()> {
        let mut file = match std::mem::replace(&mut self.io, FileIo::Swapping) {
            FileIo::Writing(writer) => writer
                .into_inner()
                .map_err(|e| SorterError::BackendWrite(e.into_error()))?,
            FileIo::Reading(reader) => reader.into_inner(),
            FileIo::Swapping => {
                error_bail!("reset on a file backend in transient state");
            }
        };

        file.set_len(0).map_err(SorterError::BackendWrite)?;
        file.seek(SeekFrom::Start(0))
            .map_err(SorterError::BackendWrite)?;

        self.size = 0;
        self.chunk_limit_warned = false;
        self.io = FileIo::Writing(BufWriter::with_capacity(FILE_BUFFER_SIZE, file));
        Ok(())
    }

    /// Close the handle and delete the spill file.
    pub fn destroy(self) -> Result<()> {
        let path = self.path;
        drop(self.io);
        fs::remove_file(&path).map_err(SorterError::BackendWrite)?;
        Ok(())
    }
}

/// Read until `buf` is full or the reader is exhausted; returns bytes read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(read)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SorterError;
    use brook_core::tool::setup_log;
    use tempfile::tempdir;

    fn sample_events() -> Vec<Event> {
        vec![
            Event::put(5, 1, b"k1".to_vec(), b"v1".to_vec(), 1),
            Event::delete(7, 2, b"k2".to_vec(), 1),
            Event::resolved(0, 7),
        ]
    }

    #[test]
    fn test_memory_backend_cycle() {
        setup_log();

        let mut backend = SorterBackend::Memory(MemoryBackend::new());
        for event in sample_events() {
            backend.write_next(event).unwrap();
        }
        assert_eq!(backend.size(), -1);

        backend.flush().unwrap();
        let mut got = Vec::new();
        while let Some(event) = backend.read_next().unwrap() {
            got.push(event);
        }
        assert_eq!(got, sample_events());

        backend.reset().unwrap();
        backend.flush().unwrap();
        assert!(backend.read_next().unwrap().is_none());
    }

    #[test]
    fn test_file_backend_cycle() {
        setup_log();

        let dir = tempdir().unwrap();
        let backend = FileBackend::create(dir.path().join("sort-1"), 1024 * 1024).unwrap();
        let mut backend = SorterBackend::File(backend);

        for event in sample_events() {
            backend.write_next(event).unwrap();
        }
        assert!(backend.size() > 0);

        backend.flush().unwrap();
        let mut got = Vec::new();
        while let Some(event) = backend.read_next().unwrap() {
            got.push(event);
        }
        assert_eq!(got, sample_events());

        // A reset backend is writable and empty again.
        backend.reset().unwrap();
        assert_eq!(backend.size(), 0);
        backend
            .write_next(Event::put(9, 3, b"k3".to_vec(), vec![], 2))
            .unwrap();
        backend.flush().unwrap();
        let event = backend.read_next().unwrap().unwrap();
        assert_eq!(event.crts, 9);
        assert!(backend.read_next().unwrap().is_none());
    }

    #[test]
    fn test_file_backend_write_after_flush_rejected() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::create(dir.path().join("sort-1"), 1024).unwrap();
        let mut backend = SorterBackend::File(backend);

        backend.write_next(Event::resolved(0, 1)).unwrap();
        backend.flush().unwrap();
        assert!(backend.write_next(Event::resolved(0, 2)).is_err());
    }

    #[test]
    fn test_truncated_run_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sort-1");

        let backend = FileBackend::create(path.clone(), 1024).unwrap();
        let mut backend = SorterBackend::File(backend);
        backend
            .write_next(Event::put(5, 1, b"key".to_vec(), b"value".to_vec(), 1))
            .unwrap();
        backend.flush().unwrap();
        drop(backend);

        // Cut the file inside the record.
        let full = fs::read(&path).unwrap();
        fs::write(&path, &full[..full.len() - 2]).unwrap();

        let file = OpenOptions::new().read(true).open(&path).unwrap();
        let mut backend = FileBackend {
            path: path.clone(),
            io: FileIo::Reading(BufReader::new(file)),
            size: 0,
            chunk_size_limit: 1024,
            chunk_limit_warned: false,
        };
        let err = backend.read_next().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SorterError>(),
            Some(SorterError::CorruptRun { .. })
        ));
    }

    #[test]
    fn test_short_length_prefix_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sort-1");

        // One full record followed by a dangling 2-byte length prefix.
        let payload =
            bincode::encode_to_vec(Event::resolved(0, 3), bincode::config::standard()).unwrap();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&payload);
        bytes.extend_from_slice(&[0xab, 0xcd]);
        fs::write(&path, &bytes).unwrap();

        let file = OpenOptions::new().read(true).open(&path).unwrap();
        let mut backend = FileBackend {
            path: path.clone(),
            io: FileIo::Reading(BufReader::new(file)),
            size: 0,
            chunk_size_limit: 1024,
            chunk_limit_warned: false,
        };

        assert_eq!(backend.read_next().unwrap().unwrap(), Event::resolved(0, 3));
        let err = backend.read_next().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SorterError>(),
            Some(SorterError::CorruptRun { .. })
        ));
    }

    #[test]
    fn test_destroy_removes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sort-1");
        let backend = FileBackend::create(path.clone(), 1024).unwrap();
        assert!(path.exists());
        backend.destroy().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_oversized_length_prefix_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sort-1");

        {
            let mut file = fs::File::create(&path).unwrap();
            file.write_all(&u32::MAX.to_le_bytes()).unwrap();
        }

        let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let mut backend = FileBackend {
            path: path.clone(),
            io: FileIo::Reading(BufReader::new(file)),
            size: 0,
            chunk_size_limit: 1024,
            chunk_limit_warned: false,
        };
        let err = backend.read_next().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SorterError>(),
            Some(SorterError::CorruptRun { .. })
        ));
    }
}
