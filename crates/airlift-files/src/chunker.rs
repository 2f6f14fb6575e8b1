//! File chunking and receiver-side chunk staging.
//!
//! The sender partitions a staged artifact into fixed-size chunks and hashes
//! each one; the receiver persists chunks as individual temporary files and
//! reassembles them in index order once the declared byte count has arrived.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::chunk_count;

/// Sequential reader over a file partitioned into fixed-size chunks.
pub struct FileChunker {
    file: File,
    chunk_size: usize,
    total_size: u64,
    next_index: u64,
}

impl FileChunker {
    /// Open a file for chunked reading.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or its metadata read.
    pub fn open<P: AsRef<Path>>(path: P, chunk_size: usize) -> io::Result<Self> {
        let file = File::open(path)?;
        let total_size = file.metadata()?.len();
        Ok(Self {
            file,
            chunk_size,
            total_size,
            next_index: 0,
        })
    }

    /// Total file size in bytes.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Total number of chunks.
    #[must_use]
    pub fn num_chunks(&self) -> u64 {
        chunk_count(self.total_size, self.chunk_size)
    }

    /// Read the next chunk in sequence, or `None` past the end.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails.
    pub fn read_next(&mut self) -> io::Result<Option<(u64, Vec<u8>)>> {
        if self.next_index >= self.num_chunks() {
            return Ok(None);
        }
        let index = self.next_index;
        let data = read_indexed(&mut self.file, self.total_size, self.chunk_size, index)?;
        self.next_index += 1;
        Ok(Some((index, data)))
    }
}

/// Read one chunk of a file by index, opening the file for this read only.
///
/// Concurrent chunk senders each open their own handle, so no shared seek
/// position exists between streams.
///
/// # Errors
///
/// Returns an error if the index is out of bounds or reading fails.
pub fn read_chunk_at(path: &Path, chunk_size: usize, index: u64) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let total_size = file.metadata()?.len();
    read_indexed(&mut file, total_size, chunk_size, index)
}

fn read_indexed(file: &mut File, total_size: u64, chunk_size: usize, index: u64) -> io::Result<Vec<u8>> {
    let offset = index * chunk_size as u64;
    if offset >= total_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "chunk index out of bounds",
        ));
    }
    let len = (total_size - offset).min(chunk_size as u64) as usize;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

/// Receiver-side staging area for one incoming transfer.
///
/// Chunks land as individual files under a per-transfer directory. Duplicate
/// deliveries of an index overwrite the existing file without advancing the
/// received-byte count, so accounting stays exact under retries.
pub struct ChunkStore {
    dir: PathBuf,
    total_size: u64,
    chunk_size: usize,
    received: HashSet<u64>,
    received_bytes: u64,
}

impl ChunkStore {
    /// Create the staging directory for a transfer.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn create<P: AsRef<Path>>(dir: P, total_size: u64, chunk_size: usize) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            total_size,
            chunk_size,
            received: HashSet::new(),
            received_bytes: 0,
        })
    }

    fn chunk_path(&self, index: u64) -> PathBuf {
        self.dir.join(format!("{index}.chunk"))
    }

    /// Total number of chunks expected.
    #[must_use]
    pub fn total_chunks(&self) -> u64 {
        chunk_count(self.total_size, self.chunk_size)
    }

    /// Bytes received so far, counting each index once.
    #[must_use]
    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    /// Whether every declared byte has arrived.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.received_bytes == self.total_size
    }

    /// Persist one chunk. Returns `true` if the index was new.
    ///
    /// # Errors
    ///
    /// Returns an error if the index is out of bounds or writing fails.
    pub fn write_chunk(&mut self, index: u64, data: &[u8]) -> io::Result<bool> {
        if index >= self.total_chunks() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "chunk index out of bounds",
            ));
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.chunk_path(index))?;
        file.write_all(data)?;
        if self.received.insert(index) {
            self.received_bytes += data.len() as u64;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Reassemble all chunks in index order into `dest`, deleting the chunk
    /// files as they are consumed. Returns the BLAKE3 checksum (hex) of the
    /// assembled file.
    ///
    /// # Errors
    ///
    /// Returns an error if any chunk is missing or I/O fails; on error the
    /// partial destination file is removed.
    pub fn assemble(&mut self, dest: &Path) -> io::Result<String> {
        let result = self.assemble_inner(dest);
        if result.is_err() {
            let _ = fs::remove_file(dest);
        }
        result
    }

    fn assemble_inner(&mut self, dest: &Path) -> io::Result<String> {
        let mut out = File::create(dest)?;
        let mut hasher = blake3::Hasher::new();
        for index in 0..self.total_chunks() {
            let path = self.chunk_path(index);
            let data = fs::read(&path).map_err(|e| {
                io::Error::new(e.kind(), format!("chunk {index} unreadable: {e}"))
            })?;
            hasher.update(&data);
            out.write_all(&data)?;
            fs::remove_file(&path)?;
        }
        out.sync_all()?;
        let _ = fs::remove_dir(&self.dir);
        Ok(hasher.finalize().to_hex().to_string())
    }

    /// Best-effort removal of the staging directory and any remaining chunks.
    pub fn discard(&mut self) {
        self.received.clear();
        self.received_bytes = 0;
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!("failed to discard chunk staging {}: {e}", self.dir.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CHUNK_SIZE, file_checksum};
    use tempfile::TempDir;

    fn write_fixture(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn chunking_roundtrip_reproduces_checksum() {
        let tmp = TempDir::new().unwrap();
        let data: Vec<u8> = (0..3 * CHUNK_SIZE).map(|i| (i % 251) as u8).collect();
        let src = write_fixture(&tmp, "src.dat", &data);

        let mut chunker = FileChunker::open(&src, CHUNK_SIZE).unwrap();
        assert_eq!(chunker.num_chunks(), 3);

        let mut store =
            ChunkStore::create(tmp.path().join("incoming"), data.len() as u64, CHUNK_SIZE).unwrap();
        while let Some((index, chunk)) = chunker.read_next().unwrap() {
            assert!(store.write_chunk(index, &chunk).unwrap());
        }
        assert!(store.is_complete());

        let dest = tmp.path().join("out.dat");
        let assembled = store.assemble(&dest).unwrap();
        assert_eq!(assembled, file_checksum(&src).unwrap());
        assert_eq!(fs::read(&dest).unwrap(), data);
    }

    #[test]
    fn duplicate_chunks_do_not_double_count() {
        let tmp = TempDir::new().unwrap();
        let mut store = ChunkStore::create(tmp.path().join("in"), 2048, 1024).unwrap();

        assert!(store.write_chunk(0, &[0xAA; 1024]).unwrap());
        assert!(!store.write_chunk(0, &[0xAA; 1024]).unwrap());
        assert_eq!(store.received_bytes(), 1024);
        assert!(!store.is_complete());

        assert!(store.write_chunk(1, &[0xBB; 1024]).unwrap());
        assert_eq!(store.received_bytes(), 2048);
        assert!(store.is_complete());
    }

    #[test]
    fn single_chunk_file() {
        let tmp = TempDir::new().unwrap();
        let data = vec![0x42u8; 4096];
        let src = write_fixture(&tmp, "small.dat", &data);

        let mut chunker = FileChunker::open(&src, CHUNK_SIZE).unwrap();
        assert_eq!(chunker.num_chunks(), 1);

        let (index, chunk) = chunker.read_next().unwrap().unwrap();
        assert_eq!(index, 0);
        assert_eq!(chunk, data);
        assert!(chunker.read_next().unwrap().is_none());
    }

    #[test]
    fn read_chunk_at_partial_tail() {
        let tmp = TempDir::new().unwrap();
        let data = vec![0x17u8; CHUNK_SIZE + 100];
        let src = write_fixture(&tmp, "tail.dat", &data);

        assert_eq!(read_chunk_at(&src, CHUNK_SIZE, 0).unwrap().len(), CHUNK_SIZE);
        assert_eq!(read_chunk_at(&src, CHUNK_SIZE, 1).unwrap().len(), 100);
        assert!(read_chunk_at(&src, CHUNK_SIZE, 2).is_err());
    }

    #[test]
    fn assemble_with_missing_chunk_fails() {
        let tmp = TempDir::new().unwrap();
        let mut store = ChunkStore::create(tmp.path().join("in"), 2048, 1024).unwrap();
        store.write_chunk(1, &[0u8; 1024]).unwrap();

        let dest = tmp.path().join("out.dat");
        assert!(store.assemble(&dest).is_err());
        assert!(!dest.exists());
    }
}
