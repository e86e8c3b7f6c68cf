use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};

use crate::TransferError;

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Computes SHA-256 of an entire file and returns the hex-encoded digest.
pub fn calculate_file_checksum(path: &Path) -> Result<String, TransferError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

// ---------------------------------------------------------------------------
// Chunk sources
// ---------------------------------------------------------------------------

/// Random-access byte source that chunks are read from.
///
/// Reads are independent so several chunks can be read concurrently.
pub trait ChunkSource: Send + Sync {
    /// Total length in bytes.
    fn len(&self) -> u64;

    /// Reads exactly the bytes in `range`.
    fn read_range(&self, range: Range<u64>) -> Result<Vec<u8>, TransferError>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Reads chunks straight from a file on disk.
#[derive(Debug, Clone)]
pub struct FileChunkSource {
    path: PathBuf,
    len: u64,
}

impl FileChunkSource {
    /// Opens `path` and records its current length.
    pub fn open(path: &Path) -> Result<Self, TransferError> {
        let len = std::fs::metadata(path)?.len();
        Ok(Self {
            path: path.to_path_buf(),
            len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ChunkSource for FileChunkSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_range(&self, range: Range<u64>) -> Result<Vec<u8>, TransferError> {
        let mut file = std::fs::File::open(&self.path)?;
        let actual = file.metadata()?.len();
        if actual != self.len {
            return Err(TransferError::SourceChanged {
                expected: self.len,
                actual,
            });
        }
        file.seek(SeekFrom::Start(range.start))?;
        let mut buf = vec![0u8; (range.end - range.start) as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

impl ChunkSource for Vec<u8> {
    fn len(&self) -> u64 {
        self.as_slice().len() as u64
    }

    fn read_range(&self, range: Range<u64>) -> Result<Vec<u8>, TransferError> {
        let slice = self
            .get(range.start as usize..range.end as usize)
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::UnexpectedEof))?;
        Ok(slice.to_vec())
    }
}

// ---------------------------------------------------------------------------
// ChunkWriter
// ---------------------------------------------------------------------------

/// Distinguishes temp files of concurrent writes to the same index.
static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Stores accepted chunks as `<index>.part` files under one directory.
#[derive(Debug, Clone)]
pub struct ChunkWriter {
    dir: PathBuf,
}

impl ChunkWriter {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn part_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!("{index}.part"))
    }

    /// Writes chunk `index` to disk.
    ///
    /// - Verifies `checksum` first if non-empty.
    /// - Writes to a temp file, syncs, then renames into place, so a part
    ///   file is either absent or complete.
    pub fn write_chunk(&self, index: u32, data: &[u8], checksum: &str) -> Result<PathBuf, TransferError> {
        if !checksum.is_empty() && !checksum.eq_ignore_ascii_case(&checksum_bytes(data)) {
            return Err(TransferError::ChecksumMismatch { index });
        }

        std::fs::create_dir_all(&self.dir)?;

        let final_path = self.part_path(index);
        let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp_path = self.dir.join(format!("{index}.part.{seq}.tmp"));
        {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &final_path)?;
        Ok(final_path)
    }

    pub fn has_part(&self, index: u32) -> bool {
        self.part_path(index).is_file()
    }

    /// Removes every stored part together with the directory.
    pub fn remove_all(&self) -> Result<(), TransferError> {
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Assembly
// ---------------------------------------------------------------------------

/// Result of [`assemble_parts`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assembled {
    /// Hex SHA-256 of the assembled stream.
    pub digest: String,
    pub size: u64,
}

/// Concatenates parts `0..total_chunks` in index order into `dest`,
/// hashing the stream as it is written.
///
/// `dest` is written through a temp file and only renamed into place once
/// every part has been copied.
pub fn assemble_parts(
    writer: &ChunkWriter,
    total_chunks: u32,
    dest: &Path,
) -> Result<Assembled, TransferError> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut tmp_name = dest.as_os_str().to_owned();
    tmp_name.push(".assembling");
    let tmp_path = PathBuf::from(tmp_name);

    let result = copy_parts(writer, total_chunks, &tmp_path);
    match result {
        Ok(assembled) => {
            std::fs::rename(&tmp_path, dest)?;
            Ok(assembled)
        }
        Err(e) => {
            let _ = std::fs::remove_file(&tmp_path);
            Err(e)
        }
    }
}

fn copy_parts(writer: &ChunkWriter, total_chunks: u32, out: &Path) -> Result<Assembled, TransferError> {
    let mut file = std::fs::File::create(out)?;
    let mut hasher = Sha256::new();
    let mut size = 0u64;
    let mut buf = [0u8; 8192];

    for index in 0..total_chunks {
        let mut part = match std::fs::File::open(writer.part_path(index)) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TransferError::MissingPart(index));
            }
            Err(e) => return Err(e.into()),
        };
        loop {
            let n = part.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n])?;
            size += n as u64;
        }
    }
    file.sync_all()?;

    Ok(Assembled {
        digest: hex::encode(hasher.finalize()),
        size,
    })
}
