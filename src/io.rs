//! Sector-aligned file access.
//!
//! The engine issues all graph I/O as batches of sector-granular positional
//! reads through the [`AlignedReader`] trait. Platform-specific asynchronous
//! backends (io_uring, IOCP) can implement the same trait; the built-in
//! [`DirectFileReader`] uses positional reads and is what `load` constructs.
//!
//! Failures are per-request: one bad sector does not fail its siblings, and
//! the beam search drops the affected node from candidacy for that query.

use std::fs::File;
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::path::Path;

use tracing::warn;

use crate::defaults::SECTOR_LEN;
use crate::error::{Result, SearchError};

/// One positional read: `len = buf.len()` bytes at `offset`.
///
/// Both the offset and the length must be multiples of [`SECTOR_LEN`]; the
/// buffer comes from a [`SectorArena`] and is sector-aligned.
pub struct AlignedRead<'a> {
    pub offset: u64,
    pub buf: &'a mut [u8],
}

impl<'a> AlignedRead<'a> {
    /// Build a read request, validating sector alignment.
    pub fn new(offset: u64, buf: &'a mut [u8]) -> Result<Self> {
        if offset % SECTOR_LEN as u64 != 0 || buf.len() % SECTOR_LEN != 0 {
            return Err(SearchError::BadArgument(format!(
                "read at offset {} len {} is not sector-aligned",
                offset,
                buf.len()
            )));
        }
        Ok(Self { offset, buf })
    }
}

/// Batched, sector-aligned positional reads.
///
/// `register_thread`/`deregister_thread` let backends that queue I/O per OS
/// thread associate submissions with the caller. The default reader needs no
/// per-thread state, so the hooks are no-ops there.
pub trait AlignedReader: Send + Sync {
    /// Called once per worker thread before it issues reads.
    fn register_thread(&self) {}

    /// Called when a worker thread is done with the reader.
    fn deregister_thread(&self) {}

    /// Execute every request in the batch. Returns one success flag per
    /// request, in order; a failed read leaves its buffer contents
    /// unspecified.
    fn read(&self, reqs: &mut [AlignedRead<'_>]) -> Vec<bool>;
}

/// [`AlignedReader`] over a regular file using positional reads.
pub struct DirectFileReader {
    file: File,
    len: u64,
}

impl DirectFileReader {
    /// Open `path` for read-only sector access.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }

    /// Total file length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the file is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl AlignedReader for DirectFileReader {
    fn read(&self, reqs: &mut [AlignedRead<'_>]) -> Vec<bool> {
        reqs.iter_mut()
            .map(|req| {
                // Reads past EOF are trimmed: the final sector of a file whose
                // payload is not sector-padded is still addressable.
                let avail = self.len.saturating_sub(req.offset);
                if avail == 0 {
                    warn!(offset = req.offset, "sector read past end of file");
                    return false;
                }
                let want = (req.buf.len() as u64).min(avail) as usize;
                match self.file.read_exact_at(&mut req.buf[..want], req.offset) {
                    Ok(()) => {
                        req.buf[want..].fill(0);
                        true
                    }
                    Err(e) => {
                        warn!(offset = req.offset, error = %e, "sector read failed");
                        false
                    }
                }
            })
            .collect()
    }
}

/// A reusable, sector-aligned scratch buffer carved into fixed-size chunks.
///
/// Allocated once per scratch slot and handed out as disjoint `&mut [u8]`
/// windows each beam iteration, so no query-path allocation occurs.
pub struct SectorArena {
    storage: Vec<u8>,
    start: usize,
    sectors: usize,
}

impl SectorArena {
    /// Allocate an arena holding `sectors` sectors, aligned to [`SECTOR_LEN`].
    pub fn new(sectors: usize) -> Self {
        let mut storage = vec![0u8; (sectors + 1) * SECTOR_LEN];
        let addr = storage.as_ptr() as usize;
        let start = (SECTOR_LEN - addr % SECTOR_LEN) % SECTOR_LEN;
        // the padding sector guarantees `start + sectors * SECTOR_LEN` fits
        storage[start..].fill(0);
        Self {
            storage,
            start,
            sectors,
        }
    }

    /// Number of sectors the arena holds.
    pub fn sectors(&self) -> usize {
        self.sectors
    }

    /// Split the arena into disjoint chunks of `sectors_per_chunk` sectors.
    pub fn chunks_mut(&mut self, sectors_per_chunk: usize) -> impl Iterator<Item = &mut [u8]> {
        let bytes = sectors_per_chunk * SECTOR_LEN;
        let end = self.start + self.sectors * SECTOR_LEN;
        self.storage[self.start..end].chunks_exact_mut(bytes)
    }

    /// View one chunk immutably after a read has filled it.
    pub fn chunk(&self, sectors_per_chunk: usize, idx: usize) -> &[u8] {
        let bytes = sectors_per_chunk * SECTOR_LEN;
        let begin = self.start + idx * bytes;
        &self.storage[begin..begin + bytes]
    }
}

/// Read the `(rows, cols)` header of a bin file: two little-endian `u32`s
/// followed by row-major payload.
pub(crate) fn read_bin_header(file: &mut File) -> Result<(u32, u32)> {
    let mut buf = [0u8; 8];
    file.read_exact(&mut buf)?;
    let rows = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let cols = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    Ok((rows, cols))
}

/// Load a `u32` bin file, returning `(rows, cols, values)`.
pub(crate) fn load_bin_u32(path: &Path) -> Result<(usize, usize, Vec<u32>)> {
    let mut file = File::open(path)?;
    let (rows, cols) = read_bin_header(&mut file)?;
    let count = rows as usize * cols as usize;
    let mut bytes = vec![0u8; count * 4];
    file.read_exact(&mut bytes).map_err(|_| {
        SearchError::CorruptIndex(format!("{}: truncated u32 payload", path.display()))
    })?;
    let vals = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok((rows as usize, cols as usize, vals))
}

/// Load an `f32` bin file, returning `(rows, cols, values)`.
pub(crate) fn load_bin_f32(path: &Path) -> Result<(usize, usize, Vec<f32>)> {
    let mut file = File::open(path)?;
    let (rows, cols) = read_bin_header(&mut file)?;
    let count = rows as usize * cols as usize;
    let mut bytes = vec![0u8; count * 4];
    file.read_exact(&mut bytes).map_err(|_| {
        SearchError::CorruptIndex(format!("{}: truncated f32 payload", path.display()))
    })?;
    let vals = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok((rows as usize, cols as usize, vals))
}

/// Load a `u8` bin file, returning `(rows, cols, bytes)`.
pub(crate) fn load_bin_u8(path: &Path) -> Result<(usize, usize, Vec<u8>)> {
    let mut file = File::open(path)?;
    let (rows, cols) = read_bin_header(&mut file)?;
    let mut bytes = vec![0u8; rows as usize * cols as usize];
    file.read_exact(&mut bytes).map_err(|_| {
        SearchError::CorruptIndex(format!("{}: truncated u8 payload", path.display()))
    })?;
    Ok((rows as usize, cols as usize, bytes))
}
