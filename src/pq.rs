//! Product-quantization tables and the resident code store.
//!
//! A PQ pivots file carries, per chunk, 256 centroids over that chunk's
//! dimensions, together with a per-dimension centering vector, the chunk
//! offset table, and an optional square rotation matrix (OPQ-style). At query
//! time the table is specialized into a flat `n_chunks x 256` lookup array so
//! that scoring a candidate is one table read per chunk.
//!
//! Layout of `<prefix>_pq_pivots.bin`:
//!
//! ```text
//! [num_centroids u32 = 256][dim u32][n_chunks u32][has_rotation u32]
//! [centroid      f32 x dim]
//! [chunk_offsets u32 x (n_chunks + 1)]
//! [pivots        f32 x 256 x dim]            row-major, centroid-major
//! [rotation      f32 x dim x dim]            present iff has_rotation != 0
//! ```
//!
//! `<prefix>_pq_compressed.bin` is a u8 bin file of shape `N x n_chunks`.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::defaults::MAX_PQ_CHUNKS;
use crate::error::{Result, SearchError};

/// Number of centroids per chunk; codes are one byte.
pub const NUM_PQ_CENTROIDS: usize = 256;

/// Per-chunk codebooks plus query-side preprocessing state.
#[derive(Debug, Clone)]
pub struct FixedChunkPqTable {
    dim: usize,
    n_chunks: usize,
    /// `n_chunks + 1` boundaries into the (rotated) dimension space.
    chunk_offsets: Vec<u32>,
    /// `256 x dim`, centroid-major.
    pivots: Vec<f32>,
    /// Per-dimension centering, subtracted from queries before rotation.
    centroid: Vec<f32>,
    /// Optional `dim x dim` row-major rotation.
    rotation: Option<Vec<f32>>,
}

impl FixedChunkPqTable {
    /// Load a pivots file. `expected_chunks` cross-checks the chunk count
    /// against the compressed store when known; pass `None` to infer (the
    /// disk-PQ pivots file is loaded that way).
    pub fn load(path: &Path, expected_chunks: Option<usize>) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut head = [0u8; 16];
        file.read_exact(&mut head).map_err(|_| {
            SearchError::CorruptIndex(format!("{}: truncated pivots header", path.display()))
        })?;
        let num_centroids = u32::from_le_bytes([head[0], head[1], head[2], head[3]]) as usize;
        let dim = u32::from_le_bytes([head[4], head[5], head[6], head[7]]) as usize;
        let n_chunks = u32::from_le_bytes([head[8], head[9], head[10], head[11]]) as usize;
        let has_rotation = u32::from_le_bytes([head[12], head[13], head[14], head[15]]) != 0;

        if num_centroids != NUM_PQ_CENTROIDS {
            return Err(SearchError::CorruptIndex(format!(
                "{}: expected {} PQ centroids, found {}",
                path.display(),
                NUM_PQ_CENTROIDS,
                num_centroids
            )));
        }
        if n_chunks == 0 || n_chunks > MAX_PQ_CHUNKS || n_chunks > dim {
            return Err(SearchError::CorruptIndex(format!(
                "{}: invalid chunk count {} for dim {}",
                path.display(),
                n_chunks,
                dim
            )));
        }
        if let Some(expected) = expected_chunks {
            if expected != n_chunks {
                return Err(SearchError::CorruptIndex(format!(
                    "{}: pivots declare {} chunks but compressed data has {}",
                    path.display(),
                    n_chunks,
                    expected
                )));
            }
        }

        let centroid = read_f32s(&mut file, dim, path)?;
        let offsets_raw = read_u32s(&mut file, n_chunks + 1, path)?;
        if offsets_raw[0] != 0
            || offsets_raw[n_chunks] as usize != dim
            || offsets_raw.windows(2).any(|w| w[0] > w[1])
        {
            return Err(SearchError::CorruptIndex(format!(
                "{}: chunk offset table is not a partition of 0..{}",
                path.display(),
                dim
            )));
        }
        let pivots = read_f32s(&mut file, NUM_PQ_CENTROIDS * dim, path)?;
        let rotation = if has_rotation {
            Some(read_f32s(&mut file, dim * dim, path)?)
        } else {
            None
        };

        Ok(Self {
            dim,
            n_chunks,
            chunk_offsets: offsets_raw,
            pivots,
            centroid,
            rotation,
        })
    }

    /// Number of chunks, i.e. bytes per code.
    pub fn n_chunks(&self) -> usize {
        self.n_chunks
    }

    /// Dimensionality the table was trained on.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Center the query and apply the rotation when one is present.
    /// `out` must hold `dim` floats.
    pub fn preprocess_query(&self, query: &[f32], out: &mut [f32]) {
        let centered: Vec<f32> = query[..self.dim]
            .iter()
            .zip(self.centroid.iter())
            .map(|(q, c)| q - c)
            .collect();
        match &self.rotation {
            Some(rot) => {
                for (i, dst) in out[..self.dim].iter_mut().enumerate() {
                    let row = &rot[i * self.dim..(i + 1) * self.dim];
                    *dst = crate::distance::dot(row, &centered);
                }
            }
            None => out[..self.dim].copy_from_slice(&centered),
        }
    }

    /// Fill `table` (at least `n_chunks * 256` floats) with the squared L2
    /// distance from the preprocessed query's chunk-subvector to every
    /// centroid of every chunk. The table is read-only for the rest of the
    /// query.
    pub fn populate_chunk_distances(&self, query_rotated: &[f32], table: &mut [f32]) {
        let table = &mut table[..self.n_chunks * NUM_PQ_CENTROIDS];
        table.fill(0.0);
        for chunk in 0..self.n_chunks {
            let lo = self.chunk_offsets[chunk] as usize;
            let hi = self.chunk_offsets[chunk + 1] as usize;
            let row = &mut table[chunk * NUM_PQ_CENTROIDS..(chunk + 1) * NUM_PQ_CENTROIDS];
            for d in lo..hi {
                let q = query_rotated[d];
                for (c, slot) in row.iter_mut().enumerate() {
                    let diff = q - self.pivots[c * self.dim + d];
                    *slot += diff * diff;
                }
            }
        }
    }

    /// Reconstruct the vector a code encodes, adding back the centering.
    /// `out` must hold `dim` floats.
    pub fn inflate_vector(&self, code: &[u8], out: &mut [f32]) {
        for chunk in 0..self.n_chunks {
            let lo = self.chunk_offsets[chunk] as usize;
            let hi = self.chunk_offsets[chunk + 1] as usize;
            let c = code[chunk] as usize;
            for d in lo..hi {
                out[d] = self.pivots[c * self.dim + d] + self.centroid[d];
            }
        }
    }

    /// Exact-from-code inner product against a float query, negated so that
    /// smaller is better like every other comparator in the engine. Used when
    /// the on-disk coordinates are themselves PQ codes.
    pub fn inner_product(&self, query: &[f32], code: &[u8]) -> f32 {
        let mut ip = 0.0f32;
        for chunk in 0..self.n_chunks {
            let lo = self.chunk_offsets[chunk] as usize;
            let hi = self.chunk_offsets[chunk + 1] as usize;
            let c = code[chunk] as usize;
            for d in lo..hi {
                ip += query[d] * (self.pivots[c * self.dim + d] + self.centroid[d]);
            }
        }
        -ip
    }

    /// Exact-from-code squared L2 distance against a float query.
    pub fn l2_distance(&self, query: &[f32], code: &[u8]) -> f32 {
        let mut dist = 0.0f32;
        for chunk in 0..self.n_chunks {
            let lo = self.chunk_offsets[chunk] as usize;
            let hi = self.chunk_offsets[chunk + 1] as usize;
            let c = code[chunk] as usize;
            for d in lo..hi {
                let diff = query[d] - (self.pivots[c * self.dim + d] + self.centroid[d]);
                dist += diff * diff;
            }
        }
        dist
    }
}

/// Sum table entries selected by each code: the PQ distance estimator.
///
/// `codes` holds `n_pts` codes of `n_chunks` bytes gathered contiguously;
/// `table` is the output of
/// [`FixedChunkPqTable::populate_chunk_distances`].
pub fn pq_dist_lookup(codes: &[u8], n_pts: usize, n_chunks: usize, table: &[f32], out: &mut [f32]) {
    for (i, dst) in out[..n_pts].iter_mut().enumerate() {
        let code = &codes[i * n_chunks..(i + 1) * n_chunks];
        let mut acc = 0.0f32;
        for (chunk, &c) in code.iter().enumerate() {
            acc += table[chunk * NUM_PQ_CENTROIDS + c as usize];
        }
        *dst = acc;
    }
}

/// The full compressed code table, resident in memory for the index lifetime.
#[derive(Debug)]
pub struct PqCodes {
    codes: Vec<u8>,
    n_points: usize,
    n_chunks: usize,
}

impl PqCodes {
    /// Load `<prefix>_pq_compressed.bin` (shape `N x n_chunks`).
    pub fn load(path: &Path) -> Result<Self> {
        let (n_points, n_chunks, codes) = crate::io::load_bin_u8(path)?;
        if n_chunks == 0 || n_chunks > MAX_PQ_CHUNKS {
            return Err(SearchError::CorruptIndex(format!(
                "{}: compressed data has {} chunks, cap is {}",
                path.display(),
                n_chunks,
                MAX_PQ_CHUNKS
            )));
        }
        Ok(Self {
            codes,
            n_points,
            n_chunks,
        })
    }

    pub fn n_points(&self) -> usize {
        self.n_points
    }

    pub fn n_chunks(&self) -> usize {
        self.n_chunks
    }

    /// Code bytes for one point.
    pub fn get(&self, id: u32) -> &[u8] {
        let start = id as usize * self.n_chunks;
        &self.codes[start..start + self.n_chunks]
    }

    /// Gather codes for a batch of ids into `out` (contiguous, in order).
    pub fn gather(&self, ids: &[u32], out: &mut [u8]) {
        for (i, &id) in ids.iter().enumerate() {
            debug_assert!((id as usize) < self.n_points);
            out[i * self.n_chunks..(i + 1) * self.n_chunks].copy_from_slice(self.get(id));
        }
    }
}

fn read_f32s(file: &mut File, count: usize, path: &Path) -> Result<Vec<f32>> {
    let mut bytes = vec![0u8; count * 4];
    file.read_exact(&mut bytes).map_err(|_| {
        SearchError::CorruptIndex(format!("{}: truncated pivots payload", path.display()))
    })?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn read_u32s(file: &mut File, count: usize, path: &Path) -> Result<Vec<u32>> {
    let mut bytes = vec![0u8; count * 4];
    file.read_exact(&mut bytes).map_err(|_| {
        SearchError::CorruptIndex(format!("{}: truncated pivots payload", path.display()))
    })?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
