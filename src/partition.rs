//! Partitioned graph layout: adjacency separated from coordinates.
//!
//! When a partition prefix is supplied at open, the adjacency lists live in
//! `<part_prefix>_disk_graph.index` while the primary index file keeps
//! serving coordinates and PQ data. Sector `p + 1` of the graph file holds
//! the packed records of partition `p`: each record is a `u32` degree
//! followed by that many neighbor ids, laid out at a fixed
//! `graph_node_len` stride in partition order.
//!
//! `<part_prefix>_partition.bin`:
//!
//! ```text
//! [C u64][num_partitions u64][N u64]
//! per partition: [size u32][ids u32 x size]
//! [id2partition u32 x N]
//! ```

use std::fs::File;
use std::io::Read;
use std::path::Path;

use smallvec::SmallVec;
use tracing::info;

use crate::defaults::SECTOR_LEN;
use crate::error::{Result, SearchError};

/// Adjacency list decoded from a partition sector; inline up to typical R.
pub type NeighborList = SmallVec<[u32; 64]>;

/// Partition membership tables, validated at load.
pub struct PartitionTable {
    pub num_partitions: u64,
    /// Ids co-located in each partition's sector, in record order.
    pub partitions: Vec<Vec<u32>>,
    /// For every id, the partition holding its adjacency record.
    pub id2partition: Vec<u32>,
}

impl PartitionTable {
    /// Load and validate `<part_prefix>_partition.bin`.
    pub fn load(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut head = [0u8; 24];
        file.read_exact(&mut head).map_err(|_| {
            SearchError::CorruptIndex(format!("{}: truncated partition header", path.display()))
        })?;
        let capacity = u64::from_le_bytes(head[0..8].try_into().unwrap());
        let num_partitions = u64::from_le_bytes(head[8..16].try_into().unwrap());
        let num_points = u64::from_le_bytes(head[16..24].try_into().unwrap());

        let mut partitions = Vec::with_capacity(num_partitions as usize);
        for p in 0..num_partitions {
            let mut size_buf = [0u8; 4];
            file.read_exact(&mut size_buf).map_err(|_| {
                SearchError::CorruptIndex(format!(
                    "{}: truncated at partition {}",
                    path.display(),
                    p
                ))
            })?;
            let size = u32::from_le_bytes(size_buf) as usize;
            let mut ids = vec![0u8; size * 4];
            file.read_exact(&mut ids).map_err(|_| {
                SearchError::CorruptIndex(format!(
                    "{}: truncated ids in partition {}",
                    path.display(),
                    p
                ))
            })?;
            partitions.push(
                ids.chunks_exact(4)
                    .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            );
        }

        let mut map_bytes = vec![0u8; num_points as usize * 4];
        file.read_exact(&mut map_bytes).map_err(|_| {
            SearchError::CorruptIndex(format!("{}: truncated id map", path.display()))
        })?;
        let id2partition: Vec<u32> = map_bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let table = Self {
            num_partitions,
            partitions,
            id2partition,
        };
        table.validate(path)?;
        info!(
            partitions = num_partitions,
            points = num_points,
            capacity,
            "loaded partition table"
        );
        Ok(table)
    }

    fn validate(&self, path: &Path) -> Result<()> {
        for (id, &p) in self.id2partition.iter().enumerate() {
            if p as u64 >= self.num_partitions {
                return Err(SearchError::CorruptIndex(format!(
                    "{}: id {} maps to partition {} of {}",
                    path.display(),
                    id,
                    p,
                    self.num_partitions
                )));
            }
            if !self.partitions[p as usize].contains(&(id as u32)) {
                return Err(SearchError::CorruptIndex(format!(
                    "{}: id {} missing from its partition {}",
                    path.display(),
                    id,
                    p
                )));
            }
        }
        let total: usize = self.partitions.iter().map(Vec::len).sum();
        if total != self.id2partition.len() {
            return Err(SearchError::CorruptIndex(format!(
                "{}: partitions hold {} ids, map has {}",
                path.display(),
                total,
                self.id2partition.len()
            )));
        }
        Ok(())
    }

    /// Partition of `id` and its record index inside that partition.
    pub fn locate(&self, id: u32) -> Result<(u32, usize)> {
        let p = *self
            .id2partition
            .get(id as usize)
            .ok_or_else(|| SearchError::CorruptIndex(format!("id {} has no partition", id)))?;
        let j = self.partitions[p as usize]
            .iter()
            .position(|&x| x == id)
            .ok_or_else(|| {
                SearchError::CorruptIndex(format!("id {} missing from partition {}", id, p))
            })?;
        Ok((p, j))
    }
}

/// Geometry of the separate graph file, read from its sector 0.
///
/// The meta sector is `[meta_n u32][meta_dim u32][meta_info u64 x meta_n]`
/// with `meta_info[1]` the coordinate dim and `meta_info[3]` the combined
/// coords+adjacency node length; the adjacency stride in partition sectors
/// is the remainder once coordinates are stripped.
#[derive(Debug, Clone, Copy)]
pub struct GraphFileMeta {
    pub num_points: u64,
    pub dim: u64,
    pub max_node_len: u64,
    /// Stride of one adjacency record inside a partition sector.
    pub graph_node_len: u64,
}

impl GraphFileMeta {
    pub fn parse(sector0: &[u8]) -> Result<Self> {
        if sector0.len() < 8 {
            return Err(SearchError::CorruptIndex(
                "graph file header is too short".into(),
            ));
        }
        let meta_n = u32::from_le_bytes(sector0[0..4].try_into().unwrap()) as usize;
        if 8 + meta_n * 8 > sector0.len() || meta_n < 4 {
            return Err(SearchError::CorruptIndex(format!(
                "graph file declares {} metadata entries",
                meta_n
            )));
        }
        let meta: Vec<u64> = (0..meta_n)
            .map(|i| u64::from_le_bytes(sector0[8 + i * 8..16 + i * 8].try_into().unwrap()))
            .collect();
        let num_points = meta[0];
        let dim = meta[1];
        let max_node_len = meta[3];
        let dim_bytes = dim * 4;
        if max_node_len <= dim_bytes {
            return Err(SearchError::CorruptIndex(format!(
                "graph node len {} does not cover {} coordinate bytes",
                max_node_len, dim_bytes
            )));
        }
        Ok(Self {
            num_points,
            dim,
            max_node_len,
            graph_node_len: max_node_len - dim_bytes,
        })
    }

    /// Sector of the graph file holding partition `p`.
    pub fn partition_sector(&self, p: u32) -> u64 {
        p as u64 + 1
    }

    /// Decode the adjacency record at position `record_idx` of a partition
    /// sector, validating degree and extent against the sector.
    pub fn neighbors_in_sector(&self, sector: &[u8], record_idx: usize) -> Result<NeighborList> {
        let offset = record_idx * self.graph_node_len as usize;
        if offset + 4 > SECTOR_LEN || offset + 4 > sector.len() {
            return Err(SearchError::CorruptIndex(format!(
                "adjacency record {} starts past sector end",
                record_idx
            )));
        }
        let degree =
            u32::from_le_bytes(sector[offset..offset + 4].try_into().unwrap()) as usize;
        let needed = degree * 4;
        if offset + 4 + needed > SECTOR_LEN || offset + 4 + needed > sector.len() {
            return Err(SearchError::CorruptIndex(format!(
                "adjacency record {} of degree {} overruns its sector",
                record_idx, degree
            )));
        }
        Ok(sector[offset + 4..offset + 4 + needed]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_partition_file(path: &Path, partitions: &[Vec<u32>], n: usize) {
        let mut f = File::create(path).unwrap();
        f.write_all(&(64u64).to_le_bytes()).unwrap();
        f.write_all(&(partitions.len() as u64).to_le_bytes()).unwrap();
        f.write_all(&(n as u64).to_le_bytes()).unwrap();
        let mut id2p = vec![0u32; n];
        for (p, ids) in partitions.iter().enumerate() {
            f.write_all(&(ids.len() as u32).to_le_bytes()).unwrap();
            for &id in ids {
                f.write_all(&id.to_le_bytes()).unwrap();
                id2p[id as usize] = p as u32;
            }
        }
        for p in id2p {
            f.write_all(&p.to_le_bytes()).unwrap();
        }
    }

    #[test]
    fn loads_and_locates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partition.bin");
        write_partition_file(&path, &[vec![0, 2, 4], vec![1, 3, 5]], 6);
        let table = PartitionTable::load(&path).unwrap();
        assert_eq!(table.num_partitions, 2);
        assert_eq!(table.locate(4).unwrap(), (0, 2));
        assert_eq!(table.locate(1).unwrap(), (1, 0));
    }

    #[test]
    fn id_in_wrong_partition_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partition.bin");
        // id 3 claimed by partition 0's map entry but listed in partition 1
        let mut f = File::create(&path).unwrap();
        f.write_all(&(64u64).to_le_bytes()).unwrap();
        f.write_all(&(2u64).to_le_bytes()).unwrap();
        f.write_all(&(4u64).to_le_bytes()).unwrap();
        f.write_all(&(2u32).to_le_bytes()).unwrap();
        f.write_all(&0u32.to_le_bytes()).unwrap();
        f.write_all(&1u32.to_le_bytes()).unwrap();
        f.write_all(&(2u32).to_le_bytes()).unwrap();
        f.write_all(&2u32.to_le_bytes()).unwrap();
        f.write_all(&3u32.to_le_bytes()).unwrap();
        for p in [0u32, 0, 1, 0] {
            f.write_all(&p.to_le_bytes()).unwrap();
        }
        drop(f);
        assert!(matches!(
            PartitionTable::load(&path),
            Err(SearchError::CorruptIndex(_))
        ));
    }

    #[test]
    fn graph_meta_and_record_decode() {
        let mut sector0 = vec![0u8; SECTOR_LEN];
        sector0[0..4].copy_from_slice(&9u32.to_le_bytes());
        sector0[4..8].copy_from_slice(&1u32.to_le_bytes());
        let meta = [8u64, 4, 0, 16 + 20, 0, 0, 0, 0, 0];
        for (i, m) in meta.iter().enumerate() {
            sector0[8 + i * 8..16 + i * 8].copy_from_slice(&m.to_le_bytes());
        }
        let gm = GraphFileMeta::parse(&sector0).unwrap();
        assert_eq!(gm.graph_node_len, 20);
        assert_eq!(gm.partition_sector(3), 4);

        let mut sector = vec![0u8; SECTOR_LEN];
        // record 1 at offset 20: degree 2, neighbors 9 and 4
        sector[20..24].copy_from_slice(&2u32.to_le_bytes());
        sector[24..28].copy_from_slice(&9u32.to_le_bytes());
        sector[28..32].copy_from_slice(&4u32.to_le_bytes());
        assert_eq!(gm.neighbors_in_sector(&sector, 1).unwrap().as_slice(), &[9, 4]);
    }

    #[test]
    fn overrunning_record_is_corrupt() {
        let mut sector0 = vec![0u8; SECTOR_LEN];
        sector0[0..4].copy_from_slice(&9u32.to_le_bytes());
        sector0[4..8].copy_from_slice(&1u32.to_le_bytes());
        let meta = [8u64, 4, 0, 16 + 20, 0, 0, 0, 0, 0];
        for (i, m) in meta.iter().enumerate() {
            sector0[8 + i * 8..16 + i * 8].copy_from_slice(&m.to_le_bytes());
        }
        let gm = GraphFileMeta::parse(&sector0).unwrap();
        let mut sector = vec![0u8; SECTOR_LEN];
        sector[0..4].copy_from_slice(&5000u32.to_le_bytes());
        assert!(gm.neighbors_in_sector(&sector, 0).is_err());
    }
}
