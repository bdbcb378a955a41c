//! On-disk index layout: header decode and node addressing.
//!
//! Sector 0 of `<prefix>_disk.index` is the header; node records start at
//! sector 1. A node record is `[coords][degree u32][neighbor u32 x degree]`
//! padded to `max_node_len`. Small nodes are packed `nnodes_per_sector` to a
//! sector; large nodes span `ceil(max_node_len / SECTOR_LEN)` consecutive
//! sectors and `nnodes_per_sector` is 0.
//!
//! Nothing here performs I/O: callers hand in sector buffers and get
//! bounds-checked views back.

use crate::defaults::{div_round_up, MAX_GRAPH_DEGREE, SECTOR_LEN};
use crate::distance::Element;
use crate::error::{Result, SearchError};

/// Location and shape of the optional full-precision reorder region.
#[derive(Debug, Clone, Copy)]
pub struct ReorderMeta {
    pub start_sector: u64,
    pub ndims: u64,
    pub nvecs_per_sector: u64,
}

/// Decoded sector-0 metadata plus derived node geometry.
#[derive(Debug, Clone)]
pub struct DiskLayout {
    pub num_points: u64,
    /// Dimensionality the disk file declares (PQ chunk count in disk-PQ mode).
    pub disk_dims: u64,
    pub medoid_id: u64,
    pub max_node_len: u64,
    /// 0 means multi-sector nodes.
    pub nnodes_per_sector: u64,
    pub num_frozen: u64,
    pub frozen_id: u64,
    pub reorder: Option<ReorderMeta>,
    /// Bytes of coordinate data at the start of each node record.
    pub disk_bytes_per_point: u64,
    pub max_degree: u64,
}

fn read_u64(buf: &[u8], pos: &mut usize) -> u64 {
    let v = u64::from_le_bytes(buf[*pos..*pos + 8].try_into().unwrap());
    *pos += 8;
    v
}

impl DiskLayout {
    /// Decode the header sector. `disk_bytes_per_point` is already known from
    /// the PQ metadata (or the disk-PQ chunk count) and determines where the
    /// neighbor region begins inside a record.
    pub fn parse(sector0: &[u8], disk_bytes_per_point: u64) -> Result<Self> {
        if sector0.len() < SECTOR_LEN {
            return Err(SearchError::CorruptIndex(
                "header sector is shorter than SECTOR_LEN".into(),
            ));
        }
        // two u32s of bin-style metadata shape, then u64 fields
        let mut pos = 8;
        let num_points = read_u64(sector0, &mut pos);
        let disk_dims = read_u64(sector0, &mut pos);
        let medoid_id = read_u64(sector0, &mut pos);
        let max_node_len = read_u64(sector0, &mut pos);
        let nnodes_per_sector = read_u64(sector0, &mut pos);
        let num_frozen = read_u64(sector0, &mut pos);
        let frozen_id = read_u64(sector0, &mut pos);
        let has_reorder = read_u64(sector0, &mut pos);
        let reorder = if has_reorder != 0 {
            Some(ReorderMeta {
                start_sector: read_u64(sector0, &mut pos),
                ndims: read_u64(sector0, &mut pos),
                nvecs_per_sector: read_u64(sector0, &mut pos),
            })
        } else {
            None
        };

        if max_node_len <= disk_bytes_per_point + 4 {
            return Err(SearchError::CorruptIndex(format!(
                "max_node_len {} cannot hold {} coord bytes plus a neighbor list",
                max_node_len, disk_bytes_per_point
            )));
        }
        let max_degree = (max_node_len - disk_bytes_per_point) / 4 - 1;
        if max_degree as usize > MAX_GRAPH_DEGREE {
            return Err(SearchError::CorruptIndex(format!(
                "graph degree {} exceeds cap {}",
                max_degree, MAX_GRAPH_DEGREE
            )));
        }
        if nnodes_per_sector > 0 && nnodes_per_sector * max_node_len > SECTOR_LEN as u64 {
            return Err(SearchError::CorruptIndex(format!(
                "{} nodes of {} bytes do not fit one sector",
                nnodes_per_sector, max_node_len
            )));
        }
        if let Some(r) = &reorder {
            if r.nvecs_per_sector == 0 || r.ndims == 0 {
                return Err(SearchError::CorruptIndex(
                    "reorder region declares zero dims or vecs per sector".into(),
                ));
            }
        }

        Ok(Self {
            num_points,
            disk_dims,
            medoid_id,
            max_node_len,
            nnodes_per_sector,
            num_frozen,
            frozen_id,
            reorder,
            disk_bytes_per_point,
            max_degree,
        })
    }

    /// Sectors one node record occupies.
    pub fn sectors_per_node(&self) -> usize {
        if self.nnodes_per_sector > 0 {
            1
        } else {
            div_round_up(self.max_node_len as usize, SECTOR_LEN)
        }
    }

    /// First sector of the record for `id`.
    pub fn node_sector(&self, id: u32) -> u64 {
        let id = id as u64;
        1 + if self.nnodes_per_sector > 0 {
            id / self.nnodes_per_sector
        } else {
            id * self.sectors_per_node() as u64
        }
    }

    /// Byte offset of the record for `id` inside its (multi-)sector buffer.
    pub fn node_offset(&self, id: u32) -> usize {
        if self.nnodes_per_sector == 0 {
            0
        } else {
            (id as u64 % self.nnodes_per_sector) as usize * self.max_node_len as usize
        }
    }

    /// Sector holding the full-precision vector for `id` in the reorder
    /// region, and the byte offset of that vector inside the sector.
    /// `elem_bytes` is the size of one stored scalar.
    pub fn reorder_location(&self, id: u32, elem_bytes: usize) -> Option<(u64, usize)> {
        self.reorder.map(|r| {
            let sector = r.start_sector + id as u64 / r.nvecs_per_sector;
            let offset =
                (id as u64 % r.nvecs_per_sector) as usize * r.ndims as usize * elem_bytes;
            (sector, offset)
        })
    }

    /// Borrow the record for `id` out of a sector buffer previously read from
    /// `node_sector(id)`. Every range is validated before a slice is formed.
    pub fn node_record<'a>(&self, sector_buf: &'a [u8], id: u32) -> Result<NodeRecord<'a>> {
        let off = self.node_offset(id);
        let len = self.max_node_len as usize;
        if off + len > sector_buf.len() {
            return Err(SearchError::CorruptIndex(format!(
                "node {} record overruns its sector buffer",
                id
            )));
        }
        let node_buf = &sector_buf[off..off + len];
        let dbpp = self.disk_bytes_per_point as usize;
        let degree =
            u32::from_le_bytes(node_buf[dbpp..dbpp + 4].try_into().unwrap());
        if degree as u64 > self.max_degree {
            return Err(SearchError::CorruptIndex(format!(
                "node {} declares degree {} above max {}",
                id, degree, self.max_degree
            )));
        }
        let nbr_bytes = &node_buf[dbpp + 4..dbpp + 4 + degree as usize * 4];
        Ok(NodeRecord {
            coord_bytes: &node_buf[..dbpp],
            degree,
            nbr_bytes,
        })
    }
}

/// Borrowed view of one node record inside a sector buffer.
pub struct NodeRecord<'a> {
    coord_bytes: &'a [u8],
    degree: u32,
    nbr_bytes: &'a [u8],
}

impl<'a> NodeRecord<'a> {
    pub fn degree(&self) -> u32 {
        self.degree
    }

    /// Raw coordinate bytes (`disk_bytes_per_point` of them).
    pub fn coord_bytes(&self) -> &'a [u8] {
        self.coord_bytes
    }

    /// Decode the coordinates into `out` (`out.len()` elements).
    pub fn decode_coords<T: Element>(&self, out: &mut [T]) {
        T::decode_slice(self.coord_bytes, out);
    }

    /// Neighbor ids in record order.
    pub fn neighbors(&self) -> impl Iterator<Item = u32> + 'a {
        self.nbr_bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes(fields: &[u64]) -> Vec<u8> {
        let mut buf = vec![0u8; SECTOR_LEN];
        buf[0..4].copy_from_slice(&(fields.len() as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&1u32.to_le_bytes());
        for (i, f) in fields.iter().enumerate() {
            buf[8 + i * 8..16 + i * 8].copy_from_slice(&f.to_le_bytes());
        }
        buf
    }

    #[test]
    fn packed_layout_addressing() {
        // dim 4 f32 coords (16 bytes) + degree + 3 neighbors = 32 bytes/node
        let hdr = header_bytes(&[100, 4, 0, 32, 128, 0, 0, 0]);
        let layout = DiskLayout::parse(&hdr, 16).unwrap();
        assert_eq!(layout.max_degree, 3);
        assert_eq!(layout.sectors_per_node(), 1);
        assert_eq!(layout.node_sector(0), 1);
        assert_eq!(layout.node_sector(127), 1);
        assert_eq!(layout.node_sector(128), 2);
        assert_eq!(layout.node_offset(129), 32);
    }

    #[test]
    fn multi_sector_layout_addressing() {
        // 2048-dim f32 coords (8192 bytes) + degree + 15 neighbors
        let max_node_len = 2 * SECTOR_LEN as u64 + 64;
        let hdr = header_bytes(&[10, 2048, 0, max_node_len, 0, 0, 0, 0]);
        let layout = DiskLayout::parse(&hdr, 8192).unwrap();
        assert_eq!(layout.max_degree, 15);
        assert_eq!(layout.sectors_per_node(), 3);
        assert_eq!(layout.node_sector(0), 1);
        assert_eq!(layout.node_sector(2), 7);
        assert_eq!(layout.node_offset(2), 0);
    }

    #[test]
    fn oversize_degree_is_corrupt() {
        // max_node_len implies degree 8191 > MAX_GRAPH_DEGREE
        let hdr = header_bytes(&[10, 4, 0, 16 + 4 + 8191 * 4 + 4, 0, 0, 0, 0]);
        assert!(matches!(
            DiskLayout::parse(&hdr, 16),
            Err(SearchError::CorruptIndex(_))
        ));
    }

    #[test]
    fn node_record_bounds_and_decode() {
        let hdr = header_bytes(&[8, 2, 0, 24, 128, 0, 0, 0]);
        // 8 bytes coords (2 f32) + degree + up to 3 nbrs
        let layout = DiskLayout::parse(&hdr, 8).unwrap();

        let mut sector = vec![0u8; SECTOR_LEN];
        // node 1 at offset 24
        sector[24..28].copy_from_slice(&1.5f32.to_le_bytes());
        sector[28..32].copy_from_slice(&(-2.0f32).to_le_bytes());
        sector[32..36].copy_from_slice(&2u32.to_le_bytes());
        sector[36..40].copy_from_slice(&7u32.to_le_bytes());
        sector[40..44].copy_from_slice(&3u32.to_le_bytes());

        let rec = layout.node_record(&sector, 1).unwrap();
        assert_eq!(rec.degree(), 2);
        let mut coords = [0f32; 2];
        rec.decode_coords(&mut coords);
        assert_eq!(coords, [1.5, -2.0]);
        assert_eq!(rec.neighbors().collect::<Vec<_>>(), vec![7, 3]);
    }

    #[test]
    fn corrupt_degree_in_record_is_refused() {
        let hdr = header_bytes(&[8, 2, 0, 24, 128, 0, 0, 0]);
        let layout = DiskLayout::parse(&hdr, 8).unwrap();
        let mut sector = vec![0u8; SECTOR_LEN];
        sector[8..12].copy_from_slice(&999u32.to_le_bytes());
        assert!(layout.node_record(&sector, 0).is_err());
    }

    #[test]
    fn reorder_addressing() {
        let hdr = header_bytes(&[8, 2, 0, 24, 128, 0, 0, 1, 50, 4, 256]);
        let layout = DiskLayout::parse(&hdr, 8).unwrap();
        let (sector, off) = layout.reorder_location(300, 4).unwrap();
        assert_eq!(sector, 51);
        assert_eq!(off, (300 % 256) * 16);
    }
}
