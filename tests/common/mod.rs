//! Shared fixtures: writes tiny but format-exact indexes to disk and hosts a
//! mock embedding service speaking the crate's wire protocol.
//!
//! All fixtures use an identity PQ codebook (pivot row `i` is point `i`'s
//! vector, point `i`'s code is `[i]`), so the PQ estimator is exact and
//! search results are fully predictable.

#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::net::TcpListener;
use std::path::Path;

use prost::Message;

use beamline::embedding::{
    read_frame, write_frame, NodeEmbeddingRequest, NodeEmbeddingResponse,
};
use beamline::Metric;

pub const SECTOR_LEN: usize = 4096;
pub const NUM_PQ_CENTROIDS: usize = 256;

/// A small in-memory dataset plus its graph, written out in the on-disk
/// index format.
pub struct Fixture {
    pub metric: Metric,
    /// Vectors as the caller supplied them.
    pub raw: Vec<Vec<f32>>,
    /// Vectors after the build-time metric transform; these are what land on
    /// disk and in the PQ codebook.
    pub prepared: Vec<Vec<f32>>,
    pub adjacency: Vec<Vec<u32>>,
    pub medoid: u32,
    pub max_degree: usize,
    pub max_base_norm: f32,
}

impl Fixture {
    pub fn new(
        metric: Metric,
        vectors: Vec<Vec<f32>>,
        adjacency: Vec<Vec<u32>>,
        medoid: u32,
    ) -> Self {
        assert!(vectors.len() <= NUM_PQ_CENTROIDS, "identity PQ needs N <= 256");
        assert_eq!(vectors.len(), adjacency.len());
        let max_degree = adjacency.iter().map(Vec::len).max().unwrap().max(1);
        let (prepared, max_base_norm) = prepare(metric, &vectors);
        Self {
            metric,
            raw: vectors,
            prepared,
            adjacency,
            medoid,
            max_degree,
            max_base_norm,
        }
    }

    /// Dimensionality after the metric transform (`d + 1` for inner product).
    pub fn dim(&self) -> usize {
        self.prepared[0].len()
    }

    pub fn num_points(&self) -> usize {
        self.prepared.len()
    }

    /// Write the packed-layout index family under `prefix`.
    pub fn write(&self, prefix: &str) {
        self.write_index_file(&format!("{prefix}_disk.index"), Some(&self.adjacency));
        self.write_pq(prefix);
        if self.metric == Metric::InnerProduct {
            write_bin_f32(
                Path::new(&format!("{prefix}_disk.index_max_base_norm.bin")),
                1,
                1,
                &[self.max_base_norm],
            );
        }
    }

    /// Write the partitioned layout: the primary file keeps coordinates but
    /// zeroed adjacency, and the real adjacency goes to the graph file.
    pub fn write_partitioned(&self, prefix: &str, part_prefix: &str, partitions: &[Vec<u32>]) {
        self.write_index_file(&format!("{prefix}_disk.index"), None);
        self.write_pq(prefix);
        if self.metric == Metric::InnerProduct {
            write_bin_f32(
                Path::new(&format!("{prefix}_disk.index_max_base_norm.bin")),
                1,
                1,
                &[self.max_base_norm],
            );
        }
        // the engine needs an explicit medoid entry for partitioned opens
        write_bin_u32(
            Path::new(&format!("{prefix}_disk.index_medoids.bin")),
            1,
            1,
            &[self.medoid],
        );

        let dim = self.dim();
        let max_node_len = dim * 4 + 4 + self.max_degree * 4;
        let graph_node_len = 4 + self.max_degree * 4;

        // graph file: meta sector then one sector per partition
        let graph_path = format!("{part_prefix}_disk_graph.index");
        let mut f = File::create(&graph_path).unwrap();
        let mut sector0 = vec![0u8; SECTOR_LEN];
        sector0[0..4].copy_from_slice(&9u32.to_le_bytes());
        sector0[4..8].copy_from_slice(&1u32.to_le_bytes());
        let meta = [
            self.num_points() as u64,
            dim as u64,
            0,
            max_node_len as u64,
            0,
            0,
            0,
            0,
            ((partitions.len() + 1) * SECTOR_LEN) as u64,
        ];
        for (i, m) in meta.iter().enumerate() {
            sector0[8 + i * 8..16 + i * 8].copy_from_slice(&m.to_le_bytes());
        }
        f.write_all(&sector0).unwrap();
        for part in partitions {
            let mut sector = vec![0u8; SECTOR_LEN];
            for (j, &id) in part.iter().enumerate() {
                let off = j * graph_node_len;
                let nbrs = &self.adjacency[id as usize];
                sector[off..off + 4].copy_from_slice(&(nbrs.len() as u32).to_le_bytes());
                for (m, &nbr) in nbrs.iter().enumerate() {
                    sector[off + 4 + m * 4..off + 8 + m * 4]
                        .copy_from_slice(&nbr.to_le_bytes());
                }
            }
            f.write_all(&sector).unwrap();
        }

        // partition table
        let part_path = format!("{part_prefix}_partition.bin");
        let mut f = File::create(&part_path).unwrap();
        f.write_all(&64u64.to_le_bytes()).unwrap();
        f.write_all(&(partitions.len() as u64).to_le_bytes()).unwrap();
        f.write_all(&(self.num_points() as u64).to_le_bytes())
            .unwrap();
        let mut id2p = vec![0u32; self.num_points()];
        for (p, part) in partitions.iter().enumerate() {
            f.write_all(&(part.len() as u32).to_le_bytes()).unwrap();
            for &id in part {
                f.write_all(&id.to_le_bytes()).unwrap();
                id2p[id as usize] = p as u32;
            }
        }
        for p in id2p {
            f.write_all(&p.to_le_bytes()).unwrap();
        }
    }

    fn write_index_file(&self, path: &str, adjacency: Option<&[Vec<u32>]>) {
        let dim = self.dim();
        let n = self.num_points();
        let dbpp = dim * 4;
        let max_node_len = dbpp + 4 + self.max_degree * 4;
        let nnodes_per_sector = SECTOR_LEN / max_node_len;
        assert!(nnodes_per_sector >= 1, "fixture nodes must pack into sectors");

        let mut f = File::create(path).unwrap();
        let mut sector0 = vec![0u8; SECTOR_LEN];
        sector0[0..4].copy_from_slice(&8u32.to_le_bytes());
        sector0[4..8].copy_from_slice(&1u32.to_le_bytes());
        let fields = [
            n as u64,
            dim as u64,
            self.medoid as u64,
            max_node_len as u64,
            nnodes_per_sector as u64,
            0,
            0,
            0,
        ];
        for (i, v) in fields.iter().enumerate() {
            sector0[8 + i * 8..16 + i * 8].copy_from_slice(&v.to_le_bytes());
        }
        f.write_all(&sector0).unwrap();

        let mut id = 0usize;
        while id < n {
            let mut sector = vec![0u8; SECTOR_LEN];
            for j in 0..nnodes_per_sector {
                if id >= n {
                    break;
                }
                let off = j * max_node_len;
                for (d, &v) in self.prepared[id].iter().enumerate() {
                    sector[off + d * 4..off + d * 4 + 4].copy_from_slice(&v.to_le_bytes());
                }
                let nbrs: &[u32] = match adjacency {
                    Some(adj) => &adj[id],
                    None => &[],
                };
                sector[off + dbpp..off + dbpp + 4]
                    .copy_from_slice(&(nbrs.len() as u32).to_le_bytes());
                for (m, &nbr) in nbrs.iter().enumerate() {
                    sector[off + dbpp + 4 + m * 4..off + dbpp + 8 + m * 4]
                        .copy_from_slice(&nbr.to_le_bytes());
                }
                id += 1;
            }
            f.write_all(&sector).unwrap();
        }
    }

    fn write_pq(&self, prefix: &str) {
        let dim = self.dim();
        let n = self.num_points();

        let mut f = File::create(format!("{prefix}_pq_pivots.bin")).unwrap();
        f.write_all(&(NUM_PQ_CENTROIDS as u32).to_le_bytes()).unwrap();
        f.write_all(&(dim as u32).to_le_bytes()).unwrap();
        f.write_all(&1u32.to_le_bytes()).unwrap();
        f.write_all(&0u32.to_le_bytes()).unwrap();
        for _ in 0..dim {
            f.write_all(&0f32.to_le_bytes()).unwrap();
        }
        f.write_all(&0u32.to_le_bytes()).unwrap();
        f.write_all(&(dim as u32).to_le_bytes()).unwrap();
        for c in 0..NUM_PQ_CENTROIDS {
            if c < n {
                for &v in &self.prepared[c] {
                    f.write_all(&v.to_le_bytes()).unwrap();
                }
            } else {
                for _ in 0..dim {
                    f.write_all(&0f32.to_le_bytes()).unwrap();
                }
            }
        }

        let mut f = File::create(format!("{prefix}_pq_compressed.bin")).unwrap();
        f.write_all(&(n as u32).to_le_bytes()).unwrap();
        f.write_all(&1u32.to_le_bytes()).unwrap();
        let codes: Vec<u8> = (0..n as u8).collect();
        f.write_all(&codes).unwrap();
    }

    /// Exact nearest neighbors in the prepared (search) space.
    pub fn brute_force(&self, query: &[f32], k: usize) -> Vec<u32> {
        let prepared_query = self.prepare_query(query);
        let mut scored: Vec<(u32, f32)> = self
            .prepared
            .iter()
            .enumerate()
            .map(|(i, v)| (i as u32, l2_sq(&prepared_query, v)))
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));
        scored.into_iter().take(k).map(|(id, _)| id).collect()
    }

    /// Mirror the engine's query-side transform.
    pub fn prepare_query(&self, query: &[f32]) -> Vec<f32> {
        match self.metric {
            Metric::L2 => query.to_vec(),
            Metric::Cosine => {
                let n = query.iter().map(|v| v * v).sum::<f32>().sqrt();
                query.iter().map(|v| v / n).collect()
            }
            Metric::InnerProduct => {
                let n = query.iter().map(|v| v * v).sum::<f32>().sqrt();
                let mut out: Vec<f32> = query.iter().map(|v| v / n).collect();
                out.push(0.0);
                out
            }
        }
    }
}

fn prepare(metric: Metric, vectors: &[Vec<f32>]) -> (Vec<Vec<f32>>, f32) {
    match metric {
        Metric::L2 => (vectors.to_vec(), 0.0),
        Metric::Cosine => (
            vectors
                .iter()
                .map(|v| {
                    let n = v.iter().map(|x| x * x).sum::<f32>().sqrt();
                    v.iter().map(|x| x / n).collect()
                })
                .collect(),
            0.0,
        ),
        Metric::InnerProduct => {
            let max_norm = vectors
                .iter()
                .map(|v| v.iter().map(|x| x * x).sum::<f32>().sqrt())
                .fold(0.0f32, f32::max);
            let prepared = vectors
                .iter()
                .map(|v| {
                    let norm_sq: f32 = v.iter().map(|x| x * x).sum();
                    let mut out: Vec<f32> = v.iter().map(|x| x / max_norm).collect();
                    let tail = (1.0 - norm_sq / (max_norm * max_norm)).max(0.0).sqrt();
                    out.push(tail);
                    out
                })
                .collect();
            (prepared, max_norm)
        }
    }
}

pub fn l2_sq(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// A ring graph with `extra` forward chords per node; strongly connected.
pub fn ring_graph(n: usize, extra: usize) -> Vec<Vec<u32>> {
    (0..n)
        .map(|i| {
            let mut nbrs = vec![((i + 1) % n) as u32, ((i + n - 1) % n) as u32];
            for e in 2..2 + extra {
                nbrs.push(((i + e) % n) as u32);
            }
            nbrs.sort_unstable();
            nbrs.dedup();
            nbrs.retain(|&x| x != i as u32);
            nbrs
        })
        .collect()
}

pub fn write_bin_u32(path: &Path, rows: usize, cols: usize, vals: &[u32]) {
    let mut f = File::create(path).unwrap();
    f.write_all(&(rows as u32).to_le_bytes()).unwrap();
    f.write_all(&(cols as u32).to_le_bytes()).unwrap();
    for v in vals {
        f.write_all(&v.to_le_bytes()).unwrap();
    }
}

pub fn write_bin_f32(path: &Path, rows: usize, cols: usize, vals: &[f32]) {
    let mut f = File::create(path).unwrap();
    f.write_all(&(rows as u32).to_le_bytes()).unwrap();
    f.write_all(&(cols as u32).to_le_bytes()).unwrap();
    for v in vals {
        f.write_all(&v.to_le_bytes()).unwrap();
    }
}

/// Write the label file family for a filtered index.
pub fn write_label_files(
    prefix: &str,
    labels_per_point: &[Vec<u32>],
    name_map: &[(&str, u32)],
    label_medoids: &[(u32, Vec<u32>)],
    universal: Option<u32>,
) {
    let base = format!("{prefix}_disk.index");
    let mut body = String::new();
    for labels in labels_per_point {
        let line: Vec<String> = labels.iter().map(u32::to_string).collect();
        body.push_str(&line.join(","));
        body.push('\n');
    }
    std::fs::write(format!("{base}_labels.txt"), body).unwrap();

    let mut map_body = String::new();
    for (name, id) in name_map {
        map_body.push_str(&format!("{name}\t{id}\n"));
    }
    std::fs::write(format!("{base}_labels_map.txt"), map_body).unwrap();

    let mut med_body = String::new();
    for (label, medoids) in label_medoids {
        let ids: Vec<String> = medoids.iter().map(u32::to_string).collect();
        med_body.push_str(&format!("{label},{}\n", ids.join(",")));
    }
    std::fs::write(format!("{base}_labels_to_medoids.txt"), med_body).unwrap();

    if let Some(u) = universal {
        std::fs::write(format!("{base}_universal_label.txt"), format!("{u}\n")).unwrap();
    }
}

/// Serve embeddings for the given vectors over the crate's request/reply
/// protocol. Returns the bound port; the server thread lives until the test
/// process exits.
pub fn spawn_embedding_server(vectors: Vec<Vec<f32>>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            let vectors = vectors.clone();
            std::thread::spawn(move || loop {
                let Ok(body) = read_frame(&mut stream) else { break };
                let Ok(req) = NodeEmbeddingRequest::decode(body.as_slice()) else {
                    break;
                };
                let dim = vectors[0].len();
                let mut data = Vec::with_capacity(req.node_ids.len() * dim * 4);
                for &id in &req.node_ids {
                    for &v in &vectors[id as usize] {
                        data.extend_from_slice(&v.to_le_bytes());
                    }
                }
                let resp = NodeEmbeddingResponse {
                    embeddings_data: data,
                    dimensions: vec![req.node_ids.len() as i32, dim as i32],
                    missing_ids: Vec::new(),
                };
                if write_frame(&mut stream, &resp.encode_to_vec()).is_err() {
                    break;
                }
            });
        }
    });
    port
}
