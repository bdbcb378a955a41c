//! The disk index handle: loading, caching, and the public search surface.
//!
//! [`DiskIndex::open`] reads every auxiliary file under the index prefix,
//! validates the on-disk metadata, sizes the scratch pool, and optionally
//! warms the node cache. After that the handle is immutable and shared;
//! queries run concurrently through [`DiskIndex::search`] and friends, each
//! borrowing one scratch slot.
//!
//! File family under `<index_prefix>`:
//!
//! * `<prefix>_disk.index`: header sector + node records (+ reorder region)
//! * `<pq_prefix>_pq_pivots.bin`, `<pq_prefix>_pq_compressed.bin`
//! * `<prefix>_disk.index_pq_pivots.bin`: present iff coords on disk are PQ
//! * `<prefix>_disk.index_medoids.bin`, `..._centroids.bin`,
//!   `..._max_base_norm.bin`
//! * `..._labels.txt`, `..._labels_map.txt`, `..._labels_to_medoids.txt`,
//!   `..._universal_label.txt`, `..._dummy_map.txt`
//! * `<part_prefix>_disk_graph.index`, `<part_prefix>_partition.bin`

mod search;

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::{CachedNode, NodeCache};
use crate::defaults::{round_up, MAX_N_SECTOR_READS, SECTOR_LEN};
use crate::distance::{Element, Metric};
use crate::error::{Result, SearchError};
use crate::io::{AlignedRead, AlignedReader, DirectFileReader, SectorArena};
use crate::labels::LabelSet;
use crate::layout::DiskLayout;
use crate::partition::{GraphFileMeta, PartitionTable};
use crate::pq::{FixedChunkPqTable, PqCodes};
use crate::scratch::{ScratchPool, SearchScratch};
use crate::stats::QueryStats;

/// How to populate the node cache at open.
#[derive(Debug, Clone, Default)]
pub enum CacheWarmup {
    /// Leave the cache empty.
    #[default]
    None,
    /// Breadth-first expansion from the medoids, capped at 10% of the index.
    Bfs { num_nodes: usize, shuffle: bool },
    /// Run searches over a sample query file with visit counting and keep
    /// the most-visited ids.
    Sample {
        sample_file: PathBuf,
        num_nodes: usize,
        l_search: u32,
        beam_width: u32,
    },
}

/// Parameters for [`DiskIndex::open`].
#[derive(Debug, Clone)]
pub struct OpenParams {
    pub metric: Metric,
    /// Prefix of the index file family, e.g. `/data/wiki` for
    /// `/data/wiki_disk.index`.
    pub index_prefix: String,
    /// Prefix of the PQ pivot/compressed files; defaults to `index_prefix`.
    pub pq_prefix: Option<String>,
    /// Enables the partitioned graph layout when set.
    pub partition_prefix: Option<String>,
    /// Scratch pool capacity; also the maximum query concurrency.
    pub num_threads: usize,
    pub cache: CacheWarmup,
    /// Port of the embedding service on localhost.
    pub embedding_port: u16,
}

impl Default for OpenParams {
    fn default() -> Self {
        Self {
            metric: Metric::L2,
            index_prefix: String::new(),
            pq_prefix: None,
            partition_prefix: None,
            num_threads: 1,
            cache: CacheWarmup::None,
            embedding_port: 0,
        }
    }
}

/// Per-query knobs. The four classic entry points (plain, filtered,
/// io-limited, both) collapse into one options record.
#[derive(Debug, Clone, Serialize)]
pub struct SearchOptions {
    /// Restrict results to points carrying this label id.
    pub filter: Option<u32>,
    /// Stop traversal after this many read requests.
    pub io_limit: u32,
    /// Rescore the top `3k` from the full-precision reorder region.
    pub use_reorder: bool,
    /// Traverse on PQ only and repair every distance in one fetch afterward.
    pub deferred_fetch: bool,
    /// Use the PQ estimate as the committed distance for expanded nodes.
    pub skip_search_reorder: bool,
    /// Score neighbors from freshly fetched embeddings instead of PQ.
    pub recompute_neighbors: bool,
    /// Memoize recomputed distances per query.
    pub dedup_cache: bool,
    /// Fraction of each neighbor list to drop before scoring (0 disables).
    pub prune_ratio: f32,
    /// Defer exact neighbor scoring to one fetch per beam iteration.
    pub batch_recompute: bool,
    /// Prune against a query-global pool of scored neighbors instead of
    /// per-list. The pool is never trimmed during the query, so its memory
    /// footprint grows with every scored neighbor.
    pub global_pruning: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            filter: None,
            io_limit: u32::MAX,
            use_reorder: false,
            deferred_fetch: false,
            skip_search_reorder: false,
            recompute_neighbors: false,
            dedup_cache: false,
            prune_ratio: 0.0,
            batch_recompute: false,
            global_pruning: false,
        }
    }
}

/// Expanding-L schedule knobs for [`DiskIndex::range_search`].
#[derive(Debug, Clone)]
pub struct RangeSearchParams {
    pub min_l: u32,
    pub max_l: u32,
    pub min_beam_width: u32,
    /// Stop expanding once fewer than this fraction of L qualifies.
    pub early_stop_fraction: f32,
}

impl Default for RangeSearchParams {
    fn default() -> Self {
        Self {
            min_l: 16,
            max_l: 1024,
            min_beam_width: 2,
            early_stop_fraction: 0.5,
        }
    }
}

/// State of the optional split graph file.
pub(crate) struct GraphState {
    pub reader: DirectFileReader,
    pub meta: GraphFileMeta,
    pub table: PartitionTable,
}

/// Coordinates and adjacency fetched for one node by [`DiskIndex::read_nodes`].
pub(crate) struct NodeData<T> {
    pub coords: Vec<T>,
    pub coord_bytes: Vec<u8>,
    pub neighbors: Vec<u32>,
}

/// A loaded, read-only disk index.
pub struct DiskIndex<T: Element> {
    pub(crate) metric: Metric,
    pub(crate) reader: DirectFileReader,
    pub(crate) graph: Option<GraphState>,
    pub(crate) layout: DiskLayout,
    pub(crate) pq_table: FixedChunkPqTable,
    pub(crate) pq_codes: PqCodes,
    /// Present when the on-disk coordinates are themselves PQ codes.
    pub(crate) disk_pq: Option<FixedChunkPqTable>,
    pub(crate) num_points: usize,
    pub(crate) data_dim: usize,
    pub(crate) aligned_dim: usize,
    pub(crate) medoids: Vec<u32>,
    /// One aligned float vector per medoid, the search seeds.
    pub(crate) centroid_data: Vec<f32>,
    pub(crate) max_base_norm: f32,
    pub(crate) cache: NodeCache<T>,
    pub(crate) labels: Option<LabelSet>,
    pub(crate) scratch: ScratchPool<T>,
    /// Per-id visit counters, populated only during sample-driven warmup.
    pub(crate) visit_counter: RwLock<Option<Vec<AtomicU32>>>,
}

impl<T: Element> std::fmt::Debug for DiskIndex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskIndex")
            .field("num_points", &self.num_points)
            .field("data_dim", &self.data_dim)
            .field("aligned_dim", &self.aligned_dim)
            .finish_non_exhaustive()
    }
}

impl<T: Element> DiskIndex<T> {
    /// Load an index and return a shareable handle.
    pub fn open(params: OpenParams) -> Result<Self> {
        let index_file = format!("{}_disk.index", params.index_prefix);
        let pq_prefix = params
            .pq_prefix
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| params.index_prefix.clone());

        // Resident PQ data first: it fixes N, the data dim, and the chunk
        // count that everything else is validated against.
        let pq_codes = PqCodes::load(Path::new(&format!("{pq_prefix}_pq_compressed.bin")))?;
        let pq_table = FixedChunkPqTable::load(
            Path::new(&format!("{pq_prefix}_pq_pivots.bin")),
            Some(pq_codes.n_chunks()),
        )?;
        let num_points = pq_codes.n_points();
        let data_dim = pq_table.dim();
        let aligned_dim = round_up(data_dim, crate::defaults::ALIGNMENT);

        // Disk-PQ: a pivots file under the index file's own name means the
        // on-disk coords are codes, not raw vectors.
        let disk_pq_path = format!("{index_file}_pq_pivots.bin");
        let disk_pq = if Path::new(&disk_pq_path).exists() {
            let table = FixedChunkPqTable::load(Path::new(&disk_pq_path), None)?;
            info!(
                chunks = table.n_chunks(),
                "disk coordinates are PQ-compressed"
            );
            Some(table)
        } else {
            None
        };
        let disk_bytes_per_point = match &disk_pq {
            Some(table) => table.n_chunks(),
            None => data_dim * T::BYTES,
        };

        let labels = Self::load_labels(&index_file, num_points)?;

        // Header sector of the main index file.
        let mut sector0 = vec![0u8; SECTOR_LEN];
        {
            let mut f = File::open(&index_file)?;
            f.read_exact(&mut sector0).map_err(|_| {
                SearchError::CorruptIndex(format!("{index_file}: truncated header sector"))
            })?;
        }
        let layout = DiskLayout::parse(&sector0, disk_bytes_per_point as u64)?;
        if layout.num_points as usize != num_points {
            return Err(SearchError::CorruptIndex(format!(
                "{} declares {} points but compressed data has {}",
                index_file, layout.num_points, num_points
            )));
        }
        if layout.reorder.is_some() && disk_pq.is_none() {
            return Err(SearchError::CorruptIndex(
                "reorder data requires the disk-PQ compression option".into(),
            ));
        }

        let reader = DirectFileReader::open(Path::new(&index_file))?;

        let graph = match params.partition_prefix.as_deref().filter(|p| !p.is_empty()) {
            Some(prefix) => {
                let graph_path = format!("{prefix}_disk_graph.index");
                let graph_reader = DirectFileReader::open(Path::new(&graph_path))?;
                let mut gsector0 = vec![0u8; SECTOR_LEN];
                {
                    let mut f = File::open(&graph_path)?;
                    f.read_exact(&mut gsector0).map_err(|_| {
                        SearchError::CorruptIndex(format!("{graph_path}: truncated header sector"))
                    })?;
                }
                let meta = GraphFileMeta::parse(&gsector0)?;
                let table = PartitionTable::load(Path::new(&format!("{prefix}_partition.bin")))?;
                if table.id2partition.len() != num_points {
                    return Err(SearchError::CorruptIndex(format!(
                        "partition table covers {} ids, index has {}",
                        table.id2partition.len(),
                        num_points
                    )));
                }
                Some(GraphState {
                    reader: graph_reader,
                    meta,
                    table,
                })
            }
            None => None,
        };

        let num_threads = params.num_threads.max(1);
        let slots = (0..num_threads)
            .map(|_| {
                SearchScratch::new(
                    aligned_dim,
                    data_dim,
                    pq_codes.n_chunks(),
                    layout.max_degree as usize,
                    4096,
                    params.embedding_port,
                )
            })
            .collect();

        let mut index = Self {
            metric: params.metric,
            reader,
            graph,
            layout,
            pq_table,
            pq_codes,
            disk_pq,
            num_points,
            data_dim,
            aligned_dim,
            medoids: Vec::new(),
            centroid_data: Vec::new(),
            max_base_norm: 0.0,
            cache: NodeCache::new(),
            labels,
            scratch: ScratchPool::new(slots),
            visit_counter: RwLock::new(None),
        };

        index.load_medoids(&index_file)?;

        let norm_file = format!("{index_file}_max_base_norm.bin");
        if params.metric == Metric::InnerProduct && Path::new(&norm_file).exists() {
            let (_, _, vals) = crate::io::load_bin_f32(Path::new(&norm_file))?;
            index.max_base_norm = vals.first().copied().unwrap_or(0.0);
            info!(norm = index.max_base_norm, "loaded base rescaling factor");
        }

        match &params.cache {
            CacheWarmup::None => {}
            CacheWarmup::Bfs { num_nodes, shuffle } => {
                let ids = index.cache_bfs_levels(*num_nodes, *shuffle)?;
                index.load_cache_list(&ids)?;
            }
            CacheWarmup::Sample {
                sample_file,
                num_nodes,
                l_search,
                beam_width,
            } => {
                let ids = index.cache_list_from_sample_queries(
                    sample_file,
                    *l_search,
                    *beam_width,
                    *num_nodes,
                    num_threads,
                )?;
                index.load_cache_list(&ids)?;
            }
        }

        info!(
            points = index.num_points,
            dim = index.data_dim,
            chunks = index.pq_codes.n_chunks(),
            max_degree = index.layout.max_degree,
            cached = index.cache.len(),
            partitioned = index.graph.is_some(),
            "index loaded"
        );
        Ok(index)
    }

    fn load_labels(index_file: &str, num_points: usize) -> Result<Option<LabelSet>> {
        let labels_file = format!("{index_file}_labels.txt");
        if !Path::new(&labels_file).exists() {
            return Ok(None);
        }
        let mut set = LabelSet::default();
        let pts = set.parse_label_file(Path::new(&labels_file))?;
        if pts != num_points {
            return Err(SearchError::CorruptIndex(format!(
                "{labels_file}: labels cover {pts} points, index has {num_points}"
            )));
        }
        let map_file = format!("{index_file}_labels_map.txt");
        if Path::new(&map_file).exists() {
            set.load_label_map(Path::new(&map_file))?;
        }
        let medoids_file = format!("{index_file}_labels_to_medoids.txt");
        if Path::new(&medoids_file).exists() {
            set.load_filter_medoids(Path::new(&medoids_file))?;
        }
        let univ_file = format!("{index_file}_universal_label.txt");
        if Path::new(&univ_file).exists() {
            set.load_universal_label(Path::new(&univ_file))?;
        }
        let dummy_file = format!("{index_file}_dummy_map.txt");
        if Path::new(&dummy_file).exists() {
            set.load_dummy_map(Path::new(&dummy_file))?;
        }
        Ok(Some(set))
    }

    fn load_medoids(&mut self, index_file: &str) -> Result<()> {
        let medoids_file = format!("{index_file}_medoids.bin");
        let centroids_file = format!("{index_file}_centroids.bin");

        if Path::new(&medoids_file).exists() {
            let (_rows, cols, vals) = crate::io::load_bin_u32(Path::new(&medoids_file))?;
            if cols != 1 {
                return Err(SearchError::CorruptIndex(format!(
                    "{medoids_file}: expected an m x 1 vector of medoid ids"
                )));
            }
            self.medoids = vals;
            if Path::new(&centroids_file).exists() {
                let (rows, cols, vals) = crate::io::load_bin_f32(Path::new(&centroids_file))?;
                if rows != self.medoids.len() || cols != self.data_dim {
                    return Err(SearchError::CorruptIndex(format!(
                        "{centroids_file}: expected {} x {} floats",
                        self.medoids.len(),
                        self.data_dim
                    )));
                }
                self.centroid_data = vec![0.0; rows * self.aligned_dim];
                for m in 0..rows {
                    self.centroid_data[m * self.aligned_dim..m * self.aligned_dim + cols]
                        .copy_from_slice(&vals[m * cols..(m + 1) * cols]);
                }
            } else {
                debug!("no centroid file, reading medoid vectors from disk");
                self.use_medoids_data_as_centroids()?;
            }
        } else {
            self.medoids = vec![self.layout.medoid_id as u32];
            self.use_medoids_data_as_centroids()?;
        }
        Ok(())
    }

    /// Read each medoid's on-disk vector and use it as that medoid's seed
    /// centroid. Under disk-PQ the stored code is inflated to floats.
    fn use_medoids_data_as_centroids(&mut self) -> Result<()> {
        let medoids = self.medoids.clone();
        self.centroid_data = vec![0.0; medoids.len() * self.aligned_dim];
        let nodes = self.read_nodes(&medoids, true, false)?;
        for (m, node) in nodes.into_iter().enumerate() {
            let node = node.ok_or_else(|| {
                SearchError::CorruptIndex(format!("unable to read medoid {}", medoids[m]))
            })?;
            let row = &mut self.centroid_data[m * self.aligned_dim..(m + 1) * self.aligned_dim];
            match &self.disk_pq {
                Some(table) => table.inflate_vector(&node.coord_bytes, &mut row[..self.data_dim]),
                None => {
                    for (dst, src) in row.iter_mut().zip(node.coords.iter()) {
                        *dst = src.to_f32();
                    }
                }
            }
        }
        Ok(())
    }

    /// Fetch coordinates and/or adjacency for a batch of ids, blocked so that
    /// no round exceeds the sector-read budget. One failed node never fails
    /// its siblings; it comes back as `None`.
    pub(crate) fn read_nodes(
        &self,
        ids: &[u32],
        want_coords: bool,
        want_nbrs: bool,
    ) -> Result<Vec<Option<NodeData<T>>>> {
        let spn = self.layout.sectors_per_node();
        let per_block = (MAX_N_SECTOR_READS / spn).max(1);
        let mut out: Vec<Option<NodeData<T>>> = Vec::with_capacity(ids.len());
        let mut arena = SectorArena::new(per_block * spn);

        for block in ids.chunks(per_block) {
            let mut statuses = vec![true; block.len()];

            // coords (and packed-mode adjacency) from the primary file
            {
                let mut reqs = Vec::with_capacity(block.len());
                for (chunk, &id) in arena.chunks_mut(spn).zip(block.iter()) {
                    let offset = self.layout.node_sector(id) * SECTOR_LEN as u64;
                    reqs.push(AlignedRead::new(offset, chunk)?);
                }
                let ok = self.reader.read(&mut reqs);
                for (s, o) in statuses.iter_mut().zip(ok) {
                    *s &= o;
                }
            }

            let mut block_nodes: Vec<Option<NodeData<T>>> = Vec::with_capacity(block.len());
            for (i, &id) in block.iter().enumerate() {
                if !statuses[i] {
                    block_nodes.push(None);
                    continue;
                }
                let record = match self.layout.node_record(arena.chunk(spn, i), id) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(id, error = %e, "bad node record");
                        block_nodes.push(None);
                        continue;
                    }
                };
                let mut data = NodeData {
                    coords: Vec::new(),
                    coord_bytes: Vec::new(),
                    neighbors: Vec::new(),
                };
                if want_coords {
                    data.coord_bytes = record.coord_bytes().to_vec();
                    if self.disk_pq.is_none() {
                        let mut coords = vec![T::default(); self.aligned_dim];
                        record.decode_coords(&mut coords[..self.data_dim]);
                        data.coords = coords;
                    }
                }
                if want_nbrs && self.graph.is_none() {
                    data.neighbors = record.neighbors().collect();
                }
                block_nodes.push(Some(data));
            }

            // adjacency from the graph file, one read per touched partition
            if want_nbrs {
                if let Some(graph) = &self.graph {
                    let mut by_partition: std::collections::HashMap<u32, Vec<usize>> =
                        std::collections::HashMap::new();
                    for (i, &id) in block.iter().enumerate() {
                        if block_nodes[i].is_none() {
                            continue;
                        }
                        match graph.table.locate(id) {
                            Ok((p, _)) => by_partition.entry(p).or_default().push(i),
                            Err(e) => {
                                warn!(id, error = %e, "id missing from partition table");
                                block_nodes[i] = None;
                            }
                        }
                    }
                    let mut sector_arena = SectorArena::new(1);
                    for (p, indices) in by_partition {
                        let offset = graph.meta.partition_sector(p) * SECTOR_LEN as u64;
                        let ok = {
                            let chunk = sector_arena.chunks_mut(1).next().unwrap();
                            let mut reqs = vec![AlignedRead::new(offset, chunk)?];
                            graph.reader.read(&mut reqs)[0]
                        };
                        if !ok {
                            for &i in &indices {
                                block_nodes[i] = None;
                            }
                            continue;
                        }
                        let sector = sector_arena.chunk(1, 0);
                        for &i in &indices {
                            let id = block[i];
                            let (_, j) = graph.table.locate(id)?;
                            match graph.meta.neighbors_in_sector(sector, j) {
                                Ok(nbrs) => {
                                    if let Some(node) = &mut block_nodes[i] {
                                        node.neighbors = nbrs.into_vec();
                                    }
                                }
                                Err(e) => {
                                    warn!(id, error = %e, "bad adjacency record");
                                    block_nodes[i] = None;
                                }
                            }
                        }
                    }
                }
            }

            out.append(&mut block_nodes);
        }
        Ok(out)
    }

    /// BFS from the medoids (and any filter medoids) until the requested
    /// number of distinct ids is reached, capped at 10% of the index.
    pub fn cache_bfs_levels(&self, num_nodes_to_cache: usize, shuffle: bool) -> Result<Vec<u32>> {
        let ten_percent = ((self.num_points as f64 * 0.1).round() as usize).max(1);
        let target = num_nodes_to_cache.min(ten_percent).max(1);
        if num_nodes_to_cache > ten_percent {
            info!(
                requested = num_nodes_to_cache,
                capped = target,
                "reducing nodes to cache to 10% of the index"
            );
        }

        let mut node_set: HashSet<u32> = HashSet::new();
        let mut cur_level: HashSet<u32> = HashSet::new();

        for &m in &self.medoids {
            if cur_level.len() >= target {
                break;
            }
            cur_level.insert(m);
        }
        if let Some(labels) = &self.labels {
            if labels.has_filter_medoids() && cur_level.len() < target {
                'outer: for label_medoids in labels.all_filter_medoids() {
                    for &m in label_medoids {
                        cur_level.insert(m);
                        if cur_level.len() == target {
                            break 'outer;
                        }
                    }
                }
            }
        }

        let mut level = 1u32;
        while node_set.len() + cur_level.len() < target && !cur_level.is_empty() {
            let prev_level = std::mem::take(&mut cur_level);

            let mut to_expand: Vec<u32> = prev_level
                .into_iter()
                .filter(|id| node_set.insert(*id))
                .collect();
            if shuffle {
                to_expand.shuffle(&mut rand::rng());
            } else {
                to_expand.sort_unstable();
            }

            let mut done = false;
            for block in to_expand.chunks(1024) {
                if done {
                    break;
                }
                let nodes = self.read_nodes(block, false, true)?;
                for node in nodes.into_iter().flatten() {
                    for nbr in node.neighbors {
                        if !node_set.contains(&nbr) {
                            cur_level.insert(nbr);
                        }
                        if cur_level.len() + node_set.len() >= target {
                            done = true;
                            break;
                        }
                    }
                    if done {
                        break;
                    }
                }
            }
            debug!(level, frontier = cur_level.len(), total = node_set.len(), "bfs level done");
            level += 1;
        }

        let mut list: Vec<u32> = node_set.into_iter().collect();
        list.extend(cur_level);
        Ok(list)
    }

    /// Run sample queries with visit counting enabled and keep the ids the
    /// traversal touched most. Filtered indexes draw a random label per
    /// sample from the base label distribution.
    pub fn cache_list_from_sample_queries(
        &self,
        sample_file: &Path,
        l_search: u32,
        beam_width: u32,
        num_nodes_to_cache: usize,
        num_threads: usize,
    ) -> Result<Vec<u32>> {
        if num_nodes_to_cache >= self.num_points {
            return Ok((0..self.num_points as u32).collect());
        }
        let (samples, sample_dim) = self.load_sample_bin(sample_file)?;
        let n_samples = samples.len() / sample_dim;

        let filters = match &self.labels {
            Some(labels) if labels.has_filter_medoids() => {
                Some(labels.random_labels(n_samples)?)
            }
            _ => None,
        };

        {
            let mut counters = self.visit_counter.write();
            *counters = Some((0..self.num_points).map(|_| AtomicU32::new(0)).collect());
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .map_err(|e| SearchError::BadArgument(e.to_string()))?;
        pool.install(|| {
            samples
                .par_chunks(sample_dim)
                .enumerate()
                .for_each(|(i, q)| {
                    let opts = SearchOptions {
                        filter: filters.as_ref().map(|f| f[i]),
                        ..Default::default()
                    };
                    if let Err(e) = self.search(q, 1, l_search as usize, beam_width as usize, &opts)
                    {
                        warn!(sample = i, error = %e, "sample query failed during warmup");
                    }
                });
        });

        let counters = self.visit_counter.write().take().unwrap_or_default();
        let mut counted: Vec<(u32, u32)> = counters
            .iter()
            .enumerate()
            .map(|(id, c)| (id as u32, c.load(Ordering::Relaxed)))
            .collect();
        counted.sort_unstable_by(|a, b| b.1.cmp(&a.1));
        Ok(counted
            .into_iter()
            .take(num_nodes_to_cache)
            .map(|(id, _)| id)
            .collect())
    }

    fn load_sample_bin(&self, path: &Path) -> Result<(Vec<T>, usize)> {
        let mut file = File::open(path)?;
        let (rows, cols) = crate::io::read_bin_header(&mut file)?;
        let mut bytes = vec![0u8; rows as usize * cols as usize * T::BYTES];
        file.read_exact(&mut bytes).map_err(|_| {
            SearchError::CorruptIndex(format!("{}: truncated sample data", path.display()))
        })?;
        let mut samples = vec![T::default(); rows as usize * cols as usize];
        T::decode_slice(&bytes, &mut samples);
        Ok((samples, cols as usize))
    }

    /// Read the listed nodes and install them in the warm cache.
    pub fn load_cache_list(&mut self, ids: &[u32]) -> Result<()> {
        info!(nodes = ids.len(), "loading cache list");
        let nodes = self.read_nodes(ids, true, true)?;
        for (&id, node) in ids.iter().zip(nodes) {
            if let Some(node) = node {
                self.cache.insert(
                    id,
                    CachedNode {
                        coords: node.coords.into_boxed_slice(),
                        coord_bytes: node.coord_bytes.into_boxed_slice(),
                        neighbors: node.neighbors.into_boxed_slice(),
                    },
                );
            }
        }
        Ok(())
    }

    /// k nearest neighbors as `(id, distance)` pairs, best first.
    pub fn search(
        &self,
        query: &[T],
        k: usize,
        l: usize,
        beam_width: usize,
        opts: &SearchOptions,
    ) -> Result<Vec<(u32, f32)>> {
        let mut stats = QueryStats::default();
        self.beam_search(query, k, l, beam_width, opts, &mut stats)
    }

    /// [`search`](Self::search) with execution counters.
    pub fn search_with_stats(
        &self,
        query: &[T],
        k: usize,
        l: usize,
        beam_width: usize,
        opts: &SearchOptions,
    ) -> Result<(Vec<(u32, f32)>, QueryStats)> {
        let mut stats = QueryStats::default();
        let hits = self.beam_search(query, k, l, beam_width, opts, &mut stats)?;
        Ok((hits, stats))
    }

    /// Run many queries on a scoped thread pool. `queries` is row-major with
    /// `query_dim` scalars per query.
    pub fn batch_search(
        &self,
        queries: &[T],
        query_dim: usize,
        k: usize,
        l: usize,
        beam_width: usize,
        num_threads: usize,
        opts: &SearchOptions,
    ) -> Result<Vec<Vec<(u32, f32)>>> {
        if query_dim == 0 || queries.len() % query_dim != 0 {
            return Err(SearchError::BadArgument(format!(
                "query buffer of {} scalars is not a multiple of dim {}",
                queries.len(),
                query_dim
            )));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads.max(1))
            .build()
            .map_err(|e| SearchError::BadArgument(e.to_string()))?;
        pool.install(|| {
            queries
                .par_chunks(query_dim)
                .map(|q| self.search(q, k, l, beam_width, opts))
                .collect()
        })
    }

    /// All results within `range`, found by doubling L until the hit density
    /// falls below `early_stop_fraction` or `max_l` is passed.
    pub fn range_search(
        &self,
        query: &[T],
        range: f32,
        params: &RangeSearchParams,
    ) -> Result<Vec<(u32, f32)>> {
        let mut l = params.min_l.max(1);
        let mut hits;
        loop {
            let beam = (l / 5)
                .max(params.min_beam_width)
                .min(100)
                .max(1) as usize;
            let results = self.search(query, l as usize, l as usize, beam, &SearchOptions::default())?;
            let res_count = results
                .iter()
                .position(|&(_, d)| d > range)
                .unwrap_or(results.len());
            hits = results.into_iter().take(res_count).collect();
            if (res_count as f32) < params.early_stop_fraction * l as f32 {
                break;
            }
            l *= 2;
            if l > params.max_l {
                break;
            }
        }
        Ok(hits)
    }

    /// Resolve a user-facing label string to the id used by
    /// [`SearchOptions::filter`].
    pub fn resolve_label(&self, name: &str) -> Result<u32> {
        match &self.labels {
            Some(labels) => labels.resolve(name),
            None => Err(SearchError::UnknownLabel(name.to_string())),
        }
    }

    /// Number of points in the index.
    pub fn num_points(&self) -> usize {
        self.num_points
    }

    /// Dimensionality of the base vectors.
    pub fn data_dim(&self) -> usize {
        self.data_dim
    }

    /// Metric the index was opened with.
    pub fn metric(&self) -> Metric {
        self.metric
    }

    /// The resident PQ code of one point.
    pub fn get_pq_vector(&self, id: u32) -> Vec<u8> {
        self.pq_codes.get(id).to_vec()
    }
}
