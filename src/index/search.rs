//! The beam search core.
//!
//! One routine serves every entry point: plain, filtered, io-limited, and the
//! recompute/deferred variants, switched by [`SearchOptions`]. Traversal is
//! best-first over the candidate queue; each iteration picks up to
//! `beam_width` unexpanded nodes, splits them into cache hits and frontier
//! nodes needing I/O, issues all frontier sector reads as one batch, then
//! scores coordinates and expands neighbor lists while committing real
//! distances into the full return set.
//!
//! In global-pruning mode every PQ-scored neighbor is pushed into a per-query
//! pool that is never trimmed until the query ends, so its footprint grows
//! with the number of scored neighbors. The pool lives on this call's stack
//! and is freed with it.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::time::Instant;

use tracing::warn;

use super::{DiskIndex, SearchOptions};
use crate::defaults::{FP_RERANK_MULTIPLIER, MAX_N_SECTOR_READS, SECTOR_LEN};
use crate::distance::{l2_sq, l2_sq_elems, Element, Metric};
use crate::embedding::{preprocess_fetched, EmbeddingClient};
use crate::error::{Result, SearchError};
use crate::io::{AlignedRead, AlignedReader};
use crate::labels::LabelSet;
use crate::pq::pq_dist_lookup;
use crate::scratch::{CandidateQueue, Scored};
use crate::stats::QueryStats;

/// Entry of the global-pruning pool, ordered ascending by distance.
#[derive(PartialEq)]
struct PoolEntry {
    dist: f32,
    id: u32,
}

impl Eq for PoolEntry {}

impl Ord for PoolEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.dist
            .total_cmp(&other.dist)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for PoolEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

type GlobalPool = BinaryHeap<Reverse<PoolEntry>>;

/// Read-only context the scoring paths share.
struct Scorer<'a, T: Element> {
    index: &'a DiskIndex<T>,
    opts: &'a SearchOptions,
    chunk_dists: &'a [f32],
    aligned_query: &'a [T],
}

impl<T: Element> Scorer<'_, T> {
    /// PQ-estimate distances for a batch of ids.
    fn pq(&self, ids: &[u32], gather: &mut Vec<u8>, out: &mut Vec<f32>) {
        let nc = self.index.pq_codes.n_chunks();
        gather.resize(ids.len() * nc, 0);
        out.resize(ids.len(), 0.0);
        self.index.pq_codes.gather(ids, gather);
        pq_dist_lookup(gather, ids.len(), nc, self.chunk_dists, out);
    }

    /// Score ids the way the options ask: PQ lookup, or exact distances from
    /// freshly fetched embeddings with an optional per-query memo. A failed
    /// fetch degrades the whole batch to PQ estimates.
    #[allow(clippy::too_many_arguments)]
    fn score(
        &self,
        ids: &[u32],
        gather: &mut Vec<u8>,
        coord_buf: &mut [T],
        memo: &mut HashMap<u32, f32>,
        embedding: &mut EmbeddingClient,
        out: &mut Vec<f32>,
        stats: &mut QueryStats,
    ) {
        if !self.opts.recompute_neighbors {
            self.pq(ids, gather, out);
            return;
        }

        out.resize(ids.len(), 0.0);
        stats.recompute_requests += ids.len() as u64;

        // two-pass split: serve memo hits, fetch only the rest, merge back
        // preserving request order
        let mut fetch_ids: Vec<u32> = Vec::new();
        let mut fetch_pos: Vec<usize> = Vec::new();
        if self.opts.dedup_cache {
            for (i, &id) in ids.iter().enumerate() {
                match memo.get(&id) {
                    Some(&d) => {
                        out[i] = d;
                        stats.recompute_memo_hits += 1;
                    }
                    None => {
                        fetch_ids.push(id);
                        fetch_pos.push(i);
                    }
                }
            }
            if fetch_ids.is_empty() {
                return;
            }
        } else {
            fetch_ids.extend_from_slice(ids);
            fetch_pos.extend(0..ids.len());
        }

        match embedding.fetch(&fetch_ids) {
            Ok(mut embs) => {
                preprocess_fetched(
                    &mut embs,
                    self.index.metric,
                    self.index.max_base_norm,
                    self.index.data_dim,
                );
                for (j, &pos) in fetch_pos.iter().enumerate() {
                    let emb = &mut embs[j];
                    emb.resize(self.index.aligned_dim, 0.0);
                    for (dst, src) in coord_buf.iter_mut().zip(emb.iter()) {
                        *dst = T::from_f32(*src);
                    }
                    let d = l2_sq_elems(self.aligned_query, coord_buf);
                    out[pos] = d;
                    if self.opts.dedup_cache {
                        memo.insert(fetch_ids[j], d);
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, batch = fetch_ids.len(), "embedding fetch failed, using PQ distances");
                self.pq(ids, gather, out);
            }
        }
    }

    /// Score one id through the mode-dependent path.
    #[allow(clippy::too_many_arguments)]
    fn score_one(
        &self,
        id: u32,
        gather: &mut Vec<u8>,
        coord_buf: &mut [T],
        memo: &mut HashMap<u32, f32>,
        embedding: &mut EmbeddingClient,
        scratch_out: &mut Vec<f32>,
        stats: &mut QueryStats,
    ) -> f32 {
        self.score(&[id], gather, coord_buf, memo, embedding, scratch_out, stats);
        scratch_out[0]
    }
}

/// Drop unpromising neighbors before expensive scoring. Only meaningful in
/// recompute mode; lists of ten or fewer are left alone.
fn prune_list<T: Element>(
    scorer: &Scorer<'_, T>,
    work: &mut Vec<u32>,
    gather: &mut Vec<u8>,
    pq_dists: &mut Vec<f32>,
    pool: &mut GlobalPool,
    visited: &HashSet<u32>,
) {
    let opts = scorer.opts;
    if !opts.recompute_neighbors || opts.prune_ratio <= 0.0 || work.len() <= 10 {
        return;
    }
    let retain = 1.0 - opts.prune_ratio;
    scorer.pq(work, gather, pq_dists);

    if opts.global_pruning {
        for (&id, &d) in work.iter().zip(pq_dists.iter()) {
            pool.push(Reverse(PoolEntry { dist: d, id }));
        }
        let take = (retain * pool.len() as f32) as usize;
        let mut rollback = Vec::with_capacity(take);
        let mut promising = Vec::new();
        for _ in 0..take {
            let Some(Reverse(entry)) = pool.pop() else {
                break;
            };
            if !visited.contains(&entry.id) {
                promising.push(entry.id);
            }
            rollback.push(entry);
        }
        for entry in rollback {
            pool.push(Reverse(entry));
        }
        *work = promising;
        return;
    }

    let mut scored: Vec<(u32, f32)> = work
        .iter()
        .copied()
        .zip(pq_dists.iter().copied())
        .collect();
    scored.sort_unstable_by(|a, b| a.1.total_cmp(&b.1));
    let keep = ((work.len() as f32 * retain) as usize).max(10);
    if keep < work.len() {
        work.clear();
        work.extend(scored.into_iter().take(keep).map(|(id, _)| id));
    }
}

/// Fold scored neighbors into the frontier, honoring the visited set, the
/// dummy suppression rule, and the label filter.
fn accept_neighbors(
    ids: &[u32],
    dists: &[f32],
    num_points: usize,
    labels: Option<&LabelSet>,
    filter: Option<u32>,
    visited: &mut HashSet<u32>,
    candidates: &mut CandidateQueue,
) {
    for (&id, &dist) in ids.iter().zip(dists.iter()) {
        if !visited.insert(id) {
            continue;
        }
        if id as usize >= num_points {
            debug_assert!(false, "graph references id {} beyond N", id);
            continue;
        }
        match filter {
            None => {
                if labels.is_some_and(|l| l.is_dummy(id)) {
                    continue;
                }
            }
            Some(label) => {
                if !labels.is_some_and(|l| l.accepts(id, label)) {
                    continue;
                }
            }
        }
        candidates.insert(id, dist);
    }
}

impl<T: Element> DiskIndex<T> {
    pub(super) fn beam_search(
        &self,
        query: &[T],
        k: usize,
        l: usize,
        beam_width: usize,
        opts: &SearchOptions,
        stats: &mut QueryStats,
    ) -> Result<Vec<(u32, f32)>> {
        let query_timer = Instant::now();

        if k == 0 || l < k {
            return Err(SearchError::BadArgument(format!(
                "need 0 < k <= l, got k={k} l={l}"
            )));
        }
        let spn = self.layout.sectors_per_node();
        // the partitioned layout takes a second arena chunk per node for the
        // adjacency sector
        let lanes = if self.graph.is_some() { 2 * spn } else { spn };
        if beam_width == 0 || beam_width * lanes > MAX_N_SECTOR_READS {
            return Err(SearchError::BadArgument(format!(
                "beam width {beam_width} exceeds the {MAX_N_SECTOR_READS}-sector read budget"
            )));
        }
        if opts.use_reorder && self.layout.reorder.is_none() {
            return Err(SearchError::BadArgument(
                "reorder data was requested but the index has none".into(),
            ));
        }
        if opts.filter.is_some() && self.labels.is_none() {
            return Err(SearchError::UnknownLabel(
                "index has no label data".into(),
            ));
        }

        let mut guard = self.scratch.acquire();
        let scratch = &mut *guard;
        scratch.reset();
        scratch.candidates.reserve(l);

        let crate::scratch::SearchScratch {
            aligned_query,
            query_float,
            rotated_query,
            chunk_dists,
            neighbor_dists,
            code_gather,
            coord_buf,
            sectors,
            candidates,
            visited,
            full_results,
            distance_memo,
            embedding,
        } = scratch;

        // Stage the query. Cosine normalizes all dims; inner product
        // normalizes the first d-1 and zeroes the extra build-time
        // coordinate; L2 copies.
        let inherent_dim = match self.metric {
            Metric::InnerProduct => self.data_dim - 1,
            _ => self.data_dim,
        };
        if query.len() < inherent_dim {
            return Err(SearchError::BadArgument(format!(
                "query has {} dims, index needs {}",
                query.len(),
                inherent_dim
            )));
        }
        aligned_query.fill(T::default());
        let mut query_norm = 0.0f32;
        match self.metric {
            Metric::L2 => {
                aligned_query[..self.data_dim].copy_from_slice(&query[..self.data_dim]);
            }
            _ => {
                for i in 0..inherent_dim {
                    let v = query[i].to_f32();
                    query_norm += v * v;
                }
                query_norm = query_norm.sqrt();
                let inv = if query_norm > 0.0 { 1.0 / query_norm } else { 1.0 };
                for i in 0..inherent_dim {
                    aligned_query[i] = T::from_f32(query[i].to_f32() * inv);
                }
            }
        }
        for (dst, src) in query_float.iter_mut().zip(aligned_query.iter()) {
            *dst = src.to_f32();
        }

        // Query-conditioned PQ tables; read-only below this point.
        self.pq_table
            .preprocess_query(&query_float[..self.data_dim], rotated_query);
        self.pq_table
            .populate_chunk_distances(rotated_query, chunk_dists);
        let chunk_dists: &[f32] = chunk_dists;
        let aligned_query: &[T] = aligned_query;

        let scorer = Scorer {
            index: self,
            opts,
            chunk_dists,
            aligned_query,
        };

        // Seed: nearest medoid by exact centroid distance, or for filtered
        // queries the best filter medoid by PQ estimate (no global centroid
        // data exists per label).
        let seed = match opts.filter {
            None => {
                let mut best = (0u32, f32::MAX);
                for (m, &id) in self.medoids.iter().enumerate() {
                    let row =
                        &self.centroid_data[m * self.aligned_dim..(m + 1) * self.aligned_dim];
                    let d = l2_sq(&query_float[..self.aligned_dim], row);
                    if d < best.1 {
                        best = (id, d);
                    }
                }
                best.0
            }
            Some(label) => {
                let labels = self.labels.as_ref().unwrap();
                let medoid_ids = labels.medoids_for(label).ok_or_else(|| {
                    SearchError::UnknownLabel(format!("no seed medoids for label {label}"))
                })?;
                let mut best = (0u32, f32::MAX);
                for &id in medoid_ids {
                    scorer.pq(&[id], code_gather, neighbor_dists);
                    if neighbor_dists[0] < best.1 {
                        best = (id, neighbor_dists[0]);
                    }
                }
                best.0
            }
        };
        let seed_dist = scorer.score_one(
            seed,
            code_gather,
            coord_buf,
            distance_memo,
            embedding,
            neighbor_dists,
            stats,
        );
        candidates.insert(seed, seed_dist);
        visited.insert(seed);

        let counters = self.visit_counter.read();

        let mut frontier: Vec<u32> = Vec::with_capacity(2 * beam_width);
        let mut cached_ids: Vec<u32> = Vec::with_capacity(2 * beam_width);
        let mut frontier_ok: Vec<bool> = Vec::new();
        let mut batched_ids: Vec<u32> = Vec::new();
        let mut work: Vec<u32> = Vec::new();
        let mut nbr_buf: Vec<u32> = Vec::new();
        let mut prune_dists: Vec<f32> = Vec::new();
        let mut pool: GlobalPool = GlobalPool::new();
        let mut num_ios: u32 = 0;

        while candidates.has_unexpanded() && num_ios < opts.io_limit {
            frontier.clear();
            cached_ids.clear();
            batched_ids.clear();

            // pick the beam, splitting cache hits from nodes needing I/O
            let mut num_seen = 0;
            while candidates.has_unexpanded()
                && frontier.len() < beam_width
                && num_seen < beam_width
            {
                let c = candidates.closest_unexpanded();
                num_seen += 1;
                if self.cache.contains(c.id) {
                    cached_ids.push(c.id);
                    stats.n_cache_hits += 1;
                } else {
                    frontier.push(c.id);
                }
                if let Some(counters) = counters.as_ref() {
                    counters[c.id as usize].fetch_add(1, Ordering::Relaxed);
                }
            }

            // one batched read for the whole frontier; in partitioned mode a
            // second batch pulls each node's adjacency sector
            frontier_ok.clear();
            if !frontier.is_empty() {
                stats.n_hops += 1;
                let io_timer = Instant::now();
                let (coord_ok, graph_ok) = {
                    let mut chunks = sectors.chunks_mut(spn);
                    let mut coord_reqs: Vec<AlignedRead<'_>> =
                        Vec::with_capacity(frontier.len());
                    for &id in &frontier {
                        let chunk = chunks.next().expect("arena sized for the beam");
                        coord_reqs.push(AlignedRead::new(
                            self.layout.node_sector(id) * SECTOR_LEN as u64,
                            chunk,
                        )?);
                    }
                    let mut graph_reqs: Vec<AlignedRead<'_>> = Vec::new();
                    if let Some(graph) = &self.graph {
                        for &id in &frontier {
                            let chunk = chunks.next().expect("arena sized for the beam");
                            let (p, _) = graph.table.locate(id)?;
                            graph_reqs.push(AlignedRead::new(
                                graph.meta.partition_sector(p) * SECTOR_LEN as u64,
                                &mut chunk[..SECTOR_LEN],
                            )?);
                        }
                    }
                    let coord_ok = self.reader.read(&mut coord_reqs);
                    let graph_ok = match &self.graph {
                        Some(graph) => graph.reader.read(&mut graph_reqs),
                        None => Vec::new(),
                    };
                    (coord_ok, graph_ok)
                };
                stats.io_us += io_timer.elapsed().as_micros() as u64;
                num_ios += frontier.len() as u32;
                stats.n_ios += frontier.len() as u32;
                stats.n_4k += (frontier.len() * spn) as u32;
                if self.graph.is_some() {
                    stats.n_4k += frontier.len() as u32;
                }
                frontier_ok.extend((0..frontier.len()).map(|i| {
                    coord_ok[i] && graph_ok.get(i).copied().unwrap_or(true)
                }));
            }

            let cpu_timer = Instant::now();

            // cache hits: exact coords in memory, no I/O spent
            for &id in &cached_ids {
                let node = self.cache.get(id).expect("picked from cache");
                let committed = if opts.skip_search_reorder {
                    scorer.score_one(
                        id,
                        code_gather,
                        coord_buf,
                        distance_memo,
                        embedding,
                        neighbor_dists,
                        stats,
                    )
                } else if opts.deferred_fetch {
                    0.0
                } else if let Some(dpq) = &self.disk_pq {
                    match self.metric {
                        Metric::InnerProduct => dpq.inner_product(query_float, &node.coord_bytes),
                        _ => dpq.l2_distance(query_float, &node.coord_bytes),
                    }
                } else {
                    l2_sq_elems(aligned_query, &node.coords)
                };
                full_results.push(Scored {
                    id,
                    distance: committed,
                });

                if opts.batch_recompute {
                    batched_ids.extend_from_slice(&node.neighbors);
                    continue;
                }
                work.clear();
                work.extend_from_slice(&node.neighbors);
                prune_list(&scorer, &mut work, code_gather, &mut prune_dists, &mut pool, visited);
                scorer.score(
                    &work,
                    code_gather,
                    coord_buf,
                    distance_memo,
                    embedding,
                    neighbor_dists,
                    stats,
                );
                stats.n_cmps += work.len() as u32;
                accept_neighbors(
                    &work,
                    neighbor_dists,
                    self.num_points,
                    self.labels.as_ref(),
                    opts.filter,
                    visited,
                    candidates,
                );
            }

            // frontier nodes: decode the fetched sectors
            for (i, &id) in frontier.iter().enumerate() {
                if !frontier_ok[i] {
                    // failed read: the node is elided for this query
                    continue;
                }
                let record = match self.layout.node_record(sectors.chunk(spn, i), id) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(id, error = %e, "bad node record, skipping");
                        continue;
                    }
                };

                let committed = if opts.skip_search_reorder {
                    scorer.score_one(
                        id,
                        code_gather,
                        coord_buf,
                        distance_memo,
                        embedding,
                        neighbor_dists,
                        stats,
                    )
                } else if opts.deferred_fetch {
                    0.0
                } else if self.graph.is_some()
                    && opts.recompute_neighbors
                    && opts.dedup_cache
                {
                    // graph-only reads rely on the memo; a first visit that
                    // was never scored as a neighbor is computed on demand
                    match distance_memo.get(&id) {
                        Some(&d) => d,
                        None => scorer.score_one(
                            id,
                            code_gather,
                            coord_buf,
                            distance_memo,
                            embedding,
                            neighbor_dists,
                            stats,
                        ),
                    }
                } else if let Some(dpq) = &self.disk_pq {
                    match self.metric {
                        Metric::InnerProduct => {
                            dpq.inner_product(query_float, record.coord_bytes())
                        }
                        _ => dpq.l2_distance(query_float, record.coord_bytes()),
                    }
                } else {
                    record.decode_coords(&mut coord_buf[..self.data_dim]);
                    for v in coord_buf[self.data_dim..].iter_mut() {
                        *v = T::default();
                    }
                    l2_sq_elems(aligned_query, coord_buf)
                };
                full_results.push(Scored {
                    id,
                    distance: committed,
                });

                nbr_buf.clear();
                match &self.graph {
                    Some(graph) => {
                        let (_, j) = graph.table.locate(id)?;
                        let sector = &sectors.chunk(spn, frontier.len() + i)[..SECTOR_LEN];
                        match graph.meta.neighbors_in_sector(sector, j) {
                            Ok(nbrs) => nbr_buf.extend(nbrs),
                            Err(e) => {
                                warn!(id, error = %e, "bad adjacency record, skipping");
                                continue;
                            }
                        }
                    }
                    None => nbr_buf.extend(record.neighbors()),
                }

                if opts.batch_recompute {
                    batched_ids.extend_from_slice(&nbr_buf);
                    continue;
                }
                work.clear();
                work.extend_from_slice(&nbr_buf);
                prune_list(&scorer, &mut work, code_gather, &mut prune_dists, &mut pool, visited);
                scorer.score(
                    &work,
                    code_gather,
                    coord_buf,
                    distance_memo,
                    embedding,
                    neighbor_dists,
                    stats,
                );
                stats.n_cmps += work.len() as u32;
                accept_neighbors(
                    &work,
                    neighbor_dists,
                    self.num_points,
                    self.labels.as_ref(),
                    opts.filter,
                    visited,
                    candidates,
                );
            }

            // batch mode: one scoring call for every neighbor this iteration
            if opts.batch_recompute && !batched_ids.is_empty() {
                work.clear();
                work.append(&mut batched_ids);
                prune_list(&scorer, &mut work, code_gather, &mut prune_dists, &mut pool, visited);
                scorer.score(
                    &work,
                    code_gather,
                    coord_buf,
                    distance_memo,
                    embedding,
                    neighbor_dists,
                    stats,
                );
                stats.n_cmps += work.len() as u32;
                accept_neighbors(
                    &work,
                    neighbor_dists,
                    self.num_points,
                    self.labels.as_ref(),
                    opts.filter,
                    visited,
                    candidates,
                );
            }

            stats.cpu_us += cpu_timer.elapsed().as_micros() as u64;
        }
        stats.io_limit_hit = candidates.has_unexpanded() && num_ios >= opts.io_limit;
        drop(counters);

        // deferred mode: every committed distance is a placeholder; one
        // fetch repairs them all, and a failure fails the query
        if opts.deferred_fetch && !full_results.is_empty() {
            let ids: Vec<u32> = full_results.iter().map(|s| s.id).collect();
            let mut embs = embedding.fetch(&ids)?;
            preprocess_fetched(&mut embs, self.metric, self.max_base_norm, self.data_dim);
            for (s, emb) in full_results.iter_mut().zip(embs.iter_mut()) {
                emb.resize(self.aligned_dim, 0.0);
                for (dst, src) in coord_buf.iter_mut().zip(emb.iter()) {
                    *dst = T::from_f32(*src);
                }
                s.distance = l2_sq_elems(aligned_query, coord_buf);
            }
        }

        full_results.sort_unstable_by(|a, b| a.distance.total_cmp(&b.distance));

        // rescore the head from the full-precision region
        if opts.use_reorder {
            let reorder = self.layout.reorder.expect("validated above");
            full_results.truncate(k * FP_RERANK_MULTIPLIER);
            let io_timer = Instant::now();
            let mut start = 0;
            while start < full_results.len() {
                let end = (start + MAX_N_SECTOR_READS).min(full_results.len());
                let ok = {
                    let mut chunks = sectors.chunks_mut(1);
                    let mut reqs: Vec<AlignedRead<'_>> = Vec::with_capacity(end - start);
                    for s in &full_results[start..end] {
                        let (sector, _) = self
                            .layout
                            .reorder_location(s.id, T::BYTES)
                            .expect("validated above");
                        let chunk = chunks.next().expect("arena sized for reorder block");
                        reqs.push(AlignedRead::new(sector * SECTOR_LEN as u64, chunk)?);
                    }
                    self.reader.read(&mut reqs)
                };
                stats.n_ios += (end - start) as u32;
                stats.n_4k += (end - start) as u32;
                for (j, s) in full_results[start..end].iter_mut().enumerate() {
                    if !ok[j] {
                        continue;
                    }
                    let (_, offset) = self
                        .layout
                        .reorder_location(s.id, T::BYTES)
                        .expect("validated above");
                    let ndims = reorder.ndims as usize;
                    let sector = sectors.chunk(1, j);
                    let bytes = &sector[offset..offset + ndims * T::BYTES];
                    T::decode_slice(bytes, &mut coord_buf[..ndims]);
                    s.distance = l2_sq_elems(&aligned_query[..ndims], &coord_buf[..ndims]);
                }
                start = end;
            }
            stats.io_us += io_timer.elapsed().as_micros() as u64;
            full_results.sort_unstable_by(|a, b| a.distance.total_cmp(&b.distance));
        }

        // emit top k, mapping dummies back and undoing the metric transform
        let count = k.min(full_results.len());
        let mut out = Vec::with_capacity(count);
        for s in full_results.iter().take(count) {
            let id = match &self.labels {
                Some(labels) => labels.to_real(s.id),
                None => s.id,
            };
            let mut dist = s.distance;
            if self.metric != Metric::L2 {
                dist = -dist;
                if self.max_base_norm != 0.0 {
                    dist *= self.max_base_norm * query_norm;
                }
            }
            out.push((id, dist));
        }

        if opts.recompute_neighbors && opts.dedup_cache && stats.recompute_requests > 0 {
            tracing::debug!(
                requested = stats.recompute_requests,
                memo_hits = stats.recompute_memo_hits,
                "recompute memo statistics"
            );
        }
        stats.total_us = query_timer.elapsed().as_micros() as u64;
        Ok(out)
    }
}
