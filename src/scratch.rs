//! Per-thread reusable query state.
//!
//! Every buffer the beam search touches is preallocated inside a
//! [`SearchScratch`] slot and checked out of a fixed-capacity [`ScratchPool`]
//! for the duration of one query. The guard returns the slot on every exit
//! path, including errors, so a panicking or failing query never leaks its
//! slot. The pool's capacity is fixed at load time; callers beyond it block.

use std::collections::{HashMap, HashSet};

use parking_lot::{Condvar, Mutex};

use crate::defaults::MAX_N_SECTOR_READS;
use crate::distance::Element;
use crate::embedding::EmbeddingClient;
use crate::io::SectorArena;
use crate::pq::NUM_PQ_CENTROIDS;

/// A scored node in the best-first frontier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub id: u32,
    pub distance: f32,
    pub expanded: bool,
}

/// A node with its committed ("real") distance, accumulated into the full
/// return set during traversal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scored {
    pub id: u32,
    pub distance: f32,
}

/// Best-first candidate list of bounded capacity `L`.
///
/// Kept sorted ascending by distance. `closest_unexpanded` marks entries as
/// it hands them out; once the list is full, inserting keeps whichever of the
/// incumbent tail and the newcomer is closer.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    data: Vec<Candidate>,
    size: usize,
    capacity: usize,
    cur: usize,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the queue and set its capacity for the coming query.
    pub fn reserve(&mut self, capacity: usize) {
        self.data.resize(
            capacity + 1,
            Candidate {
                id: 0,
                distance: 0.0,
                expanded: false,
            },
        );
        self.capacity = capacity;
        self.size = 0;
        self.cur = 0;
    }

    pub fn clear(&mut self) {
        self.size = 0;
        self.cur = 0;
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Insert `(id, distance)`, keeping the list sorted and bounded.
    /// A duplicate id at the same distance is ignored.
    pub fn insert(&mut self, id: u32, distance: f32) {
        if self.size == self.capacity && self.data[self.size - 1].distance < distance {
            return;
        }

        // first position whose distance is >= the newcomer's
        let mut lo = 0usize;
        let mut hi = self.size;
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.data[mid].distance < distance {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        // scan the equal-distance run for the same id
        let mut probe = lo;
        while probe < self.size && self.data[probe].distance == distance {
            if self.data[probe].id == id {
                return;
            }
            probe += 1;
        }

        if lo < self.capacity {
            self.data.copy_within(lo..self.size.min(self.capacity), lo + 1);
            self.data[lo] = Candidate {
                id,
                distance,
                expanded: false,
            };
            if self.size < self.capacity {
                self.size += 1;
            }
            if lo < self.cur {
                self.cur = lo;
            }
        }
    }

    /// Whether any retained candidate is still unexpanded.
    pub fn has_unexpanded(&self) -> bool {
        self.cur < self.size
    }

    /// Mark and return the closest unexpanded candidate.
    pub fn closest_unexpanded(&mut self) -> Candidate {
        debug_assert!(self.has_unexpanded());
        self.data[self.cur].expanded = true;
        let pre = self.cur;
        while self.cur < self.size && self.data[self.cur].expanded {
            self.cur += 1;
        }
        self.data[pre]
    }
}

/// All mutable state one query needs, owned by one worker at a time.
pub struct SearchScratch<T: Element> {
    /// Query converted/normalized into the element type, padded to
    /// `aligned_dim`.
    pub aligned_query: Vec<T>,
    /// Float rendition of the aligned query (disk-PQ comparators use it).
    pub query_float: Vec<f32>,
    /// Query after PQ centering/rotation; `data_dim` long.
    pub rotated_query: Vec<f32>,
    /// Flat `n_chunks x 256` query-conditioned distance table.
    pub chunk_dists: Vec<f32>,
    /// PQ distance output for one node's neighbor list.
    pub neighbor_dists: Vec<f32>,
    /// Gathered PQ codes for one node's neighbor list.
    pub code_gather: Vec<u8>,
    /// Staging buffer for one coordinate vector.
    pub coord_buf: Vec<T>,
    /// Sector-aligned arena the frontier reads land in.
    pub sectors: SectorArena,
    /// Best-first frontier of capacity `L`.
    pub candidates: CandidateQueue,
    /// Ids ever inserted into the frontier; grows monotonically per query.
    pub visited: HashSet<u32>,
    /// Every node scored with a real distance, in visit order.
    pub full_results: Vec<Scored>,
    /// Per-query memo for recompute-dedup mode.
    pub distance_memo: HashMap<u32, f32>,
    /// This worker's persistent embedding connection.
    pub embedding: EmbeddingClient,
}

impl<T: Element> SearchScratch<T> {
    /// Allocate a slot for an index with the given geometry.
    pub fn new(
        aligned_dim: usize,
        data_dim: usize,
        n_chunks: usize,
        max_degree: usize,
        visited_reserve: usize,
        embedding_port: u16,
    ) -> Self {
        Self {
            aligned_query: vec![T::default(); aligned_dim],
            query_float: vec![0.0; aligned_dim],
            rotated_query: vec![0.0; data_dim],
            chunk_dists: vec![0.0; n_chunks * NUM_PQ_CENTROIDS],
            neighbor_dists: vec![0.0; max_degree + 1],
            code_gather: vec![0; (max_degree + 1) * n_chunks],
            coord_buf: vec![T::default(); aligned_dim],
            sectors: SectorArena::new(MAX_N_SECTOR_READS),
            candidates: CandidateQueue::new(),
            visited: HashSet::with_capacity(visited_reserve),
            full_results: Vec::with_capacity(visited_reserve),
            distance_memo: HashMap::new(),
            embedding: EmbeddingClient::new(embedding_port),
        }
    }

    /// Wipe per-query state. Buffers and the embedding connection survive.
    pub fn reset(&mut self) {
        self.candidates.clear();
        self.visited.clear();
        self.full_results.clear();
        self.distance_memo.clear();
    }
}

/// Fixed-capacity bag of scratch slots.
pub struct ScratchPool<T: Element> {
    slots: Mutex<Vec<SearchScratch<T>>>,
    available: Condvar,
}

impl<T: Element> ScratchPool<T> {
    pub fn new(slots: Vec<SearchScratch<T>>) -> Self {
        Self {
            slots: Mutex::new(slots),
            available: Condvar::new(),
        }
    }

    /// Check out a slot, blocking until one is free.
    pub fn acquire(&self) -> ScratchGuard<'_, T> {
        let mut slots = self.slots.lock();
        while slots.is_empty() {
            self.available.wait(&mut slots);
        }
        let slot = slots.pop().unwrap();
        ScratchGuard {
            pool: self,
            slot: Some(slot),
        }
    }
}

/// RAII handle returning its slot to the pool on drop.
pub struct ScratchGuard<'a, T: Element> {
    pool: &'a ScratchPool<T>,
    slot: Option<SearchScratch<T>>,
}

impl<T: Element> std::ops::Deref for ScratchGuard<'_, T> {
    type Target = SearchScratch<T>;

    fn deref(&self) -> &Self::Target {
        self.slot.as_ref().unwrap()
    }
}

impl<T: Element> std::ops::DerefMut for ScratchGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.slot.as_mut().unwrap()
    }
}

impl<T: Element> Drop for ScratchGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.slots.lock().push(slot);
            self.pool.available.notify_one();
        }
    }
}
