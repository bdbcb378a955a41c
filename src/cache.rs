//! Warm in-memory cache of node coordinates and adjacency.
//!
//! A cache hit during beam search skips a sector read entirely and supplies
//! exact (non-PQ) coordinates for the current-node rescoring step. The set of
//! cached ids is curated once, right after load, by BFS from the medoids or
//! by counting visits over a sample query run; see the warm-up methods on
//! [`crate::index::DiskIndex`]. After that the cache is read-only and shared.

use std::collections::HashMap;

use crate::distance::Element;

/// Coordinates plus neighbor list for one cached node.
pub struct CachedNode<T> {
    /// Exact coordinates, `aligned_dim` long (zero-padded tail). In disk-PQ
    /// mode these are the raw on-disk code bytes widened into `T` storage by
    /// the loader, and the search consults `coord_bytes` instead.
    pub coords: Box<[T]>,
    /// Raw on-disk coordinate bytes, used by the disk-PQ comparators.
    pub coord_bytes: Box<[u8]>,
    pub neighbors: Box<[u32]>,
}

/// Static id -> node map for the curated hot set.
#[derive(Default)]
pub struct NodeCache<T> {
    nodes: HashMap<u32, CachedNode<T>>,
}

impl<T: Element> NodeCache<T> {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
        }
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            nodes: HashMap::with_capacity(n),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn insert(&mut self, id: u32, node: CachedNode<T>) {
        self.nodes.insert(id, node);
    }

    pub fn get(&self, id: u32) -> Option<&CachedNode<T>> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.nodes.contains_key(&id)
    }
}
