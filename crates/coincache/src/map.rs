//! The hash container backing a cache view.
//!
//! `CoinsMap` is a hash index over a dense vector of entries. The index is a
//! separately chained hash table whose nodes hold only the outpoint and the
//! entry's slot in the dense vector, and every node is served by the
//! fixed-size pool allocator. Iteration, erase and size all act on the dense
//! vector; erase is O(1) by swapping with the last slot and fixing up the
//! moved entry's index node.

use crate::CacheEntry;
use bitcoin::OutPoint;
use coincache_pool::{ChunkAllocator, NodeAllocator};
use coincache_primitives::memusage;
use std::alloc::Layout;
use std::mem;
use std::ptr::{self, NonNull};

/// A hash index node: the key and the slot of its entry in the dense vector.
struct Node {
    key: OutPoint,
    dense: u32,
    next: *mut Node,
}

const NODE_LAYOUT: Layout = Layout::new::<Node>();

/// Largest chunk size the map's pool serves. Leaves headroom over the node
/// size so the layout can grow without touching the pool configuration.
const MAX_NODE_CHUNK_BYTES: usize = 256;

const _: () = assert!(mem::size_of::<Node>() <= MAX_NODE_CHUNK_BYTES);
const _: () = assert!(mem::align_of::<Node>() <= 8);

/// The pool-backed allocator the map uses by default.
pub type CoinsMapAllocator = NodeAllocator<MAX_NODE_CHUNK_BYTES, 8>;

/// Keyed hasher for outpoints, salted with a per-instance random seed to
/// frustrate hash-flooding of the outpoint space. The deterministic mode
/// pins the seed for reproducible tests.
#[derive(Clone)]
pub struct SaltedOutpointHasher {
    state: ahash::RandomState,
}

impl SaltedOutpointHasher {
    /// Randomly salted hasher.
    pub fn new() -> Self {
        Self {
            state: ahash::RandomState::with_seeds(
                fastrand::u64(..),
                fastrand::u64(..),
                fastrand::u64(..),
                fastrand::u64(..),
            ),
        }
    }

    /// Hasher with a fixed salt, for reproducible tests.
    pub fn deterministic() -> Self {
        Self {
            state: ahash::RandomState::with_seeds(
                0x8e81_9f26_07a1_8de6,
                0xc143_83cc_2f5c_96f4,
                0x6ae5_3046_33c1_1ca0,
                0x2202_81ba_93a6_41d6,
            ),
        }
    }

    fn hash(&self, outpoint: &OutPoint) -> u64 {
        self.state.hash_one(outpoint)
    }
}

impl Default for SaltedOutpointHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Map from [`OutPoint`] to [`CacheEntry`], generic over the node allocator
/// so it can run on either a [`NodeAllocator`] pool or the system allocator.
///
/// Invariant: the hash index and the dense vector agree on size and contents;
/// every index node's key equals the outpoint stored in its dense slot.
pub struct CoinsMap<A: ChunkAllocator = CoinsMapAllocator> {
    /// Hash index; power-of-two number of buckets, empty until first insert.
    buckets: Vec<*mut Node>,
    /// Dense entry storage, in no particular order.
    entries: Vec<(OutPoint, CacheEntry)>,
    hasher: SaltedOutpointHasher,
    alloc: A,
}

impl CoinsMap<CoinsMapAllocator> {
    /// Map on a fresh pool with a random hash salt.
    pub fn new() -> Self {
        Self::with_allocator(CoinsMapAllocator::new(), SaltedOutpointHasher::new())
    }

    /// Map on a fresh pool with a fixed hash salt.
    pub fn deterministic() -> Self {
        Self::with_allocator(CoinsMapAllocator::new(), SaltedOutpointHasher::deterministic())
    }
}

impl Default for CoinsMap<CoinsMapAllocator> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: ChunkAllocator> CoinsMap<A> {
    /// Map drawing its nodes from the given allocator.
    pub fn with_allocator(alloc: A, hasher: SaltedOutpointHasher) -> Self {
        Self {
            buckets: Vec::new(),
            entries: Vec::new(),
            hasher,
            alloc,
        }
    }

    /// The allocator handle this map draws nodes from.
    pub fn allocator(&self) -> &A {
        &self.alloc
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn bucket_of(&self, hash: u64, num_buckets: usize) -> usize {
        hash as usize & (num_buckets - 1)
    }

    fn find_node(&self, key: &OutPoint) -> Option<NonNull<Node>> {
        if self.buckets.is_empty() {
            return None;
        }
        let bucket = self.bucket_of(self.hasher.hash(key), self.buckets.len());
        let mut node = self.buckets[bucket];
        while !node.is_null() {
            unsafe {
                if (*node).key == *key {
                    return Some(NonNull::new_unchecked(node));
                }
                node = (*node).next;
            }
        }
        None
    }

    /// Dense slot of the entry for `key`, if present.
    pub fn get_index(&self, key: &OutPoint) -> Option<usize> {
        self.find_node(key)
            .map(|node| unsafe { node.as_ref().dense } as usize)
    }

    /// The entry for `key`, if present.
    pub fn get(&self, key: &OutPoint) -> Option<&CacheEntry> {
        self.get_index(key).map(|index| &self.entries[index].1)
    }

    /// Mutable entry for `key`, if present.
    pub fn get_mut(&mut self, key: &OutPoint) -> Option<&mut CacheEntry> {
        self.get_index(key).map(|index| &mut self.entries[index].1)
    }

    /// Whether `key` has an entry.
    pub fn contains_key(&self, key: &OutPoint) -> bool {
        self.find_node(key).is_some()
    }

    /// Entry at a dense slot.
    pub fn entry_at(&self, index: usize) -> (&OutPoint, &CacheEntry) {
        let (key, entry) = &self.entries[index];
        (key, entry)
    }

    /// Mutable entry at a dense slot. The key is immutable.
    pub fn entry_at_mut(&mut self, index: usize) -> (&OutPoint, &mut CacheEntry) {
        let (key, entry) = &mut self.entries[index];
        (&*key, entry)
    }

    /// Insert `entry` under `key` if absent.
    ///
    /// Returns the entry's dense slot and whether an insertion happened; an
    /// existing entry is left untouched.
    pub fn try_insert(&mut self, key: OutPoint, entry: CacheEntry) -> (usize, bool) {
        if let Some(node) = self.find_node(&key) {
            return (unsafe { node.as_ref().dense } as usize, false);
        }

        self.grow_if_needed();
        let dense = self.entries.len() as u32;
        let bucket = self.bucket_of(self.hasher.hash(&key), self.buckets.len());
        let node = self.alloc.allocate(NODE_LAYOUT).cast::<Node>();
        unsafe {
            node.as_ptr().write(Node {
                key,
                dense,
                next: self.buckets[bucket],
            });
        }
        self.buckets[bucket] = node.as_ptr();
        self.entries.push((key, entry));
        (dense as usize, true)
    }

    /// Remove the entry for `key`, returning it.
    pub fn erase(&mut self, key: &OutPoint) -> Option<CacheEntry> {
        let index = self.get_index(key)?;
        Some(self.erase_at(index))
    }

    /// Remove the entry at a dense slot in O(1): the last entry is swapped
    /// into the vacated slot and its index node updated.
    pub fn erase_at(&mut self, index: usize) -> CacheEntry {
        let key = self.entries[index].0;
        self.unlink_and_free(&key);
        let (_, entry) = self.entries.swap_remove(index);
        if index < self.entries.len() {
            let moved_key = self.entries[index].0;
            let node = self
                .find_node(&moved_key)
                .expect("dense entries always have an index node; qed");
            unsafe {
                (*node.as_ptr()).dense = index as u32;
            }
        }
        entry
    }

    /// Remove every entry, returning all index nodes to the allocator.
    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            let mut node = *bucket;
            while !node.is_null() {
                unsafe {
                    let next = (*node).next;
                    self.alloc
                        .deallocate(NonNull::new_unchecked(node.cast()), NODE_LAYOUT);
                    node = next;
                }
            }
            *bucket = ptr::null_mut();
        }
        self.entries.clear();
    }

    /// Iterate the entries in dense order.
    pub fn iter(&self) -> impl Iterator<Item = (&OutPoint, &CacheEntry)> {
        self.entries.iter().map(|(key, entry)| (key, entry))
    }

    /// Iterate the entries mutably; keys stay immutable.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&OutPoint, &mut CacheEntry)> {
        self.entries.iter_mut().map(|(key, entry)| (&*key, entry))
    }

    /// Heap bytes owned by the map itself: the bucket array and the dense
    /// vector. Index nodes live in the pool and are accounted for by its
    /// resource.
    pub fn dynamic_memory_usage(&self) -> usize {
        memusage::vec_usage(&self.buckets) + memusage::vec_usage(&self.entries)
    }

    /// Assert that the hash index and the dense vector agree.
    pub fn check_consistency(&self) {
        let mut indexed = 0;
        for (bucket, &head) in self.buckets.iter().enumerate() {
            let mut node = head;
            while !node.is_null() {
                unsafe {
                    let dense = (*node).dense as usize;
                    assert!(dense < self.entries.len(), "index node past dense storage");
                    assert_eq!(
                        self.entries[dense].0,
                        (*node).key,
                        "index node key diverges from its dense slot"
                    );
                    assert_eq!(
                        self.bucket_of(self.hasher.hash(&(*node).key), self.buckets.len()),
                        bucket,
                        "index node in the wrong bucket"
                    );
                    indexed += 1;
                    node = (*node).next;
                }
            }
        }
        assert_eq!(indexed, self.entries.len(), "index and dense sizes diverge");
    }

    /// Double the bucket array when the load factor reaches one, rethreading
    /// the existing nodes. Nodes never move in memory.
    fn grow_if_needed(&mut self) {
        if self.entries.len() < self.buckets.len() {
            return;
        }
        let new_len = if self.buckets.is_empty() {
            16
        } else {
            self.buckets.len() * 2
        };
        let mut new_buckets = vec![ptr::null_mut(); new_len];
        for &head in &self.buckets {
            let mut node = head;
            while !node.is_null() {
                unsafe {
                    let next = (*node).next;
                    let bucket = self.hasher.hash(&(*node).key) as usize & (new_len - 1);
                    (*node).next = new_buckets[bucket];
                    new_buckets[bucket] = node;
                    node = next;
                }
            }
        }
        self.buckets = new_buckets;
    }

    fn unlink_and_free(&mut self, key: &OutPoint) {
        let bucket = self.bucket_of(self.hasher.hash(key), self.buckets.len());
        let mut link: *mut *mut Node = &mut self.buckets[bucket];
        unsafe {
            while !(*link).is_null() {
                let node = *link;
                if (*node).key == *key {
                    *link = (*node).next;
                    self.alloc
                        .deallocate(NonNull::new_unchecked(node.cast()), NODE_LAYOUT);
                    return;
                }
                link = &mut (*node).next;
            }
        }
        panic!("hash index out of sync with dense entries");
    }
}

impl<A: ChunkAllocator> Clone for CoinsMap<A> {
    /// Rebuild the entries with nodes drawn from the source's pool, so the
    /// clone's allocator compares equal to the source's.
    fn clone(&self) -> Self {
        let mut clone = Self::with_allocator(self.alloc.clone(), self.hasher.clone());
        for (key, entry) in self.iter() {
            clone.try_insert(*key, entry.clone());
        }
        clone
    }
}

impl<A: ChunkAllocator> Drop for CoinsMap<A> {
    fn drop(&mut self) {
        self.clear();
    }
}
