//! The memory resource that actually owns and hands out memory.

use coincache_primitives::memusage;
use std::alloc::{self, Layout};
use std::cell::{Cell, RefCell};
use std::mem;
use std::ptr::NonNull;

/// In-place linked list node for the free lists.
///
/// A freed chunk stores the pointer to the next free chunk of its size class
/// in its first machine word, so the free lists need no storage of their own.
#[repr(C)]
struct ListNode {
    next: *mut ListNode,
}

/// Default number of bytes allocated per backing block.
const DEFAULT_BLOCK_SIZE_BYTES: usize = 262_144;

/// A memory resource optimized for small, fixed-size allocations.
///
/// The resource allocates large blocks of memory (256 KiB by default) and
/// carves chunks out of the newest block with a bump cursor. Freed chunks go
/// onto a LIFO free list indexed by their size class, and are preferentially
/// handed back out on the next request of the same class. Requests whose
/// `(size, alignment)` fall outside the envelope of
/// `MAX_CHUNK_SIZE_BYTES` / `ALIGN_BYTES` bypass the pool entirely and go to
/// the system allocator.
///
/// Chunks carved from a fresh block are not pre-threaded onto a free list:
/// untouched pages are never written, so resident memory tracks actual use
/// rather than reserved capacity.
///
/// Blocks are only released when the resource is dropped. The resource is
/// single-threaded by construction (a container and its pool are owned by one
/// logical writer) and is therefore neither `Send` nor `Sync`.
pub struct PoolResource<const MAX_CHUNK_SIZE_BYTES: usize, const ALIGN_BYTES: usize> {
    /// Bytes allocated per backing block.
    block_size_bytes: usize,
    /// Every block allocated so far; freed in `drop`.
    blocks: RefCell<Vec<NonNull<u8>>>,
    /// One LIFO free list per size class. Index 0 is a sentinel for requests
    /// outside the envelope and is never populated.
    free_lists: RefCell<Vec<*mut ListNode>>,
    /// Bump cursor into the newest block.
    untouched_start: Cell<*mut u8>,
    /// End of the newest block.
    untouched_end: Cell<*mut u8>,
}

impl<const MAX_CHUNK_SIZE_BYTES: usize, const ALIGN_BYTES: usize>
    PoolResource<MAX_CHUNK_SIZE_BYTES, ALIGN_BYTES>
{
    /// Alignment every pooled chunk actually gets: the configured alignment,
    /// raised to at least the alignment of the free list node that may be
    /// written into a freed chunk.
    pub const ELEM_ALIGN_BYTES: usize = if ALIGN_BYTES > mem::align_of::<ListNode>() {
        ALIGN_BYTES
    } else {
        mem::align_of::<ListNode>()
    };

    const PARAMETER_CHECKS: () = {
        assert!(ALIGN_BYTES.is_power_of_two(), "alignment must be a power of two");
        assert!(
            MAX_CHUNK_SIZE_BYTES % Self::ELEM_ALIGN_BYTES == 0,
            "max chunk size must be a multiple of the alignment"
        );
        assert!(
            MAX_CHUNK_SIZE_BYTES >= mem::size_of::<ListNode>(),
            "a chunk must be able to hold a free list node"
        );
    };

    /// Create a resource with the default block size.
    pub fn new() -> Self {
        Self::with_block_size(DEFAULT_BLOCK_SIZE_BYTES)
    }

    /// Create a resource that allocates `block_size_bytes` per backing block.
    ///
    /// The block size must hold at least one chunk of the largest size class
    /// and be a multiple of the chunk alignment.
    pub fn with_block_size(block_size_bytes: usize) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::PARAMETER_CHECKS;
        assert!(block_size_bytes >= MAX_CHUNK_SIZE_BYTES);
        assert_eq!(block_size_bytes % Self::ELEM_ALIGN_BYTES, 0);

        let resource = Self {
            block_size_bytes,
            blocks: RefCell::new(Vec::new()),
            free_lists: RefCell::new(vec![
                std::ptr::null_mut();
                MAX_CHUNK_SIZE_BYTES / Self::ELEM_ALIGN_BYTES + 1
            ]),
            untouched_start: Cell::new(std::ptr::null_mut()),
            untouched_end: Cell::new(std::ptr::null_mut()),
        };
        resource.allocate_block(&mut resource.free_lists.borrow_mut());
        resource
    }

    /// Number of `ELEM_ALIGN_BYTES` units needed to hold `bytes`, which is
    /// also the free list index of that size class.
    const fn size_class(bytes: usize) -> usize {
        (bytes + Self::ELEM_ALIGN_BYTES - 1) / Self::ELEM_ALIGN_BYTES
    }

    /// Whether a request can be served from the pool. Alignments below the
    /// pool's are satisfied by the pool's stricter alignment; anything above
    /// it, or larger than the largest size class, goes to the system
    /// allocator.
    const fn is_pool_usable(bytes: usize, alignment: usize) -> bool {
        alignment <= Self::ELEM_ALIGN_BYTES && bytes <= MAX_CHUNK_SIZE_BYTES
    }

    /// Allocate `bytes` with the given alignment.
    ///
    /// Never returns null: if a backing block cannot be obtained the global
    /// allocator's error handler aborts the process.
    pub fn allocate(&self, bytes: usize, alignment: usize) -> NonNull<u8> {
        debug_assert!(bytes > 0);
        debug_assert!(alignment.is_power_of_two());

        if Self::is_pool_usable(bytes, alignment) {
            let class = Self::size_class(bytes);
            let mut free_lists = self.free_lists.borrow_mut();

            let head = free_lists[class];
            if !head.is_null() {
                // Unlink the most recently freed chunk of this class.
                unsafe {
                    free_lists[class] = (*head).next;
                    return NonNull::new_unchecked(head.cast());
                }
            }

            // Free list is empty: carve off the bump cursor, rounded up to
            // the size class so a later free lands back on the same list.
            let round_bytes = class * Self::ELEM_ALIGN_BYTES;
            if round_bytes > self.available_bytes_in_current_block() {
                self.allocate_block(&mut free_lists);
            }
            let chunk = self.untouched_start.get();
            unsafe {
                self.untouched_start.set(chunk.add(round_bytes));
                NonNull::new_unchecked(chunk)
            }
        } else {
            let layout =
                Layout::from_size_align(bytes, alignment).expect("request layout is valid; qed");
            match NonNull::new(unsafe { alloc::alloc(layout) }) {
                Some(ptr) => ptr,
                None => alloc::handle_alloc_error(layout),
            }
        }
    }

    /// Return an allocation obtained from [`PoolResource::allocate`].
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on this resource with the
    /// same `bytes` and `alignment`, and must not be used afterwards.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, bytes: usize, alignment: usize) {
        if Self::is_pool_usable(bytes, alignment) {
            let class = Self::size_class(bytes);
            let mut free_lists = self.free_lists.borrow_mut();
            push_chunk(&mut free_lists[class], ptr.as_ptr());
        } else {
            let layout =
                Layout::from_size_align(bytes, alignment).expect("request layout is valid; qed");
            alloc::dealloc(ptr.as_ptr(), layout);
        }
    }

    /// Allocate a fresh backing block and point the bump cursor at it.
    fn allocate_block(&self, free_lists: &mut [*mut ListNode]) {
        // Whatever tail is left in the current block is too small for the
        // request that triggered this call, but still belongs to some size
        // class: park it on that class's free list so no byte is stranded.
        let remaining = self.available_bytes_in_current_block();
        if remaining != 0 {
            let class = remaining / Self::ELEM_ALIGN_BYTES;
            push_chunk(&mut free_lists[class], self.untouched_start.get());
        }

        let layout = Layout::from_size_align(self.block_size_bytes, Self::ELEM_ALIGN_BYTES)
            .expect("block layout is valid; qed");
        let block = match NonNull::new(unsafe { alloc::alloc(layout) }) {
            Some(ptr) => ptr,
            None => alloc::handle_alloc_error(layout),
        };
        self.blocks.borrow_mut().push(block);
        self.untouched_start.set(block.as_ptr());
        self.untouched_end
            .set(unsafe { block.as_ptr().add(self.block_size_bytes) });
    }

    /// Bytes allocated per backing block.
    pub fn block_size_bytes(&self) -> usize {
        self.block_size_bytes
    }

    /// Number of backing blocks allocated so far.
    pub fn num_blocks(&self) -> usize {
        self.blocks.borrow().len()
    }

    /// Bytes not yet carved out of the newest block.
    pub fn available_bytes_in_current_block(&self) -> usize {
        self.untouched_end.get() as usize - self.untouched_start.get() as usize
    }

    /// Length of the free list of every size class, by index.
    pub fn free_list_sizes(&self) -> Vec<usize> {
        let free_lists = self.free_lists.borrow();
        free_lists
            .iter()
            .map(|&head| {
                let mut len = 0;
                let mut node = head;
                while !node.is_null() {
                    node = unsafe { (*node).next };
                    len += 1;
                }
                len
            })
            .collect()
    }

    /// Total number of chunks sitting on free lists.
    pub fn num_free_chunks(&self) -> usize {
        self.free_list_sizes().iter().sum()
    }

    /// Verify the accounting invariant at rest.
    ///
    /// Once every allocation has been returned, the bytes reachable through
    /// the free lists plus the untouched tail of the newest block must equal
    /// the total block bytes, and every free chunk must lie inside a block at
    /// a size-class-aligned offset.
    pub fn check_all_data_accounted_for(&self) {
        let free_list_sizes = self.free_list_sizes();
        let mut free_bytes = self.available_bytes_in_current_block();
        for (class, len) in free_list_sizes.iter().enumerate() {
            free_bytes += class * Self::ELEM_ALIGN_BYTES * len;
        }
        assert_eq!(
            free_bytes,
            self.num_blocks() * self.block_size_bytes,
            "free bytes and block bytes diverge: an allocation is unaccounted for"
        );

        let blocks = self.blocks.borrow();
        let free_lists = self.free_lists.borrow();
        for &head in free_lists.iter() {
            let mut node = head;
            while !node.is_null() {
                let addr = node as usize;
                let in_some_block = blocks.iter().any(|block| {
                    let start = block.as_ptr() as usize;
                    let offset = addr.wrapping_sub(start);
                    addr >= start
                        && offset < self.block_size_bytes
                        && offset % Self::ELEM_ALIGN_BYTES == 0
                });
                assert!(in_some_block, "free chunk does not point into any block");
                node = unsafe { (*node).next };
            }
        }
    }

    /// Bytes of memory claimed by this resource, in allocator terms.
    pub fn dynamic_memory_usage(&self) -> usize {
        let blocks = self.blocks.borrow();
        let free_lists = self.free_lists.borrow();
        memusage::malloc_usage(self.block_size_bytes) * blocks.len()
            + memusage::vec_usage(&blocks)
            + memusage::vec_usage(&free_lists)
    }
}

impl<const MAX_CHUNK_SIZE_BYTES: usize, const ALIGN_BYTES: usize> Default
    for PoolResource<MAX_CHUNK_SIZE_BYTES, ALIGN_BYTES>
{
    fn default() -> Self {
        Self::new()
    }
}

impl<const MAX_CHUNK_SIZE_BYTES: usize, const ALIGN_BYTES: usize> Drop
    for PoolResource<MAX_CHUNK_SIZE_BYTES, ALIGN_BYTES>
{
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.block_size_bytes, Self::ELEM_ALIGN_BYTES)
            .expect("block layout is valid; qed");
        for block in self.blocks.borrow_mut().drain(..) {
            unsafe { alloc::dealloc(block.as_ptr(), layout) };
        }
    }
}

/// Thread a freed chunk onto the head of a free list.
fn push_chunk(head: &mut *mut ListNode, chunk: *mut u8) {
    let node = chunk.cast::<ListNode>();
    unsafe {
        (*node).next = *head;
    }
    *head = node;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_allocating() {
        let resource = PoolResource::<8, 8>::new();
        resource.check_all_data_accounted_for();

        // The first block is allocated eagerly.
        let mut expected_bytes_available = resource.block_size_bytes();
        assert_eq!(
            expected_bytes_available,
            resource.available_bytes_in_current_block()
        );

        // A matching request carves from the block, no free list involved.
        let chunk = resource.allocate(8, 8);
        expected_bytes_available -= 8;
        assert_eq!(
            expected_bytes_available,
            resource.available_bytes_in_current_block()
        );

        assert_eq!(0, resource.free_list_sizes()[1]);
        unsafe { resource.deallocate(chunk, 8, 8) };
        resource.check_all_data_accounted_for();
        assert_eq!(1, resource.free_list_sizes()[1]);

        // A smaller alignment still uses the best fitting free list, and
        // nothing new is carved.
        let chunk = resource.allocate(8, 1);
        assert_eq!(0, resource.free_list_sizes()[1]);
        assert_eq!(
            expected_bytes_available,
            resource.available_bytes_in_current_block()
        );
        unsafe { resource.deallocate(chunk, 8, 1) };
        resource.check_all_data_accounted_for();
        assert_eq!(1, resource.free_list_sizes()[1]);

        // Alignment above the pool's bypasses the pool entirely.
        let chunk = resource.allocate(8, 16);
        resource.check_all_data_accounted_for();
        assert_eq!(1, resource.free_list_sizes()[1]);
        assert_eq!(
            expected_bytes_available,
            resource.available_bytes_in_current_block()
        );
        unsafe { resource.deallocate(chunk, 8, 16) };
        resource.check_all_data_accounted_for();
        assert_eq!(1, resource.free_list_sizes()[1]);

        // So does a size above the largest class.
        let chunk = resource.allocate(16, 8);
        resource.check_all_data_accounted_for();
        assert_eq!(1, resource.free_list_sizes()[1]);
        unsafe { resource.deallocate(chunk, 16, 8) };
        resource.check_all_data_accounted_for();
        assert_eq!(1, resource.free_list_sizes()[1]);
    }

    #[test]
    fn test_too_small_allocation() {
        let resource = PoolResource::<8, 8>::new();

        // A one-byte request is served by the smallest size class.
        let chunk = resource.allocate(1, 1);
        assert!(resource.free_list_sizes().iter().all(|&len| len == 0));
        assert_eq!(resource.num_blocks(), 1);

        unsafe { resource.deallocate(chunk, 1, 1) };
        assert_eq!(resource.free_list_sizes()[1], 1);
        assert_eq!(resource.num_blocks(), 1);

        // The freed chunk is reused for a pointer-sized request.
        let chunk = resource.allocate(8, 8);
        assert_eq!(resource.free_list_sizes()[1], 0);
        unsafe { resource.deallocate(chunk, 8, 8) };
        resource.check_all_data_accounted_for();
    }

    #[test]
    fn test_allocate_any_byte() {
        let resource = PoolResource::<128, 8>::with_block_size(1024);

        let num_allocs = 200u8;
        let mut data = Vec::new();

        // Allocate an increasing number of bytes and fill each allocation
        // with a distinct value.
        for num_bytes in 1..num_allocs {
            let ptr = resource.allocate(num_bytes as usize, 1);
            unsafe {
                std::ptr::write_bytes(ptr.as_ptr(), num_bytes, num_bytes as usize);
            }
            data.push((ptr, num_bytes));
        }

        // All allocations still hold their values, so none of them overlap.
        for &(ptr, num_bytes) in &data {
            let slice =
                unsafe { std::slice::from_raw_parts(ptr.as_ptr(), num_bytes as usize) };
            assert!(slice.iter().all(|&byte| byte == num_bytes));
        }
        for (ptr, num_bytes) in data {
            unsafe { resource.deallocate(ptr, num_bytes as usize, 1) };
        }

        resource.check_all_data_accounted_for();
    }

    #[test]
    fn test_random_allocations() {
        struct PtrSizeAlignment {
            ptr: NonNull<u8>,
            bytes: usize,
            alignment: usize,
        }

        // A bunch of random allocations, all given back in random order.
        let resource = PoolResource::<128, 8>::with_block_size(65_536);
        let mut rng = fastrand::Rng::with_seed(42);
        let mut allocations: Vec<PtrSizeAlignment> = Vec::new();

        for _ in 0..1000 {
            // Make it a bit more likely to allocate than deallocate.
            if allocations.is_empty() || rng.usize(0..4) != 0 {
                let alignment = 1usize << rng.usize(0..8); // 1, 2, ..., 128
                let bytes = (rng.usize(0..2000) / alignment + 1) * alignment;
                let ptr = resource.allocate(bytes, alignment);
                assert_eq!(ptr.as_ptr() as usize & (alignment - 1), 0);
                allocations.push(PtrSizeAlignment {
                    ptr,
                    bytes,
                    alignment,
                });
            } else {
                let entry = allocations.swap_remove(rng.usize(0..allocations.len()));
                unsafe { resource.deallocate(entry.ptr, entry.bytes, entry.alignment) };
            }
        }

        for entry in allocations {
            unsafe { resource.deallocate(entry.ptr, entry.bytes, entry.alignment) };
        }

        resource.check_all_data_accounted_for();
    }

    #[test]
    fn test_block_exhaustion_parks_tail() {
        // Block of 64 bytes, chunks of 24: after two carves the 16-byte tail
        // cannot satisfy another request and must land on free list 2.
        let resource = PoolResource::<32, 8>::with_block_size(64);
        let a = resource.allocate(24, 8);
        let b = resource.allocate(24, 8);
        assert_eq!(resource.num_blocks(), 1);

        let c = resource.allocate(24, 8);
        assert_eq!(resource.num_blocks(), 2);
        assert_eq!(resource.free_list_sizes()[2], 1);

        unsafe {
            resource.deallocate(a, 24, 8);
            resource.deallocate(b, 24, 8);
            resource.deallocate(c, 24, 8);
        }
        resource.check_all_data_accounted_for();
    }

    #[test]
    fn test_lifo_reuse() {
        let resource = PoolResource::<64, 8>::new();
        let a = resource.allocate(48, 8);
        let b = resource.allocate(48, 8);
        unsafe {
            resource.deallocate(a, 48, 8);
            resource.deallocate(b, 48, 8);
        }
        // Most recently freed chunk comes back first.
        let c = resource.allocate(48, 8);
        assert_eq!(c.as_ptr(), b.as_ptr());
        let d = resource.allocate(48, 8);
        assert_eq!(d.as_ptr(), a.as_ptr());
        unsafe {
            resource.deallocate(c, 48, 8);
            resource.deallocate(d, 48, 8);
        }
        resource.check_all_data_accounted_for();
    }
}
