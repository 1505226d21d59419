//! Allocator handles used by the node-based containers.

use crate::PoolResource;
use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::rc::Rc;

/// The allocation interface a node-based container requires.
///
/// Implementations are handles: cloning one is cheap and yields an allocator
/// drawing from the same underlying memory. Containers move and swap their
/// handle together with their contents, so a moved container keeps allocating
/// from the pool its nodes already live in.
pub trait ChunkAllocator: Clone {
    /// Allocate memory for `layout`. Never returns null; allocation failure
    /// aborts through the global allocator's error handler.
    fn allocate(&self, layout: Layout) -> NonNull<u8>;

    /// Return an allocation.
    ///
    /// # Safety
    ///
    /// `ptr` must have been obtained from [`ChunkAllocator::allocate`] on
    /// this allocator (or one comparing equal to it) with the same `layout`,
    /// and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);

    /// Whether `self` and `other` draw from the same underlying memory, i.e.
    /// whether memory allocated through one may be returned through the
    /// other.
    fn is_same_pool(&self, other: &Self) -> bool;
}

/// Handle to a [`PoolResource`].
///
/// The handle is a reference-counted pointer: copies are cheap and all copies
/// allocate from the one shared resource. Two handles compare equal exactly
/// when they reference the same resource.
pub struct NodeAllocator<const MAX_CHUNK_SIZE_BYTES: usize, const ALIGN_BYTES: usize> {
    resource: Rc<PoolResource<MAX_CHUNK_SIZE_BYTES, ALIGN_BYTES>>,
}

impl<const MAX_CHUNK_SIZE_BYTES: usize, const ALIGN_BYTES: usize>
    NodeAllocator<MAX_CHUNK_SIZE_BYTES, ALIGN_BYTES>
{
    /// Create a handle backed by a fresh resource with default block size.
    pub fn new() -> Self {
        Self {
            resource: Rc::new(PoolResource::new()),
        }
    }

    /// Create a handle to an existing resource.
    pub fn from_resource(resource: Rc<PoolResource<MAX_CHUNK_SIZE_BYTES, ALIGN_BYTES>>) -> Self {
        Self { resource }
    }

    /// The resource this handle allocates from.
    pub fn resource(&self) -> &PoolResource<MAX_CHUNK_SIZE_BYTES, ALIGN_BYTES> {
        &self.resource
    }
}

impl<const MAX_CHUNK_SIZE_BYTES: usize, const ALIGN_BYTES: usize> Default
    for NodeAllocator<MAX_CHUNK_SIZE_BYTES, ALIGN_BYTES>
{
    fn default() -> Self {
        Self::new()
    }
}

impl<const MAX_CHUNK_SIZE_BYTES: usize, const ALIGN_BYTES: usize> Clone
    for NodeAllocator<MAX_CHUNK_SIZE_BYTES, ALIGN_BYTES>
{
    fn clone(&self) -> Self {
        Self {
            resource: Rc::clone(&self.resource),
        }
    }
}

impl<const MAX_CHUNK_SIZE_BYTES: usize, const ALIGN_BYTES: usize> PartialEq
    for NodeAllocator<MAX_CHUNK_SIZE_BYTES, ALIGN_BYTES>
{
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.resource, &other.resource)
    }
}

impl<const MAX_CHUNK_SIZE_BYTES: usize, const ALIGN_BYTES: usize> Eq
    for NodeAllocator<MAX_CHUNK_SIZE_BYTES, ALIGN_BYTES>
{
}

impl<const MAX_CHUNK_SIZE_BYTES: usize, const ALIGN_BYTES: usize> std::fmt::Debug
    for NodeAllocator<MAX_CHUNK_SIZE_BYTES, ALIGN_BYTES>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeAllocator")
            .field("resource", &Rc::as_ptr(&self.resource))
            .finish()
    }
}

impl<const MAX_CHUNK_SIZE_BYTES: usize, const ALIGN_BYTES: usize> ChunkAllocator
    for NodeAllocator<MAX_CHUNK_SIZE_BYTES, ALIGN_BYTES>
{
    fn allocate(&self, layout: Layout) -> NonNull<u8> {
        self.resource.allocate(layout.size(), layout.align())
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        self.resource.deallocate(ptr, layout.size(), layout.align())
    }

    fn is_same_pool(&self, other: &Self) -> bool {
        self == other
    }
}

/// The global allocator behind the [`ChunkAllocator`] interface, for
/// containers that do not want a pool.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct SystemAllocator;

impl ChunkAllocator for SystemAllocator {
    fn allocate(&self, layout: Layout) -> NonNull<u8> {
        match NonNull::new(unsafe { alloc::alloc(layout) }) {
            Some(ptr) => ptr,
            None => alloc::handle_alloc_error(layout),
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        alloc::dealloc(ptr.as_ptr(), layout);
    }

    fn is_same_pool(&self, _other: &Self) -> bool {
        // All system allocations are interchangeable.
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_equality_is_resource_identity() {
        let a = NodeAllocator::<64, 8>::new();
        let b = a.clone();
        let c = NodeAllocator::<64, 8>::new();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.is_same_pool(&b));
        assert!(!a.is_same_pool(&c));
    }

    #[test]
    fn test_allocations_cross_handles() {
        let a = NodeAllocator::<64, 8>::new();
        let b = a.clone();

        let layout = Layout::from_size_align(48, 8).unwrap();
        let ptr = a.allocate(layout);
        // A clone of the handle returns chunks to the same free lists.
        unsafe { b.deallocate(ptr, layout) };
        assert_eq!(a.resource().num_free_chunks(), 1);
        a.resource().check_all_data_accounted_for();
    }

    #[test]
    fn test_system_allocator_roundtrip() {
        let alloc = SystemAllocator;
        let layout = Layout::from_size_align(48, 8).unwrap();
        let ptr = alloc.allocate(layout);
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0xab, 48);
            alloc.deallocate(ptr, layout);
        }
        assert!(alloc.is_same_pool(&SystemAllocator));
    }
}
