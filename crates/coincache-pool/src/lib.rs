//! Fixed-size node pool allocator for the coincache containers.
//!
//! Node-based containers allocate one node per insert and free one per erase.
//! Serving those nodes from the general-purpose allocator costs a malloc
//! control structure per node, roughly doubling the memory footprint of small
//! nodes. [`PoolResource`] instead carves node-sized chunks out of large
//! blocks and recycles freed chunks through in-place free lists, so no
//! per-chunk metadata exists at all.
//!
//! [`NodeAllocator`] is the cheap handle containers hold; it can be copied
//! freely and compares equal exactly when two handles draw from the same
//! pool. [`SystemAllocator`] provides the same interface on top of the global
//! allocator, for containers that do not want a pool.

mod allocator;
mod resource;

pub use allocator::{ChunkAllocator, NodeAllocator, SystemAllocator};
pub use resource::PoolResource;
