//! Hierarchical UTXO cache.
//!
//! A validator keeps the unspent-output set behind a stack of in-memory
//! views: mutations from block application and mempool evaluation accumulate
//! in the top view and flush downward in batches, with the bottom of the
//! stack backed by the persistent store.
//!
//! ## Architecture
//!
//! - [`CoinsView`]: the read/batch-write contract every layer implements.
//! - [`CoinsViewCache`]: a layered view holding a [`CoinsMap`], delegating
//!   misses to its base and merging into it on flush.
//! - [`CoinsMap`]: hash index over a dense entry vector, its nodes served by
//!   the fixed-size pool allocator from `coincache-pool`.
//! - [`CoinsViewErrorCatcher`]: adapter that turns base read failures into a
//!   clean shutdown instead of a silent "not found".
//!
//! Each cache entry tracks whether it diverges from its parent (`DIRTY`) and
//! whether the parent has no live record of the outpoint (`FRESH`). The two
//! flags decide whether a spent coin must be written down as a deletion or
//! may be dropped entirely; see [`EntryFlags`].
//!
//! The stack is single-writer: no layer synchronises internally, and reads
//! materialise cache entries, so even lookups take `&mut self`.

mod cache;
mod entry;
mod error;
mod error_catcher;
mod map;
mod view;

pub use cache::{access_by_txid, add_coins_for_tx, CoinsViewCache};
pub use coincache_primitives::Coin;
pub use entry::{CacheEntry, EntryFlags};
pub use error::Error;
pub use error_catcher::CoinsViewErrorCatcher;
pub use map::{CoinsMap, CoinsMapAllocator, SaltedOutpointHasher};
pub use view::{CoinsView, MemoryCoinsView};

/// Result type for coins view operations.
pub type Result<T> = std::result::Result<T, Error>;
