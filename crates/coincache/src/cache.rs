//! The layered cache view.

use crate::{CacheEntry, CoinsMap, CoinsView, EntryFlags, Result};
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, OutPoint, Transaction, Txid};
use coincache_primitives::{script_is_unspendable, Coin, MAX_OUTPUTS_PER_BLOCK};
use std::sync::LazyLock;
use tracing::trace;

static EMPTY_COIN: LazyLock<Coin> = LazyLock::new(Coin::default);

fn empty_coin() -> &'static Coin {
    &EMPTY_COIN
}

/// A coins view layered over a base view.
///
/// Reads fall through misses to the base and materialise entries in the
/// owned [`CoinsMap`]; writes only ever touch the map. [`flush`] and
/// [`sync`] hand the whole map to the base's `batch_write`, which merges it
/// entry by entry. The result is exactly what writing the same operations
/// directly against the base would have produced.
///
/// The parent must outlive the cache, which the `&mut` borrow enforces; the
/// same borrow makes the stack single-writer.
///
/// [`flush`]: CoinsViewCache::flush
/// [`sync`]: CoinsViewCache::sync
pub struct CoinsViewCache<'a> {
    base: &'a mut dyn CoinsView,
    cache_coins: CoinsMap,
    /// Cached best block; all-zero until first asked or assigned.
    best_block: BlockHash,
    /// Running sum of every live entry's dynamic memory usage.
    cached_coins_usage: usize,
    /// Whether the map hashes with a fixed salt (tests).
    deterministic: bool,
}

impl<'a> CoinsViewCache<'a> {
    /// Cache over `base` with a randomly salted map.
    pub fn new(base: &'a mut dyn CoinsView) -> Self {
        Self::with_hashing(base, false)
    }

    /// Cache over `base` with a fixed hash salt, for reproducible tests.
    pub fn deterministic(base: &'a mut dyn CoinsView) -> Self {
        Self::with_hashing(base, true)
    }

    fn with_hashing(base: &'a mut dyn CoinsView, deterministic: bool) -> Self {
        Self {
            base,
            cache_coins: fresh_map(deterministic),
            best_block: BlockHash::all_zeros(),
            cached_coins_usage: 0,
            deterministic,
        }
    }

    /// Point this cache at a different base view.
    pub fn set_backend(&mut self, base: &'a mut dyn CoinsView) {
        self.base = base;
    }

    /// Dense slot of the cache entry for `outpoint`, pulling the record up
    /// from the base on a miss. No entry is created when the base has no
    /// record either.
    fn fetch_coin(&mut self, outpoint: &OutPoint) -> Result<Option<usize>> {
        if let Some(index) = self.cache_coins.get_index(outpoint) {
            return Ok(Some(index));
        }
        let Some(coin) = self.base.get_coin(outpoint)? else {
            return Ok(None);
        };
        let flags = if coin.is_spent() {
            // The base only has a vacuous record for this outpoint; our copy
            // behaves exactly as if the base had none at all.
            EntryFlags::FRESH
        } else {
            EntryFlags::empty()
        };
        self.cached_coins_usage += coin.dynamic_memory_usage();
        let (index, inserted) = self
            .cache_coins
            .try_insert(*outpoint, CacheEntry::with_flags(coin, flags));
        debug_assert!(inserted);
        Ok(Some(index))
    }

    /// Add a coin at `outpoint`.
    ///
    /// Outputs with provably unspendable scripts are not tracked and return
    /// without inserting. Overwriting an unspent coin is a logic error
    /// unless `possible_overwrite` says the caller expects it (duplicate
    /// coinbases); overwrites are never marked `FRESH`, since the replaced
    /// record may still need a tombstone written down.
    ///
    /// # Panics
    ///
    /// If an unspent coin already exists at `outpoint` and
    /// `possible_overwrite` is false.
    pub fn add_coin(&mut self, outpoint: &OutPoint, coin: Coin, possible_overwrite: bool) {
        assert!(!coin.is_spent(), "cannot add a spent coin");
        if script_is_unspendable(&coin.output.script_pubkey) {
            return;
        }

        let (index, inserted) = self.cache_coins.try_insert(*outpoint, CacheEntry::default());
        let (_, entry) = self.cache_coins.entry_at_mut(index);
        if !inserted {
            self.cached_coins_usage -= entry.coin.dynamic_memory_usage();
        }

        let mut fresh = false;
        if !possible_overwrite {
            if !entry.coin.is_spent() {
                panic!("attempted to overwrite an unspent coin without possible_overwrite");
            }
            // If the entry is a spent coin that is DIRTY, its spentness has
            // not reached the base yet. Re-adding happens on reorgs: the
            // coin is spent when its block disconnects and added again when
            // a new block includes it. Marking it FRESH now and spending it
            // again before a flush would erase the entry and the tombstone
            // with it. Only an absent or clean spent record may be fresh.
            fresh = !entry.is_dirty();
        }

        entry.coin = coin;
        entry.flags |= EntryFlags::DIRTY
            | if fresh {
                EntryFlags::FRESH
            } else {
                EntryFlags::empty()
            };
        self.cached_coins_usage += entry.coin.dynamic_memory_usage();

        trace!(
            target: "utxocache",
            txid = %outpoint.txid,
            vout = outpoint.vout,
            height = entry.coin.height,
            value = entry.coin.output.value.to_sat(),
            is_coinbase = entry.coin.is_coinbase,
            "add"
        );
    }

    /// Spend the coin at `outpoint`, optionally moving the previous value
    /// into `moveout`. Returns false when no record exists.
    ///
    /// A `FRESH` entry is erased outright: the base never saw the creation,
    /// so it must not see the spend either. Anything else becomes a `DIRTY`
    /// tombstone that the next flush writes down as a deletion.
    pub fn spend_coin(&mut self, outpoint: &OutPoint, moveout: Option<&mut Coin>) -> Result<bool> {
        let Some(index) = self.fetch_coin(outpoint)? else {
            return Ok(false);
        };

        let fresh;
        {
            let (_, entry) = self.cache_coins.entry_at_mut(index);
            self.cached_coins_usage -= entry.coin.dynamic_memory_usage();
            trace!(
                target: "utxocache",
                txid = %outpoint.txid,
                vout = outpoint.vout,
                height = entry.coin.height,
                value = entry.coin.output.value.to_sat(),
                is_coinbase = entry.coin.is_coinbase,
                "spend"
            );
            fresh = entry.is_fresh();
            if fresh {
                // The whole entry is erased below, so the coin can be moved
                // out wholesale.
                if let Some(out) = moveout {
                    *out = std::mem::take(&mut entry.coin);
                }
            } else {
                // The entry lives on as a tombstone: hand out a copy and
                // void only the output, keeping height and coinbase flag.
                if let Some(out) = moveout {
                    *out = entry.coin.clone();
                }
                entry.flags |= EntryFlags::DIRTY;
                entry.coin.clear();
            }
        }
        if fresh {
            self.cache_coins.erase_at(index);
        }
        Ok(true)
    }

    /// Reference to the coin at `outpoint`, or to the shared empty coin when
    /// neither this view nor the base has a record. The reference is stable
    /// until the next mutation of this view.
    pub fn access_coin(&mut self, outpoint: &OutPoint) -> Result<&Coin> {
        Ok(match self.fetch_coin(outpoint)? {
            Some(index) => &self.cache_coins.entry_at(index).1.coin,
            None => empty_coin(),
        })
    }

    /// Whether an unspent coin sits in this map right now. Never reads the
    /// base.
    pub fn have_coin_in_cache(&self, outpoint: &OutPoint) -> bool {
        self.cache_coins
            .get(outpoint)
            .is_some_and(|entry| !entry.coin.is_spent())
    }

    /// Whether every input of `tx` refers to an unspent coin in this view.
    /// Vacuously true for coinbase transactions.
    pub fn have_inputs(&mut self, tx: &Transaction) -> Result<bool> {
        if tx.is_coinbase() {
            return Ok(true);
        }
        for input in &tx.input {
            if !self.have_coin(&input.previous_output)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Override the cached best block.
    pub fn set_best_block(&mut self, best_block: BlockHash) {
        self.best_block = best_block;
    }

    /// Push every entry down into the base and empty this view.
    ///
    /// On success the map and its pool are torn down and rebuilt, releasing
    /// the node memory back to the OS.
    ///
    /// # Panics
    ///
    /// If the base's `batch_write` reports success but leaves entries in the
    /// map; the base is violating the erase contract.
    pub fn flush(&mut self) -> Result<()> {
        let best_block = self.best_block;
        let result = self
            .base
            .batch_write(&mut self.cache_coins, best_block, true);
        // The accounting resets whether or not the base succeeded.
        self.cached_coins_usage = 0;
        result?;
        if !self.cache_coins.is_empty() {
            panic!("batch write with erase must leave the cache empty");
        }
        self.reallocate_cache();
        Ok(())
    }

    /// Push every entry down into the base but keep the clean ones.
    ///
    /// Spent entries have reached the base as deletions and are dropped;
    /// everything else is now identical to the base, so its flags reset.
    pub fn sync(&mut self) -> Result<()> {
        let best_block = self.best_block;
        self.base
            .batch_write(&mut self.cache_coins, best_block, false)?;

        let mut index = 0;
        while index < self.cache_coins.len() {
            let (spent, usage) = {
                let (_, entry) = self.cache_coins.entry_at(index);
                (entry.coin.is_spent(), entry.coin.dynamic_memory_usage())
            };
            if spent {
                self.cache_coins.erase_at(index);
                self.cached_coins_usage -= usage;
            } else {
                self.cache_coins.entry_at_mut(index).1.flags = EntryFlags::empty();
                index += 1;
            }
        }
        Ok(())
    }

    /// Drop an unmodified entry from the map. A no-op when the entry has any
    /// flag set, since dropping modified data would lose writes, and when no
    /// entry exists.
    pub fn uncache(&mut self, outpoint: &OutPoint) {
        let Some(index) = self.cache_coins.get_index(outpoint) else {
            return;
        };
        let usage = {
            let (_, entry) = self.cache_coins.entry_at(index);
            if !entry.flags.is_empty() {
                return;
            }
            trace!(
                target: "utxocache",
                txid = %outpoint.txid,
                vout = outpoint.vout,
                height = entry.coin.height,
                value = entry.coin.output.value.to_sat(),
                is_coinbase = entry.coin.is_coinbase,
                "uncache"
            );
            entry.coin.dynamic_memory_usage()
        };
        self.cached_coins_usage -= usage;
        self.cache_coins.erase_at(index);
    }

    /// Insert a coin with the `DIRTY` flag, skipping the overwrite policy
    /// and any base read. For bulk loads into a cache known not to contain
    /// the outpoint; with an existing entry the insert is silently dropped
    /// and the memory accounting corrupted, hence unchecked.
    pub fn emplace_coin_unchecked(&mut self, outpoint: OutPoint, coin: Coin) {
        self.cached_coins_usage += coin.dynamic_memory_usage();
        let (_, inserted) = self
            .cache_coins
            .try_insert(outpoint, CacheEntry::with_flags(coin, EntryFlags::DIRTY));
        debug_assert!(inserted);
    }

    /// Number of entries in this view's map.
    pub fn get_cache_size(&self) -> usize {
        self.cache_coins.len()
    }

    /// Heap bytes attributable to this view: container overhead plus the
    /// cached coins' scripts. The node pool's blocks are reported separately
    /// by [`pool_memory_usage`](CoinsViewCache::pool_memory_usage), since a
    /// resource may outlive individual entries.
    pub fn dynamic_memory_usage(&self) -> usize {
        self.cache_coins.dynamic_memory_usage() + self.cached_coins_usage
    }

    /// Bytes held by the map's node pool.
    pub fn pool_memory_usage(&self) -> usize {
        self.cache_coins.allocator().resource().dynamic_memory_usage()
    }

    /// Assert every internal invariant: each entry's `(spent, DIRTY, FRESH)`
    /// triple is legal, the memory accounting matches a recount, and the
    /// map's hash index agrees with its dense storage.
    pub fn sanity_check(&self) {
        let mut recomputed_usage = 0;
        for (_, entry) in self.cache_coins.iter() {
            assert!(entry.is_sane(), "illegal cache entry state");
            recomputed_usage += entry.coin.dynamic_memory_usage();
        }
        assert_eq!(
            recomputed_usage, self.cached_coins_usage,
            "memory accounting out of sync"
        );
        self.cache_coins.check_consistency();
    }

    /// Tear the map and its pool down and start from a minimal footprint.
    fn reallocate_cache(&mut self) {
        debug_assert!(self.cache_coins.is_empty());
        self.cache_coins = fresh_map(self.deterministic);
    }
}

impl CoinsView for CoinsViewCache<'_> {
    fn get_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>> {
        Ok(self.fetch_coin(outpoint)?.and_then(|index| {
            let entry = self.cache_coins.entry_at(index).1;
            (!entry.coin.is_spent()).then(|| entry.coin.clone())
        }))
    }

    fn have_coin(&mut self, outpoint: &OutPoint) -> Result<bool> {
        Ok(self
            .fetch_coin(outpoint)?
            .is_some_and(|index| !self.cache_coins.entry_at(index).1.coin.is_spent()))
    }

    fn best_block(&mut self) -> BlockHash {
        if self.best_block == BlockHash::all_zeros() {
            self.best_block = self.base.best_block();
        }
        self.best_block
    }

    fn head_blocks(&mut self) -> Vec<BlockHash> {
        self.base.head_blocks()
    }

    /// Merge a child's map into this view; see the trait contract.
    ///
    /// # Panics
    ///
    /// If a child entry carries `FRESH` while this view holds an unspent
    /// coin for the same outpoint: the flag was misapplied somewhere above,
    /// and honouring it would corrupt the set.
    fn batch_write(
        &mut self,
        coins: &mut CoinsMap,
        best_block: BlockHash,
        erase: bool,
    ) -> Result<()> {
        for child_index in 0..coins.len() {
            let (outpoint, child_fresh, child_coin) = {
                let (outpoint, child_entry) = coins.entry_at_mut(child_index);
                // Clean entries are identical to ours already.
                if !child_entry.is_dirty() {
                    continue;
                }
                let coin = if erase {
                    // Moving the coin out is an optimization; the clear
                    // after the loop is what empties the child map.
                    std::mem::take(&mut child_entry.coin)
                } else {
                    child_entry.coin.clone()
                };
                (*outpoint, child_entry.is_fresh(), coin)
            };

            match self.cache_coins.get_index(&outpoint) {
                None => {
                    // A FRESH spent child entry is a tombstone against a
                    // parent with no record: a net no-op, dropped here.
                    if !(child_fresh && child_coin.is_spent()) {
                        let mut flags = EntryFlags::DIRTY;
                        if child_fresh {
                            // Freshness carries over only if the child held
                            // it; an entry we lack may still have been
                            // flushed down from here earlier and be known to
                            // the grandparent.
                            flags |= EntryFlags::FRESH;
                        }
                        self.cached_coins_usage += child_coin.dynamic_memory_usage();
                        let (_, inserted) = self
                            .cache_coins
                            .try_insert(outpoint, CacheEntry::with_flags(child_coin, flags));
                        debug_assert!(inserted);
                    }
                }
                Some(index) => {
                    let (parent_fresh, parent_spent, parent_usage) = {
                        let (_, parent) = self.cache_coins.entry_at(index);
                        (
                            parent.is_fresh(),
                            parent.coin.is_spent(),
                            parent.coin.dynamic_memory_usage(),
                        )
                    };
                    if child_fresh && !parent_spent {
                        panic!("FRESH flag misapplied to coin that exists in parent cache");
                    }
                    if parent_fresh && child_coin.is_spent() {
                        // Our entry never reached the grandparent and the
                        // coin is now spent: creation and spend cancel.
                        self.cached_coins_usage -= parent_usage;
                        self.cache_coins.erase_at(index);
                    } else {
                        let (_, parent) = self.cache_coins.entry_at_mut(index);
                        parent.coin = child_coin;
                        parent.flags |= EntryFlags::DIRTY;
                        // Never inherit FRESH on an overwrite: if our entry
                        // pre-existed and was spent here, FRESH would keep
                        // that spentness from ever reaching the grandparent.
                        let new_usage = parent.coin.dynamic_memory_usage();
                        self.cached_coins_usage = self.cached_coins_usage - parent_usage + new_usage;
                    }
                }
            }
        }

        if erase {
            coins.clear();
        }
        self.best_block = best_block;
        Ok(())
    }

    fn estimate_size(&mut self) -> usize {
        self.base.estimate_size()
    }

    fn cursor(&mut self) -> Option<Box<dyn Iterator<Item = (OutPoint, Coin)> + '_>> {
        self.base.cursor()
    }
}

fn fresh_map(deterministic: bool) -> CoinsMap {
    if deterministic {
        CoinsMap::deterministic()
    } else {
        CoinsMap::new()
    }
}

/// Add every output of `tx` at `height` to `cache`.
///
/// With `check_for_overwrite` each output is first probed so legitimate
/// replacements pass the overwrite policy. Without it, coinbase outputs are
/// always added with overwrite permission: duplicate coinbase transactions
/// exist in the chain before BIP-30 activation and must replace their
/// predecessors.
pub fn add_coins_for_tx(
    cache: &mut CoinsViewCache<'_>,
    tx: &Transaction,
    height: u32,
    check_for_overwrite: bool,
) -> Result<()> {
    let is_coinbase = tx.is_coinbase();
    let txid = tx.compute_txid();
    for (vout, output) in tx.output.iter().enumerate() {
        let outpoint = OutPoint::new(txid, vout as u32);
        let overwrite = if check_for_overwrite {
            cache.have_coin(&outpoint)?
        } else {
            is_coinbase
        };
        cache.add_coin(&outpoint, Coin::from_txout(output, height, is_coinbase), overwrite);
    }
    Ok(())
}

/// First unspent output of `txid`, scanning output indices upward from zero,
/// bounded by the most outputs a single block can create. Returns the empty
/// coin when nothing unspent is found.
pub fn access_by_txid<'c>(view: &'c mut CoinsViewCache<'_>, txid: &Txid) -> Result<&'c Coin> {
    for vout in 0..MAX_OUTPUTS_PER_BLOCK {
        let outpoint = OutPoint::new(*txid, vout);
        if view.have_coin(&outpoint)? {
            return view.access_coin(&outpoint);
        }
    }
    Ok(empty_coin())
}
