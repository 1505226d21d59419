//! The view contract every layer of the coins stack implements.

use crate::{CoinsMap, Result};
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, OutPoint};
use coincache_primitives::Coin;
use std::collections::HashMap;

/// A view of the unspent-output set.
///
/// Implemented by the persistent store at the bottom of the stack, by every
/// [`CoinsViewCache`](crate::CoinsViewCache) layered on top, and by adapters
/// like [`CoinsViewErrorCatcher`](crate::CoinsViewErrorCatcher).
///
/// Reads may materialise cache entries in the layers above the store, so all
/// methods take `&mut self`; the stack as a whole is single-writer.
pub trait CoinsView {
    /// The record stored for `outpoint`, if the view has one.
    ///
    /// The record may be the spent sentinel: callers treat a spent record as
    /// vacuous, but a cache layer fetching it learns that its parent has no
    /// live coin there.
    fn get_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>>;

    /// Whether an unspent coin exists for `outpoint`.
    fn have_coin(&mut self, outpoint: &OutPoint) -> Result<bool> {
        Ok(self
            .get_coin(outpoint)?
            .is_some_and(|coin| !coin.is_spent()))
    }

    /// Hash of the best block this view's coin set represents.
    ///
    /// An all-zero hash means the view does not know yet.
    fn best_block(&mut self) -> BlockHash;

    /// Hashes of the blocks whose application is mid-flush, for crash
    /// recovery. Empty when the view is quiescent.
    fn head_blocks(&mut self) -> Vec<BlockHash> {
        Vec::new()
    }

    /// Absorb a child's map of cache entries.
    ///
    /// Every dirty entry in `coins` is merged into this view; clean entries
    /// are skipped. With `erase` the child's map must be left empty on
    /// success (coins are moved rather than copied), without it the child may
    /// keep syncing repeatedly. The view's best block becomes `best_block`.
    ///
    /// The merge must be equivalent to applying the child's writes directly
    /// to this view: a `FRESH` spent entry vanishes, a `FRESH` entry landing
    /// on a `FRESH` parent entry collapses, and a tombstone against a
    /// non-`FRESH` parent entry is preserved for the next flush down.
    fn batch_write(
        &mut self,
        coins: &mut CoinsMap,
        best_block: BlockHash,
        erase: bool,
    ) -> Result<()>;

    /// Estimated byte size of this view's backing data.
    fn estimate_size(&mut self) -> usize {
        0
    }

    /// Iterator over the view's full coin set, for backends that support
    /// scans.
    fn cursor(&mut self) -> Option<Box<dyn Iterator<Item = (OutPoint, Coin)> + '_>> {
        None
    }
}

/// A flat, in-memory coins backend: the bottom of a view stack when no
/// persistent store is involved, and the reference model the cache layers
/// are tested against.
pub struct MemoryCoinsView {
    coins: HashMap<OutPoint, Coin>,
    best_block: BlockHash,
}

impl MemoryCoinsView {
    pub fn new() -> Self {
        Self {
            coins: HashMap::new(),
            best_block: BlockHash::all_zeros(),
        }
    }

    /// Put a record in place directly, bypassing the batch-write protocol.
    ///
    /// Spent records are stored as-is, which lets tests model a base that
    /// still carries a tombstone for an outpoint.
    pub fn put_coin(&mut self, outpoint: OutPoint, coin: Coin) {
        self.coins.insert(outpoint, coin);
    }

    /// Number of records, spent sentinels included.
    pub fn len(&self) -> usize {
        self.coins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coins.is_empty()
    }
}

impl Default for MemoryCoinsView {
    fn default() -> Self {
        Self::new()
    }
}

impl CoinsView for MemoryCoinsView {
    fn get_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>> {
        Ok(self.coins.get(outpoint).cloned())
    }

    fn best_block(&mut self) -> BlockHash {
        self.best_block
    }

    fn batch_write(
        &mut self,
        coins: &mut CoinsMap,
        best_block: BlockHash,
        erase: bool,
    ) -> Result<()> {
        for (outpoint, entry) in coins.iter() {
            if entry.is_dirty() {
                if entry.coin.is_spent() {
                    self.coins.remove(outpoint);
                } else {
                    self.coins.insert(*outpoint, entry.coin.clone());
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
        // 36-byte keys plus the serialized coin; good enough for a model.
        self.coins
            .values()
            .map(|coin| 36 + 8 + coin.output.script_pubkey.len())
            .sum()
    }

    fn cursor(&mut self) -> Option<Box<dyn Iterator<Item = (OutPoint, Coin)> + '_>> {
        Some(Box::new(
            self.coins
                .iter()
                .map(|(outpoint, coin)| (*outpoint, coin.clone())),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CacheEntry, EntryFlags};
    use bitcoin::{Amount, ScriptBuf, Txid, TxOut};

    fn outpoint(n: u8) -> OutPoint {
        OutPoint {
            txid: Txid::from_byte_array([n; 32]),
            vout: 0,
        }
    }

    fn coin(value: u64) -> Coin {
        Coin::new(
            TxOut {
                value: Amount::from_sat(value),
                script_pubkey: ScriptBuf::from_bytes(vec![0x51]),
            },
            1,
            false,
        )
    }

    #[test]
    fn test_have_coin_ignores_spent_records() {
        let mut view = MemoryCoinsView::new();
        view.put_coin(outpoint(1), coin(100));
        view.put_coin(outpoint(2), Coin::default());

        assert!(view.have_coin(&outpoint(1)).unwrap());
        assert!(!view.have_coin(&outpoint(2)).unwrap());
        assert!(!view.have_coin(&outpoint(3)).unwrap());
        // The spent record itself is still fetchable.
        assert!(view.get_coin(&outpoint(2)).unwrap().is_some());
    }

    #[test]
    fn test_batch_write_applies_only_dirty_entries() {
        let mut view = MemoryCoinsView::new();
        view.put_coin(outpoint(1), coin(100));

        let mut coins = CoinsMap::deterministic();
        // Clean entry: must be skipped even though the value differs.
        coins.try_insert(outpoint(1), CacheEntry::new(coin(999)));
        // Dirty insert and dirty tombstone.
        coins.try_insert(
            outpoint(2),
            CacheEntry::with_flags(coin(200), EntryFlags::DIRTY),
        );
        coins.try_insert(
            outpoint(3),
            CacheEntry::with_flags(Coin::default(), EntryFlags::DIRTY),
        );

        let tip = BlockHash::from_byte_array([9; 32]);
        view.batch_write(&mut coins, tip, true).unwrap();

        assert!(coins.is_empty());
        assert_eq!(view.best_block(), tip);
        assert_eq!(
            view.get_coin(&outpoint(1)).unwrap().unwrap().output.value,
            Amount::from_sat(100)
        );
        assert_eq!(
            view.get_coin(&outpoint(2)).unwrap().unwrap().output.value,
            Amount::from_sat(200)
        );
        assert!(view.get_coin(&outpoint(3)).unwrap().is_none());
    }
}
