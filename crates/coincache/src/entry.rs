//! Cache entries and their state flags.

use bitflags::bitflags;
use coincache_primitives::Coin;

bitflags! {
    /// State of a cache entry relative to the parent view.
    ///
    /// `FRESH` is an assertion about the *parent*, not about this view: it
    /// means the parent has no live record of the outpoint, so if the entry
    /// is spent before it is flushed, creation and spend cancel out and the
    /// entry may be dropped without ever reaching the parent. Misapplying
    /// `FRESH` to a coin the parent does know about would suppress the
    /// deletion the parent needs to see.
    pub struct EntryFlags: u8 {
        /// The entry diverges from the parent and must be written on flush.
        const DIRTY = 1 << 0;
        /// The parent has no live record of this outpoint.
        const FRESH = 1 << 1;
    }
}

impl Default for EntryFlags {
    fn default() -> Self {
        EntryFlags::empty()
    }
}

/// A coin plus its cache state.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The cached coin, possibly the spent sentinel.
    pub coin: Coin,
    /// State relative to the parent view.
    pub flags: EntryFlags,
}

impl CacheEntry {
    /// Entry with no flags set: identical to the parent's record.
    pub fn new(coin: Coin) -> Self {
        Self::with_flags(coin, EntryFlags::empty())
    }

    /// Entry with the given flags.
    pub fn with_flags(coin: Coin, flags: EntryFlags) -> Self {
        Self { coin, flags }
    }

    /// Whether the entry must be written to the parent on flush.
    pub fn is_dirty(&self) -> bool {
        self.flags.contains(EntryFlags::DIRTY)
    }

    /// Whether the parent has no live record of this outpoint.
    pub fn is_fresh(&self) -> bool {
        self.flags.contains(EntryFlags::FRESH)
    }

    /// Whether the `(spent, DIRTY, FRESH)` triple is one of the five legal
    /// combinations.
    ///
    /// Illegal are: a spent entry that is neither dirty nor fresh (it
    /// contributes nothing and must not be retained), a clean fresh entry
    /// that is unspent (creation always dirties), and a spent entry that is
    /// both dirty and fresh (it should have been erased on spend).
    pub fn is_sane(&self) -> bool {
        match (self.coin.is_spent(), self.is_dirty(), self.is_fresh()) {
            (true, false, false) => false,
            (false, false, true) => false,
            (true, true, true) => false,
            _ => true,
        }
    }
}

impl Default for CacheEntry {
    fn default() -> Self {
        Self::new(Coin::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::{Amount, ScriptBuf, TxOut};

    fn unspent_coin() -> Coin {
        Coin::new(
            TxOut {
                value: Amount::from_sat(1_000),
                script_pubkey: ScriptBuf::from_bytes(vec![0x51]),
            },
            7,
            false,
        )
    }

    #[test]
    fn test_five_legal_flag_combinations() {
        let spent = Coin::default();
        let live = unspent_coin();
        let cases = [
            (live.clone(), EntryFlags::empty(), true),
            (live.clone(), EntryFlags::DIRTY, true),
            (live.clone(), EntryFlags::DIRTY | EntryFlags::FRESH, true),
            (live, EntryFlags::FRESH, false),
            (spent.clone(), EntryFlags::empty(), false),
            (spent.clone(), EntryFlags::DIRTY, true),
            (spent.clone(), EntryFlags::FRESH, true),
            (spent, EntryFlags::DIRTY | EntryFlags::FRESH, false),
        ];
        for (coin, flags, sane) in cases {
            assert_eq!(CacheEntry::with_flags(coin, flags).is_sane(), sane);
        }
    }
}
