//! The UTXO record stored by the coins views.

use crate::memusage;
use bitcoin::{Amount, ScriptBuf, TxOut};

/// An unspent transaction output.
///
/// Carries the output itself together with the metadata consensus cares
/// about: the height of the block that created it and whether that block's
/// coinbase transaction did.
///
/// A `Coin` can also represent the *spent* state: an output with an empty
/// locking script is the sentinel for "no unspent record". [`Coin::clear`]
/// moves a coin into that state while retaining height and coinbase flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coin {
    /// The unspent output.
    pub output: TxOut,
    /// Block height at which the containing transaction was included.
    pub height: u32,
    /// Whether the containing transaction was a coinbase.
    pub is_coinbase: bool,
}

impl Coin {
    /// Create a coin from an owned output.
    pub fn new(output: TxOut, height: u32, is_coinbase: bool) -> Self {
        Self {
            output,
            height,
            is_coinbase,
        }
    }

    /// Create a coin from a transaction output reference.
    pub fn from_txout(output: &TxOut, height: u32, is_coinbase: bool) -> Self {
        Self::new(output.clone(), height, is_coinbase)
    }

    /// Whether this record is the spent sentinel.
    pub fn is_spent(&self) -> bool {
        self.output.script_pubkey.is_empty()
    }

    /// Turn this coin into the spent sentinel.
    ///
    /// Height and coinbase flag are retained; only the output is voided.
    pub fn clear(&mut self) {
        self.output = spent_txout();
    }

    /// Heap bytes owned by this coin, i.e. the locking script allocation.
    pub fn dynamic_memory_usage(&self) -> usize {
        memusage::malloc_usage(self.output.script_pubkey.len())
    }
}

impl Default for Coin {
    /// The spent sentinel.
    fn default() -> Self {
        Self {
            output: spent_txout(),
            height: 0,
            is_coinbase: false,
        }
    }
}

fn spent_txout() -> TxOut {
    TxOut {
        value: Amount::ZERO,
        script_pubkey: ScriptBuf::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_coin() -> Coin {
        Coin::new(
            TxOut {
                value: Amount::from_sat(5_000_000_000),
                script_pubkey: ScriptBuf::from_bytes(vec![0x51]),
            },
            100,
            true,
        )
    }

    #[test]
    fn test_spent_sentinel() {
        let mut coin = test_coin();
        assert!(!coin.is_spent());

        coin.clear();
        assert!(coin.is_spent());
        // Clearing voids the output but keeps the metadata.
        assert_eq!(coin.height, 100);
        assert!(coin.is_coinbase);

        assert!(Coin::default().is_spent());
    }

    #[test]
    fn test_dynamic_memory_usage_tracks_script() {
        let coin = test_coin();
        assert_eq!(
            coin.dynamic_memory_usage(),
            memusage::malloc_usage(coin.output.script_pubkey.len())
        );

        let mut spent = coin;
        spent.clear();
        assert_eq!(spent.dynamic_memory_usage(), 0);
    }
}
