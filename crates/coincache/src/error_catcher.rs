//! Shutdown adapter for base read failures.

use crate::{CoinsMap, CoinsView, Error, Result};
use bitcoin::{BlockHash, OutPoint};
use coincache_primitives::Coin;

/// Wraps a base view and turns read failures into a clean process shutdown.
///
/// A failed database read must not surface as "coin not found": the two are
/// indistinguishable to the caller, and treating an I/O error as an absence
/// would silently desynchronise the validator from the ledger. Instead the
/// catcher runs every registered shutdown callback, logs the failure and
/// terminates the process; writes are atomic in the base, so nothing is left
/// half-applied.
pub struct CoinsViewErrorCatcher<'a> {
    base: &'a mut dyn CoinsView,
    err_callbacks: Vec<Box<dyn Fn()>>,
}

impl<'a> CoinsViewErrorCatcher<'a> {
    pub fn new(base: &'a mut dyn CoinsView) -> Self {
        Self {
            base,
            err_callbacks: Vec::new(),
        }
    }

    /// Register a callback to run before the process terminates on a read
    /// error. Callbacks run in registration order.
    pub fn add_read_err_callback(&mut self, callback: Box<dyn Fn()>) {
        self.err_callbacks.push(callback);
    }

    fn on_read_error(&self, error: &Error) -> ! {
        for callback in &self.err_callbacks {
            callback();
        }
        tracing::error!(target: "utxocache", "Error reading from database: {error}");
        // Starting a shutdown sequence and returning an error upward could
        // still be misread as "entry not found" somewhere. Exit immediately:
        // nothing can continue from here, and all writes are atomic.
        std::process::abort();
    }
}

impl CoinsView for CoinsViewErrorCatcher<'_> {
    fn get_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>> {
        match self.base.get_coin(outpoint) {
            Ok(coin) => Ok(coin),
            Err(error) => self.on_read_error(&error),
        }
    }

    fn have_coin(&mut self, outpoint: &OutPoint) -> Result<bool> {
        match self.base.have_coin(outpoint) {
            Ok(have) => Ok(have),
            Err(error) => self.on_read_error(&error),
        }
    }

    fn best_block(&mut self) -> BlockHash {
        self.base.best_block()
    }

    fn head_blocks(&mut self) -> Vec<BlockHash> {
        self.base.head_blocks()
    }

    fn batch_write(
        &mut self,
        coins: &mut CoinsMap,
        best_block: BlockHash,
        erase: bool,
    ) -> Result<()> {
        self.base.batch_write(coins, best_block, erase)
    }

    fn estimate_size(&mut self) -> usize {
        self.base.estimate_size()
    }

    fn cursor(&mut self) -> Option<Box<dyn Iterator<Item = (OutPoint, Coin)> + '_>> {
        self.base.cursor()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CoinsViewCache, MemoryCoinsView};
    use bitcoin::hashes::Hash;
    use bitcoin::{Amount, ScriptBuf, Txid, TxOut};

    #[test]
    fn test_successful_reads_pass_through() {
        let outpoint = OutPoint {
            txid: Txid::from_byte_array([1; 32]),
            vout: 0,
        };
        let mut base = MemoryCoinsView::new();
        base.put_coin(
            outpoint,
            Coin::new(
                TxOut {
                    value: Amount::from_sat(100),
                    script_pubkey: ScriptBuf::from_bytes(vec![0x51]),
                },
                1,
                false,
            ),
        );

        let mut catcher = CoinsViewErrorCatcher::new(&mut base);
        catcher.add_read_err_callback(Box::new(|| unreachable!("no error expected")));
        assert!(catcher.have_coin(&outpoint).unwrap());

        // A cache stacks on the catcher like on any other view.
        let mut cache = CoinsViewCache::deterministic(&mut catcher);
        assert!(cache.have_coin(&outpoint).unwrap());
    }
}
