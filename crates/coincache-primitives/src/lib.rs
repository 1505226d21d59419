//! Primitive types shared by the coincache crates.
//!
//! The [`Coin`] record is the unit the UTXO caches move around; the
//! [`memusage`] module estimates the heap footprint of the dynamically
//! allocated parts so the surrounding node can make eviction decisions.

mod coin;
pub mod memusage;

pub use coin::Coin;

use bitcoin::Script;

/// The maximum allowed weight of a block.
pub const MAX_BLOCK_WEIGHT: u64 = 4_000_000;

/// Scale factor between virtual size and weight.
pub const WITNESS_SCALE_FACTOR: u64 = 4;

/// Scripts longer than this are provably unspendable.
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Weight of the smallest possible transaction output: an 8-byte value and a
/// one-byte empty script, scaled up from serialized size.
const MIN_TRANSACTION_OUTPUT_WEIGHT: u64 = WITNESS_SCALE_FACTOR * 9;

/// Conservative upper bound on the number of outputs a single block can
/// create. Used to bound scans over the output indices of a txid.
pub const MAX_OUTPUTS_PER_BLOCK: u32 =
    (MAX_BLOCK_WEIGHT / MIN_TRANSACTION_OUTPUT_WEIGHT) as u32;

/// Whether a locking script can never be satisfied, so the output it guards
/// consumes no UTXO-set resources.
pub fn script_is_unspendable(script: &Script) -> bool {
    script.is_op_return() || script.len() > MAX_SCRIPT_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::ScriptBuf;

    #[test]
    fn test_max_outputs_per_block() {
        // 4_000_000 weight units / 36 per output.
        assert_eq!(MAX_OUTPUTS_PER_BLOCK, 111_111);
    }

    #[test]
    fn test_unspendable_scripts() {
        let op_return = ScriptBuf::from_bytes(vec![0x6a]);
        assert!(script_is_unspendable(&op_return));

        let oversized = ScriptBuf::from_bytes(vec![0x51; MAX_SCRIPT_SIZE + 1]);
        assert!(script_is_unspendable(&oversized));

        let p2pk_like = ScriptBuf::from_bytes(vec![0x51]);
        assert!(!script_is_unspendable(&p2pk_like));
    }
}
