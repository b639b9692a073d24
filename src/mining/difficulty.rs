//! Difficulty schedule for the parent chain.
//!
//! All arithmetic runs over unbounded integers; the final difficulty written
//! into a block must fit 53 bits, which callers enforce by retrying with a
//! later timestamp.

use num_bigint::{BigInt, BigUint};

const MINIMUM_DIFFICULTY_U64: u64 = 0x0011_8019_7202_9393;

/// Largest difficulty representable in a block (2^53 - 1).
pub const MAX_SAFE_DIFFICULTY: u64 = 9_007_199_254_740_991;

/// Network floor for difficulty.
pub fn minimum_difficulty() -> BigUint {
    BigUint::from(MINIMUM_DIFFICULTY_U64)
}

/// Next pre-exponent difficulty.
///
/// `now` and `prev_ts` are milliseconds. `new_block_count` is the number of
/// chains that contributed a fresh tip since the previous block.
pub fn get_diff(
    now: u64,
    prev_ts: u64,
    prev_distance: &BigUint,
    min_diff: &BigUint,
    new_block_count: u64,
) -> BigUint {
    let mut elapsed = now as i64 - prev_ts as i64;
    let bonus = elapsed + (elapsed - 4) * new_block_count as i64;
    if bonus > 0 {
        elapsed = bonus;
    }

    let x = (1 - elapsed.div_euclid(6)).max(-99);
    let y = prev_distance / 148u32;

    let result = BigInt::from(prev_distance.clone()) + BigInt::from(x) * BigInt::from(y);
    let floor = BigInt::from(min_diff.clone());
    let result = if result < floor { floor } else { result };
    result
        .to_biguint()
        .unwrap_or_else(|| min_diff.clone())
}

/// Emission-period adjustment: past the second period the difficulty gains an
/// exponential term.
pub fn get_exp_factor_diff(diff: BigUint, parent_height: u64) -> BigUint {
    let period = (parent_height + 1) / 66_000_000;
    if period > 2 {
        let exponent = (period - 2) as u32;
        return diff + BigUint::from(2u8).pow(exponent);
    }
    diff
}
