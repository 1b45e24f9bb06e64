//! Fixed-point helpers
//!
//! Proportional shares are `floor(a * b / c)` over `u128` amounts. The
//! product of a block reward and a weight easily exceeds 128 bits, so the
//! intermediate is carried as a `U256` and the quotient narrowed back.

use crate::types::Amount;
use primitive_types::U256;

/// Multipliers are applied in parts per million
pub const MULTIPLIER_SCALE: u128 = 1_000_000;

/// `floor(a * b / c)`, `None` when `c == 0` or the quotient exceeds `u128`
pub fn mul_div_floor(a: u128, b: u128, c: u128) -> Option<u128> {
    if c == 0 {
        return None;
    }
    // u128 * u128 always fits in 256 bits
    let quotient = U256::from(a) * U256::from(b) / U256::from(c);
    if quotient > U256::from(u128::MAX) {
        return None;
    }
    Some(quotient.low_u128())
}

/// Convert a multiplier factor to parts per million
///
/// Negative, NaN and infinite factors are rejected.
pub fn multiplier_to_ppm(factor: f64) -> Option<u128> {
    if !factor.is_finite() || factor < 0.0 {
        return None;
    }
    Some((factor * MULTIPLIER_SCALE as f64).round() as u128)
}

/// Scale an amount by a parts-per-million multiplier, rounding down
pub fn apply_multiplier(base: Amount, ppm: u128) -> Amount {
    mul_div_floor(base, ppm, MULTIPLIER_SCALE).unwrap_or(Amount::MAX)
}

/// Signed difference `new - old`, saturating at the `i128` range
pub fn power_delta(old: Amount, new: Amount) -> i128 {
    if new >= old {
        i128::try_from(new - old).unwrap_or(i128::MAX)
    } else {
        i128::try_from(old - new).map(|d| -d).unwrap_or(i128::MIN)
    }
}

/// Add a signed delta to an amount, saturating at zero and `Amount::MAX`
pub fn apply_delta(value: Amount, delta: i128) -> Amount {
    if delta >= 0 {
        value.saturating_add(delta as u128)
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}
