//! Type conversion and formatting utilities.
//!
//! Amounts travel through the pipeline as `U256` wei. They only become
//! `BigDecimal` token units at the read-model boundary, so sums stay exact.

use alloy::primitives::{hex, U256};
use bigdecimal::BigDecimal;
use num_bigint::BigInt;
use once_cell::sync::Lazy;

/// Decimals used by both the staked native asset and the reward token.
const TOKEN_DECIMALS: u8 = 18;

// ============================================
// Hex Encoding
// ============================================

/// Encode bytes as a lowercase hex string with 0x prefix.
pub fn hex_encode(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

// ============================================
// U256 Conversions
// ============================================

/// Convert a raw integer amount to token units as an exact `BigDecimal`.
fn u256_to_units(value: U256, decimals: u8) -> BigDecimal {
    // Convert U256 to BigDecimal via bytes (faster than string parsing)
    let bytes: [u8; 32] = value.to_le_bytes();
    let big_int = BigInt::from_bytes_le(num_bigint::Sign::Plus, &bytes);
    BigDecimal::from(big_int) / big_pow10(decimals)
}

/// Convert a wei amount to ether units.
///
/// # Example
/// ```ignore
/// let value = U256::from(1_500_000_000_000_000_000u128);
/// assert_eq!(wei_to_ether(value), BigDecimal::from_str("1.5").unwrap());
/// ```
pub fn wei_to_ether(value: U256) -> BigDecimal {
    u256_to_units(value, TOKEN_DECIMALS)
}

/// Render a wei amount in ether units without trailing zeros (`1.5`, `1000`, `0`).
pub fn format_ether(value: U256) -> String {
    let unit = U256::from(10u64).pow(U256::from(TOKEN_DECIMALS));
    let int = value / unit;
    let frac = value % unit;

    if frac.is_zero() {
        return int.to_string();
    }

    let frac = format!("{:0>width$}", frac.to_string(), width = TOKEN_DECIMALS as usize);
    format!("{}.{}", int, frac.trim_end_matches('0'))
}

/// Parse a base-10 integer string as produced by the event normalizer.
pub fn parse_u256(value: &str) -> Option<U256> {
    U256::from_str_radix(value, 10).ok()
}

// ============================================
// Internal Helpers
// ============================================

static POW10_CACHE: Lazy<[BigDecimal; 25]> =
    Lazy::new(|| std::array::from_fn(|i| BigDecimal::from(BigInt::from(10u32).pow(i as u32))));

/// Compute 10^exp as BigDecimal.
pub(crate) fn big_pow10(exp: u8) -> BigDecimal {
    if (exp as usize) < POW10_CACHE.len() {
        POW10_CACHE[exp as usize].clone()
    } else {
        BigDecimal::from(BigInt::from(10u32).pow(exp as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    const ETHER: u128 = 1_000_000_000_000_000_000;

    #[test]
    fn wei_converts_exactly() {
        let half = U256::from(ETHER / 2);
        assert_eq!(wei_to_ether(half), BigDecimal::from_str("0.5").unwrap());
        assert_eq!(wei_to_ether(U256::ZERO), BigDecimal::from(0));
    }

    #[test]
    fn format_strips_trailing_zeros() {
        assert_eq!(format_ether(U256::from(ETHER + ETHER / 2)), "1.5");
        assert_eq!(format_ether(U256::from(1000 * ETHER)), "1000");
        assert_eq!(format_ether(U256::ZERO), "0");
        assert_eq!(format_ether(U256::from(1u64)), "0.000000000000000001");
    }

    #[test]
    fn parse_decimal_strings() {
        assert_eq!(parse_u256("42"), Some(U256::from(42u64)));
        assert_eq!(parse_u256("0x2a"), None);
    }

    #[test]
    fn hex_is_lowercase_prefixed() {
        assert_eq!(hex_encode(&[0xAB, 0x01]), "0xab01");
    }
}
