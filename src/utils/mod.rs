//! Utility functions for the stake indexer.
//!
//! - [`conversion`] - U256 amounts, ether formatting, hex encoding
//! - [`retry`] - Exponential backoff with cancellation

mod conversion;
mod retry;

// ============================================
// Re-exports
// ============================================

pub use conversion::{format_ether, hex_encode, parse_u256, wei_to_ether};
pub use retry::Backoff;
