// =============================================================================
// Binance Futures REST access
// =============================================================================

pub mod client;

pub use client::{DepthSnapshot, FuturesRest};
