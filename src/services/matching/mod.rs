//! Order Matching Module
//!
//! In-memory price-time-priority matching for binary markets.
//!
//! # Architecture
//!
//! ```text
//! OrderService (saga)
//!   ↓
//! MatchingEngine (per-market matching, direct + cross)
//!   └→ OrderBook (four-sided: YES bids/asks, NO bids/asks)
//! ```
//!
//! The engine has no suspension points and never touches the store; the
//! order saga persists whatever the engine returns.

mod engine;
mod orderbook;
mod types;

pub use engine::MatchingEngine;
pub use orderbook::OrderBook;
pub use types::*;
