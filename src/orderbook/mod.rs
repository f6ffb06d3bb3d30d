//! Order book module
//!
//! The price-level book, its concurrent read accessor and the immutable
//! views handed to readers.

mod book;
mod metrics;
mod shared;

pub use book::{BookError, PriceLevelBook, VolumeQuote};
pub use metrics::BookMetrics;
pub use shared::SharedBook;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::message::MarketId;

/// Side of the order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Bid,
    Ask,
}

/// A single level in the order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, quantity: Decimal) -> Self {
        Self { price, quantity }
    }
}

/// Point-in-time copy of a book, safe to hold while the writer moves on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookView {
    pub market: MarketId,
    pub timestamp: Option<DateTime<Utc>>,
    pub last_applied_sequence: u64,
    /// Best first (descending)
    pub bids: Vec<PriceLevel>,
    /// Best first (ascending)
    pub asks: Vec<PriceLevel>,
    pub last_trade_price: Option<Decimal>,
    pub metrics: BookMetrics,
}
