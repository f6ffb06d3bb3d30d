//! Canonical market data messages
//!
//! Every exchange adapter normalizes its native payloads into
//! [`CanonicalMessage`]; the synchronizer never sees exchange wire formats.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::MarketDataError;
use crate::orderbook::PriceLevel;

/// One tradeable instrument on one exchange (e.g. "BTCUSDT")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MarketId(String);

impl MarketId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MarketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MarketId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for MarketId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// What a message means for the book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Full replacement of both sides, valid as of `sequence`
    Snapshot,
    /// Incremental upserts/deletes; the book reaches `sequence` after applying it
    Diff,
    /// A single print. Carries one level: in `bids` for a taker buy, in
    /// `asks` for a taker sell.
    Trade,
}

/// Exchange-agnostic order book message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalMessage {
    pub market: MarketId,
    pub kind: MessageKind,
    pub sequence: u64,
    /// First exchange update id covered by a diff, for exchanges that batch
    /// several updates into one event. `None` means the diff covers exactly
    /// `sequence`.
    pub first_sequence: Option<u64>,
    pub timestamp: DateTime<Utc>,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

impl CanonicalMessage {
    pub fn snapshot(
        market: impl Into<MarketId>,
        sequence: u64,
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
    ) -> Self {
        Self {
            market: market.into(),
            kind: MessageKind::Snapshot,
            sequence,
            first_sequence: None,
            timestamp: Utc::now(),
            bids,
            asks,
        }
    }

    pub fn diff(
        market: impl Into<MarketId>,
        sequence: u64,
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
    ) -> Self {
        Self {
            market: market.into(),
            kind: MessageKind::Diff,
            sequence,
            first_sequence: None,
            timestamp: Utc::now(),
            bids,
            asks,
        }
    }

    pub fn trade(market: impl Into<MarketId>, level: PriceLevel, taker_buy: bool) -> Self {
        let (bids, asks) = if taker_buy {
            (vec![level], Vec::new())
        } else {
            (Vec::new(), vec![level])
        };
        Self {
            market: market.into(),
            kind: MessageKind::Trade,
            sequence: 0,
            first_sequence: None,
            timestamp: Utc::now(),
            bids,
            asks,
        }
    }

    pub fn with_first_sequence(mut self, first_sequence: u64) -> Self {
        self.first_sequence = Some(first_sequence);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Whether this diff continues a book that last applied `last_applied`.
    ///
    /// Assumes `self.sequence > last_applied` has already been checked.
    pub fn is_contiguous_after(&self, last_applied: u64) -> bool {
        self.first_sequence.unwrap_or(self.sequence) <= last_applied.saturating_add(1)
    }

    /// The traded level of a trade message
    pub fn trade_level(&self) -> Option<&PriceLevel> {
        self.bids.first().or_else(|| self.asks.first())
    }

    /// Reject messages an adapter should never have produced
    pub fn validate(&self) -> Result<(), MarketDataError> {
        if self.market.as_str().is_empty() {
            return Err(MarketDataError::MalformedMessage(
                "empty market id".to_string(),
            ));
        }

        for level in self.bids.iter().chain(self.asks.iter()) {
            if level.price <= Decimal::ZERO {
                return Err(MarketDataError::MalformedMessage(format!(
                    "{}: non-positive price {}",
                    self.market, level.price
                )));
            }
            if level.quantity < Decimal::ZERO {
                return Err(MarketDataError::MalformedMessage(format!(
                    "{}: negative quantity {} at {}",
                    self.market, level.quantity, level.price
                )));
            }
        }

        match self.kind {
            MessageKind::Diff => {
                if let Some(first) = self.first_sequence {
                    if first > self.sequence {
                        return Err(MarketDataError::MalformedMessage(format!(
                            "{}: first sequence {} after final sequence {}",
                            self.market, first, self.sequence
                        )));
                    }
                }
            }
            MessageKind::Trade => {
                let levels = self.bids.len() + self.asks.len();
                let positive = self
                    .trade_level()
                    .map(|l| l.quantity > Decimal::ZERO)
                    .unwrap_or(false);
                if levels != 1 || !positive {
                    return Err(MarketDataError::MalformedMessage(format!(
                        "{}: trade must carry exactly one positive level",
                        self.market
                    )));
                }
            }
            MessageKind::Snapshot => {}
        }

        Ok(())
    }
}
