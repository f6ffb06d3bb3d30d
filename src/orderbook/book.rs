//! Core order book implementation
//!
//! Uses BTreeMap for efficient sorted price level management. The book is
//! a pure mutator: sequencing policy lives in the synchronizer.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use thiserror::Error;

use super::{BookMetrics, BookView, PriceLevel, Side};
use crate::message::MarketId;

/// Caller contract violations. A rejected call leaves the book untouched.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BookError {
    #[error("negative quantity {quantity} at price {price}")]
    NegativeQuantity { price: Decimal, quantity: Decimal },

    #[error("non-positive price {0}")]
    NonPositivePrice(Decimal),
}

/// Result of walking one side of the book for a target volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeQuote {
    /// Price of the last level needed to reach the target
    pub price: Decimal,
    /// Cumulative volume of the levels walked (>= target)
    pub volume: Decimal,
    /// Volume-weighted average price for exactly the target volume
    pub vwap: Decimal,
}

/// Order book for a single market
#[derive(Debug)]
pub struct PriceLevelBook {
    market: MarketId,
    /// Bids sorted by price descending (highest first)
    bids: BTreeMap<Reverse<Decimal>, Decimal>,
    /// Asks sorted by price ascending (lowest first)
    asks: BTreeMap<Decimal, Decimal>,
    /// Sequence of the most recently applied snapshot or diff
    last_applied_sequence: u64,
    /// Timestamp of last update
    last_update_time: Option<DateTime<Utc>>,
    last_trade_price: Option<Decimal>,
}

impl PriceLevelBook {
    /// Create a new empty order book
    pub fn new(market: MarketId) -> Self {
        Self {
            market,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_applied_sequence: 0,
            last_update_time: None,
            last_trade_price: None,
        }
    }

    pub fn market(&self) -> &MarketId {
        &self.market
    }

    /// Replace both sides wholesale. Zero-quantity levels are filtered out.
    pub fn apply_snapshot(
        &mut self,
        bids: &[PriceLevel],
        asks: &[PriceLevel],
        sequence: u64,
    ) -> Result<(), BookError> {
        check_levels(bids)?;
        check_levels(asks)?;

        self.bids.clear();
        self.asks.clear();

        for level in bids {
            if level.quantity > Decimal::ZERO {
                self.bids.insert(Reverse(level.price), level.quantity);
            }
        }

        for level in asks {
            if level.quantity > Decimal::ZERO {
                self.asks.insert(level.price, level.quantity);
            }
        }

        self.last_applied_sequence = sequence;
        self.last_update_time = Some(Utc::now());
        Ok(())
    }

    /// Upsert or delete (quantity == 0) the given levels.
    ///
    /// The caller is responsible for ordering: `sequence` is recorded as-is.
    pub fn apply_diff(
        &mut self,
        bids: &[PriceLevel],
        asks: &[PriceLevel],
        sequence: u64,
    ) -> Result<(), BookError> {
        check_levels(bids)?;
        check_levels(asks)?;

        for level in bids {
            self.update_side(Side::Bid, level);
        }

        for level in asks {
            self.update_side(Side::Ask, level);
        }

        self.last_applied_sequence = sequence;
        self.last_update_time = Some(Utc::now());
        Ok(())
    }

    /// Update a single price level
    fn update_side(&mut self, side: Side, level: &PriceLevel) {
        match side {
            Side::Bid => {
                if level.quantity == Decimal::ZERO {
                    self.bids.remove(&Reverse(level.price));
                } else {
                    self.bids.insert(Reverse(level.price), level.quantity);
                }
            }
            Side::Ask => {
                if level.quantity == Decimal::ZERO {
                    self.asks.remove(&level.price);
                } else {
                    self.asks.insert(level.price, level.quantity);
                }
            }
        }
    }

    pub fn record_trade(&mut self, price: Decimal, timestamp: DateTime<Utc>) {
        self.last_trade_price = Some(price);
        self.last_update_time = Some(timestamp);
    }

    /// Get best bid level
    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids
            .first_key_value()
            .map(|(Reverse(p), q)| PriceLevel::new(*p, *q))
    }

    /// Get best ask level
    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks
            .first_key_value()
            .map(|(p, q)| PriceLevel::new(*p, *q))
    }

    /// Get mid price
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid.price + ask.price) / Decimal::from(2)),
            _ => None,
        }
    }

    /// Get spread in basis points
    pub fn spread_bps(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask(), self.mid_price()) {
            (Some(bid), Some(ask), Some(mid)) if mid > Decimal::ZERO => {
                Some((ask.price - bid.price) / mid * Decimal::from(10000))
            }
            _ => None,
        }
    }

    /// Calculate order book imbalance at top N levels
    pub fn imbalance(&self, levels: usize) -> Option<Decimal> {
        let bid_volume: Decimal = self.bids.iter().take(levels).map(|(_, q)| q).sum();
        let ask_volume: Decimal = self.asks.iter().take(levels).map(|(_, q)| q).sum();

        let total = bid_volume + ask_volume;
        if total > Decimal::ZERO {
            Some((bid_volume - ask_volume) / total)
        } else {
            None
        }
    }

    /// Calculate weighted imbalance (closer to mid weighted more)
    pub fn weighted_imbalance(&self, levels: usize, decay: Decimal) -> Option<Decimal> {
        let weigh = |quantities: &mut dyn Iterator<Item = Decimal>| -> Decimal {
            let mut weight = Decimal::ONE;
            let mut total = Decimal::ZERO;
            for q in quantities.take(levels) {
                total += q * weight;
                weight *= decay;
            }
            total
        };

        let bid_weighted = weigh(&mut self.bids.values().copied());
        let ask_weighted = weigh(&mut self.asks.values().copied());

        let total = bid_weighted + ask_weighted;
        if total > Decimal::ZERO {
            Some((bid_weighted - ask_weighted) / total)
        } else {
            None
        }
    }

    /// Walk `side` best-first until `target` volume is covered.
    ///
    /// `Side::Ask` answers "what does buying `target` cost", `Side::Bid`
    /// "what does selling it fetch". `None` when the side is too thin.
    pub fn price_for_volume(&self, side: Side, target: Decimal) -> Option<VolumeQuote> {
        if target <= Decimal::ZERO {
            return None;
        }

        let levels: Box<dyn Iterator<Item = (Decimal, Decimal)> + '_> = match side {
            Side::Bid => Box::new(self.bids.iter().map(|(Reverse(p), q)| (*p, *q))),
            Side::Ask => Box::new(self.asks.iter().map(|(p, q)| (*p, *q))),
        };

        let mut volume = Decimal::ZERO;
        let mut cost = Decimal::ZERO;
        for (price, quantity) in levels {
            let take = quantity.min(target - volume);
            cost += take * price;
            volume += quantity;
            if volume >= target {
                return Some(VolumeQuote {
                    price,
                    volume,
                    vwap: cost / target,
                });
            }
        }

        None
    }

    /// Get last applied sequence
    pub fn last_applied_sequence(&self) -> u64 {
        self.last_applied_sequence
    }

    pub fn last_trade_price(&self) -> Option<Decimal> {
        self.last_trade_price
    }

    pub fn bid_levels(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_levels(&self) -> usize {
        self.asks.len()
    }

    /// Immutable copy of the current state for readers
    pub fn snapshot_view(&self) -> BookView {
        BookView {
            market: self.market.clone(),
            timestamp: self.last_update_time,
            last_applied_sequence: self.last_applied_sequence,
            bids: self
                .bids
                .iter()
                .map(|(Reverse(p), q)| PriceLevel::new(*p, *q))
                .collect(),
            asks: self
                .asks
                .iter()
                .map(|(p, q)| PriceLevel::new(*p, *q))
                .collect(),
            last_trade_price: self.last_trade_price,
            metrics: self.calculate_metrics(),
        }
    }

    /// Calculate order book metrics
    fn calculate_metrics(&self) -> BookMetrics {
        BookMetrics {
            mid_price: self.mid_price(),
            spread_bps: self.spread_bps(),
            imbalance: self.imbalance(5),
            weighted_imbalance: self.weighted_imbalance(10, Decimal::new(9, 1)),
            bid_depth: self.bids.values().copied().sum(),
            ask_depth: self.asks.values().copied().sum(),
            bid_levels: self.bids.len(),
            ask_levels: self.asks.len(),
        }
    }
}

fn check_levels(levels: &[PriceLevel]) -> Result<(), BookError> {
    for level in levels {
        if level.price <= Decimal::ZERO {
            return Err(BookError::NonPositivePrice(level.price));
        }
        if level.quantity < Decimal::ZERO {
            return Err(BookError::NegativeQuantity {
                price: level.price,
                quantity: level.quantity,
            });
        }
    }
    Ok(())
}
