//! Single-writer, many-reader access to a book
//!
//! The owning synchronizer holds the only write path. Everyone else gets
//! copies taken under a brief read lock, never a live reference.

use parking_lot::{RwLock, RwLockWriteGuard};
use rust_decimal::Decimal;
use std::sync::Arc;

use super::{BookView, PriceLevel, PriceLevelBook, Side, VolumeQuote};
use crate::message::MarketId;

#[derive(Debug, Clone)]
pub struct SharedBook {
    inner: Arc<RwLock<PriceLevelBook>>,
}

impl SharedBook {
    pub fn new(market: MarketId) -> Self {
        Self {
            inner: Arc::new(RwLock::new(PriceLevelBook::new(market))),
        }
    }

    /// Write access for the owning synchronizer
    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, PriceLevelBook> {
        self.inner.write()
    }

    pub fn snapshot_view(&self) -> BookView {
        self.inner.read().snapshot_view()
    }

    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.inner.read().best_bid()
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.inner.read().best_ask()
    }

    pub fn last_applied_sequence(&self) -> u64 {
        self.inner.read().last_applied_sequence()
    }

    pub fn price_for_volume(&self, side: Side, target: Decimal) -> Option<VolumeQuote> {
        self.inner.read().price_for_volume(side, target)
    }
}
