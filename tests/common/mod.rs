//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use prometheus::Registry;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use orderbook_sync::{
    CanonicalMessage, MarketDataError, MarketDataSource, MarketId, MessageSink, PriceLevel,
    Result, TrackerRouter, TrackerSettings, Unlimited,
};

type Feed = Arc<AsyncMutex<mpsc::UnboundedReceiver<Result<CanonicalMessage>>>>;

/// Snapshot source driven by the test: each `get_snapshot` call waits until
/// the test releases a response for that market.
#[derive(Default)]
pub struct ScriptedSource {
    senders: Mutex<HashMap<MarketId, mpsc::UnboundedSender<Result<CanonicalMessage>>>>,
    feeds: Mutex<HashMap<MarketId, Feed>>,
    calls: Mutex<HashMap<MarketId, usize>>,
}

impl ScriptedSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn ensure(&self, market: &MarketId) -> Feed {
        let mut feeds = self.feeds.lock();
        feeds
            .entry(market.clone())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                self.senders.lock().insert(market.clone(), tx);
                Arc::new(AsyncMutex::new(rx))
            })
            .clone()
    }

    /// Answer the next (or a pending) snapshot request for the message's market
    pub fn release(&self, snapshot: CanonicalMessage) {
        let market = snapshot.market.clone();
        self.ensure(&market);
        if let Some(tx) = self.senders.lock().get(&market) {
            let _ = tx.send(Ok(snapshot));
        }
    }

    pub fn fail(&self, market: &str, error: MarketDataError) {
        let market = MarketId::from(market);
        self.ensure(&market);
        if let Some(tx) = self.senders.lock().get(&market) {
            let _ = tx.send(Err(error));
        }
    }

    pub fn snapshot_calls(&self, market: &str) -> usize {
        self.calls
            .lock()
            .get(&MarketId::from(market))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl MarketDataSource for ScriptedSource {
    async fn get_snapshot(&self, market: &MarketId) -> Result<CanonicalMessage> {
        *self.calls.lock().entry(market.clone()).or_insert(0) += 1;
        let feed = self.ensure(market);
        let mut rx = feed.lock().await;
        rx.recv()
            .await
            .unwrap_or_else(|| Err(MarketDataError::RestApiError("feed closed".to_string())))
    }

    async fn initial_markets(&self) -> Result<Vec<MarketId>> {
        Ok(Vec::new())
    }

    async fn stream(
        &self,
        _markets: Vec<MarketId>,
        _sink: MessageSink,
        cancel: CancellationToken,
    ) -> Result<()> {
        cancel.cancelled().await;
        Ok(())
    }
}

pub fn fast_settings() -> TrackerSettings {
    TrackerSettings {
        snapshot_retry_delay: Duration::from_millis(10),
        supervision_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

pub fn spawn_router(source: Arc<ScriptedSource>, settings: TrackerSettings) -> TrackerRouter {
    TrackerRouter::spawn(source, Arc::new(Unlimited), settings, &Registry::new())
        .expect("router should start")
}

pub fn bid_diff(market: &str, sequence: u64, price: i64, quantity: i64) -> CanonicalMessage {
    CanonicalMessage::diff(
        market,
        sequence,
        vec![PriceLevel::new(Decimal::from(price), Decimal::from(quantity))],
        vec![],
    )
}

pub fn snapshot(market: &str, sequence: u64) -> CanonicalMessage {
    CanonicalMessage::snapshot(
        market,
        sequence,
        vec![PriceLevel::new(Decimal::from(100), Decimal::ONE)],
        vec![PriceLevel::new(Decimal::from(101), Decimal::ONE)],
    )
}

/// Poll `condition` for up to two seconds
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
