//! Market data source capability
//!
//! Exchange adapters implement [`MarketDataSource`]; the engine only ever
//! talks to this trait and never branches on exchange identity.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::message::{CanonicalMessage, MarketId};

/// One exchange's snapshot endpoint and streaming connection
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Fetch a full book snapshot (a `MessageKind::Snapshot` message).
    async fn get_snapshot(&self, market: &MarketId) -> Result<CanonicalMessage>;

    /// Markets the source wants tracked at startup
    async fn initial_markets(&self) -> Result<Vec<MarketId>>;

    /// Push diffs and trades for `markets` into `sink` until `cancel` fires.
    async fn stream(
        &self,
        markets: Vec<MarketId>,
        sink: MessageSink,
        cancel: CancellationToken,
    ) -> Result<()>;
}

/// Producer side of the router's inbound stream.
///
/// Sending never blocks: if the router falls behind, the oldest pending
/// messages are overwritten and the router counts the loss.
#[derive(Debug, Clone)]
pub struct MessageSink {
    tx: broadcast::Sender<CanonicalMessage>,
}

impl MessageSink {
    pub(crate) fn new(tx: broadcast::Sender<CanonicalMessage>) -> Self {
        Self { tx }
    }

    /// Returns false once the router has shut down
    pub fn send(&self, message: CanonicalMessage) -> bool {
        self.tx.send(message).is_ok()
    }
}
