//! Fan-out from one inbound stream to per-market synchronizers
//!
//! A single control task owns the routing table. It applies tracking
//! changes, forwards each message to its market's queue and holds a small
//! side-buffer for markets that are not tracked (yet). Readers reach books
//! through a shared handle map and never talk to the control task.

use parking_lot::{Mutex, RwLock};
use prometheus::Registry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{
    BoundedBuffer, DropReason, MarketSynchronizer, SyncContext, TrackerMetrics, TrackerSettings,
};
use crate::admission::AdmissionControl;
use crate::error::{MarketDataError, Result};
use crate::message::{CanonicalMessage, MarketId};
use crate::orderbook::SharedBook;
use crate::source::{MarketDataSource, MessageSink};

/// Outcome of a tracking change
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackingChange {
    pub added: Vec<MarketId>,
    pub removed: Vec<MarketId>,
}

impl TrackingChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

enum Command {
    SetTracked {
        markets: Vec<MarketId>,
        ack: oneshot::Sender<TrackingChange>,
    },
}

/// What readers see of a tracked market
#[derive(Clone)]
struct MarketHandle {
    book: SharedBook,
    live_once: Arc<AtomicBool>,
}

type HandleMap = Arc<RwLock<HashMap<MarketId, MarketHandle>>>;

pub struct TrackerRouter {
    commands: mpsc::Sender<Command>,
    inbound: broadcast::Sender<CanonicalMessage>,
    handles: HandleMap,
    metrics: TrackerMetrics,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TrackerRouter {
    /// Start the control task. Must be called inside a tokio runtime.
    pub fn spawn(
        source: Arc<dyn MarketDataSource>,
        admission: Arc<dyn AdmissionControl>,
        settings: TrackerSettings,
        registry: &Registry,
    ) -> Result<Self> {
        let metrics = TrackerMetrics::new(registry)?;
        let (inbound, raw) = broadcast::channel(settings.router_capacity.max(1));
        let (commands, command_rx) = mpsc::channel(16);
        let handles: HandleMap = Arc::new(RwLock::new(HashMap::new()));
        let cancel = CancellationToken::new();

        let control = ControlLoop {
            side_buffers: HashMap::new(),
            running: HashMap::new(),
            retired: Vec::new(),
            handles: handles.clone(),
            metrics: metrics.clone(),
            cancel: cancel.clone(),
            ctx: SyncContext {
                source,
                admission,
                settings,
            },
        };
        let task = tokio::spawn(
            control
                .run(command_rx, raw)
                .instrument(info_span!("tracker_router")),
        );

        Ok(Self {
            commands,
            inbound,
            handles,
            metrics,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    /// Producer handle for market data sources
    pub fn sink(&self) -> MessageSink {
        MessageSink::new(self.inbound.clone())
    }

    /// Replace the tracked set. Returns once the change has been applied.
    pub async fn set_tracked_markets(&self, markets: Vec<MarketId>) -> Result<TrackingChange> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(Command::SetTracked { markets, ack })
            .await
            .map_err(|_| MarketDataError::RouterClosed)?;
        done.await.map_err(|_| MarketDataError::RouterClosed)
    }

    /// Read handles for every tracked market
    pub fn order_books(&self) -> HashMap<MarketId, SharedBook> {
        self.handles
            .read()
            .iter()
            .map(|(market, handle)| (market.clone(), handle.book.clone()))
            .collect()
    }

    pub fn book(&self, market: &MarketId) -> Option<SharedBook> {
        self.handles.read().get(market).map(|h| h.book.clone())
    }

    pub fn tracked_markets(&self) -> Vec<MarketId> {
        let mut markets: Vec<MarketId> = self.handles.read().keys().cloned().collect();
        markets.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        markets
    }

    /// True once every tracked market has been live at least once. False
    /// when nothing is tracked.
    pub fn ready(&self) -> bool {
        let handles = self.handles.read();
        !handles.is_empty()
            && handles
                .values()
                .all(|h| h.live_once.load(Ordering::Acquire))
    }

    pub fn metrics(&self) -> &TrackerMetrics {
        &self.metrics
    }

    /// Stop every synchronizer and the control task, then wait for them
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Tracker control task ended abnormally");
            }
        }
    }
}

impl Drop for TrackerRouter {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct RunningMarket {
    queue: broadcast::Sender<CanonicalMessage>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct ControlLoop {
    side_buffers: HashMap<MarketId, BoundedBuffer<CanonicalMessage>>,
    running: HashMap<MarketId, RunningMarket>,
    /// Cancelled synchronizers whose per-market series are removed once
    /// their task has ended
    retired: Vec<(MarketId, JoinHandle<()>)>,
    handles: HandleMap,
    metrics: TrackerMetrics,
    cancel: CancellationToken,
    ctx: SyncContext,
}

impl ControlLoop {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut raw: broadcast::Receiver<CanonicalMessage>,
    ) {
        let mut supervision = interval(self.ctx.settings.supervision_interval);
        supervision.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let cancel = self.cancel.clone();

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                Some(command) = commands.recv() => self.execute(command),

                received = raw.recv() => match received {
                    Ok(message) => self.route(message),
                    Err(RecvError::Lagged(missed)) => {
                        self.metrics.dropped_by(DropReason::RouterLag, missed);
                        warn!(missed, "Router inbound stream overflowed");
                    }
                    Err(RecvError::Closed) => break,
                },

                _ = supervision.tick() => self.supervise(),
            }
        }

        for (market, running) in self.running.drain() {
            running.cancel.cancel();
            if let Err(e) = running.task.await {
                warn!(market = %market, error = %e, "Synchronizer ended abnormally");
            }
        }
        for (_, task) in self.retired.drain(..) {
            let _ = task.await;
        }
        self.handles.write().clear();
        self.metrics.tracked_markets.set(0);
        info!("Tracker router stopped");
    }

    fn execute(&mut self, command: Command) {
        match command {
            Command::SetTracked { markets, ack } => {
                let change = self.set_tracked(markets);
                if !change.is_empty() {
                    info!(
                        added = ?change.added,
                        removed = ?change.removed,
                        tracked = self.running.len(),
                        "Tracked markets updated"
                    );
                }
                // caller may have given up waiting
                let _ = ack.send(change);
            }
        }
    }

    fn set_tracked(&mut self, markets: Vec<MarketId>) -> TrackingChange {
        let wanted: HashSet<MarketId> = markets.into_iter().collect();

        let mut removed: Vec<MarketId> = self
            .running
            .keys()
            .filter(|market| !wanted.contains(*market))
            .cloned()
            .collect();
        for market in &removed {
            self.stop(market);
        }

        let mut added = Vec::new();
        for market in wanted {
            if !self.running.contains_key(&market) {
                self.start(market.clone());
                added.push(market);
            }
        }

        added.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        removed.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        self.metrics.tracked_markets.set(self.running.len() as i64);
        TrackingChange { added, removed }
    }

    fn start(&mut self, market: MarketId) {
        let settings = &self.ctx.settings;
        let (queue, inbound) = broadcast::channel(settings.queue_capacity.max(1));

        let mut replayed = 0usize;
        if let Some(mut pending) = self.side_buffers.remove(&market) {
            for message in pending.drain() {
                if queue.send(message).is_ok() {
                    replayed += 1;
                }
            }
            self.metrics.messages_routed.inc_by(replayed as u64);
        }

        let book = SharedBook::new(market.clone());
        let live_once = Arc::new(AtomicBool::new(false));
        let synchronizer = MarketSynchronizer::new(
            market.clone(),
            book.clone(),
            settings.diff_buffer_capacity,
            live_once.clone(),
            self.metrics.clone(),
        );
        let cancel = self.cancel.child_token();
        let task = tokio::spawn(
            synchronizer
                .run(inbound, self.ctx.clone(), cancel.clone())
                .instrument(info_span!("synchronizer", market = %market)),
        );

        self.handles
            .write()
            .insert(market.clone(), MarketHandle { book, live_once });
        debug!(market = %market, replayed, "Market tracking started");
        self.running
            .insert(market, RunningMarket { queue, cancel, task });
    }

    fn stop(&mut self, market: &MarketId) {
        if let Some(running) = self.running.remove(market) {
            running.cancel.cancel();
            self.retired.push((market.clone(), running.task));
        }
        self.handles.write().remove(market);
        debug!(market = %market, "Market tracking stopped");
    }

    fn route(&mut self, message: CanonicalMessage) {
        if let Some(running) = self.running.get(&message.market) {
            // fails only when the synchronizer is gone; supervision cleans up
            if running.queue.send(message).is_ok() {
                self.metrics.messages_routed.inc();
            } else {
                self.metrics.dropped(DropReason::Unroutable);
            }
            return;
        }
        self.side_buffer(message);
    }

    fn side_buffer(&mut self, message: CanonicalMessage) {
        let settings = &self.ctx.settings;
        if !self.side_buffers.contains_key(&message.market)
            && self.side_buffers.len() >= settings.max_side_buffered_markets
        {
            self.metrics.dropped(DropReason::Unroutable);
            return;
        }

        let capacity = settings.side_buffer_capacity;
        let buffer = self
            .side_buffers
            .entry(message.market.clone())
            .or_insert_with(|| BoundedBuffer::new(capacity));
        if buffer.push(message).is_some() {
            self.metrics.dropped(DropReason::Unroutable);
        }
    }

    /// Untrack markets whose synchronizer task ended on its own
    fn supervise(&mut self) {
        let finished: Vec<MarketId> = self
            .running
            .iter()
            .filter(|(_, running)| running.task.is_finished())
            .map(|(market, _)| market.clone())
            .collect();

        for market in finished {
            warn!(market = %market, "Synchronizer exited unexpectedly, untracking market");
            self.metrics.synchronizer_exits.inc();
            self.stop(&market);
        }
        self.metrics.tracked_markets.set(self.running.len() as i64);

        // a market tracked again meanwhile keeps its series
        let running = &self.running;
        let metrics = &self.metrics;
        self.retired.retain(|(market, task)| {
            if !task.is_finished() {
                return true;
            }
            if !running.contains_key(market) {
                metrics.remove_market(market.as_str());
            }
            false
        });
    }
}
