//! Per-market snapshot/diff reconciliation
//!
//! State machine:
//! - `Unseeded`: no snapshot yet, diffs are buffered (bounded, drop-oldest)
//! - snapshot arrives (any state): book replaced, buffered diffs newer than
//!   the snapshot replayed in sequence order, buffer cleared, `Live`
//! - `Live`: stale diffs dropped, contiguous diffs applied, a gap moves to
//!   `Reseeding`
//! - `Reseeding`: like `Unseeded` but the book keeps its last good state
//!   while a fresh snapshot is fetched

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval_at, sleep, timeout, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{BoundedBuffer, DropReason, TrackerMetrics, TrackerSettings};
use crate::admission::AdmissionControl;
use crate::error::{MarketDataError, Result};
use crate::message::{CanonicalMessage, MarketId, MessageKind};
use crate::orderbook::SharedBook;
use crate::source::MarketDataSource;

/// Consecutive inbound messages after which a finished snapshot fetch is
/// picked up even though the queue is still non-empty
const FETCH_POLL_INTERVAL: u32 = 256;

type PendingFetch = Option<JoinHandle<Option<CanonicalMessage>>>;
type FetchResult = std::result::Result<Option<CanonicalMessage>, JoinError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Unseeded,
    Live,
    Reseeding,
}

/// What the driver must do after a message was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Continue,
    NeedSnapshot,
}

/// Collaborators a running synchronizer needs
#[derive(Clone)]
pub struct SyncContext {
    pub source: Arc<dyn MarketDataSource>,
    pub admission: Arc<dyn AdmissionControl>,
    pub settings: TrackerSettings,
}

pub struct MarketSynchronizer {
    market: MarketId,
    book: SharedBook,
    state: SyncState,
    buffer: BoundedBuffer<CanonicalMessage>,
    live_once: Arc<AtomicBool>,
    metrics: TrackerMetrics,
}

impl MarketSynchronizer {
    pub fn new(
        market: MarketId,
        book: SharedBook,
        buffer_capacity: usize,
        live_once: Arc<AtomicBool>,
        metrics: TrackerMetrics,
    ) -> Self {
        Self {
            market,
            book,
            state: SyncState::Unseeded,
            buffer: BoundedBuffer::new(buffer_capacity),
            live_once,
            metrics,
        }
    }

    pub fn market(&self) -> &MarketId {
        &self.market
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Sequences currently held for replay, oldest first
    pub fn buffered_sequences(&self) -> Vec<u64> {
        self.buffer.iter().map(|m| m.sequence).collect()
    }

    /// Advance the state machine by one message
    pub fn handle(&mut self, message: CanonicalMessage) -> SyncOutcome {
        if let Err(e) = message.validate() {
            return self.reject(e);
        }
        if message.market != self.market {
            return self.reject(MarketDataError::MalformedMessage(format!(
                "message for {} routed to {}",
                message.market, self.market
            )));
        }

        match message.kind {
            MessageKind::Snapshot => self.on_snapshot(message),
            MessageKind::Diff => self.on_diff(message),
            MessageKind::Trade => {
                self.on_trade(&message);
                SyncOutcome::Continue
            }
        }
    }

    /// `missed` messages were lost from the inbound queue
    pub fn on_lag(&mut self, missed: u64) -> SyncOutcome {
        self.metrics.dropped_by(DropReason::QueueLag, missed);
        warn!(market = %self.market, missed, "Inbound queue overflowed");

        if self.state == SyncState::Live {
            self.metrics
                .gaps_detected
                .with_label_values(&[self.market.as_str()])
                .inc();
            self.state = SyncState::Reseeding;
            return SyncOutcome::NeedSnapshot;
        }
        SyncOutcome::Continue
    }

    fn reject(&mut self, error: MarketDataError) -> SyncOutcome {
        warn!(market = %self.market, error = %error, "Dropping malformed message, forcing re-seed");
        self.metrics.dropped(DropReason::Malformed);
        self.force_reseed()
    }

    fn force_reseed(&mut self) -> SyncOutcome {
        if self.state == SyncState::Live {
            self.state = SyncState::Reseeding;
        }
        SyncOutcome::NeedSnapshot
    }

    fn on_snapshot(&mut self, snapshot: CanonicalMessage) -> SyncOutcome {
        let current = self.book.last_applied_sequence();
        if snapshot.sequence < current {
            self.metrics
                .stale_messages
                .with_label_values(&[self.market.as_str()])
                .inc();
            debug!(
                market = %self.market,
                sequence = snapshot.sequence,
                current,
                "Discarding snapshot older than the book"
            );
            return match self.state {
                SyncState::Live => SyncOutcome::Continue,
                _ => SyncOutcome::NeedSnapshot,
            };
        }

        let buffered = self.buffer.drain();
        let total = buffered.len();
        let mut replay: Vec<CanonicalMessage> = buffered
            .into_iter()
            .filter(|diff| diff.sequence > snapshot.sequence)
            .collect();
        // Stable: equal sequences keep arrival order, so the last write wins
        replay.sort_by_key(|diff| diff.sequence);
        let discarded = total - replay.len();

        let applied = {
            let mut book = self.book.write();
            book.apply_snapshot(&snapshot.bids, &snapshot.asks, snapshot.sequence)
                .and_then(|_| {
                    replay
                        .iter()
                        .try_for_each(|diff| book.apply_diff(&diff.bids, &diff.asks, diff.sequence))
                })
                .map(|_| book.last_applied_sequence())
        };

        let last_applied = match applied {
            Ok(sequence) => sequence,
            Err(e) => {
                warn!(market = %self.market, error = %e, "Snapshot replay rejected by book, forcing re-seed");
                self.state = SyncState::Reseeding;
                return SyncOutcome::NeedSnapshot;
            }
        };

        let label = [self.market.as_str()];
        self.metrics.snapshots_applied.with_label_values(&label).inc();
        self.metrics
            .diffs_applied
            .with_label_values(&label)
            .inc_by(replay.len() as u64);
        self.metrics
            .stale_messages
            .with_label_values(&label)
            .inc_by(discarded as u64);

        let previous = self.state;
        self.state = SyncState::Live;
        self.live_once.store(true, Ordering::Release);

        info!(
            market = %self.market,
            snapshot_sequence = snapshot.sequence,
            replayed = replay.len(),
            discarded,
            last_applied,
            from = ?previous,
            "Snapshot applied"
        );
        SyncOutcome::Continue
    }

    fn on_diff(&mut self, diff: CanonicalMessage) -> SyncOutcome {
        if self.state != SyncState::Live {
            self.buffer_diff(diff);
            return SyncOutcome::Continue;
        }

        let last = self.book.last_applied_sequence();
        if diff.sequence <= last {
            self.metrics
                .stale_messages
                .with_label_values(&[self.market.as_str()])
                .inc();
            trace!(market = %self.market, sequence = diff.sequence, last, "Stale diff dropped");
            return SyncOutcome::Continue;
        }

        if !diff.is_contiguous_after(last) {
            warn!(
                market = %self.market,
                expected = last + 1,
                received = diff.first_sequence.unwrap_or(diff.sequence),
                "Sequence gap detected, re-seeding"
            );
            self.metrics
                .gaps_detected
                .with_label_values(&[self.market.as_str()])
                .inc();
            self.state = SyncState::Reseeding;
            self.buffer_diff(diff);
            return SyncOutcome::NeedSnapshot;
        }

        let applied = self
            .book
            .write()
            .apply_diff(&diff.bids, &diff.asks, diff.sequence);
        match applied {
            Ok(()) => {
                self.metrics
                    .diffs_applied
                    .with_label_values(&[self.market.as_str()])
                    .inc();
                SyncOutcome::Continue
            }
            Err(e) => {
                warn!(market = %self.market, sequence = diff.sequence, error = %e, "Diff rejected by book, forcing re-seed");
                self.force_reseed()
            }
        }
    }

    fn buffer_diff(&mut self, diff: CanonicalMessage) {
        if let Some(evicted) = self.buffer.push(diff) {
            self.metrics.dropped(DropReason::BufferOverflow);
            trace!(market = %self.market, sequence = evicted.sequence, "Buffer full, oldest diff evicted");
        }
    }

    fn on_trade(&mut self, trade: &CanonicalMessage) {
        if let Some(level) = trade.trade_level() {
            self.book.write().record_trade(level.price, trade.timestamp);
        }
    }

    /// Drive the state machine from `inbound` until cancelled or the queue
    /// closes. Fetches the initial snapshot, and a fresh one whenever
    /// [`handle`](Self::handle) asks for it.
    pub async fn run(
        mut self,
        mut inbound: broadcast::Receiver<CanonicalMessage>,
        ctx: SyncContext,
        cancel: CancellationToken,
    ) {
        info!(market = %self.market, "Synchronizer started");

        let mut pending: PendingFetch = None;
        request_snapshot(
            &mut pending,
            &self.market,
            &self.metrics,
            &ctx,
            &cancel,
            Duration::ZERO,
        );

        let mut refresh = ctx.settings.snapshot_refresh_interval.map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });
        let mut streak: u32 = 0;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                received = inbound.recv() => {
                    let outcome = match received {
                        Ok(message) => self.handle_guarded(message),
                        Err(RecvError::Lagged(missed)) => self.on_lag(missed),
                        Err(RecvError::Closed) => {
                            debug!(market = %self.market, "Inbound queue closed");
                            break;
                        }
                    };
                    if outcome == SyncOutcome::NeedSnapshot {
                        request_snapshot(
                            &mut pending,
                            &self.market,
                            &self.metrics,
                            &ctx,
                            &cancel,
                            Duration::ZERO,
                        );
                    }

                    streak += 1;
                    if streak >= FETCH_POLL_INTERVAL {
                        streak = 0;
                        if pending.as_ref().map_or(false, |h| h.is_finished()) {
                            let fetched = wait_for_snapshot(&mut pending).await;
                            pending = None;
                            self.apply_fetched(fetched, &mut pending, &ctx, &cancel);
                        }
                    }
                }

                fetched = wait_for_snapshot(&mut pending) => {
                    streak = 0;
                    pending = None;
                    self.apply_fetched(fetched, &mut pending, &ctx, &cancel);
                }

                _ = next_refresh(&mut refresh) => {
                    if pending.is_none() {
                        debug!(market = %self.market, "Periodic snapshot refresh");
                        request_snapshot(
                            &mut pending,
                            &self.market,
                            &self.metrics,
                            &ctx,
                            &cancel,
                            Duration::ZERO,
                        );
                    }
                }
            }
        }

        if let Some(handle) = pending.take() {
            handle.abort();
            let _ = handle.await;
        }
        info!(market = %self.market, "Synchronizer stopped");
    }

    /// A panic while applying a message forces a re-seed instead of ending
    /// the task
    fn handle_guarded(&mut self, message: CanonicalMessage) -> SyncOutcome {
        let sequence = message.sequence;
        self.guarded(sequence, |sync| sync.handle(message))
    }

    fn guarded(
        &mut self,
        sequence: u64,
        step: impl FnOnce(&mut Self) -> SyncOutcome,
    ) -> SyncOutcome {
        match catch_unwind(AssertUnwindSafe(|| step(self))) {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(market = %self.market, sequence, "Panic while applying message, forcing re-seed");
                self.force_reseed()
            }
        }
    }

    /// A fetched snapshot that could not seed the book (stale, rejected by
    /// the book) and a fetch task that panicked both count as failed
    /// attempts and are retried after `snapshot_retry_delay`.
    fn apply_fetched(
        &mut self,
        fetched: FetchResult,
        pending: &mut PendingFetch,
        ctx: &SyncContext,
        cancel: &CancellationToken,
    ) {
        let retry = match fetched {
            Ok(Some(snapshot)) => self.handle_guarded(snapshot) == SyncOutcome::NeedSnapshot,
            Ok(None) => false,
            Err(e) if e.is_cancelled() => false,
            Err(e) => {
                error!(market = %self.market, error = %e, "Snapshot fetch task panicked");
                self.state != SyncState::Live
            }
        };
        if !retry {
            return;
        }

        self.metrics
            .snapshot_fetch_failures
            .with_label_values(&[self.market.as_str()])
            .inc();
        debug!(
            market = %self.market,
            retry_in_ms = ctx.settings.snapshot_retry_delay.as_millis() as u64,
            "Snapshot did not seed the book, retrying"
        );
        request_snapshot(
            pending,
            &self.market,
            &self.metrics,
            ctx,
            cancel,
            ctx.settings.snapshot_retry_delay,
        );
    }
}

/// Start a snapshot fetch after `delay` unless one is already in flight
fn request_snapshot(
    pending: &mut PendingFetch,
    market: &MarketId,
    metrics: &TrackerMetrics,
    ctx: &SyncContext,
    cancel: &CancellationToken,
    delay: Duration,
) {
    if pending.is_some() {
        return;
    }
    debug!(market = %market, delay_ms = delay.as_millis() as u64, "Requesting snapshot");
    *pending = Some(tokio::spawn(fetch_snapshot(
        market.clone(),
        ctx.clone(),
        metrics.clone(),
        cancel.child_token(),
        delay,
    )));
}

async fn wait_for_snapshot(pending: &mut PendingFetch) -> FetchResult {
    match pending.as_mut() {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn next_refresh(refresh: &mut Option<Interval>) {
    match refresh.as_mut() {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Retry with a fixed delay until a snapshot arrives or `cancel` fires
async fn fetch_snapshot(
    market: MarketId,
    ctx: SyncContext,
    metrics: TrackerMetrics,
    cancel: CancellationToken,
    delay: Duration,
) -> Option<CanonicalMessage> {
    if !delay.is_zero() {
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = sleep(delay) => {}
        }
    }

    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return None,
            result = attempt_snapshot(&market, &ctx) => result,
        };

        match result {
            Ok(snapshot) if snapshot.kind == MessageKind::Snapshot => return Some(snapshot),
            Ok(other) => {
                warn!(market = %market, kind = ?other.kind, "Source returned a non-snapshot message");
            }
            Err(e) => {
                warn!(
                    market = %market,
                    error = %e,
                    transient = e.is_transient(),
                    retry_in_ms = ctx.settings.snapshot_retry_delay.as_millis() as u64,
                    "Snapshot fetch failed, retrying"
                );
            }
        }
        metrics
            .snapshot_fetch_failures
            .with_label_values(&[market.as_str()])
            .inc();

        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = sleep(ctx.settings.snapshot_retry_delay) => {}
        }
    }
}

async fn attempt_snapshot(market: &MarketId, ctx: &SyncContext) -> Result<CanonicalMessage> {
    let _permit = ctx
        .admission
        .acquire(&ctx.settings.snapshot_limit_id)
        .await?;

    match timeout(ctx.settings.snapshot_timeout, ctx.source.get_snapshot(market)).await {
        Ok(result) => result,
        Err(_) => Err(MarketDataError::SnapshotTimeout {
            market: market.to_string(),
            timeout_ms: ctx.settings.snapshot_timeout.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::Unlimited;
    use crate::orderbook::PriceLevel;
    use crate::source::{MessageSink, MockMarketDataSource};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicUsize;

    const MARKET: &str = "BTCUSDT";

    fn synchronizer(capacity: usize) -> (MarketSynchronizer, SharedBook, Arc<AtomicBool>) {
        let book = SharedBook::new(MarketId::from(MARKET));
        let live = Arc::new(AtomicBool::new(false));
        let sync = MarketSynchronizer::new(
            MarketId::from(MARKET),
            book.clone(),
            capacity,
            live.clone(),
            TrackerMetrics::unregistered().unwrap(),
        );
        (sync, book, live)
    }

    fn diff(sequence: u64, price: Decimal, quantity: Decimal) -> CanonicalMessage {
        CanonicalMessage::diff(MARKET, sequence, vec![PriceLevel::new(price, quantity)], vec![])
    }

    fn snapshot(sequence: u64) -> CanonicalMessage {
        CanonicalMessage::snapshot(
            MARKET,
            sequence,
            vec![PriceLevel::new(dec!(100), dec!(1))],
            vec![PriceLevel::new(dec!(101), dec!(1))],
        )
    }

    #[test]
    fn test_diffs_buffered_until_snapshot() {
        let (mut sync, book, live) = synchronizer(10);
        assert_eq!(sync.handle(diff(1, dec!(99), dec!(1))), SyncOutcome::Continue);
        assert_eq!(sync.state(), SyncState::Unseeded);
        assert_eq!(sync.buffered_sequences(), vec![1]);
        assert_eq!(book.snapshot_view().bids.len(), 0);
        assert!(!live.load(Ordering::Acquire));
    }

    #[test]
    fn test_buffer_keeps_most_recent_n() {
        let (mut sync, _, _) = synchronizer(1000);
        for sequence in 1..=1500 {
            sync.handle(diff(sequence, dec!(99), dec!(1)));
        }
        let expected: Vec<u64> = (501..=1500).collect();
        assert_eq!(sync.buffered_sequences(), expected);
    }

    #[test]
    fn test_snapshot_then_buffered_replay_scenario() {
        let (mut sync, book, live) = synchronizer(1000);

        sync.handle(diff(5, dec!(95), dec!(5)));
        sync.handle(diff(6, dec!(96), dec!(6)));
        sync.handle(diff(8, dec!(98), dec!(8)));
        assert_eq!(sync.handle(snapshot(6)), SyncOutcome::Continue);

        assert_eq!(sync.state(), SyncState::Live);
        assert!(live.load(Ordering::Acquire));
        assert_eq!(book.last_applied_sequence(), 8);
        let view = book.snapshot_view();
        let bid_prices: Vec<Decimal> = view.bids.iter().map(|l| l.price).collect();
        assert_eq!(bid_prices, vec![dec!(100), dec!(98)]);
        assert!(sync.buffered_sequences().is_empty());

        // 9 is missing: gap
        assert_eq!(sync.handle(diff(10, dec!(90), dec!(1))), SyncOutcome::NeedSnapshot);
        assert_eq!(sync.state(), SyncState::Reseeding);
        assert_eq!(sync.buffered_sequences(), vec![10]);
        // the book keeps serving its last good state meanwhile
        assert_eq!(book.last_applied_sequence(), 8);

        assert_eq!(sync.handle(snapshot(9)), SyncOutcome::Continue);
        assert_eq!(sync.state(), SyncState::Live);
        assert_eq!(book.last_applied_sequence(), 10);
        let bid_prices: Vec<Decimal> = book.snapshot_view().bids.iter().map(|l| l.price).collect();
        assert_eq!(bid_prices, vec![dec!(100), dec!(90)]);
    }

    #[test]
    fn test_gap_requests_single_snapshot() {
        let (mut sync, _, _) = synchronizer(1000);
        sync.handle(snapshot(1));

        assert_eq!(sync.handle(diff(3, dec!(99), dec!(1))), SyncOutcome::NeedSnapshot);
        assert_eq!(sync.handle(diff(4, dec!(99), dec!(2))), SyncOutcome::Continue);
        assert_eq!(sync.handle(diff(6, dec!(99), dec!(3))), SyncOutcome::Continue);
        assert_eq!(sync.buffered_sequences(), vec![3, 4, 6]);

        sync.handle(snapshot(4));
        assert_eq!(sync.state(), SyncState::Live);
        assert!(sync.buffered_sequences().is_empty());
    }

    #[test]
    fn test_stale_diff_does_not_change_book() {
        let (mut sync, book, _) = synchronizer(10);
        sync.handle(snapshot(10));
        sync.handle(diff(11, dec!(99), dec!(1)));
        let before = book.snapshot_view();

        assert_eq!(sync.handle(diff(11, dec!(99), dec!(7))), SyncOutcome::Continue);
        assert_eq!(sync.handle(diff(3, dec!(50), dec!(7))), SyncOutcome::Continue);

        let after = book.snapshot_view();
        assert_eq!(before.bids, after.bids);
        assert_eq!(after.last_applied_sequence, 11);
    }

    #[test]
    fn test_duplicate_sequences_last_write_wins_on_replay() {
        let (mut sync, book, _) = synchronizer(10);
        sync.handle(diff(2, dec!(99), dec!(1)));
        sync.handle(diff(2, dec!(99), dec!(4)));
        sync.handle(snapshot(1));

        assert_eq!(
            book.snapshot_view().bids,
            vec![
                PriceLevel::new(dec!(100), dec!(1)),
                PriceLevel::new(dec!(99), dec!(4)),
            ]
        );
    }

    #[test]
    fn test_out_of_order_buffer_replayed_ascending() {
        let (mut sync, book, _) = synchronizer(10);
        sync.handle(diff(4, dec!(99), dec!(0)));
        sync.handle(diff(3, dec!(99), dec!(2)));
        sync.handle(snapshot(2));

        // 3 (set) then 4 (delete)
        assert_eq!(book.snapshot_view().bids.len(), 1);
        assert_eq!(book.last_applied_sequence(), 4);
    }

    #[test]
    fn test_batched_diffs_follow_range_contiguity() {
        let (mut sync, book, _) = synchronizer(10);
        sync.handle(snapshot(100));

        let overlapping = diff(105, dec!(99), dec!(1)).with_first_sequence(98);
        assert_eq!(sync.handle(overlapping), SyncOutcome::Continue);
        assert_eq!(book.last_applied_sequence(), 105);

        let gapped = diff(120, dec!(99), dec!(1)).with_first_sequence(110);
        assert_eq!(sync.handle(gapped), SyncOutcome::NeedSnapshot);
    }

    #[test]
    fn test_malformed_message_forces_reseed() {
        let (mut sync, book, _) = synchronizer(10);
        sync.handle(snapshot(1));

        let outcome = sync.handle(diff(2, dec!(99), dec!(-3)));
        assert_eq!(outcome, SyncOutcome::NeedSnapshot);
        assert_eq!(sync.state(), SyncState::Reseeding);
        assert_eq!(book.last_applied_sequence(), 1);
    }

    #[test]
    fn test_misrouted_message_rejected() {
        let (mut sync, _, _) = synchronizer(10);
        sync.handle(snapshot(1));
        let foreign = CanonicalMessage::diff("ETHUSDT", 2, vec![], vec![]);
        assert_eq!(sync.handle(foreign), SyncOutcome::NeedSnapshot);
    }

    #[test]
    fn test_stale_snapshot_ignored_when_live() {
        let (mut sync, book, _) = synchronizer(10);
        sync.handle(snapshot(10));
        sync.handle(diff(11, dec!(99), dec!(1)));

        assert_eq!(sync.handle(snapshot(5)), SyncOutcome::Continue);
        assert_eq!(book.last_applied_sequence(), 11);
        assert_eq!(book.snapshot_view().bids.len(), 2);
    }

    #[test]
    fn test_stale_snapshot_while_reseeding_requests_another() {
        let (mut sync, _, _) = synchronizer(10);
        sync.handle(snapshot(10));
        sync.handle(diff(15, dec!(99), dec!(1)));
        assert_eq!(sync.state(), SyncState::Reseeding);

        assert_eq!(sync.handle(snapshot(7)), SyncOutcome::NeedSnapshot);
        assert_eq!(sync.state(), SyncState::Reseeding);
    }

    #[test]
    fn test_queue_lag_while_live_is_a_gap() {
        let (mut sync, _, _) = synchronizer(10);
        assert_eq!(sync.on_lag(3), SyncOutcome::Continue);
        sync.handle(snapshot(1));
        assert_eq!(sync.on_lag(3), SyncOutcome::NeedSnapshot);
        assert_eq!(sync.state(), SyncState::Reseeding);
    }

    #[test]
    fn test_trade_updates_last_price_only() {
        let (mut sync, book, _) = synchronizer(10);
        sync.handle(snapshot(1));
        let trade =
            CanonicalMessage::trade(MARKET, PriceLevel::new(dec!(100.5), dec!(0.1)), false);
        assert_eq!(sync.handle(trade), SyncOutcome::Continue);

        let view = book.snapshot_view();
        assert_eq!(view.last_trade_price, Some(dec!(100.5)));
        assert_eq!(view.last_applied_sequence, 1);
    }

    #[test]
    fn test_panic_while_applying_forces_reseed() {
        let (mut sync, book, _) = synchronizer(10);
        sync.handle(snapshot(1));

        let outcome = sync.guarded(2, |_| panic!("level arithmetic overflow"));
        assert_eq!(outcome, SyncOutcome::NeedSnapshot);
        assert_eq!(sync.state(), SyncState::Reseeding);
        assert_eq!(book.last_applied_sequence(), 1);

        assert_eq!(sync.handle(snapshot(2)), SyncOutcome::Continue);
        assert_eq!(sync.state(), SyncState::Live);
    }

    fn context(source: MockMarketDataSource, retry: Duration) -> SyncContext {
        context_with(
            Arc::new(source),
            TrackerSettings {
                snapshot_retry_delay: retry,
                ..Default::default()
            },
        )
    }

    fn context_with(source: Arc<dyn MarketDataSource>, settings: TrackerSettings) -> SyncContext {
        SyncContext {
            source,
            admission: Arc::new(Unlimited),
            settings,
        }
    }

    /// Panics on the first snapshot request; later ones take `delay` and
    /// return a snapshot at sequence 3
    struct FlakySource {
        calls: AtomicUsize,
        panic_first: bool,
        delay: Duration,
    }

    impl FlakySource {
        fn new(panic_first: bool, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                panic_first,
                delay,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MarketDataSource for FlakySource {
        async fn get_snapshot(&self, market: &MarketId) -> Result<CanonicalMessage> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 && self.panic_first {
                panic!("snapshot endpoint returned garbage");
            }
            if call > 0 {
                sleep(self.delay).await;
            }
            Ok(CanonicalMessage::snapshot(
                market.clone(),
                3,
                vec![PriceLevel::new(dec!(100), dec!(1))],
                vec![],
            ))
        }

        async fn initial_markets(&self) -> Result<Vec<MarketId>> {
            Ok(vec![])
        }

        async fn stream(
            &self,
            _markets: Vec<MarketId>,
            _sink: MessageSink,
            _cancel: CancellationToken,
        ) -> Result<()> {
            Ok(())
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            sleep(Duration::from_millis(50)).await;
        }
        condition()
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_fetch_retried_after_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut source = MockMarketDataSource::new();
        source.expect_get_snapshot().times(2).returning(move |market| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(MarketDataError::RestApiError("503 Service Unavailable".to_string()))
            } else {
                Ok(CanonicalMessage::snapshot(
                    market.clone(),
                    6,
                    vec![PriceLevel::new(dec!(100), dec!(1))],
                    vec![],
                ))
            }
        });

        let (sync, book, live) = synchronizer(10);
        let (tx, rx) = broadcast::channel(16);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(sync.run(
            rx,
            context(source, Duration::from_secs(5)),
            cancel.clone(),
        ));

        assert!(wait_until(|| live.load(Ordering::Acquire)).await);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(book.last_applied_sequence(), 6);

        cancel.cancel();
        task.await.unwrap();
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_triggers_exactly_one_refetch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut source = MockMarketDataSource::new();
        source.expect_get_snapshot().returning(move |market| {
            let sequence = match counter.fetch_add(1, Ordering::SeqCst) {
                0 => 1,
                _ => 4,
            };
            Ok(CanonicalMessage::snapshot(market.clone(), sequence, vec![], vec![]))
        });

        let (sync, book, live) = synchronizer(10);
        let (tx, rx) = broadcast::channel(16);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(sync.run(
            rx,
            context(source, Duration::from_millis(10)),
            cancel.clone(),
        ));
        assert!(wait_until(|| live.load(Ordering::Acquire)).await);

        // 2 is missing; 3, 5 and 6 arrive while re-seeding
        tx.send(diff(3, dec!(99), dec!(1))).unwrap();
        tx.send(diff(5, dec!(98), dec!(1))).unwrap();
        tx.send(diff(6, dec!(97), dec!(1))).unwrap();

        assert!(wait_until(|| book.last_applied_sequence() == 6).await);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let bid_prices: Vec<Decimal> = book.snapshot_view().bids.iter().map(|l| l.price).collect();
        assert_eq!(bid_prices, vec![dec!(98), dec!(97)]);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_pending_fetch() {
        let mut source = MockMarketDataSource::new();
        source
            .expect_get_snapshot()
            .returning(|_| Err(MarketDataError::ConnectionTimeout));

        let (sync, _, live) = synchronizer(10);
        let (_tx, rx) = broadcast::channel(16);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(sync.run(
            rx,
            context(source, Duration::from_secs(5)),
            cancel.clone(),
        ));

        sleep(Duration::from_secs(12)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("synchronizer should stop promptly")
            .unwrap();
        assert!(!live.load(Ordering::Acquire));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_snapshots_retried_after_delay() {
        let fetched_at = Arc::new(Mutex::new(Vec::new()));
        let stamps = fetched_at.clone();
        let mut source = MockMarketDataSource::new();
        source.expect_get_snapshot().returning(move |market| {
            let mut stamps = stamps.lock();
            let sequence = if stamps.is_empty() { 10 } else { 5 };
            stamps.push(Instant::now());
            Ok(CanonicalMessage::snapshot(market.clone(), sequence, vec![], vec![]))
        });

        let (sync, book, live) = synchronizer(10);
        let (tx, rx) = broadcast::channel(16);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(sync.run(
            rx,
            context(source, Duration::from_secs(5)),
            cancel.clone(),
        ));
        assert!(wait_until(|| live.load(Ordering::Acquire)).await);

        // the REST endpoint lags the stream from here on
        tx.send(diff(20, dec!(99), dec!(1))).unwrap();
        sleep(Duration::from_secs(16)).await;

        let stamps = fetched_at.lock().clone();
        assert!((4..=5).contains(&stamps.len()), "fetches: {}", stamps.len());
        for pair in stamps[1..].windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(5));
        }
        assert_eq!(book.last_applied_sequence(), 10);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_fetch_is_retried() {
        let source = FlakySource::new(true, Duration::ZERO);
        let (sync, book, live) = synchronizer(10);
        let (tx, rx) = broadcast::channel(16);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(sync.run(
            rx,
            context_with(
                source.clone(),
                TrackerSettings {
                    snapshot_retry_delay: Duration::from_secs(5),
                    ..Default::default()
                },
            ),
            cancel.clone(),
        ));

        tx.send(diff(4, dec!(99), dec!(1))).unwrap();
        assert!(wait_until(|| live.load(Ordering::Acquire)).await);
        assert_eq!(source.calls(), 2);
        assert_eq!(book.last_applied_sequence(), 4);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_skipped_while_fetch_in_flight() {
        // every refresh fetch takes 90s, longer than the 60s period
        let source = FlakySource::new(false, Duration::from_secs(90));
        let (sync, _, live) = synchronizer(10);
        let (_tx, rx) = broadcast::channel(16);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(sync.run(
            rx,
            context_with(
                source.clone(),
                TrackerSettings {
                    snapshot_refresh_interval: Some(Duration::from_secs(60)),
                    snapshot_timeout: Duration::from_secs(200),
                    ..Default::default()
                },
            ),
            cancel.clone(),
        ));
        assert!(wait_until(|| live.load(Ordering::Acquire)).await);
        assert_eq!(source.calls(), 1);

        // ticks at 60s (fetch runs until 150s) and 120s (skipped)
        sleep(Duration::from_secs(65)).await;
        assert_eq!(source.calls(), 2);
        sleep(Duration::from_secs(105)).await;
        assert_eq!(source.calls(), 2);

        // next tick at 180s starts exactly one more fetch
        sleep(Duration::from_secs(15)).await;
        assert_eq!(source.calls(), 3);

        cancel.cancel();
        task.await.unwrap();
    }
}
