//! Tracker counters
//!
//! Registered into a caller-supplied registry; nothing touches the
//! process-wide default registry.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// Why a message never reached a book
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Unknown market and its side-buffer (or the side-buffer table) is full
    Unroutable,
    /// Evicted from a synchronizer's pre-snapshot buffer
    BufferOverflow,
    /// Per-market inbound queue overflowed
    QueueLag,
    /// Router inbound stream overflowed
    RouterLag,
    /// Failed validation
    Malformed,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Unroutable => "unroutable",
            DropReason::BufferOverflow => "buffer_overflow",
            DropReason::QueueLag => "queue_lag",
            DropReason::RouterLag => "router_lag",
            DropReason::Malformed => "malformed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrackerMetrics {
    pub messages_routed: IntCounter,
    pub messages_dropped: IntCounterVec,
    pub gaps_detected: IntCounterVec,
    pub snapshots_applied: IntCounterVec,
    pub snapshot_fetch_failures: IntCounterVec,
    pub diffs_applied: IntCounterVec,
    pub stale_messages: IntCounterVec,
    pub tracked_markets: IntGauge,
    pub synchronizer_exits: IntCounter,
}

impl TrackerMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self::unregistered()?;
        registry.register(Box::new(metrics.messages_routed.clone()))?;
        registry.register(Box::new(metrics.messages_dropped.clone()))?;
        registry.register(Box::new(metrics.gaps_detected.clone()))?;
        registry.register(Box::new(metrics.snapshots_applied.clone()))?;
        registry.register(Box::new(metrics.snapshot_fetch_failures.clone()))?;
        registry.register(Box::new(metrics.diffs_applied.clone()))?;
        registry.register(Box::new(metrics.stale_messages.clone()))?;
        registry.register(Box::new(metrics.tracked_markets.clone()))?;
        registry.register(Box::new(metrics.synchronizer_exits.clone()))?;
        Ok(metrics)
    }

    /// Counters that are not exported anywhere
    pub fn unregistered() -> Result<Self, prometheus::Error> {
        Ok(Self {
            messages_routed: IntCounter::new(
                "orderbook_sync_messages_routed_total",
                "Messages delivered to a tracked market's queue",
            )?,
            messages_dropped: IntCounterVec::new(
                Opts::new(
                    "orderbook_sync_messages_dropped_total",
                    "Messages dropped before reaching a book",
                ),
                &["reason"],
            )?,
            gaps_detected: IntCounterVec::new(
                Opts::new(
                    "orderbook_sync_gaps_detected_total",
                    "Sequence gaps that forced a re-seed",
                ),
                &["market"],
            )?,
            snapshots_applied: IntCounterVec::new(
                Opts::new(
                    "orderbook_sync_snapshots_applied_total",
                    "Snapshots applied to a book",
                ),
                &["market"],
            )?,
            snapshot_fetch_failures: IntCounterVec::new(
                Opts::new(
                    "orderbook_sync_snapshot_fetch_failures_total",
                    "Failed snapshot fetch attempts",
                ),
                &["market"],
            )?,
            diffs_applied: IntCounterVec::new(
                Opts::new(
                    "orderbook_sync_diffs_applied_total",
                    "Diffs applied to a book, live or replayed",
                ),
                &["market"],
            )?,
            stale_messages: IntCounterVec::new(
                Opts::new(
                    "orderbook_sync_stale_messages_total",
                    "Diffs and snapshots discarded as already represented",
                ),
                &["market"],
            )?,
            tracked_markets: IntGauge::new(
                "orderbook_sync_tracked_markets",
                "Markets currently tracked",
            )?,
            synchronizer_exits: IntCounter::new(
                "orderbook_sync_synchronizer_exits_total",
                "Synchronizer tasks that ended without being untracked",
            )?,
        })
    }

    pub fn dropped(&self, reason: DropReason) {
        self.messages_dropped
            .with_label_values(&[reason.as_str()])
            .inc();
    }

    pub fn dropped_by(&self, reason: DropReason, count: u64) {
        self.messages_dropped
            .with_label_values(&[reason.as_str()])
            .inc_by(count);
    }

    pub fn dropped_count(&self, reason: DropReason) -> u64 {
        self.messages_dropped
            .with_label_values(&[reason.as_str()])
            .get()
    }

    /// Forget per-market series once a market is untracked
    pub fn remove_market(&self, market: &str) {
        for vec in [
            &self.gaps_detected,
            &self.snapshots_applied,
            &self.snapshot_fetch_failures,
            &self.diffs_applied,
            &self.stale_messages,
        ] {
            let _ = vec.remove_label_values(&[market]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registers_into_injected_registry() {
        let registry = Registry::new();
        let metrics = TrackerMetrics::new(&registry).unwrap();
        metrics.dropped(DropReason::Unroutable);
        metrics.dropped_by(DropReason::QueueLag, 3);
        metrics.tracked_markets.set(2);

        assert_eq!(metrics.dropped_count(DropReason::Unroutable), 1);
        assert_eq!(metrics.dropped_count(DropReason::QueueLag), 3);

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|f| f.get_name().to_string())
            .collect();
        assert!(names.contains(&"orderbook_sync_messages_dropped_total".to_string()));
        assert!(names.contains(&"orderbook_sync_tracked_markets".to_string()));
    }

    #[test]
    fn test_two_registries_do_not_collide() {
        let first = Registry::new();
        let second = Registry::new();
        assert!(TrackerMetrics::new(&first).is_ok());
        assert!(TrackerMetrics::new(&second).is_ok());
    }
}
