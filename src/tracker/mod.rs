//! Market tracking
//!
//! [`TrackerRouter`] owns the set of tracked markets and fans the shared
//! inbound stream out to one [`MarketSynchronizer`] task per market.

mod buffer;
mod metrics;
mod router;
mod synchronizer;

pub use buffer::BoundedBuffer;
pub use metrics::{DropReason, TrackerMetrics};
pub use router::{TrackerRouter, TrackingChange};
pub use synchronizer::{MarketSynchronizer, SyncContext, SyncOutcome, SyncState};

use std::time::Duration;

/// Buffer sizes and retry timing shared by the router and its synchronizers
#[derive(Debug, Clone)]
pub struct TrackerSettings {
    /// Diffs held per market while waiting for a snapshot
    pub diff_buffer_capacity: usize,
    /// Per-market inbound queue
    pub queue_capacity: usize,
    /// Router inbound stream shared by all sources
    pub router_capacity: usize,
    /// Messages held per market that is not tracked yet
    pub side_buffer_capacity: usize,
    /// Distinct untracked markets the side-buffer will hold
    pub max_side_buffered_markets: usize,
    pub snapshot_retry_delay: Duration,
    pub snapshot_timeout: Duration,
    /// Re-fetch a full snapshot this often; `None` disables it
    pub snapshot_refresh_interval: Option<Duration>,
    /// Admission limit id acquired before each snapshot request
    pub snapshot_limit_id: String,
    /// How often the router checks for synchronizer tasks that died
    pub supervision_interval: Duration,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            diff_buffer_capacity: 1000,
            queue_capacity: 1000,
            router_capacity: 10_000,
            side_buffer_capacity: 100,
            max_side_buffered_markets: 256,
            snapshot_retry_delay: Duration::from_secs(5),
            snapshot_timeout: Duration::from_secs(10),
            snapshot_refresh_interval: None,
            snapshot_limit_id: "snapshot".to_string(),
            supervision_interval: Duration::from_secs(1),
        }
    }
}
