//! Order book synchronization engine
//!
//! Keeps local order books for many markets consistent with an exchange by
//! reconciling full snapshots with incremental diffs. Each tracked market
//! runs its own synchronizer task; markets can be added and removed while
//! the engine is running.

pub mod adapters;
pub mod admission;
pub mod config;
pub mod error;
pub mod health;
pub mod message;
pub mod orderbook;
pub mod source;
pub mod tracker;

pub use admission::{AdmissionControl, AdmissionPermit, AdmissionSettings, GovernorAdmission, Unlimited};
pub use config::Config;
pub use error::{MarketDataError, Result};
pub use message::{CanonicalMessage, MarketId, MessageKind};
pub use orderbook::{BookView, PriceLevel, PriceLevelBook, SharedBook, Side};
pub use source::{MarketDataSource, MessageSink};
pub use tracker::{TrackerRouter, TrackerSettings, TrackingChange};
