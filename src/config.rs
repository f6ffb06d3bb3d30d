//! Configuration for the synchronization engine
//!
//! Sources, lowest precedence first: built-in defaults, an optional
//! `orderbook-sync.{toml,yaml,json}` file, then `ORDERBOOK_SYNC_*`
//! environment variables (a `.env` file is loaded first if present).

use ::config::{Environment, File};
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

use crate::adapters::BinanceSettings;
use crate::admission::AdmissionSettings;
use crate::error::{MarketDataError, Result};
use crate::message::MarketId;
use crate::tracker::TrackerSettings;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Markets tracked at startup, comma separated (e.g. "BTCUSDT,ETHUSDT")
    pub markets: String,

    pub ws_endpoint: String,
    pub rest_endpoint: String,
    /// Levels per side requested for each snapshot
    pub snapshot_depth: usize,

    pub diff_buffer_capacity: usize,
    pub queue_capacity: usize,
    pub router_capacity: usize,
    pub side_buffer_capacity: usize,
    pub max_side_buffered_markets: usize,

    pub snapshot_retry_delay_ms: u64,
    pub snapshot_timeout_ms: u64,
    /// 0 disables periodic snapshot refresh
    pub snapshot_refresh_secs: u64,

    pub rest_requests_per_minute: u32,
    pub max_concurrent_snapshots: usize,
    pub admission_queue_timeout_secs: u64,

    pub reconnect_delay_ms: u64,

    /// Health and metrics server
    pub health_addr: String,
}

impl Config {
    /// Load configuration from the optional file and environment variables
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config: Config = ::config::Config::builder()
            .add_source(File::with_name("orderbook-sync").required(false))
            .add_source(Environment::with_prefix("ORDERBOOK_SYNC").try_parsing(true))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.market_ids().is_empty() {
            return Err(MarketDataError::ConfigError(
                "at least one market is required".to_string(),
            ));
        }
        self.health_socket_addr()?;
        Ok(())
    }

    pub fn market_ids(&self) -> Vec<MarketId> {
        self.markets
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .map(MarketId::from)
            .collect()
    }

    pub fn health_socket_addr(&self) -> Result<SocketAddr> {
        self.health_addr.parse().map_err(|e| {
            MarketDataError::ConfigError(format!("invalid health_addr '{}': {}", self.health_addr, e))
        })
    }

    pub fn tracker_settings(&self) -> TrackerSettings {
        TrackerSettings {
            diff_buffer_capacity: self.diff_buffer_capacity,
            queue_capacity: self.queue_capacity,
            router_capacity: self.router_capacity,
            side_buffer_capacity: self.side_buffer_capacity,
            max_side_buffered_markets: self.max_side_buffered_markets,
            snapshot_retry_delay: Duration::from_millis(self.snapshot_retry_delay_ms),
            snapshot_timeout: Duration::from_millis(self.snapshot_timeout_ms),
            snapshot_refresh_interval: (self.snapshot_refresh_secs > 0)
                .then(|| Duration::from_secs(self.snapshot_refresh_secs)),
            ..TrackerSettings::default()
        }
    }

    pub fn admission_settings(&self) -> AdmissionSettings {
        AdmissionSettings {
            requests_per_minute: self.rest_requests_per_minute,
            max_concurrent: self.max_concurrent_snapshots,
            queue_timeout: Duration::from_secs(self.admission_queue_timeout_secs),
        }
    }

    pub fn binance_settings(&self) -> BinanceSettings {
        BinanceSettings {
            markets: self.market_ids(),
            ws_endpoint: self.ws_endpoint.clone(),
            rest_endpoint: self.rest_endpoint.clone(),
            snapshot_depth: self.snapshot_depth,
            reconnect_delay_ms: self.reconnect_delay_ms,
            request_timeout: Duration::from_millis(self.snapshot_timeout_ms),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            markets: "BTCUSDT,ETHUSDT".to_string(),
            ws_endpoint: "wss://stream.binance.com:9443".to_string(),
            rest_endpoint: "https://api.binance.com/api/v3".to_string(),
            snapshot_depth: 1000,
            diff_buffer_capacity: 1000,
            queue_capacity: 1000,
            router_capacity: 10_000,
            side_buffer_capacity: 100,
            max_side_buffered_markets: 256,
            snapshot_retry_delay_ms: 5000,
            snapshot_timeout_ms: 10_000,
            snapshot_refresh_secs: 0,
            rest_requests_per_minute: 1000,
            max_concurrent_snapshots: 5,
            admission_queue_timeout_secs: 30,
            reconnect_delay_ms: 1000,
            health_addr: "0.0.0.0:9090".to_string(),
        }
    }
}
