//! Error types for the order book synchronization engine

use thiserror::Error;

/// Engine and adapter errors
#[derive(Error, Debug)]
pub enum MarketDataError {
    #[error("WebSocket connection error: {0}")]
    WebSocketConnection(String),

    #[error("WebSocket message error: {0}")]
    WebSocketMessage(String),

    #[error("Failed to parse message: {0}")]
    ParseError(String),

    #[error("REST API error: {0}")]
    RestApiError(String),

    #[error("Snapshot request for {market} timed out after {timeout_ms}ms")]
    SnapshotTimeout { market: String, timeout_ms: u64 },

    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Admission queue timeout for '{limit_id}' after {secs}s")]
    AdmissionTimeout { limit_id: String, secs: u64 },

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Metrics error: {0}")]
    MetricsError(#[from] prometheus::Error),

    #[error("Tracker router is not running")]
    RouterClosed,

    #[error("Connection timeout")]
    ConnectionTimeout,
}

impl MarketDataError {
    /// Whether the failure is expected to clear up on its own (network,
    /// timeout, rate limit). Transient errors are retried, never surfaced.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MarketDataError::WebSocketConnection(_)
                | MarketDataError::WebSocketMessage(_)
                | MarketDataError::RestApiError(_)
                | MarketDataError::SnapshotTimeout { .. }
                | MarketDataError::RateLimited(_)
                | MarketDataError::AdmissionTimeout { .. }
                | MarketDataError::ConnectionTimeout
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for MarketDataError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        MarketDataError::WebSocketConnection(err.to_string())
    }
}

impl From<serde_json::Error> for MarketDataError {
    fn from(err: serde_json::Error) -> Self {
        MarketDataError::ParseError(err.to_string())
    }
}

impl From<reqwest::Error> for MarketDataError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            MarketDataError::ConnectionTimeout
        } else if err.status().map(|s| s.as_u16()) == Some(429) {
            MarketDataError::RateLimited(err.to_string())
        } else {
            MarketDataError::RestApiError(err.to_string())
        }
    }
}

impl From<config::ConfigError> for MarketDataError {
    fn from(err: config::ConfigError) -> Self {
        MarketDataError::ConfigError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MarketDataError>;
