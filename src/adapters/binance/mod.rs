//! Binance spot market data
//!
//! Snapshots come from the REST depth endpoint, diffs and trades from the
//! combined WebSocket stream. The stream reconnects with capped exponential
//! backoff until cancelled.

mod client;
mod parser;

pub use client::WebSocketClient;
pub use parser::{DepthUpdate, OrderBookSnapshot, ParsedMessage, Trade};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::admission::AdmissionControl;
use crate::error::{MarketDataError, Result};
use crate::message::{CanonicalMessage, MarketId};
use crate::source::{MarketDataSource, MessageSink};

/// Admission limit id acquired before every (re)connect
pub const WS_CONNECT_LIMIT: &str = "ws_connect";

/// Maximum backoff delay in milliseconds (60 seconds)
const MAX_BACKOFF_MS: u64 = 60_000;
/// Cooldown period after which reconnect attempts are reset (5 minutes)
const RECONNECT_COOLDOWN_SECS: u64 = 300;
const KEEPALIVE_AFTER: Duration = Duration::from_secs(30);
const RECV_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Debug, Clone)]
pub struct BinanceSettings {
    pub markets: Vec<MarketId>,
    pub ws_endpoint: String,
    pub rest_endpoint: String,
    /// Levels per side requested from the depth endpoint
    pub snapshot_depth: usize,
    pub reconnect_delay_ms: u64,
    pub request_timeout: Duration,
}

impl Default for BinanceSettings {
    fn default() -> Self {
        Self {
            markets: vec![MarketId::from("BTCUSDT")],
            ws_endpoint: "wss://stream.binance.com:9443".to_string(),
            rest_endpoint: "https://api.binance.com/api/v3".to_string(),
            snapshot_depth: 1000,
            reconnect_delay_ms: 1000,
            request_timeout: Duration::from_secs(10),
        }
    }
}

pub struct BinanceSource {
    http: reqwest::Client,
    settings: BinanceSettings,
    admission: Arc<dyn AdmissionControl>,
}

impl BinanceSource {
    pub fn new(settings: BinanceSettings, admission: Arc<dyn AdmissionControl>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()?;
        Ok(Self {
            http,
            settings,
            admission,
        })
    }

    pub fn snapshot_url(&self, market: &MarketId) -> String {
        format!(
            "{}/depth?symbol={}&limit={}",
            self.settings.rest_endpoint.trim_end_matches('/'),
            market.as_str().to_uppercase(),
            self.settings.snapshot_depth
        )
    }

    /// One connection lifetime. Returns `Ok` when cancelled.
    async fn run_session(
        &self,
        markets: &[MarketId],
        sink: &MessageSink,
        cancel: &CancellationToken,
        connected: &mut Option<Instant>,
    ) -> Result<()> {
        let mut client = WebSocketClient::new(&self.settings.ws_endpoint, markets.to_vec());
        {
            let _permit = self.admission.acquire(WS_CONNECT_LIMIT).await?;
            client.connect().await?;
        }
        *connected = Some(Instant::now());

        let mut last_message = Instant::now();
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => {
                    client.close().await;
                    return Ok(());
                }
                received = timeout(RECV_TIMEOUT, client.recv()) => received,
            };

            match received {
                Ok(Ok(Some(text))) => {
                    last_message = Instant::now();
                    dispatch(&text, sink)?;
                }
                Ok(Ok(None)) => {
                    if last_message.elapsed() > KEEPALIVE_AFTER {
                        if let Err(e) = client.ping().await {
                            warn!(error = %e, "Failed to send keepalive ping");
                        }
                    }
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    warn!(
                        last_message_secs = last_message.elapsed().as_secs(),
                        "No message received within timeout, sending keepalive"
                    );
                    if client.ping().await.is_err() {
                        return Err(MarketDataError::ConnectionTimeout);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl MarketDataSource for BinanceSource {
    async fn get_snapshot(&self, market: &MarketId) -> Result<CanonicalMessage> {
        let url = self.snapshot_url(market);
        debug!(market = %market, url = %url, "Fetching order book snapshot");

        let snapshot: OrderBookSnapshot = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(snapshot.into_canonical(market.clone()))
    }

    async fn initial_markets(&self) -> Result<Vec<MarketId>> {
        Ok(self.settings.markets.clone())
    }

    async fn stream(
        &self,
        markets: Vec<MarketId>,
        sink: MessageSink,
        cancel: CancellationToken,
    ) -> Result<()> {
        if markets.is_empty() {
            info!("No markets to stream");
            cancel.cancelled().await;
            return Ok(());
        }

        info!(markets = markets.len(), "Starting Binance stream");
        let mut attempts: u32 = 0;
        let mut connected: Option<Instant> = None;

        loop {
            if let Some(since) = connected {
                if since.elapsed() > Duration::from_secs(RECONNECT_COOLDOWN_SECS) && attempts > 0 {
                    info!(previous_attempts = attempts, "Resetting reconnect counter after cooldown period");
                    attempts = 0;
                }
            }

            let delay = match self.run_session(&markets, &sink, &cancel, &mut connected).await {
                Ok(()) => return Ok(()),
                Err(MarketDataError::RouterClosed) => {
                    info!("Router closed, stopping stream");
                    return Ok(());
                }
                Err(e) => {
                    attempts += 1;
                    let delay = reconnect_delay(self.settings.reconnect_delay_ms, attempts);
                    error!(
                        error = %e,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "WebSocket session failed, reconnecting"
                    );
                    delay
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = sleep(delay) => {}
            }
        }
    }
}

fn dispatch(text: &str, sink: &MessageSink) -> Result<()> {
    match ParsedMessage::parse(text) {
        Ok(ParsedMessage::Unknown(raw)) => {
            trace!(msg = %raw, "Unknown message type");
        }
        Ok(parsed) => {
            if let Some(message) = parsed.into_canonical() {
                if !sink.send(message) {
                    return Err(MarketDataError::RouterClosed);
                }
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to parse message, skipping");
        }
    }
    Ok(())
}

/// `base * 2^min(attempts, 6)`, capped at 60s
fn reconnect_delay(base_ms: u64, attempts: u32) -> Duration {
    let delay = base_ms.saturating_mul(2u64.pow(attempts.min(6)));
    Duration::from_millis(delay.min(MAX_BACKOFF_MS))
}
