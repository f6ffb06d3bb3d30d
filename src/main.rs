//! Order book synchronization service
//!
//! Tracks the configured Binance markets, keeps their books in sync and
//! serves health, metrics and book views over HTTP.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use orderbook_sync::adapters::BinanceSource;
use orderbook_sync::health::{self, AppState};
use orderbook_sync::{Config, GovernorAdmission, MarketDataSource, TrackerRouter};

const STATUS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting order book synchronization engine");

    let config = Config::load()?;
    info!(markets = %config.markets, "Configuration loaded");

    let registry = prometheus::Registry::new();
    let admission = Arc::new(GovernorAdmission::new(config.admission_settings())?);
    let source: Arc<dyn MarketDataSource> =
        Arc::new(BinanceSource::new(config.binance_settings(), admission.clone())?);

    let router = Arc::new(TrackerRouter::spawn(
        source.clone(),
        admission,
        config.tracker_settings(),
        &registry,
    )?);

    let markets = source.initial_markets().await?;

    // Stream first: diffs that arrive before tracking starts are side-buffered
    // and replayed once the first snapshot lands.
    let cancel = CancellationToken::new();
    let stream_task = {
        let source = source.clone();
        let markets = markets.clone();
        let sink = router.sink();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = source.stream(markets, sink, cancel).await {
                error!(error = %e, "Market data stream stopped");
            }
        })
    };

    let change = router.set_tracked_markets(markets).await?;
    info!(added = ?change.added, "Initial markets tracked");

    let addr = config.health_socket_addr()?;
    let app = health::app(AppState {
        router: router.clone(),
        registry,
    });
    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        info!(addr = %addr, "Starting health check server");
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(error = %e, "Health server bind failed");
                return;
            }
        };
        let shutdown = async move { server_cancel.cancelled().await };
        if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
            warn!(error = %e, "Health server error");
        }
    });

    let status_router = router.clone();
    let status_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut ticker = interval(STATUS_INTERVAL);
        loop {
            tokio::select! {
                _ = status_cancel.cancelled() => break,
                _ = ticker.tick() => log_status(&status_router),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    cancel.cancel();
    router.shutdown().await;
    if let Err(e) = stream_task.await {
        warn!(error = %e, "Stream task ended abnormally");
    }
    if let Err(e) = server.await {
        warn!(error = %e, "Health server task ended abnormally");
    }

    info!("Stopped");
    Ok(())
}

fn log_status(router: &TrackerRouter) {
    for (market, book) in router.order_books() {
        let view = book.snapshot_view();
        if let Some(mid) = view.metrics.mid_price {
            info!(
                market = %market,
                sequence = view.last_applied_sequence,
                mid_price = %mid,
                spread_bps = ?view.metrics.spread_bps,
                imbalance = ?view.metrics.imbalance,
                "Order book status"
            );
        }
    }
}
