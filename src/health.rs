//! HTTP health, metrics and book inspection endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::warn;

use crate::message::MarketId;
use crate::tracker::TrackerRouter;

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<TrackerRouter>,
    pub registry: Registry,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/book/:market", get(book))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> Response {
    let ready = state.router.ready();
    let markets: Vec<String> = state
        .router
        .tracked_markets()
        .iter()
        .map(|m| m.to_string())
        .collect();

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = Json(serde_json::json!({
        "status": if ready { "ready" } else { "syncing" },
        "component": "orderbook-sync",
        "markets": markets,
        "timestamp": chrono::Utc::now().to_rfc3339()
    }));
    (status, body).into_response()
}

async fn metrics(State(state): State<AppState>) -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&state.registry.gather(), &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        [(axum::http::header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

async fn book(State(state): State<AppState>, Path(market): Path<String>) -> Response {
    match state.router.book(&MarketId::from(market.to_uppercase())) {
        Some(book) => Json(book.snapshot_view()).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("market {} is not tracked", market) })),
        )
            .into_response(),
    }
}
