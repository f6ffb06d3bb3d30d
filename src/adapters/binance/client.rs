//! Combined-stream WebSocket connection

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::Message,
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::error::{MarketDataError, Result};
use crate::message::MarketId;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Depth and trade streams for a set of markets over one connection
pub struct WebSocketClient {
    stream: Option<WsStream>,
    endpoint: String,
    markets: Vec<MarketId>,
}

impl WebSocketClient {
    pub fn new(endpoint: &str, markets: Vec<MarketId>) -> Self {
        Self {
            stream: None,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            markets,
        }
    }

    /// `{endpoint}/stream?streams=<sym>@depth@100ms/<sym>@trade/...`
    pub fn stream_url(&self) -> String {
        let streams: Vec<String> = self
            .markets
            .iter()
            .flat_map(|market| {
                let symbol = market.as_str().to_lowercase();
                [format!("{}@depth@100ms", symbol), format!("{}@trade", symbol)]
            })
            .collect();

        format!("{}/stream?streams={}", self.endpoint, streams.join("/"))
    }

    pub async fn connect(&mut self) -> Result<()> {
        let url = self.stream_url();
        info!(url = %url, markets = self.markets.len(), "Connecting to Binance WebSocket");

        let (ws_stream, response) = connect_async(&url).await.map_err(|e| {
            MarketDataError::WebSocketConnection(format!("Failed to connect: {}", e))
        })?;

        info!(status = ?response.status(), "WebSocket connected");
        self.stream = Some(ws_stream);
        Ok(())
    }

    /// Next text payload; `Ok(None)` for control frames
    pub async fn recv(&mut self) -> Result<Option<String>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| MarketDataError::WebSocketConnection("Not connected".to_string()))?;

        match stream.next().await {
            Some(Ok(Message::Text(text))) => Ok(Some(text)),
            Some(Ok(Message::Binary(data))) => Ok(Some(String::from_utf8_lossy(&data).into_owned())),
            Some(Ok(Message::Ping(data))) => {
                debug!("Received ping, sending pong");
                if let Err(e) = stream.send(Message::Pong(data)).await {
                    warn!(error = %e, "Failed to answer ping");
                }
                Ok(None)
            }
            Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => Ok(None),
            Some(Ok(Message::Close(frame))) => {
                warn!(frame = ?frame, "Received close frame");
                self.stream = None;
                Err(MarketDataError::WebSocketConnection(
                    "Connection closed".to_string(),
                ))
            }
            Some(Err(e)) => {
                error!(error = %e, "WebSocket error");
                self.stream = None;
                Err(MarketDataError::WebSocketMessage(e.to_string()))
            }
            None => {
                warn!("WebSocket stream ended");
                self.stream = None;
                Err(MarketDataError::WebSocketConnection(
                    "Stream ended".to_string(),
                ))
            }
        }
    }

    pub async fn ping(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.as_mut() {
            stream
                .send(Message::Ping(vec![]))
                .await
                .map_err(|e| MarketDataError::WebSocketMessage(e.to_string()))?;
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(None).await;
        }
    }
}
