//! Binance wire formats
//!
//! Deserializes depth updates, trades and REST snapshots and converts them
//! into [`CanonicalMessage`]s.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use std::str::FromStr;

use crate::message::{CanonicalMessage, MarketId};
use crate::orderbook::PriceLevel;

/// Binance depth update message
#[derive(Debug, Clone, Deserialize)]
pub struct DepthUpdate {
    #[serde(rename = "e")]
    pub event_type: String,

    /// Event time (milliseconds)
    #[serde(rename = "E")]
    pub event_time: i64,

    #[serde(rename = "s")]
    pub symbol: String,

    /// First update ID in event
    #[serde(rename = "U")]
    pub first_update_id: u64,

    /// Final update ID in event
    #[serde(rename = "u")]
    pub final_update_id: u64,

    #[serde(rename = "b", deserialize_with = "deserialize_price_levels")]
    pub bids: Vec<PriceLevel>,

    #[serde(rename = "a", deserialize_with = "deserialize_price_levels")]
    pub asks: Vec<PriceLevel>,
}

impl DepthUpdate {
    pub fn into_canonical(self) -> CanonicalMessage {
        CanonicalMessage::diff(self.symbol, self.final_update_id, self.bids, self.asks)
            .with_first_sequence(self.first_update_id)
            .with_timestamp(millis_to_utc(self.event_time))
    }
}

/// Binance trade message
#[derive(Debug, Clone, Deserialize)]
pub struct Trade {
    #[serde(rename = "e")]
    pub event_type: String,

    #[serde(rename = "E")]
    pub event_time: i64,

    #[serde(rename = "s")]
    pub symbol: String,

    #[serde(rename = "t")]
    pub trade_id: u64,

    #[serde(rename = "p", deserialize_with = "deserialize_decimal")]
    pub price: Decimal,

    #[serde(rename = "q", deserialize_with = "deserialize_decimal")]
    pub quantity: Decimal,

    /// Trade time
    #[serde(rename = "T")]
    pub trade_time: i64,

    /// Buyer was the maker, so the aggressor sold
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,
}

impl Trade {
    pub fn into_canonical(self) -> CanonicalMessage {
        CanonicalMessage::trade(
            self.symbol,
            PriceLevel::new(self.price, self.quantity),
            !self.is_buyer_maker,
        )
        .with_timestamp(millis_to_utc(self.trade_time))
    }
}

/// Order book snapshot from REST API
#[derive(Debug, Clone, Deserialize)]
pub struct OrderBookSnapshot {
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: u64,

    #[serde(deserialize_with = "deserialize_price_levels")]
    pub bids: Vec<PriceLevel>,

    #[serde(deserialize_with = "deserialize_price_levels")]
    pub asks: Vec<PriceLevel>,
}

impl OrderBookSnapshot {
    /// The REST payload does not name its symbol
    pub fn into_canonical(self, market: MarketId) -> CanonicalMessage {
        CanonicalMessage::snapshot(market, self.last_update_id, self.bids, self.asks)
    }
}

/// Combined stream message wrapper
#[derive(Debug, Clone, Deserialize)]
pub struct StreamMessage {
    pub stream: String,
    pub data: serde_json::Value,
}

/// Parsed WebSocket message
#[derive(Debug, Clone)]
pub enum ParsedMessage {
    DepthUpdate(DepthUpdate),
    Trade(Trade),
    Unknown(String),
}

impl ParsedMessage {
    /// Parse a raw WebSocket message
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        // Combined streams wrap the payload
        if let Ok(stream_msg) = serde_json::from_str::<StreamMessage>(raw) {
            return Self::parse_stream_data(&stream_msg.stream, stream_msg.data);
        }

        if let Ok(depth) = serde_json::from_str::<DepthUpdate>(raw) {
            if depth.event_type == "depthUpdate" {
                return Ok(ParsedMessage::DepthUpdate(depth));
            }
        }

        if let Ok(trade) = serde_json::from_str::<Trade>(raw) {
            if trade.event_type == "trade" {
                return Ok(ParsedMessage::Trade(trade));
            }
        }

        Ok(ParsedMessage::Unknown(raw.to_string()))
    }

    fn parse_stream_data(stream: &str, data: serde_json::Value) -> Result<Self, serde_json::Error> {
        if stream.contains("@depth") {
            Ok(ParsedMessage::DepthUpdate(serde_json::from_value(data)?))
        } else if stream.ends_with("@trade") {
            Ok(ParsedMessage::Trade(serde_json::from_value(data)?))
        } else {
            Ok(ParsedMessage::Unknown(data.to_string()))
        }
    }

    /// `None` for payloads the engine does not consume
    pub fn into_canonical(self) -> Option<CanonicalMessage> {
        match self {
            ParsedMessage::DepthUpdate(depth) => Some(depth.into_canonical()),
            ParsedMessage::Trade(trade) => Some(trade.into_canonical()),
            ParsedMessage::Unknown(_) => None,
        }
    }
}

fn millis_to_utc(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
}

fn deserialize_decimal<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    let s: &str = Deserialize::deserialize(deserializer)?;
    Decimal::from_str(s).map_err(serde::de::Error::custom)
}

/// Price levels arrive as `[["price", "qty"], ...]`
fn deserialize_price_levels<'de, D>(deserializer: D) -> Result<Vec<PriceLevel>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<Vec<String>> = Deserialize::deserialize(deserializer)?;
    raw.into_iter()
        .map(|pair| {
            if pair.len() != 2 {
                return Err(serde::de::Error::custom("Invalid price level format"));
            }
            Ok(PriceLevel::new(
                Decimal::from_str(&pair[0]).map_err(serde::de::Error::custom)?,
                Decimal::from_str(&pair[1]).map_err(serde::de::Error::custom)?,
            ))
        })
        .collect()
}
