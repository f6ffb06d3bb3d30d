//! Exchange adapters implementing [`MarketDataSource`](crate::source::MarketDataSource)

pub mod binance;

pub use binance::{BinanceSettings, BinanceSource};
