//! Market data provider clients

pub mod binance;

pub use binance::BinanceClient;
