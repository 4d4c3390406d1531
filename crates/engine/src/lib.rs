//! Signal Backtest Engine — replay of trade signals against historical candles
//!
//! Provides:
//! - Trade signal validation
//! - Deterministic candle-by-candle simulation with partial take-profit fills
//! - Parallel batch runner for independent backtests
//! - Chunked, retrying candle fetch coordinator
//! - Binance public API client for market data

pub mod api;
pub mod batch;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod types;
pub mod validation;

// Re-exports for convenience
pub use api::BinanceClient;
pub use batch::{run_batch, summarize, BacktestJob, BatchOutcome, BatchSummary};
pub use engine::BacktestEngine;
pub use error::{FetchError, InvalidInputError, SimulationError};
pub use fetch::{
    plan_chunks, CandleProvider, CandleSeries, ChunkFailure, ChunkWindow, ChunkedFetcher,
    FetchConfig, PartialData,
};
pub use types::*;
pub use validation::validate_input;

/// Replay `input` against `klines`
pub fn run_backtest(
    input: &BacktestInput,
    klines: &[Kline],
) -> Result<BacktestResult, SimulationError> {
    BacktestEngine::run(input, klines)
}
