//! Error taxonomy for validation, simulation and candle retrieval

use rust_decimal::Decimal;
use thiserror::Error;

use crate::types::{Direction, Timeframe};

/// First invariant a trade signal violates
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvalidInputError {
    #[error("symbol must not be empty")]
    EmptySymbol,

    #[error("{field} must be positive, got {value}")]
    NonPositivePrice { field: &'static str, value: Decimal },

    #[error("{field} must not be negative, got {value}")]
    NegativeAllocation { field: &'static str, value: Decimal },

    #[error("take-profit allocations must sum to 100, got {sum}")]
    AllocationSum { sum: Decimal },

    #[error("{direction} trade requires {lower} ({lower_value}) < {upper} ({upper_value})")]
    PriceOrdering {
        direction: Direction,
        lower: &'static str,
        lower_value: Decimal,
        upper: &'static str,
        upper_value: Decimal,
    },

    #[error("timeframe_expiration_hours must be positive, got {0}")]
    NonPositiveTimeframe(i64),
}

/// Failures inside the replay loop. Deterministic, so never retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimulationError {
    #[error("malformed candle at index {index}: {reason}")]
    MalformedCandle { index: usize, reason: String },

    #[error("no candle at or after entry time {entry_timestamp} (last candle at {last_open_time:?})")]
    NoCandlesAfterEntry {
        entry_timestamp: i64,
        last_open_time: Option<i64>,
    },

    /// Prices so far apart that a P/L figure leaves the `Decimal` range
    #[error("arithmetic overflow computing {quantity}")]
    ArithmeticOverflow { quantity: &'static str },
}

/// Failures of the chunked candle retrieval
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("invalid fetch range: start {start} must be before end {end}")]
    InvalidRange { start: i64, end: i64 },

    #[error(
        "no candles for {symbol} {timeframe} between {requested_start} and {requested_end} \
         ({chunks_failed} of {chunks_planned} chunks failed)"
    )]
    DataUnavailable {
        symbol: String,
        timeframe: Timeframe,
        requested_start: i64,
        requested_end: i64,
        chunks_planned: usize,
        chunks_failed: usize,
    },
}
