//! Types for the signal backtesting engine

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const MINUTE_MS: i64 = 60 * 1000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;

/// A single candlestick (OHLCV)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub close_time: i64,
}

/// Candle resolution, serialized with the Binance interval notation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "2h")]
    H2,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "6h")]
    H6,
    #[serde(rename = "12h")]
    H12,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "1w")]
    W1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 12] = [
        Timeframe::M1,
        Timeframe::M3,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H2,
        Timeframe::H4,
        Timeframe::H6,
        Timeframe::H12,
        Timeframe::D1,
        Timeframe::W1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M3 => "3m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H2 => "2h",
            Timeframe::H4 => "4h",
            Timeframe::H6 => "6h",
            Timeframe::H12 => "12h",
            Timeframe::D1 => "1d",
            Timeframe::W1 => "1w",
        }
    }

    /// Length of one bar in milliseconds
    pub fn duration_ms(&self) -> i64 {
        match self {
            Timeframe::M1 => MINUTE_MS,
            Timeframe::M3 => 3 * MINUTE_MS,
            Timeframe::M5 => 5 * MINUTE_MS,
            Timeframe::M15 => 15 * MINUTE_MS,
            Timeframe::M30 => 30 * MINUTE_MS,
            Timeframe::H1 => HOUR_MS,
            Timeframe::H2 => 2 * HOUR_MS,
            Timeframe::H4 => 4 * HOUR_MS,
            Timeframe::H6 => 6 * HOUR_MS,
            Timeframe::H12 => 12 * HOUR_MS,
            Timeframe::D1 => DAY_MS,
            Timeframe::W1 => 7 * DAY_MS,
        }
    }

    /// Largest date span fetched in one chunk. Finer resolutions get
    /// smaller chunks so a single provider call stays well under its timeout.
    pub fn max_chunk_days(&self) -> i64 {
        match self {
            Timeframe::M1 | Timeframe::M3 | Timeframe::M5 | Timeframe::M15 | Timeframe::M30 => 7,
            Timeframe::H1 | Timeframe::H2 | Timeframe::H4 | Timeframe::H6 | Timeframe::H12 => 30,
            Timeframe::D1 => 90,
            Timeframe::W1 => 365,
        }
    }

    pub fn max_chunk_ms(&self) -> i64 {
        self.max_chunk_days() * DAY_MS
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timeframe::ALL
            .iter()
            .copied()
            .find(|tf| tf.as_str() == s)
            .ok_or_else(|| format!("unknown timeframe '{}'", s))
    }
}

/// Direction of the proposed trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => write!(f, "long"),
            Direction::Short => write!(f, "short"),
        }
    }
}

/// A trade signal to be scored against history. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestInput {
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: Decimal,
    /// Entry time in milliseconds since epoch
    pub entry_timestamp: i64,
    pub tp1_price: Decimal,
    /// Percent of the position closed at TP1 (e.g., 30 = 30%)
    pub tp1_allocation: Decimal,
    pub tp2_price: Decimal,
    pub tp2_allocation: Decimal,
    pub tp3_price: Decimal,
    pub tp3_allocation: Decimal,
    pub stop_loss_price: Decimal,
    pub timeframe_expiration_hours: i64,
}

impl BacktestInput {
    /// Last timestamp (inclusive) at which a candle may still be simulated
    pub fn expiration_deadline(&self) -> i64 {
        self.entry_timestamp
            .saturating_add(self.timeframe_expiration_hours.saturating_mul(HOUR_MS))
    }

    /// Take-profit levels in evaluation order: (price, allocation)
    pub fn targets(&self) -> [(Decimal, Decimal); 3] {
        [
            (self.tp1_price, self.tp1_allocation),
            (self.tp2_price, self.tp2_allocation),
            (self.tp3_price, self.tp3_allocation),
        ]
    }
}

/// Record of a price level being reached
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LevelHit {
    pub hit: bool,
    pub hit_at: Option<i64>,
    pub hit_price: Option<Decimal>,
}

impl LevelHit {
    pub(crate) fn record(&mut self, at: i64, price: Decimal) {
        self.hit = true;
        self.hit_at = Some(at);
        self.hit_price = Some(price);
    }
}

/// Position lifecycle during a single run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeState {
    #[default]
    Open,
    PartiallyClosed,
    ClosedByStop,
    ClosedByTargets,
    Expired,
}

impl TradeState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TradeState::ClosedByStop | TradeState::ClosedByTargets | TradeState::Expired
        )
    }
}

/// Per-run target bookkeeping. `remaining_allocation` starts at 100 and only decreases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetState {
    pub tp1: LevelHit,
    pub tp2: LevelHit,
    pub tp3: LevelHit,
    pub stop_loss: LevelHit,
    pub remaining_allocation: Decimal,
    /// Allocation that was still open when the stop-loss fired
    pub stopped_allocation: Decimal,
    /// P/L locked in by target and stop fills
    pub realized_pnl_usd: Decimal,
    /// Mark-to-market P/L of the allocation still open at expiration
    pub unrealized_pnl_usd: Decimal,
    pub profit_loss_usd: Decimal,
    pub state: TradeState,
}

impl Default for TargetState {
    fn default() -> Self {
        Self {
            tp1: LevelHit::default(),
            tp2: LevelHit::default(),
            tp3: LevelHit::default(),
            stop_loss: LevelHit::default(),
            remaining_allocation: dec!(100),
            stopped_allocation: Decimal::ZERO,
            realized_pnl_usd: Decimal::ZERO,
            unrealized_pnl_usd: Decimal::ZERO,
            profit_loss_usd: Decimal::ZERO,
            state: TradeState::Open,
        }
    }
}

impl TargetState {
    pub fn targets(&self) -> [&LevelHit; 3] {
        [&self.tp1, &self.tp2, &self.tp3]
    }

    pub(crate) fn target_mut(&mut self, index: usize) -> &mut LevelHit {
        match index {
            0 => &mut self.tp1,
            1 => &mut self.tp2,
            _ => &mut self.tp3,
        }
    }

    pub fn targets_hit(&self) -> usize {
        self.targets().iter().filter(|t| t.hit).count()
    }
}

/// Terminal label of a backtest run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BacktestStatus {
    CompletedSuccess,
    CompletedFailure,
    Expired,
    Invalid,
}

impl BacktestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BacktestStatus::CompletedSuccess => "completed_success",
            BacktestStatus::CompletedFailure => "completed_failure",
            BacktestStatus::Expired => "expired",
            BacktestStatus::Invalid => "invalid",
        }
    }
}

impl fmt::Display for BacktestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BacktestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed_success" => Ok(BacktestStatus::CompletedSuccess),
            "completed_failure" => Ok(BacktestStatus::CompletedFailure),
            "expired" => Ok(BacktestStatus::Expired),
            "invalid" => Ok(BacktestStatus::Invalid),
            other => Err(format!("unknown backtest status '{}'", other)),
        }
    }
}

/// Result of a backtest run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub symbol: String,
    pub direction: Direction,
    pub status: BacktestStatus,
    pub targets: TargetState,
    pub profit_loss_usd: Decimal,
    pub profit_loss_percent: Decimal,
    pub candles_evaluated: usize,
    /// Close of the last candle examined
    pub last_price: Option<Decimal>,
    /// Timestamp of the terminal event (stop, final target or last candle)
    pub closed_at: Option<i64>,
    pub validation_error: Option<String>,
}

impl BacktestResult {
    /// Allocation closed by targets and stop plus what is still open.
    /// Always 100 for a simulated run.
    pub fn allocation_accounted(&self, input: &BacktestInput) -> Decimal {
        let from_targets: Decimal = input
            .targets()
            .iter()
            .zip(self.targets.targets())
            .filter(|(_, hit)| hit.hit)
            .map(|((_, alloc), _)| *alloc)
            .sum();
        from_targets + self.targets.stopped_allocation + self.targets.remaining_allocation
    }
}
