//! Fetch-then-simulate glue shared by the CLI commands and the HTTP API

use engine::{
    run_backtest, validate_input, BacktestInput, BacktestResult, CandleSeries, ChunkedFetcher,
    FetchError, PartialData, SimulationError, Timeframe,
};
use persistence::repository::{BacktestRecord, BacktestRepository};
use persistence::{DbResult, SqlitePool};
use serde::Serialize;
use std::sync::atomic::AtomicBool;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Carries the `invalid` result so callers can still report it
    #[error("Invalid signal: {}", .0.validation_error.as_deref().unwrap_or("unknown"))]
    Invalid(Box<BacktestResult>),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Simulation(#[from] SimulationError),

    #[error("Backtest task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// A finished backtest plus the metadata of the candle fetch behind it
#[derive(Debug, Clone, Serialize)]
pub struct ScoredSignal {
    pub result: BacktestResult,
    pub timeframe: Timeframe,
    pub chunks_planned: usize,
    pub chunks_used: usize,
    pub partial: Option<PartialData>,
}

/// Half-open fetch window for a signal: from entry up to and including the
/// expiration deadline, never past `now_ms`
pub fn fetch_window(input: &BacktestInput, now_ms: i64, end_override: Option<i64>) -> (i64, i64) {
    let end = end_override
        .unwrap_or_else(|| input.expiration_deadline().saturating_add(1))
        .min(now_ms);
    (input.entry_timestamp, end)
}

/// Fetch the candles a valid signal needs
pub async fn fetch_for_signal(
    fetcher: &ChunkedFetcher,
    input: &BacktestInput,
    timeframe: Timeframe,
    end_override: Option<i64>,
    cancel: &AtomicBool,
) -> Result<CandleSeries, FetchError> {
    let now_ms = chrono::Utc::now().timestamp_millis();
    let (start, end) = fetch_window(input, now_ms, end_override);
    fetcher
        .fetch_candle_series(&input.symbol, timeframe, start, end, cancel)
        .await
}

/// Validate, fetch and simulate one signal
pub async fn score_signal(
    fetcher: &ChunkedFetcher,
    input: BacktestInput,
    timeframe: Timeframe,
    end_override: Option<i64>,
    cancel: &AtomicBool,
) -> Result<ScoredSignal, PipelineError> {
    if let Err(e) = validate_input(&input) {
        warn!(symbol = %input.symbol, error = %e, "Signal rejected");
        // Invalid input short-circuits before any candle is looked at
        let result = run_backtest(&input, &[])?;
        return Err(PipelineError::Invalid(Box::new(result)));
    }

    let series = fetch_for_signal(fetcher, &input, timeframe, end_override, cancel).await?;
    let partial = series.partial_data();
    let chunks_planned = series.chunks_planned;
    let chunks_used = series.chunks_used;
    let candles = series.candles;

    let result = tokio::task::spawn_blocking(move || run_backtest(&input, &candles)).await??;

    info!(
        symbol = %result.symbol,
        status = %result.status,
        pnl = %result.profit_loss_usd,
        candles = result.candles_evaluated,
        "Backtest complete"
    );

    Ok(ScoredSignal {
        result,
        timeframe,
        chunks_planned,
        chunks_used,
        partial,
    })
}

/// Store a result, keyed by the signal and timeframe
pub async fn save_result(
    pool: &SqlitePool,
    input: &BacktestInput,
    timeframe: Timeframe,
    result: &BacktestResult,
    chunks_used: usize,
    partial_data: bool,
) -> DbResult<i64> {
    let record = BacktestRecord::from_result(input, timeframe, result, chunks_used, partial_data)?;
    BacktestRepository::new(pool).save(&record).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use engine::{BacktestStatus, CandleProvider, Direction, FetchConfig, Kline};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use std::time::Duration;

    const HOUR: i64 = 3_600_000;
    const ENTRY_TS: i64 = 1_700_000_000_000;

    /// Serves a fixed candle list, filtered to the requested range
    struct StaticProvider {
        klines: Vec<Kline>,
    }

    #[async_trait]
    impl CandleProvider for StaticProvider {
        async fn fetch_range(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            start: i64,
            end: i64,
        ) -> anyhow::Result<Vec<Kline>> {
            Ok(self
                .klines
                .iter()
                .filter(|k| k.open_time >= start && k.open_time < end)
                .cloned()
                .collect())
        }
    }

    fn candle(open_time: i64, high: Decimal, low: Decimal, close: Decimal) -> Kline {
        Kline {
            open_time,
            open: low,
            high,
            low,
            close,
            volume: dec!(1),
            close_time: open_time + HOUR - 1,
        }
    }

    fn signal() -> BacktestInput {
        BacktestInput {
            symbol: "BTCUSDT".to_string(),
            direction: Direction::Long,
            entry_price: dec!(100000),
            entry_timestamp: ENTRY_TS,
            tp1_price: dec!(102000),
            tp1_allocation: dec!(30),
            tp2_price: dec!(104000),
            tp2_allocation: dec!(40),
            tp3_price: dec!(106000),
            tp3_allocation: dec!(30),
            stop_loss_price: dec!(98000),
            timeframe_expiration_hours: 24,
        }
    }

    fn fetcher(klines: Vec<Kline>) -> ChunkedFetcher {
        let config = FetchConfig {
            inter_chunk_delay: Duration::ZERO,
            max_attempts: 1,
            retry_delay: Duration::ZERO,
            chunk_timeout: Duration::from_secs(5),
        };
        ChunkedFetcher::new(Arc::new(StaticProvider { klines }), config)
    }

    #[test]
    fn test_fetch_window_ends_after_deadline() {
        let input = signal();
        let (start, end) = fetch_window(&input, i64::MAX, None);
        assert_eq!(start, ENTRY_TS);
        assert_eq!(end, ENTRY_TS + 24 * HOUR + 1);
    }

    #[test]
    fn test_fetch_window_is_capped_at_now() {
        let input = signal();
        let now = ENTRY_TS + 5 * HOUR;
        assert_eq!(fetch_window(&input, now, None), (ENTRY_TS, now));
        assert_eq!(
            fetch_window(&input, i64::MAX, Some(ENTRY_TS + HOUR)),
            (ENTRY_TS, ENTRY_TS + HOUR)
        );
    }

    #[tokio::test]
    async fn test_score_signal_runs_fetched_candles() {
        let klines = vec![
            candle(ENTRY_TS, dec!(102500), dec!(99500), dec!(102000)),
            candle(ENTRY_TS + HOUR, dec!(104200), dec!(101000), dec!(104000)),
            candle(ENTRY_TS + 2 * HOUR, dec!(106100), dec!(103000), dec!(106000)),
        ];
        let cancel = AtomicBool::new(false);

        let scored = score_signal(
            &fetcher(klines),
            signal(),
            Timeframe::H1,
            Some(ENTRY_TS + 3 * HOUR),
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(scored.result.status, BacktestStatus::CompletedSuccess);
        assert_eq!(scored.result.profit_loss_usd, dec!(4000));
        assert_eq!(scored.chunks_used, 1);
        assert!(scored.partial.is_none());
    }

    #[tokio::test]
    async fn test_invalid_signal_skips_fetch() {
        let mut input = signal();
        input.tp3_allocation = dec!(20);
        let cancel = AtomicBool::new(false);

        let err = score_signal(&fetcher(Vec::new()), input, Timeframe::H1, None, &cancel)
            .await
            .unwrap_err();

        match err {
            PipelineError::Invalid(result) => {
                assert_eq!(result.status, BacktestStatus::Invalid);
                assert!(result.validation_error.is_some());
            }
            other => panic!("expected invalid, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_candles_is_a_fetch_error() {
        let cancel = AtomicBool::new(false);
        let err = score_signal(
            &fetcher(Vec::new()),
            signal(),
            Timeframe::H1,
            Some(ENTRY_TS + 3 * HOUR),
            &cancel,
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Fetch(FetchError::DataUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_save_result_upserts() {
        let db = persistence::Database::in_memory().await.unwrap();
        let input = signal();
        let klines = vec![candle(ENTRY_TS, dec!(101000), dec!(99000), dec!(100500))];
        let result = run_backtest(&input, &klines).unwrap();

        let first = save_result(db.pool(), &input, Timeframe::H1, &result, 1, false)
            .await
            .unwrap();
        let second = save_result(db.pool(), &input, Timeframe::H1, &result, 1, true)
            .await
            .unwrap();
        assert_eq!(first, second);

        let stats = BacktestRepository::new(db.pool()).get_stats().await.unwrap();
        assert_eq!(stats.total_backtests, 1);
        assert_eq!(stats.partial_data_runs, 1);
    }
}
