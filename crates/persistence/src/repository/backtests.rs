//! Backtest results repository

use crate::{DbError, DbResult};
use engine::{BacktestInput, BacktestResult, Timeframe};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{FromRow, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};

/// A stored backtest result
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BacktestRecord {
    pub id: Option<i64>,
    pub signal_hash: String,
    pub symbol: String,
    pub direction: String,
    pub timeframe: String,
    pub entry_price: String,
    pub entry_timestamp: i64,
    pub signal_json: String,
    pub status: String,
    pub trade_state: String,
    pub profit_loss_usd: String,
    pub profit_loss_percent: String,
    pub realized_pnl_usd: String,
    pub unrealized_pnl_usd: String,
    pub remaining_allocation: String,
    pub tp1_hit: bool,
    pub tp1_hit_at: Option<i64>,
    pub tp2_hit: bool,
    pub tp2_hit_at: Option<i64>,
    pub tp3_hit: bool,
    pub tp3_hit_at: Option<i64>,
    pub stop_loss_hit: bool,
    pub stop_loss_hit_at: Option<i64>,
    pub candles_evaluated: i64,
    pub chunks_used: i64,
    /// Some candle chunks failed; the result is lower confidence
    pub partial_data: bool,
    pub validation_error: Option<String>,
    pub result_json: String,
    pub created_at: Option<i64>,
}

impl BacktestRecord {
    /// Build a record from a finished run and the metadata of its candle fetch
    pub fn from_result(
        input: &BacktestInput,
        timeframe: Timeframe,
        result: &BacktestResult,
        chunks_used: usize,
        partial_data: bool,
    ) -> DbResult<Self> {
        let targets = &result.targets;
        let trade_state = serde_json::to_value(targets.state)?
            .as_str()
            .unwrap_or_default()
            .to_string();

        Ok(Self {
            id: None,
            signal_hash: compute_signal_hash(input, timeframe)?,
            symbol: input.symbol.clone(),
            direction: input.direction.to_string(),
            timeframe: timeframe.to_string(),
            entry_price: input.entry_price.to_string(),
            entry_timestamp: input.entry_timestamp,
            signal_json: serde_json::to_string(input)?,
            status: result.status.to_string(),
            trade_state,
            profit_loss_usd: result.profit_loss_usd.to_string(),
            profit_loss_percent: result.profit_loss_percent.to_string(),
            realized_pnl_usd: targets.realized_pnl_usd.to_string(),
            unrealized_pnl_usd: targets.unrealized_pnl_usd.to_string(),
            remaining_allocation: targets.remaining_allocation.to_string(),
            tp1_hit: targets.tp1.hit,
            tp1_hit_at: targets.tp1.hit_at,
            tp2_hit: targets.tp2.hit,
            tp2_hit_at: targets.tp2.hit_at,
            tp3_hit: targets.tp3.hit,
            tp3_hit_at: targets.tp3.hit_at,
            stop_loss_hit: targets.stop_loss.hit,
            stop_loss_hit_at: targets.stop_loss.hit_at,
            candles_evaluated: result.candles_evaluated as i64,
            chunks_used: chunks_used as i64,
            partial_data,
            validation_error: result.validation_error.clone(),
            result_json: serde_json::to_string(result)?,
            created_at: None,
        })
    }

    /// Decode the full result stored alongside the flat columns
    pub fn result(&self) -> DbResult<BacktestResult> {
        Ok(serde_json::from_str(&self.result_json)?)
    }
}

/// Aggregated stats over stored results
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BacktestStats {
    pub total_backtests: i64,
    pub completed_success: i64,
    pub completed_failure: i64,
    pub expired: i64,
    pub invalid: i64,
    pub partial_data_runs: i64,
    /// Mean P/L percent over simulated (non-invalid) runs
    pub avg_profit_loss_percent: String,
}

/// Compute a deterministic hash for deduplication of scored signals
pub fn compute_signal_hash(input: &BacktestInput, timeframe: Timeframe) -> DbResult<String> {
    let payload = format!("{}|{}", serde_json::to_string(input)?, timeframe);
    let hash = Sha256::digest(payload.as_bytes());
    Ok(format!("{:x}", hash))
}

/// Repository for backtest results
pub struct BacktestRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> BacktestRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace a result (upsert by signal_hash)
    pub async fn save(&self, record: &BacktestRecord) -> DbResult<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO backtest_results (
                signal_hash, symbol, direction, timeframe, entry_price, entry_timestamp,
                signal_json, status, trade_state,
                profit_loss_usd, profit_loss_percent, realized_pnl_usd, unrealized_pnl_usd,
                remaining_allocation,
                tp1_hit, tp1_hit_at, tp2_hit, tp2_hit_at, tp3_hit, tp3_hit_at,
                stop_loss_hit, stop_loss_hit_at,
                candles_evaluated, chunks_used, partial_data, validation_error, result_json
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(signal_hash) DO UPDATE SET
                status = excluded.status,
                trade_state = excluded.trade_state,
                profit_loss_usd = excluded.profit_loss_usd,
                profit_loss_percent = excluded.profit_loss_percent,
                realized_pnl_usd = excluded.realized_pnl_usd,
                unrealized_pnl_usd = excluded.unrealized_pnl_usd,
                remaining_allocation = excluded.remaining_allocation,
                tp1_hit = excluded.tp1_hit,
                tp1_hit_at = excluded.tp1_hit_at,
                tp2_hit = excluded.tp2_hit,
                tp2_hit_at = excluded.tp2_hit_at,
                tp3_hit = excluded.tp3_hit,
                tp3_hit_at = excluded.tp3_hit_at,
                stop_loss_hit = excluded.stop_loss_hit,
                stop_loss_hit_at = excluded.stop_loss_hit_at,
                candles_evaluated = excluded.candles_evaluated,
                chunks_used = excluded.chunks_used,
                partial_data = excluded.partial_data,
                validation_error = excluded.validation_error,
                result_json = excluded.result_json,
                created_at = strftime('%s', 'now')
            RETURNING id
            "#,
        )
        .bind(&record.signal_hash)
        .bind(&record.symbol)
        .bind(&record.direction)
        .bind(&record.timeframe)
        .bind(&record.entry_price)
        .bind(record.entry_timestamp)
        .bind(&record.signal_json)
        .bind(&record.status)
        .bind(&record.trade_state)
        .bind(&record.profit_loss_usd)
        .bind(&record.profit_loss_percent)
        .bind(&record.realized_pnl_usd)
        .bind(&record.unrealized_pnl_usd)
        .bind(&record.remaining_allocation)
        .bind(record.tp1_hit)
        .bind(record.tp1_hit_at)
        .bind(record.tp2_hit)
        .bind(record.tp2_hit_at)
        .bind(record.tp3_hit)
        .bind(record.tp3_hit_at)
        .bind(record.stop_loss_hit)
        .bind(record.stop_loss_hit_at)
        .bind(record.candles_evaluated)
        .bind(record.chunks_used)
        .bind(record.partial_data)
        .bind(&record.validation_error)
        .bind(&record.result_json)
        .fetch_one(self.pool)
        .await?;

        debug!(id, symbol = %record.symbol, status = %record.status, "Stored backtest result");
        Ok(id)
    }

    /// Get a result by signal_hash
    pub async fn get_by_hash(&self, hash: &str) -> DbResult<Option<BacktestRecord>> {
        let record = sqlx::query_as::<_, BacktestRecord>(
            "SELECT * FROM backtest_results WHERE signal_hash = ?",
        )
        .bind(hash)
        .fetch_optional(self.pool)
        .await?;

        Ok(record)
    }

    /// Most recently stored results first
    pub async fn list_recent(&self, limit: i64) -> DbResult<Vec<BacktestRecord>> {
        let records = sqlx::query_as::<_, BacktestRecord>(
            "SELECT * FROM backtest_results ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }

    /// Results for one symbol, latest entry first
    pub async fn list_by_symbol(&self, symbol: &str, limit: i64) -> DbResult<Vec<BacktestRecord>> {
        let records = sqlx::query_as::<_, BacktestRecord>(
            "SELECT * FROM backtest_results WHERE symbol = ? ORDER BY entry_timestamp DESC LIMIT ?",
        )
        .bind(symbol)
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }

    /// Counts per status plus mean P/L percent of simulated runs
    pub async fn get_stats(&self) -> DbResult<BacktestStats> {
        let counts: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM backtest_results GROUP BY status")
                .fetch_all(self.pool)
                .await?;

        let (partial_data_runs,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM backtest_results WHERE partial_data = 1")
                .fetch_one(self.pool)
                .await?;

        let pnl_rows: Vec<(String,)> = sqlx::query_as(
            "SELECT profit_loss_percent FROM backtest_results WHERE status != 'invalid'",
        )
        .fetch_all(self.pool)
        .await?;

        // Averaged in Decimal: the column is TEXT to keep full precision
        let mut sum = Decimal::ZERO;
        for (value,) in &pnl_rows {
            sum += Decimal::from_str(value)
                .map_err(|e| DbError::Query(format!("bad profit_loss_percent '{value}': {e}")))?;
        }
        let avg = if pnl_rows.is_empty() {
            Decimal::ZERO
        } else {
            (sum / Decimal::from(pnl_rows.len())).round_dp(4)
        };

        let count_of = |status: &str| {
            counts
                .iter()
                .find(|(s, _)| s == status)
                .map(|(_, n)| *n)
                .unwrap_or(0)
        };

        Ok(BacktestStats {
            total_backtests: counts.iter().map(|(_, n)| n).sum(),
            completed_success: count_of("completed_success"),
            completed_failure: count_of("completed_failure"),
            expired: count_of("expired"),
            invalid: count_of("invalid"),
            partial_data_runs,
            avg_profit_loss_percent: avg.to_string(),
        })
    }

    /// Delete results stored before `cutoff` (unix seconds). Returns rows removed.
    pub async fn delete_older_than(&self, cutoff: i64) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM backtest_results WHERE created_at < ?")
            .bind(cutoff)
            .execute(self.pool)
            .await?;

        let removed = result.rows_affected();
        if removed > 0 {
            info!(removed, cutoff, "Pruned old backtest results");
        }
        Ok(removed)
    }
}
