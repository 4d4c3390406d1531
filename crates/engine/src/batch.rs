//! Parallel execution of independent backtests
//!
//! Every run owns its own `TargetState`, so jobs are spread over the rayon
//! pool with no coordination. Output order matches input order.

use rayon::prelude::*;
use serde::Serialize;
use tracing::info;

use crate::engine::BacktestEngine;
use crate::error::SimulationError;
use crate::types::{BacktestInput, BacktestResult, BacktestStatus, Kline};

/// One signal paired with the candles it should be replayed against
#[derive(Debug, Clone)]
pub struct BacktestJob {
    pub input: BacktestInput,
    pub klines: Vec<Kline>,
}

/// Outcome of a single job in a batch
#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub symbol: String,
    pub result: Option<BacktestResult>,
    pub error: Option<String>,
}

impl BatchOutcome {
    fn from_run(symbol: &str, run: Result<BacktestResult, SimulationError>) -> Self {
        match run {
            Ok(result) => Self {
                symbol: symbol.to_string(),
                result: Some(result),
                error: None,
            },
            Err(e) => Self {
                symbol: symbol.to_string(),
                result: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Summary counts over a finished batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub completed_success: usize,
    pub completed_failure: usize,
    pub expired: usize,
    pub invalid: usize,
    pub errored: usize,
}

/// Run all jobs in parallel
pub fn run_batch(jobs: &[BacktestJob]) -> Vec<BatchOutcome> {
    info!(jobs = jobs.len(), "Running backtest batch");

    jobs.par_iter()
        .map(|job| {
            let run = BacktestEngine::run(&job.input, &job.klines);
            BatchOutcome::from_run(&job.input.symbol, run)
        })
        .collect()
}

pub fn summarize(outcomes: &[BatchOutcome]) -> BatchSummary {
    let mut summary = BatchSummary {
        total: outcomes.len(),
        ..Default::default()
    };
    for outcome in outcomes {
        match outcome.result.as_ref().map(|r| r.status) {
            Some(BacktestStatus::CompletedSuccess) => summary.completed_success += 1,
            Some(BacktestStatus::CompletedFailure) => summary.completed_failure += 1,
            Some(BacktestStatus::Expired) => summary.expired += 1,
            Some(BacktestStatus::Invalid) => summary.invalid += 1,
            None => summary.errored += 1,
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn signal(symbol: &str) -> BacktestInput {
        BacktestInput {
            symbol: symbol.to_string(),
            direction: Direction::Long,
            entry_price: dec!(100),
            entry_timestamp: 0,
            tp1_price: dec!(110),
            tp1_allocation: dec!(50),
            tp2_price: dec!(120),
            tp2_allocation: dec!(25),
            tp3_price: dec!(130),
            tp3_allocation: dec!(25),
            stop_loss_price: dec!(90),
            timeframe_expiration_hours: 48,
        }
    }

    fn kline(hour: i64, high: Decimal, low: Decimal) -> Kline {
        Kline {
            open_time: hour * 3_600_000,
            open: low,
            high,
            low,
            close: low,
            volume: dec!(1),
            close_time: (hour + 1) * 3_600_000 - 1,
        }
    }

    #[test]
    fn test_batch_preserves_order_and_isolates_runs() {
        let jobs = vec![
            BacktestJob {
                input: signal("AAA"),
                klines: vec![kline(0, dec!(135), dec!(95))],
            },
            BacktestJob {
                input: signal("BBB"),
                klines: vec![kline(0, dec!(112), dec!(85))],
            },
            BacktestJob {
                input: signal("CCC"),
                klines: vec![kline(0, dec!(105), dec!(95))],
            },
            BacktestJob {
                input: BacktestInput {
                    tp1_allocation: dec!(10),
                    ..signal("DDD")
                },
                klines: vec![kline(0, dec!(105), dec!(95))],
            },
            BacktestJob {
                input: signal("EEE"),
                klines: vec![],
            },
        ];

        let outcomes = run_batch(&jobs);
        let symbols: Vec<&str> = outcomes.iter().map(|o| o.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["AAA", "BBB", "CCC", "DDD", "EEE"]);

        let status = |i: usize| outcomes[i].result.as_ref().map(|r| r.status);
        assert_eq!(status(0), Some(BacktestStatus::CompletedSuccess));
        assert_eq!(status(1), Some(BacktestStatus::CompletedFailure));
        assert_eq!(status(2), Some(BacktestStatus::Expired));
        assert_eq!(status(3), Some(BacktestStatus::Invalid));
        assert!(outcomes[4].error.is_some());

        let summary = summarize(&outcomes);
        assert_eq!(
            summary,
            BatchSummary {
                total: 5,
                completed_success: 1,
                completed_failure: 1,
                expired: 1,
                invalid: 1,
                errored: 1,
            }
        );
    }

    #[test]
    fn test_batch_matches_sequential_runs() {
        let jobs: Vec<BacktestJob> = (0..16)
            .map(|i| BacktestJob {
                input: signal(&format!("SYM{}", i)),
                klines: vec![kline(0, Decimal::from(100 + i * 2), dec!(95))],
            })
            .collect();

        let parallel = run_batch(&jobs);
        for (job, outcome) in jobs.iter().zip(&parallel) {
            let sequential = BacktestEngine::run(&job.input, &job.klines).unwrap();
            assert_eq!(outcome.result.as_ref(), Some(&sequential));
        }
    }
}
