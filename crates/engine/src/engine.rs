//! Candle-by-candle replay of a trade signal
//!
//! Each candle is evaluated once, in a fixed order: the stop-loss first, then
//! TP1, TP2 and TP3. OHLC bars do not reveal the intra-bar path, so when a
//! bar spans both the stop and a target the stop wins. This is a worst-case
//! assumption; the real path may have touched the target first.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info};

use crate::error::SimulationError;
use crate::types::*;
use crate::validation::validate_input;

const HUNDRED: Decimal = dec!(100);

/// Backtesting engine that replays a signal bar-by-bar
pub struct BacktestEngine;

impl BacktestEngine {
    /// Run a backtest of `input` over `klines` (ascending by open time).
    ///
    /// Invalid signals are not an error: they come back as a result with
    /// `status = invalid`. Errors are reserved for unusable candle data.
    pub fn run(input: &BacktestInput, klines: &[Kline]) -> Result<BacktestResult, SimulationError> {
        if let Err(e) = validate_input(input) {
            info!(symbol = %input.symbol, error = %e, "Signal failed validation");
            return Ok(Self::invalid(input, e.to_string()));
        }

        check_klines(klines)?;

        let first = klines.partition_point(|k| k.open_time < input.entry_timestamp);
        let window = &klines[first..];
        if window.is_empty() {
            return Err(SimulationError::NoCandlesAfterEntry {
                entry_timestamp: input.entry_timestamp,
                last_open_time: klines.last().map(|k| k.open_time),
            });
        }

        let deadline = input.expiration_deadline();

        info!(
            symbol = %input.symbol,
            direction = %input.direction,
            entry = %input.entry_price,
            bars = window.len(),
            deadline,
            "Starting backtest"
        );

        let mut state = TargetState::default();
        let mut evaluated = 0usize;
        let mut last: Option<&Kline> = None;
        let mut closed_at = None;

        for kline in window {
            if kline.open_time > deadline {
                break;
            }
            evaluated += 1;
            last = Some(kline);

            if Self::step(input, kline, &mut state)? {
                closed_at = Some(kline.open_time);
                break;
            }
        }

        let last_price = last.map(|k| k.close);

        if state.remaining_allocation > Decimal::ZERO {
            // Out of candles or past the deadline with allocation still open
            if let Some(kline) = last {
                let unrealized = pnl_for(
                    input.direction,
                    input.entry_price,
                    kline.close,
                    state.remaining_allocation,
                )?;
                state.unrealized_pnl_usd = unrealized;
                state.profit_loss_usd = checked(
                    state.profit_loss_usd.checked_add(unrealized),
                    "profit_loss_usd",
                )?;
                closed_at = Some(kline.open_time);
            }
            state.state = TradeState::Expired;
        }

        let status = derive_status(&state);
        let profit_loss_percent = checked(
            state
                .profit_loss_usd
                .checked_div(input.entry_price)
                .and_then(|ratio| ratio.checked_mul(HUNDRED)),
            "profit_loss_percent",
        )?
        .round_dp(4);

        info!(
            symbol = %input.symbol,
            status = %status,
            targets_hit = state.targets_hit(),
            stop_hit = state.stop_loss.hit,
            remaining = %state.remaining_allocation,
            pnl = %state.profit_loss_usd,
            "Backtest complete"
        );

        Ok(BacktestResult {
            symbol: input.symbol.clone(),
            direction: input.direction,
            status,
            profit_loss_usd: state.profit_loss_usd,
            profit_loss_percent,
            targets: state,
            candles_evaluated: evaluated,
            last_price,
            closed_at,
            validation_error: None,
        })
    }

    /// Evaluate one candle. Returns true once the position is fully closed.
    fn step(
        input: &BacktestInput,
        kline: &Kline,
        state: &mut TargetState,
    ) -> Result<bool, SimulationError> {
        let stop = input.stop_loss_price;
        let stop_touched = match input.direction {
            Direction::Long => kline.low <= stop,
            Direction::Short => kline.high >= stop,
        };

        if stop_touched && !state.stop_loss.hit {
            let closed = state.remaining_allocation;
            let loss = pnl_for(input.direction, input.entry_price, stop, closed)?;
            realize(state, loss)?;
            state.stop_loss.record(kline.open_time, stop);
            state.stopped_allocation = closed;
            state.remaining_allocation = Decimal::ZERO;
            state.state = TradeState::ClosedByStop;

            debug!(
                time = kline.open_time,
                price = %stop,
                allocation = %closed,
                pnl = %loss,
                "Stop-loss hit"
            );
            return Ok(true);
        }

        for (i, (price, allocation)) in input.targets().into_iter().enumerate() {
            if state.remaining_allocation <= Decimal::ZERO {
                break;
            }
            if state.target_mut(i).hit {
                continue;
            }
            let touched = match input.direction {
                Direction::Long => kline.high >= price,
                Direction::Short => kline.low <= price,
            };
            if !touched {
                continue;
            }

            let profit = pnl_for(input.direction, input.entry_price, price, allocation)?;
            realize(state, profit)?;
            state.target_mut(i).record(kline.open_time, price);
            state.remaining_allocation -= allocation;

            debug!(
                target = i + 1,
                time = kline.open_time,
                price = %price,
                allocation = %allocation,
                pnl = %profit,
                "Take-profit hit"
            );
        }

        if state.remaining_allocation <= Decimal::ZERO {
            state.remaining_allocation = Decimal::ZERO;
            state.state = TradeState::ClosedByTargets;
            return Ok(true);
        }
        // A zero-allocation target can be hit without closing anything
        if state.remaining_allocation < HUNDRED {
            state.state = TradeState::PartiallyClosed;
        }
        Ok(false)
    }

    fn invalid(input: &BacktestInput, reason: String) -> BacktestResult {
        BacktestResult {
            symbol: input.symbol.clone(),
            direction: input.direction,
            status: BacktestStatus::Invalid,
            targets: TargetState::default(),
            profit_loss_usd: Decimal::ZERO,
            profit_loss_percent: Decimal::ZERO,
            candles_evaluated: 0,
            last_price: None,
            closed_at: None,
            validation_error: Some(reason),
        }
    }
}

/// P/L of closing `allocation` percent of the position at `exit`
fn pnl_for(
    direction: Direction,
    entry: Decimal,
    exit: Decimal,
    allocation: Decimal,
) -> Result<Decimal, SimulationError> {
    let fraction = allocation / HUNDRED;
    let move_per_unit = match direction {
        Direction::Long => exit.checked_sub(entry),
        Direction::Short => entry.checked_sub(exit),
    };
    checked(move_per_unit.and_then(|m| m.checked_mul(fraction)), "trade P/L")
}

fn realize(state: &mut TargetState, amount: Decimal) -> Result<(), SimulationError> {
    state.realized_pnl_usd = checked(
        state.realized_pnl_usd.checked_add(amount),
        "realized_pnl_usd",
    )?;
    state.profit_loss_usd = checked(state.profit_loss_usd.checked_add(amount), "profit_loss_usd")?;
    Ok(())
}

fn checked(value: Option<Decimal>, quantity: &'static str) -> Result<Decimal, SimulationError> {
    value.ok_or(SimulationError::ArithmeticOverflow { quantity })
}

/// The terminal event decides the label, not the sign of the P/L
fn derive_status(state: &TargetState) -> BacktestStatus {
    match state.state {
        TradeState::ClosedByStop => BacktestStatus::CompletedFailure,
        TradeState::ClosedByTargets => BacktestStatus::CompletedSuccess,
        TradeState::Open | TradeState::PartiallyClosed | TradeState::Expired => {
            BacktestStatus::Expired
        }
    }
}

fn check_klines(klines: &[Kline]) -> Result<(), SimulationError> {
    let malformed = |index: usize, reason: String| SimulationError::MalformedCandle { index, reason };

    for (i, k) in klines.iter().enumerate() {
        if k.low <= Decimal::ZERO {
            return Err(malformed(i, format!("non-positive low {}", k.low)));
        }
        if k.low > k.high {
            return Err(malformed(i, format!("low {} above high {}", k.low, k.high)));
        }
        for (name, value) in [("open", k.open), ("close", k.close)] {
            if value < k.low || value > k.high {
                return Err(malformed(
                    i,
                    format!("{} {} outside range [{}, {}]", name, value, k.low, k.high),
                ));
            }
        }
        if i > 0 && k.open_time <= klines[i - 1].open_time {
            return Err(malformed(
                i,
                format!(
                    "open_time {} not after previous {}",
                    k.open_time,
                    klines[i - 1].open_time
                ),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const HOUR: i64 = 3_600_000;

    fn signal() -> BacktestInput {
        BacktestInput {
            symbol: "BTCUSDT".to_string(),
            direction: Direction::Long,
            entry_price: dec!(100000),
            entry_timestamp: 0,
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

    fn short_signal() -> BacktestInput {
        BacktestInput {
            direction: Direction::Short,
            tp1_price: dec!(98000),
            tp2_price: dec!(96000),
            tp3_price: dec!(94000),
            stop_loss_price: dec!(102000),
            ..signal()
        }
    }

    fn bar(hour: i64, high: Decimal, low: Decimal, close: Decimal) -> Kline {
        Kline {
            open_time: hour * HOUR,
            open: close.max(low).min(high),
            high,
            low,
            close,
            volume: dec!(10),
            close_time: (hour + 1) * HOUR - 1,
        }
    }

    #[test]
    fn test_scenario_a_two_targets_in_one_candle() {
        let klines = vec![bar(0, dec!(104500), dec!(99000), dec!(104000))];
        let result = BacktestEngine::run(&signal(), &klines).unwrap();

        assert!(result.targets.tp1.hit);
        assert!(result.targets.tp2.hit);
        assert!(!result.targets.tp3.hit);
        assert_eq!(result.targets.realized_pnl_usd, dec!(2200));
        assert_eq!(result.targets.remaining_allocation, dec!(30));
        assert_eq!(result.targets.tp1.hit_price, Some(dec!(102000)));
        assert_eq!(result.targets.tp2.hit_at, Some(0));
    }

    #[test]
    fn test_scenario_b_partial_fill_then_stop() {
        let klines = vec![
            bar(0, dec!(104500), dec!(99000), dec!(104000)),
            bar(1, dec!(101000), dec!(97500), dec!(97800)),
        ];
        let result = BacktestEngine::run(&signal(), &klines).unwrap();

        assert!(result.targets.stop_loss.hit);
        assert_eq!(result.targets.stop_loss.hit_at, Some(HOUR));
        assert_eq!(result.targets.stopped_allocation, dec!(30));
        assert_eq!(result.targets.remaining_allocation, Decimal::ZERO);
        assert_eq!(result.profit_loss_usd, dec!(1600));
        assert_eq!(result.status, BacktestStatus::CompletedFailure);
        assert_eq!(result.targets.state, TradeState::ClosedByStop);
    }

    #[test]
    fn test_scenario_c_partial_fill_then_expiration() {
        let klines = vec![
            bar(0, dec!(102500), dec!(99000), dec!(100000)),
            // Past the 24h deadline, must not be examined
            bar(30, dec!(107000), dec!(99500), dec!(106500)),
        ];
        let result = BacktestEngine::run(&signal(), &klines).unwrap();

        assert!(result.targets.tp1.hit);
        assert!(!result.targets.tp2.hit);
        assert_eq!(result.targets.remaining_allocation, dec!(70));
        assert_eq!(result.targets.unrealized_pnl_usd, Decimal::ZERO);
        assert_eq!(result.profit_loss_usd, dec!(600));
        assert_eq!(result.status, BacktestStatus::Expired);
        assert_eq!(result.candles_evaluated, 1);
        assert_eq!(result.last_price, Some(dec!(100000)));
    }

    #[test]
    fn test_stop_wins_when_candle_spans_stop_and_target() {
        let klines = vec![bar(0, dec!(103000), dec!(97000), dec!(100000))];
        let result = BacktestEngine::run(&signal(), &klines).unwrap();

        assert!(result.targets.stop_loss.hit);
        assert!(!result.targets.tp1.hit);
        assert_eq!(result.profit_loss_usd, dec!(-2000));
        assert_eq!(result.status, BacktestStatus::CompletedFailure);
    }

    #[test]
    fn test_all_targets_is_success() {
        let klines = vec![
            bar(0, dec!(102100), dec!(99500), dec!(102000)),
            bar(1, dec!(106500), dec!(101000), dec!(106000)),
            bar(2, dec!(110000), dec!(90000), dec!(95000)),
        ];
        let result = BacktestEngine::run(&signal(), &klines).unwrap();

        // 600 + 1600 + 1800
        assert_eq!(result.profit_loss_usd, dec!(4000));
        assert_eq!(result.status, BacktestStatus::CompletedSuccess);
        assert_eq!(result.targets.remaining_allocation, Decimal::ZERO);
        assert_eq!(result.candles_evaluated, 2);
        assert_eq!(result.closed_at, Some(HOUR));
        assert_eq!(result.profit_loss_percent, dec!(4));
    }

    #[test]
    fn test_no_target_no_stop_marks_full_position_at_last_close() {
        let klines = vec![
            bar(0, dec!(101000), dec!(99000), dec!(100500)),
            bar(1, dec!(101500), dec!(99500), dec!(101200)),
        ];
        let result = BacktestEngine::run(&signal(), &klines).unwrap();

        assert_eq!(result.status, BacktestStatus::Expired);
        assert_eq!(result.targets.state, TradeState::Expired);
        assert_eq!(result.profit_loss_usd, dec!(101200) - dec!(100000));
        assert_eq!(result.targets.realized_pnl_usd, Decimal::ZERO);
        assert_eq!(result.targets.remaining_allocation, dec!(100));
    }

    #[test]
    fn test_failure_label_even_with_positive_pnl() {
        let input = BacktestInput {
            tp1_allocation: dec!(80),
            tp2_allocation: dec!(10),
            tp3_allocation: dec!(10),
            ..signal()
        };
        let klines = vec![
            bar(0, dec!(102500), dec!(99000), dec!(102000)),
            bar(1, dec!(100000), dec!(97000), dec!(97500)),
        ];
        let result = BacktestEngine::run(&input, &klines).unwrap();

        // 1600 from TP1, -400 on the stopped 20%
        assert_eq!(result.profit_loss_usd, dec!(1200));
        assert!(result.profit_loss_usd > Decimal::ZERO);
        assert_eq!(result.status, BacktestStatus::CompletedFailure);
    }

    #[test]
    fn test_short_direction_mirrors_comparisons() {
        let klines = vec![
            bar(0, dec!(100500), dec!(97500), dec!(98000)),
            bar(1, dec!(102500), dec!(99000), dec!(102000)),
        ];
        let result = BacktestEngine::run(&short_signal(), &klines).unwrap();

        assert!(result.targets.tp1.hit);
        assert!(!result.targets.tp2.hit);
        assert!(result.targets.stop_loss.hit);
        // +600 on TP1, -1400 on the remaining 70%
        assert_eq!(result.profit_loss_usd, dec!(-800));
        assert_eq!(result.status, BacktestStatus::CompletedFailure);
    }

    #[test]
    fn test_short_expiration_marks_to_market() {
        let klines = vec![bar(0, dec!(100500), dec!(99000), dec!(99000))];
        let result = BacktestEngine::run(&short_signal(), &klines).unwrap();

        assert_eq!(result.status, BacktestStatus::Expired);
        assert_eq!(result.profit_loss_usd, dec!(1000));
        assert_eq!(result.targets.unrealized_pnl_usd, dec!(1000));
    }

    #[test]
    fn test_allocation_is_conserved() {
        let input = signal();
        let cases = vec![
            vec![bar(0, dec!(104500), dec!(99000), dec!(104000))],
            vec![
                bar(0, dec!(104500), dec!(99000), dec!(104000)),
                bar(1, dec!(101000), dec!(97500), dec!(97800)),
            ],
            vec![bar(0, dec!(107000), dec!(99000), dec!(105000))],
            vec![bar(0, dec!(100100), dec!(99900), dec!(100000))],
        ];

        for klines in cases {
            let result = BacktestEngine::run(&input, &klines).unwrap();
            assert_eq!(result.allocation_accounted(&input), dec!(100));
            match result.status {
                BacktestStatus::CompletedSuccess | BacktestStatus::CompletedFailure => {
                    assert_eq!(result.targets.remaining_allocation, Decimal::ZERO)
                }
                BacktestStatus::Expired => {
                    assert!(result.targets.remaining_allocation > Decimal::ZERO)
                }
                BacktestStatus::Invalid => panic!("signal should be valid"),
            }
        }
    }

    #[test]
    fn test_identical_inputs_give_identical_results() {
        let klines = vec![
            bar(0, dec!(102500), dec!(99000), dec!(101000)),
            bar(1, dec!(103000), dec!(100000), dec!(102500)),
        ];
        let a = BacktestEngine::run(&signal(), &klines).unwrap();
        let b = BacktestEngine::run(&signal(), &klines).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_invalid_signal_short_circuits() {
        let input = BacktestInput {
            tp2_allocation: dec!(50),
            ..signal()
        };
        let klines = vec![bar(0, dec!(110000), dec!(90000), dec!(100000))];
        let result = BacktestEngine::run(&input, &klines).unwrap();

        assert_eq!(result.status, BacktestStatus::Invalid);
        assert_eq!(result.profit_loss_usd, Decimal::ZERO);
        assert_eq!(result.candles_evaluated, 0);
        assert!(!result.targets.tp1.hit);
        assert!(result.validation_error.unwrap().contains("sum to 100"));
    }

    #[test]
    fn test_candles_before_entry_are_skipped() {
        let input = BacktestInput {
            entry_timestamp: 2 * HOUR,
            ..signal()
        };
        let klines = vec![
            // Would stop out if examined
            bar(0, dec!(100000), dec!(95000), dec!(96000)),
            bar(1, dec!(100000), dec!(95000), dec!(99000)),
            bar(2, dec!(102500), dec!(99000), dec!(102000)),
        ];
        let result = BacktestEngine::run(&input, &klines).unwrap();

        assert!(!result.targets.stop_loss.hit);
        assert!(result.targets.tp1.hit);
        assert_eq!(result.candles_evaluated, 1);
    }

    #[test]
    fn test_candle_at_deadline_is_included() {
        let input = BacktestInput {
            timeframe_expiration_hours: 2,
            ..signal()
        };
        let klines = vec![
            bar(0, dec!(100500), dec!(99500), dec!(100000)),
            bar(2, dec!(102500), dec!(99500), dec!(102000)),
            bar(3, dec!(104500), dec!(99500), dec!(104000)),
        ];
        let result = BacktestEngine::run(&input, &klines).unwrap();

        assert!(result.targets.tp1.hit);
        assert!(!result.targets.tp2.hit);
        assert_eq!(result.candles_evaluated, 2);
        // 600 realized + 70% of (102000 - 100000)
        assert_eq!(result.profit_loss_usd, dec!(2000));
    }

    #[test]
    fn test_no_candles_after_entry() {
        let input = BacktestInput {
            entry_timestamp: 10 * HOUR,
            ..signal()
        };
        let klines = vec![bar(0, dec!(100500), dec!(99500), dec!(100000))];
        let err = BacktestEngine::run(&input, &klines).unwrap_err();
        assert_eq!(
            err,
            SimulationError::NoCandlesAfterEntry {
                entry_timestamp: 10 * HOUR,
                last_open_time: Some(0),
            }
        );

        assert!(BacktestEngine::run(&signal(), &[]).is_err());
    }

    #[test]
    fn test_malformed_candles_are_rejected() {
        let mut inverted = bar(1, dec!(100500), dec!(99500), dec!(100000));
        inverted.low = dec!(101000);
        let klines = vec![bar(0, dec!(100500), dec!(99500), dec!(100000)), inverted];
        assert!(matches!(
            BacktestEngine::run(&signal(), &klines),
            Err(SimulationError::MalformedCandle { index: 1, .. })
        ));

        let unordered = vec![
            bar(1, dec!(100500), dec!(99500), dec!(100000)),
            bar(1, dec!(100500), dec!(99500), dec!(100000)),
        ];
        assert!(matches!(
            BacktestEngine::run(&signal(), &unordered),
            Err(SimulationError::MalformedCandle { index: 1, .. })
        ));
    }

    #[test]
    fn test_zero_allocation_target_hit_keeps_position_open() {
        let input = BacktestInput {
            tp1_allocation: Decimal::ZERO,
            tp2_allocation: dec!(70),
            ..signal()
        };
        let first = bar(0, dec!(102500), dec!(99500), dec!(102000));
        let second = bar(1, dec!(104500), dec!(99500), dec!(104000));
        let mut state = TargetState::default();

        let closed = BacktestEngine::step(&input, &first, &mut state).unwrap();

        assert!(!closed);
        assert!(state.tp1.hit);
        assert_eq!(state.remaining_allocation, dec!(100));
        assert_eq!(state.state, TradeState::Open);

        BacktestEngine::step(&input, &second, &mut state).unwrap();
        assert_eq!(state.state, TradeState::PartiallyClosed);
    }

    #[test]
    fn test_extreme_price_ratio_reports_overflow() {
        let input = BacktestInput {
            entry_price: dec!(0.00000000000000000002),
            stop_loss_price: dec!(0.00000000000000000001),
            tp1_price: dec!(1000000000),
            tp2_price: dec!(2000000000),
            tp3_price: dec!(3000000000),
            ..signal()
        };
        assert!(validate_input(&input).is_ok());

        let klines = vec![bar(0, dec!(1500000000), dec!(1), dec!(1000000000))];
        assert_eq!(
            BacktestEngine::run(&input, &klines),
            Err(SimulationError::ArithmeticOverflow {
                quantity: "profit_loss_percent"
            })
        );
    }

    #[test]
    fn test_zero_allocation_target_not_required_for_success() {
        let input = BacktestInput {
            tp2_allocation: dec!(70),
            tp3_allocation: Decimal::ZERO,
            ..signal()
        };
        let klines = vec![bar(0, dec!(104500), dec!(99000), dec!(104000))];
        let result = BacktestEngine::run(&input, &klines).unwrap();

        assert_eq!(result.status, BacktestStatus::CompletedSuccess);
        assert!(!result.targets.tp3.hit);
        // 600 + 1400
        assert_eq!(result.profit_loss_usd, dec!(2000));
    }
}
