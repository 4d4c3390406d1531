//! Trade signal validation
//!
//! Checks run in a fixed order and the first violation wins, so the caller
//! always gets the same message for the same bad signal.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::error::InvalidInputError;
use crate::types::{BacktestInput, Direction};

/// Validate a trade signal before simulation
pub fn validate_input(input: &BacktestInput) -> Result<(), InvalidInputError> {
    if input.symbol.trim().is_empty() {
        return Err(InvalidInputError::EmptySymbol);
    }

    let prices = [
        ("entry_price", input.entry_price),
        ("tp1_price", input.tp1_price),
        ("tp2_price", input.tp2_price),
        ("tp3_price", input.tp3_price),
        ("stop_loss_price", input.stop_loss_price),
    ];
    for (field, value) in prices {
        if value <= Decimal::ZERO {
            return Err(InvalidInputError::NonPositivePrice { field, value });
        }
    }

    let allocations = [
        ("tp1_allocation", input.tp1_allocation),
        ("tp2_allocation", input.tp2_allocation),
        ("tp3_allocation", input.tp3_allocation),
    ];
    for (field, value) in allocations {
        if value < Decimal::ZERO {
            return Err(InvalidInputError::NegativeAllocation { field, value });
        }
    }

    let sum = input.tp1_allocation + input.tp2_allocation + input.tp3_allocation;
    if sum != dec!(100) {
        return Err(InvalidInputError::AllocationSum { sum });
    }

    check_ordering(input)?;

    if input.timeframe_expiration_hours <= 0 {
        return Err(InvalidInputError::NonPositiveTimeframe(
            input.timeframe_expiration_hours,
        ));
    }

    Ok(())
}

fn check_ordering(input: &BacktestInput) -> Result<(), InvalidInputError> {
    // Ascending for long, descending for short
    let ladder = match input.direction {
        Direction::Long => [
            ("stop_loss_price", input.stop_loss_price),
            ("entry_price", input.entry_price),
            ("tp1_price", input.tp1_price),
            ("tp2_price", input.tp2_price),
            ("tp3_price", input.tp3_price),
        ],
        Direction::Short => [
            ("tp3_price", input.tp3_price),
            ("tp2_price", input.tp2_price),
            ("tp1_price", input.tp1_price),
            ("entry_price", input.entry_price),
            ("stop_loss_price", input.stop_loss_price),
        ],
    };

    for pair in ladder.windows(2) {
        let (lower, lower_value) = pair[0];
        let (upper, upper_value) = pair[1];
        if lower_value >= upper_value {
            return Err(InvalidInputError::PriceOrdering {
                direction: input.direction,
                lower,
                lower_value,
                upper,
                upper_value,
            });
        }
    }
    Ok(())
}
