//! Fixed-point money helpers.
//!
//! Balances carry 8 decimal places; user-facing charges are rounded to 2
//! using banker's rounding before being debited (spec.md §4.4 step 2).

use rust_decimal::{Decimal, RoundingStrategy};

pub const BALANCE_SCALE: u32 = 8;
pub const CHARGE_SCALE: u32 = 2;

/// `quantity * price_per_thousand / 1000`, rounded half-to-even to 2 dp.
pub fn compute_charge(quantity: u32, price_per_thousand: Decimal) -> Decimal {
    let raw = Decimal::from(quantity) * price_per_thousand / Decimal::from(1000);
    raw.round_dp_with_strategy(CHARGE_SCALE, RoundingStrategy::MidpointNearestEven)
}

/// Rescale to the balance ledger's canonical precision.
pub fn to_balance_scale(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(BALANCE_SCALE, RoundingStrategy::MidpointNearestEven)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn charge_matches_s1_scenario() {
        // service pricePerThousand=2.50, quantity=2000 -> charge=5.00
        let charge = compute_charge(2000, dec!(2.50));
        assert_eq!(charge, dec!(5.00));
    }

    #[test]
    fn charge_rounds_half_to_even() {
        // 0.125 rounds to 0.12 under banker's rounding (nearest even at 2dp)
        let charge = compute_charge(1, dec!(125));
        assert_eq!(charge, dec!(0.12));
    }
}
