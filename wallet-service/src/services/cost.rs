//! Cost model: ceiling-rounded units, free allowance first, then paid balance.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

/// Breakdown of what a request costs against a given free allowance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CostQuote {
    /// Requested units rounded up to whole units.
    pub billed_units: Decimal,
    /// Portion covered by the free allowance.
    pub free_units_used: Decimal,
    /// Portion charged to the paid balance.
    pub billable_units: Decimal,
    pub cost: Decimal,
}

#[derive(Debug, Clone)]
pub struct CostModel {
    price_per_unit: Decimal,
}

impl CostModel {
    pub fn new(price_per_unit: Decimal) -> Self {
        Self {
            price_per_unit: price_per_unit.max(Decimal::ZERO),
        }
    }

    pub fn price_per_unit(&self) -> Decimal {
        self.price_per_unit
    }

    /// Partial units always bill as a full unit.
    pub fn billed_units(requested_units: Decimal) -> Decimal {
        if requested_units <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        requested_units.ceil()
    }

    pub fn quote(&self, requested_units: Decimal, free_allowance_available: Decimal) -> CostQuote {
        let billed_units = Self::billed_units(requested_units);
        let free_units_used = free_allowance_available.max(Decimal::ZERO).min(billed_units);
        let billable_units = billed_units - free_units_used;
        let cost = (billable_units * self.price_per_unit)
            .max(Decimal::ZERO)
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);

        CostQuote {
            billed_units,
            free_units_used,
            billable_units,
            cost,
        }
    }

    pub fn cost(&self, requested_units: Decimal, free_allowance_available: Decimal) -> Decimal {
        self.quote(requested_units, free_allowance_available).cost
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_partial_unit_bills_as_full_unit() {
        let model = CostModel::new(d("1.00"));
        let quote = model.quote(d("0.3"), Decimal::ZERO);
        assert_eq!(quote.billed_units, d("1"));
        assert_eq!(quote.cost, d("1.00"));
    }

    #[test]
    fn test_whole_units_are_not_rounded_up() {
        assert_eq!(CostModel::billed_units(d("15.0")), d("15"));
        assert_eq!(CostModel::billed_units(d("15.01")), d("16"));
    }

    #[test]
    fn test_free_allowance_covers_request() {
        let model = CostModel::new(d("1.00"));
        let quote = model.quote(d("9.5"), d("10.00"));
        assert_eq!(quote.billed_units, d("10"));
        assert_eq!(quote.free_units_used, d("10"));
        assert_eq!(quote.cost, Decimal::ZERO);
    }

    #[test]
    fn test_free_allowance_consumed_before_paid() {
        let model = CostModel::new(d("1.00"));
        assert_eq!(model.cost(d("15.0"), d("10.00")), d("5.00"));
        assert_eq!(model.cost(d("150.0"), d("10.00")), d("140.00"));
    }

    #[test]
    fn test_fractional_allowance_and_price() {
        let model = CostModel::new(d("0.75"));
        let quote = model.quote(d("3.2"), d("1.5"));
        assert_eq!(quote.billed_units, d("4"));
        assert_eq!(quote.billable_units, d("2.5"));
        assert_eq!(quote.cost, d("1.88"));
    }

    #[test]
    fn test_non_positive_request_costs_nothing() {
        let model = CostModel::new(d("1.00"));
        assert_eq!(model.cost(Decimal::ZERO, Decimal::ZERO), Decimal::ZERO);
        assert_eq!(model.cost(d("-3"), Decimal::ZERO), Decimal::ZERO);
    }
}
