use proptest::prelude::*;
use risk::{lot_quantity, protective_limit, ExitRules, ExitTrigger, RiskConfig};

proptest! {
    /// Sized buys never exceed the lot notional and are always whole shares.
    #[test]
    fn sizing_stays_within_lot(
        lot in 1.0f64..1_000_000.0,
        price in 0.0001f64..100_000.0,
    ) {
        if let Some(qty) = lot_quantity(lot, price) {
            prop_assert!(qty >= 1.0);
            prop_assert_eq!(qty.fract(), 0.0);
            prop_assert!(qty * price <= lot + 1e-6);
        } else {
            prop_assert!(lot / price < 1.0);
        }
    }

    /// The protective sell is never priced below the fill.
    #[test]
    fn protective_limit_never_below_entry(
        entry in 0.01f64..100_000.0,
        last in 0.0f64..100_000.0,
        margin in 0.0f64..0.5,
    ) {
        prop_assert!(protective_limit(entry, last, margin) >= entry - 1e-9);
    }

    /// Exit checks on arbitrary prices never panic and agree with thresholds.
    #[test]
    fn exit_rules_match_thresholds(
        entry in 0.0001f64..1_000_000.0,
        price in 0.0001f64..1_000_000.0,
    ) {
        let rules = ExitRules::new(RiskConfig::default());
        match rules.check(entry, price) {
            Some(ExitTrigger::StopLoss) => prop_assert!(price < entry * 0.9),
            Some(ExitTrigger::TakeProfit) => prop_assert!(price > entry * 1.2),
            None => prop_assert!(price >= entry * 0.9 && price <= entry * 1.2),
        }
    }
}
