/// Whole shares purchasable with `lot_notional` at `price`.
///
/// Returns `None` when the lot buys less than one share or the price is
/// unusable; callers treat that as "skip this signal".
pub fn lot_quantity(lot_notional: f64, price: f64) -> Option<f64> {
    if !price.is_finite() || price <= 0.0 || !lot_notional.is_finite() || lot_notional <= 0.0 {
        return None;
    }
    let qty = (lot_notional / price).floor();
    (qty >= 1.0).then_some(qty)
}

/// Limit price for the protective sell after a buy fills at `entry`.
///
/// Never below `entry * (1 + margin_pct)`; raised to `last_close` when the
/// market already trades higher. Rounded up to the cent.
pub fn protective_limit(entry: f64, last_close: f64, margin_pct: f64) -> f64 {
    let floor = entry * (1.0 + margin_pct.max(0.0));
    let target = if last_close.is_finite() {
        floor.max(last_close)
    } else {
        floor
    };
    round_up_to_cent(target)
}

fn round_up_to_cent(price: f64) -> f64 {
    // Tolerate representation error so 100.10 stays 100.10.
    ((price * 100.0) - 1e-6).ceil() / 100.0
}
