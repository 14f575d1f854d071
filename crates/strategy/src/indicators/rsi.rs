/// RSI (Relative Strength Index) with Wilder smoothing.
///
/// Returns `None` until at least `period + 1` closes are available.
#[derive(Debug, Clone)]
pub struct RsiIndicator {
    pub period: usize,
}

impl RsiIndicator {
    pub fn new(period: usize) -> Self {
        assert!(period >= 2, "RSI period must be >= 2");
        Self { period }
    }

    /// RSI of the latest close (closes oldest first).
    pub fn compute(&self, closes: &[f64]) -> Option<f64> {
        if closes.len() < self.period + 1 {
            return None;
        }

        let p = self.period as f64;
        let mut gains = 0.0;
        let mut losses = 0.0;
        for w in closes[..=self.period].windows(2) {
            let change = w[1] - w[0];
            if change > 0.0 {
                gains += change;
            } else {
                losses -= change;
            }
        }
        let (mut avg_gain, mut avg_loss) = (gains / p, losses / p);

        for w in closes[self.period..].windows(2) {
            let change = w[1] - w[0];
            avg_gain = (avg_gain * (p - 1.0) + change.max(0.0)) / p;
            avg_loss = (avg_loss * (p - 1.0) + (-change).max(0.0)) / p;
        }

        if avg_loss == 0.0 {
            return Some(if avg_gain == 0.0 { 50.0 } else { 100.0 });
        }
        Some(100.0 - 100.0 / (1.0 + avg_gain / avg_loss))
    }

    /// True when RSI moved from at-or-below `level` on the previous close to
    /// above it on the latest close.
    pub fn crossed_above(&self, closes: &[f64], level: f64) -> bool {
        if closes.len() < self.period + 2 {
            return false;
        }
        match (
            self.compute(&closes[..closes.len() - 1]),
            self.compute(closes),
        ) {
            (Some(prev), Some(curr)) => prev <= level && curr > level,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsi_returns_none_when_insufficient_data() {
        let rsi = RsiIndicator::new(14);
        assert!(rsi.compute(&[100.0; 14]).is_none());
        assert!(rsi.compute(&[100.0; 15]).is_some());
    }

    #[test]
    fn rsi_extremes() {
        let rsi = RsiIndicator::new(3);
        let up = rsi.compute(&[10.0, 11.0, 12.0, 13.0, 14.0]).unwrap();
        let down = rsi.compute(&[14.0, 13.0, 12.0, 11.0, 10.0]).unwrap();
        assert!((up - 100.0).abs() < 1e-6, "Expected ~100, got {up}");
        assert!(down.abs() < 1e-6, "Expected ~0, got {down}");
    }

    #[test]
    fn flat_series_is_neutral() {
        let rsi = RsiIndicator::new(5);
        let value = rsi.compute(&[50.0; 10]).unwrap();
        assert!((value - 50.0).abs() < 1e-9);
    }

    #[test]
    fn rebound_from_oversold_crosses_level() {
        let rsi = RsiIndicator::new(3);
        // Steady decline drives RSI to 0, then one strong up move lifts it.
        let mut closes = vec![20.0, 19.0, 18.0, 17.0, 16.0];
        assert!(!rsi.crossed_above(&closes, 30.0));
        closes.push(19.0);
        assert!(rsi.crossed_above(&closes, 30.0));
    }
}
