/// Simple moving average over a fixed trailing window.
#[derive(Debug, Clone)]
pub struct SmaIndicator {
    pub window: usize,
}

impl SmaIndicator {
    /// Windows below 2 are raised to 2; a one-bar average cannot cross.
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(2),
        }
    }

    /// Average of the last `window` closes (oldest first).
    /// Returns `None` if there are fewer than `window` values.
    pub fn compute(&self, closes: &[f64]) -> Option<f64> {
        if closes.len() < self.window {
            return None;
        }
        Some(mean(&closes[closes.len() - self.window..]))
    }

    /// Average of up to `window` closes ending at `closes.len()`, using
    /// however many are available. `None` only for an empty slice.
    pub fn compute_partial(&self, closes: &[f64]) -> Option<f64> {
        if closes.is_empty() {
            return None;
        }
        let start = closes.len().saturating_sub(self.window);
        Some(mean(&closes[start..]))
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}
