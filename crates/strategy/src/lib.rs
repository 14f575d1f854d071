pub mod config;
pub mod evaluators;
pub mod indicators;

pub use config::{SignalConfig, SignalFileConfig};
pub use evaluators::{build_evaluator, RsiReversal, SmaCrossover};

use common::Bar;

/// Buy-signal decision over one instrument's bar history.
///
/// Implementations must be pure with respect to `bars` and must return
/// `false` rather than fail when the history is shorter than they need.
/// The engine holds evaluators as `Arc<dyn SignalEvaluator>`, so any
/// implementation can be swapped in at construction time.
pub trait SignalEvaluator: Send + Sync {
    /// Human-readable name used in logs.
    fn name(&self) -> &str;

    /// `bars` is the session history for one symbol, oldest first.
    fn evaluate(&self, bars: &[Bar]) -> bool;
}
