pub mod exits;
pub mod pricing;

pub use exits::{ExitRules, ExitTrigger, RiskConfig};
pub use pricing::{lot_quantity, protective_limit};
