pub mod algo;
pub mod alpaca;
pub mod clock;
pub mod recovery;
pub mod scheduler;
pub mod state;
pub mod sweep;

#[cfg(test)]
mod testing;

pub use algo::{AlgoCommand, AlgoConfig, InstrumentAlgo};
pub use alpaca::{AlpacaBarStream, AlpacaClient, TradeUpdateStream};
pub use clock::SessionClock;
pub use recovery::{derive_state, BrokerSnapshot, Recovered, RecoveryBootstrap};
pub use scheduler::{FleetHandle, Scheduler};
pub use state::{ActiveOrder, AlgoState, InstrumentState};
pub use sweep::{SafetySweep, SweepConfig, SweepOutcome};
