use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use common::{Config, ExecutionClient};

use crate::algo::AlgoCommand;
use crate::clock::SessionClock;
use crate::scheduler::FleetHandle;

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub interval: Duration,
    /// Liquidate once the session has this little time left.
    pub close_margin: Duration,
}

impl SweepConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            interval: cfg.sweep_interval,
            close_margin: cfg.close_margin,
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            close_margin: Duration::from_secs(300),
        }
    }
}

/// What a single sweep pass observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    Trading,
    /// Inside the close margin; liquidation was requested.
    Closing,
    SessionClosed,
    /// Clock query failed; nothing was done this tick.
    ClockUnavailable,
}

/// Periodic supervisor running beside the scheduler.
///
/// Talks to the algos only through the fleet's inboxes, so its commands are
/// serialized with the market and order events for each symbol.
pub struct SafetySweep {
    client: Arc<dyn ExecutionClient>,
    fleet: FleetHandle,
    clock: SessionClock,
    config: SweepConfig,
    shutdown_tx: watch::Sender<bool>,
    closing: bool,
}

impl SafetySweep {
    pub fn new(
        client: Arc<dyn ExecutionClient>,
        fleet: FleetHandle,
        config: SweepConfig,
        shutdown_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            client,
            fleet,
            clock: SessionClock::new(),
            config,
            shutdown_tx,
            closing: false,
        }
    }

    /// Tick until the session closes or shutdown is signalled elsewhere.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            close_margin_secs = self.config.close_margin.as_secs(),
            "Safety sweep running"
        );
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.tick().await == SweepOutcome::SessionClosed {
                        info!("Session closed; signalling shutdown");
                        let _ = self.shutdown_tx.send(true);
                        break;
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Safety sweep stopped");
    }

    /// One supervisory pass: close-of-session liquidation, buy expiry, and
    /// session-end detection.
    pub async fn tick(&mut self) -> SweepOutcome {
        let clock = match self.clock.refresh(self.client.as_ref()).await {
            Ok(clock) => clock.clone(),
            Err(e) => {
                warn!(error = %e, "Clock query failed; retrying next sweep");
                return SweepOutcome::ClockUnavailable;
            }
        };

        if !clock.is_open {
            return SweepOutcome::SessionClosed;
        }

        let mut outcome = SweepOutcome::Trading;
        if self.clock.within_close_margin(self.config.close_margin) {
            if !self.closing {
                warn!(
                    next_close = %clock.next_close,
                    instruments = self.fleet.len(),
                    "Approaching session close; liquidating"
                );
                self.closing = true;
            }
            self.fleet.broadcast(|| AlgoCommand::Liquidate);
            outcome = SweepOutcome::Closing;
        }

        let now = clock.timestamp;
        self.fleet.broadcast(|| AlgoCommand::CheckExpiry { now });
        debug!(now = %now, outcome = ?outcome, "Sweep pass complete");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tokio::sync::mpsc;

    use super::*;
    use crate::testing::clock_at;
    use paper::PaperBroker;

    fn sweep_for(
        broker: Arc<PaperBroker>,
    ) -> (SafetySweep, mpsc::Receiver<AlgoCommand>, watch::Receiver<bool>) {
        let (tx, rx) = mpsc::channel(16);
        let fleet = FleetHandle::new(HashMap::from([("TSLA".to_string(), tx)]));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweep = SafetySweep::new(broker, fleet, SweepConfig::default(), shutdown_tx);
        (sweep, rx, shutdown_rx)
    }

    fn drain(rx: &mut mpsc::Receiver<AlgoCommand>) -> Vec<AlgoCommand> {
        let mut cmds = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            cmds.push(cmd);
        }
        cmds
    }

    #[tokio::test]
    async fn mid_session_tick_only_checks_expiry() {
        let broker = Arc::new(PaperBroker::new(clock_at(60)));
        let (mut sweep, mut rx, _) = sweep_for(broker);

        assert_eq!(sweep.tick().await, SweepOutcome::Trading);
        let cmds = drain(&mut rx);
        assert_eq!(cmds.len(), 1);
        assert!(matches!(
            cmds[0],
            AlgoCommand::CheckExpiry { now } if now == clock_at(60).timestamp
        ));
    }

    #[tokio::test]
    async fn close_margin_liquidates_on_every_tick() {
        let broker = Arc::new(PaperBroker::new(clock_at(386)));
        let (mut sweep, mut rx, _) = sweep_for(broker.clone());

        assert_eq!(sweep.tick().await, SweepOutcome::Closing);
        let first = drain(&mut rx);
        assert!(matches!(first[0], AlgoCommand::Liquidate));
        assert!(matches!(first[1], AlgoCommand::CheckExpiry { .. }));

        broker.set_clock(clock_at(387)).await;
        assert_eq!(sweep.tick().await, SweepOutcome::Closing);
        assert!(matches!(drain(&mut rx)[0], AlgoCommand::Liquidate));
    }

    #[tokio::test]
    async fn clock_failure_sends_nothing() {
        let broker = Arc::new(PaperBroker::new(clock_at(60)));
        broker.set_failing(true).await;
        let (mut sweep, mut rx, _) = sweep_for(broker);

        assert_eq!(sweep.tick().await, SweepOutcome::ClockUnavailable);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn closed_session_signals_shutdown() {
        let mut clock = clock_at(391);
        clock.is_open = false;
        let broker = Arc::new(PaperBroker::new(clock));
        let (sweep, _rx, shutdown_rx) = sweep_for(broker);

        tokio::time::timeout(Duration::from_secs(5), sweep.run(shutdown_rx.clone()))
            .await
            .expect("sweep should stop once the session is closed");
        assert!(*shutdown_rx.borrow());
    }
}
