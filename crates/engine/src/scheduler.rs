use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use common::{Bar, OrderUpdate};

use crate::algo::{AlgoCommand, InstrumentAlgo};

const INBOX_CAPACITY: usize = 256;
const ROUTE_TIMEOUT: Duration = Duration::from_secs(1);

/// Cloneable routing table from symbol to its algo task's inbox.
#[derive(Clone)]
pub struct FleetHandle {
    routes: Arc<HashMap<String, mpsc::Sender<AlgoCommand>>>,
}

impl FleetHandle {
    pub(crate) fn new(routes: HashMap<String, mpsc::Sender<AlgoCommand>>) -> Self {
        Self {
            routes: Arc::new(routes),
        }
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Deliver `cmd` to the algo for `symbol`. Unknown symbols are dropped,
    /// and so is the event if the inbox stays full for `ROUTE_TIMEOUT`, so a
    /// stalled instrument cannot hold up the others.
    pub async fn route(&self, symbol: &str, cmd: AlgoCommand) -> bool {
        let Some(tx) = self.routes.get(symbol) else {
            warn!(symbol = %symbol, "Event for unknown symbol dropped");
            return false;
        };
        match tx.send_timeout(cmd, ROUTE_TIMEOUT).await {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(symbol = %symbol, "Instrument inbox full; event dropped");
                false
            }
            Err(SendTimeoutError::Closed(_)) => {
                warn!(symbol = %symbol, "Instrument task stopped; event dropped");
                false
            }
        }
    }

    /// Offer a fresh command to every algo without waiting. Used for the
    /// sweep's commands, which are re-sent every tick.
    pub fn broadcast<F>(&self, make: F)
    where
        F: Fn() -> AlgoCommand,
    {
        for (symbol, tx) in self.routes.iter() {
            match tx.try_send(make()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(symbol = %symbol, "Instrument inbox full; sweep command skipped");
                }
                Err(TrySendError::Closed(_)) => {
                    warn!(symbol = %symbol, "Instrument task stopped; command dropped");
                }
            }
        }
    }
}

/// Owns one task per instrument and demultiplexes the shared event streams.
///
/// Each algo's inbox is FIFO, so events for one symbol are handled in
/// arrival order and never concurrently. Different symbols progress
/// independently.
pub struct Scheduler {
    fleet: FleetHandle,
    tasks: Vec<(String, JoinHandle<()>)>,
    shutdown_grace: Duration,
}

impl Scheduler {
    /// Spawn a task for every algo. Call from within a tokio runtime.
    pub fn spawn(algos: Vec<InstrumentAlgo>, shutdown_grace: Duration) -> Self {
        let mut routes = HashMap::new();
        let mut tasks = Vec::new();

        for algo in algos {
            let symbol = algo.symbol().to_string();
            if routes.contains_key(&symbol) {
                warn!(symbol = %symbol, "Duplicate instrument ignored");
                continue;
            }
            let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
            routes.insert(symbol.clone(), tx);
            tasks.push((symbol, tokio::spawn(algo.run(rx))));
        }

        info!(instruments = tasks.len(), "Scheduler started");
        Self {
            fleet: FleetHandle::new(routes),
            tasks,
            shutdown_grace,
        }
    }

    pub fn fleet(&self) -> FleetHandle {
        self.fleet.clone()
    }

    /// Route bars and order updates until shutdown is signalled or both
    /// streams close, then wait for the algo tasks to drain.
    pub async fn run(
        self,
        mut market_rx: broadcast::Receiver<Bar>,
        mut order_rx: broadcast::Receiver<OrderUpdate>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut market_open = true;
        let mut orders_open = true;

        while (market_open || orders_open) && !*shutdown_rx.borrow() {
            tokio::select! {
                // ── Market data ─────────────────────────────────────────────
                bar = market_rx.recv(), if market_open => {
                    match bar {
                        Ok(bar) => {
                            let symbol = bar.symbol.clone();
                            self.fleet.route(&symbol, AlgoCommand::Bar(bar)).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(dropped = n, "Scheduler market channel lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!("Market data channel closed");
                            market_open = false;
                        }
                    }
                }

                // ── Order updates ───────────────────────────────────────────
                update = order_rx.recv(), if orders_open => {
                    match update {
                        Ok(update) => {
                            debug!(symbol = %update.symbol, order_id = %update.order_id, event = %update.event, "Order update");
                            let symbol = update.symbol.clone();
                            self.fleet.route(&symbol, AlgoCommand::OrderUpdate(update)).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(dropped = n, "Scheduler order-update channel lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!("Order-update channel closed");
                            orders_open = false;
                        }
                    }
                }

                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Scheduler no longer accepting events");
        self.drain().await;
    }

    /// Drop our senders and wait for each algo to finish its queued work.
    async fn drain(self) {
        let Scheduler {
            fleet,
            tasks,
            shutdown_grace,
        } = self;
        drop(fleet);

        let deadline = tokio::time::Instant::now() + shutdown_grace;
        for (symbol, mut handle) in tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(symbol = %symbol, error = %e, "Instrument task failed"),
                Err(_) => {
                    warn!(symbol = %symbol, "Instrument task did not settle in time; aborting");
                    handle.abort();
                }
            }
        }
        info!("All instrument tasks stopped");
    }
}
