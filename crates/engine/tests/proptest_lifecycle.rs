//! Random event sequences against one algo and the in-memory broker. Updates
//! are delivered in order unless a step deliberately loses them.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;
use tokio::sync::broadcast;

use common::{Bar, BrokerOrder, Clock, ExecutionClient, OrderUpdate};
use engine::{AlgoConfig, InstrumentAlgo};
use paper::PaperBroker;
use risk::RiskConfig;
use strategy::SmaCrossover;

#[derive(Debug, Clone)]
enum Step {
    Bar(f64),
    Fill,
    PartialFill,
    Reject,
    ExternalCancel,
    Expiry(i64),
    Liquidate,
    /// Fill the working order and drop every update it produces.
    SilentFill,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        6 => (80.0f64..125.0).prop_map(Step::Bar),
        2 => Just(Step::Fill),
        1 => Just(Step::PartialFill),
        1 => Just(Step::Reject),
        1 => Just(Step::ExternalCancel),
        2 => (1i64..4).prop_map(Step::Expiry),
        1 => Just(Step::Liquidate),
        1 => Just(Step::SilentFill),
    ]
}

fn market_open() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 14, 30, 0).unwrap()
}

fn at(minute: i64) -> DateTime<Utc> {
    market_open() + chrono::Duration::minutes(minute)
}

fn bar(minute: i64, close: f64) -> Bar {
    Bar {
        symbol: "TSLA".to_string(),
        timestamp: at(minute),
        open: close,
        high: close,
        low: close,
        close,
        volume: 1_000.0,
    }
}

struct Sim {
    broker: Arc<PaperBroker>,
    algo: InstrumentAlgo,
    updates: broadcast::Receiver<OrderUpdate>,
    minute: i64,
    last_close: f64,
}

impl Sim {
    async fn start() -> Self {
        let broker = Arc::new(PaperBroker::new(Clock {
            timestamp: at(0),
            is_open: true,
            next_open: market_open() + chrono::Duration::days(1),
            next_close: at(390),
        }));
        let updates = broker.subscribe_order_updates();
        let config = AlgoConfig {
            lot_notional: 1_000.0,
            buy_timeout: Duration::from_secs(120),
            risk: RiskConfig::default(),
        };
        let algo = InstrumentAlgo::new(
            "TSLA",
            Arc::new(SmaCrossover::default()),
            broker.clone(),
            config,
        );
        let mut sim = Self {
            broker,
            algo,
            updates,
            minute: 0,
            last_close: 100.0,
        };
        for _ in 0..19 {
            sim.bar(100.0).await;
        }
        sim
    }

    /// Hand every queued update to the algo, including ones its reactions
    /// produce.
    async fn deliver(&mut self) {
        while let Ok(update) = self.updates.try_recv() {
            self.algo.on_order_update(&update).await;
        }
    }

    fn discard(&mut self) {
        while self.updates.try_recv().is_ok() {}
    }

    async fn bar(&mut self, close: f64) {
        self.minute += 1;
        self.last_close = close;
        let bar = bar(self.minute, close);
        self.broker.advance_to(bar.timestamp).await;
        self.broker.on_bar(&bar).await;
        self.deliver().await;
        self.algo.on_bar(bar).await;
        self.deliver().await;
    }

    async fn working(&self) -> Option<BrokerOrder> {
        self.broker
            .get_open_orders("TSLA")
            .await
            .ok()
            .and_then(|orders| orders.into_iter().next())
    }

    async fn apply(&mut self, step: Step) {
        match step {
            Step::Bar(close) => self.bar(close).await,
            Step::Fill => {
                if let Some(order) = self.working().await {
                    let _ = self.broker.fill(&order.id, self.last_close).await;
                }
                self.deliver().await;
            }
            Step::PartialFill => {
                if let Some(order) = self.working().await {
                    let half = ((order.quantity - order.filled_quantity) / 2.0).floor();
                    if half >= 1.0 {
                        let _ = self
                            .broker
                            .partial_fill(&order.id, half, self.last_close)
                            .await;
                    }
                }
                self.deliver().await;
            }
            Step::Reject => {
                if let Some(order) = self.working().await {
                    let _ = self.broker.reject(&order.id).await;
                }
                self.deliver().await;
            }
            Step::ExternalCancel => {
                if let Some(order) = self.working().await {
                    let _ = self.broker.cancel_order(&order.id).await;
                }
                self.deliver().await;
            }
            Step::Expiry(minutes) => {
                self.minute += minutes;
                let now = at(self.minute);
                self.broker.advance_to(now).await;
                self.algo.check_expiry(now).await;
                self.deliver().await;
            }
            Step::Liquidate => {
                self.algo.liquidate().await;
                self.deliver().await;
            }
            Step::SilentFill => {
                if let Some(order) = self.working().await {
                    let _ = self.broker.fill(&order.id, self.last_close).await;
                }
                self.discard();
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// The broker never holds more than one working order for the symbol,
    /// and the algo's view always matches its state.
    #[test]
    fn at_most_one_order_is_ever_working(steps in prop::collection::vec(step(), 1..60)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async move {
            let mut sim = Sim::start().await;
            for step in steps {
                sim.apply(step.clone()).await;

                let open = sim.broker.get_open_orders("TSLA").await.unwrap();
                prop_assert!(open.len() <= 1, "after {:?}: {} open orders", step, open.len());
                prop_assert!(sim.algo.state().is_consistent(), "after {:?}: {:?}", step, sim.algo.state());
                prop_assert!(sim.algo.state().held_quantity >= 0.0);
                if let (Some(active), Some(order)) = (sim.algo.state().active_order.as_ref(), open.first()) {
                    prop_assert_eq!(&active.id, &order.id);
                }
            }
            Ok(())
        })?;
    }
}
