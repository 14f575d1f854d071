use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use common::{Bar, Config, ExecutionClient};
use engine::{
    AlgoConfig, AlpacaBarStream, AlpacaClient, RecoveryBootstrap, SafetySweep, Scheduler,
    SweepConfig, TradeUpdateStream,
};
use strategy::{build_evaluator, SignalFileConfig};

#[derive(Parser)]
#[command(name = "scalper", about = "Intraday scalping bot for US equities on Alpaca")]
struct Cli {
    /// USD notional allocated to each buy.
    #[arg(long, default_value_t = 2000.0)]
    lot: f64,

    /// Symbols to trade (e.g., TSLA AAPL SPY).
    #[arg(required = true)]
    symbols: Vec<String>,

    /// Also append plain-text logs to this file.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Console logging, plus a non-blocking file layer when a path is given.
/// The returned guard must live until exit so buffered lines are flushed.
fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let stdout_layer = fmt::layer().with_target(false).with_filter(env_filter());

    let Some(path) = log_file else {
        tracing_subscriber::registry().with(stdout_layer).try_init()?;
        return Ok(None);
    };

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create log directory {}", dir.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(file);
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(writer)
        .with_filter(env_filter());
    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .try_init()?;
    Ok(Some(guard))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_file.as_deref())?;

    // ── Config ────────────────────────────────────────────────────────────────
    let cfg = Config::from_env(cli.symbols, cli.lot).context("invalid configuration")?;
    info!(
        mode = %cfg.trading_mode,
        symbols = ?cfg.symbols,
        lot = cfg.lot_notional,
        "Scalper starting"
    );

    let signal_file = SignalFileConfig::load(&cfg.signal_config_path)?;
    let evaluator = build_evaluator(&signal_file.signal)?;

    // ── Broker ────────────────────────────────────────────────────────────────
    let alpaca = Arc::new(AlpacaClient::new(&cfg)?);
    let client: Arc<dyn ExecutionClient> = alpaca.clone();

    let clock = client
        .get_clock()
        .await
        .context("failed to read the market clock")?;
    if !clock.is_open {
        warn!(next_open = %clock.next_open, "Market is closed; nothing to trade");
        return Ok(());
    }

    // ── Streams ───────────────────────────────────────────────────────────────
    // Subscribe before recovery so nothing published meanwhile is lost.
    let (market_tx, market_rx) = broadcast::channel::<Bar>(1024);
    let order_rx = client.subscribe_order_updates();
    let bar_stream = tokio::spawn(AlpacaBarStream::new(&cfg, market_tx).run());
    let trade_stream = tokio::spawn(TradeUpdateStream::new(&cfg, alpaca.updates_sender()).run());

    // ── Recovery ──────────────────────────────────────────────────────────────
    let bootstrap = RecoveryBootstrap::new(
        client.clone(),
        evaluator,
        AlgoConfig::from_config(&cfg),
        cfg.recovery_attempts,
    );
    let algos = match bootstrap.recover_fleet(&cfg.symbols).await {
        Ok(algos) => algos,
        Err(e) => {
            bar_stream.abort();
            trade_stream.abort();
            return Err(e).context("startup recovery failed");
        }
    };

    // ── Scheduler + sweep ─────────────────────────────────────────────────────
    let scheduler = Scheduler::spawn(algos, cfg.shutdown_grace);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweep = SafetySweep::new(
        client.clone(),
        scheduler.fleet(),
        SweepConfig::from_config(&cfg),
        shutdown_tx.clone(),
    );
    let sweep_task = tokio::spawn(sweep.run(shutdown_rx.clone()));

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received; shutting down");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => error!(error = %e, "Failed to listen for interrupt"),
        }
    });

    info!("All subsystems started. Trading until session close.");
    scheduler.run(market_rx, order_rx, shutdown_rx).await;

    if let Err(e) = sweep_task.await {
        warn!(error = %e, "Safety sweep task failed");
    }
    bar_stream.abort();
    trade_stream.abort();
    info!("Scalper stopped");
    Ok(())
}
