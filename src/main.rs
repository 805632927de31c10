// =============================================================================
// Paper Nexus — Main Entry Point
// =============================================================================
//
// Headless paper-trading simulation engine: live Binance trade ticks drive
// leveraged paper positions, candle aggregation, and a persisted account.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use paper_nexus::binance::BinanceClient;
use paper_nexus::config::EngineConfig;
use paper_nexus::market_data::{price_feed, PriceBuffer};
use paper_nexus::persistence::StateStore;
use paper_nexus::simulator::{EngineHandle, Simulator};
use paper_nexus::types::FeedStatus;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Paper Nexus — Simulation Engine Starting          ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = EngineConfig::load("engine_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        EngineConfig::default()
    });

    // Override the watchlist and state slot from env if available.
    if let Ok(syms) = std::env::var("NEXUS_SYMBOLS") {
        config.watchlist = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Ok(path) = std::env::var("NEXUS_STATE_PATH") {
        config.state_path = path;
    }

    info!(
        watchlist = ?config.watchlist,
        active_symbol = %config.active_symbol,
        timeframe = %config.timeframe,
        "Configured symbols"
    );

    // ── 2. Durable account state ─────────────────────────────────────────
    let store = StateStore::new(&config.state_path);
    let persisted = store.load();
    info!(
        balance = persisted.balance,
        history = persisted.history.len(),
        "Account state ready"
    );

    // ── 3. Market data plumbing ──────────────────────────────────────────
    let buffer = Arc::new(PriceBuffer::new());
    let feed_status = Arc::new(RwLock::new(FeedStatus::Disconnected));
    let (symbols_tx, symbols_rx) = watch::channel(Vec::new());

    tokio::spawn(price_feed::run_feed_supervisor(
        buffer.clone(),
        feed_status.clone(),
        symbols_rx,
    ));

    // ── 4. Engine loop ───────────────────────────────────────────────────
    let client = Arc::new(BinanceClient::new());
    let (cmd_tx, cmd_rx) = mpsc::channel(64);

    let simulator = Simulator::new(
        &config,
        persisted,
        buffer,
        feed_status,
        store,
        client,
        symbols_tx,
    );
    let engine = tokio::spawn(simulator.run(cmd_rx));

    let handle = EngineHandle::new(cmd_tx);

    // ── 5. Periodic status report ────────────────────────────────────────
    let status_handle = handle.clone();
    let status_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        interval.tick().await; // skip the immediate first tick
        loop {
            interval.tick().await;
            match status_handle.snapshot().await {
                Ok(snapshot) => {
                    info!(
                        balance = snapshot.balance,
                        open_positions = snapshot.open_positions.len(),
                        feed = %snapshot.feed_status,
                        candles = snapshot.candles.len(),
                        "engine status"
                    );
                }
                Err(_) => break,
            }
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    status_task.abort();
    // Closing the command channel stops the engine loop after a final save.
    drop(handle);
    let _ = engine.await;

    info!("Paper Nexus shut down complete.");
    Ok(())
}
