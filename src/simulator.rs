// =============================================================================
// Simulation Engine — single-consumer event loop
// =============================================================================
//
// The feed socket task writes ticks into the shared PriceBuffer; everything
// else — flush, candle aggregation, mark-to-market, liquidation, persistence,
// and user commands — runs on this one loop, so the ledger needs no locking.
// Suspension points are exactly the flush tick and the channel receives; the
// historical-candle fetch is spawned off-loop and posts its result back as an
// event, so a slow fetch never stalls flushing.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::binance::BinanceClient;
use crate::config::EngineConfig;
use crate::ledger::{Ledger, LedgerError, Position};
use crate::market_data::{Candle, CandleSeries, PriceBuffer};
use crate::persistence::{PersistedState, StateStore};
use crate::types::{Direction, FeedStatus};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures surfaced to engine-handle callers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// The engine loop is no longer running.
    #[error("engine is not running")]
    Unavailable,
}

// ---------------------------------------------------------------------------
// Commands & events
// ---------------------------------------------------------------------------

/// User-initiated actions entering the engine loop. Each mutating action
/// replies synchronously through its oneshot with an all-or-nothing result.
pub enum EngineCommand {
    Open {
        symbol: String,
        direction: Direction,
        margin: f64,
        leverage: f64,
        reply: oneshot::Sender<Result<Position, LedgerError>>,
    },
    Close {
        index: usize,
        reply: oneshot::Sender<Result<Position, LedgerError>>,
    },
    Deposit {
        amount: f64,
        reply: oneshot::Sender<Result<f64, LedgerError>>,
    },
    /// Append a symbol to the watchlist; replies whether it was new.
    AddWatch {
        symbol: String,
        reply: oneshot::Sender<bool>,
    },
    /// Drop a symbol from the watchlist; replies whether it was present.
    /// Open positions referencing the symbol are untouched.
    RemoveWatch {
        symbol: String,
        reply: oneshot::Sender<bool>,
    },
    SetActiveSymbol {
        symbol: String,
    },
    SetTimeframe {
        timeframe: String,
    },
    Snapshot {
        reply: oneshot::Sender<EngineSnapshot>,
    },
}

/// Internal events posted back to the loop by spawned tasks.
enum EngineEvent {
    HistorySeeded {
        symbol: String,
        timeframe: String,
        candles: Vec<Candle>,
    },
}

/// Serialisable summary of the engine for observers.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub server_time: i64,
    pub balance: f64,
    pub total_deposited: f64,
    pub total_realized_profit: f64,
    pub total_realized_loss: f64,
    pub open_positions: Vec<Position>,
    pub history: Vec<Position>,
    pub watchlist: Vec<String>,
    pub active_symbol: String,
    pub timeframe: String,
    pub prices: HashMap<String, f64>,
    pub feed_status: FeedStatus,
    pub candles: Vec<Candle>,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable front door to a running engine loop.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    pub fn new(tx: mpsc::Sender<EngineCommand>) -> Self {
        Self { tx }
    }

    async fn send(&self, cmd: EngineCommand) -> Result<(), EngineError> {
        self.tx.send(cmd).await.map_err(|_| EngineError::Unavailable)
    }

    pub async fn open(
        &self,
        symbol: &str,
        direction: Direction,
        margin: f64,
        leverage: f64,
    ) -> Result<Position, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Open {
            symbol: symbol.to_string(),
            direction,
            margin,
            leverage,
            reply,
        })
        .await?;
        rx.await.map_err(|_| EngineError::Unavailable)?.map_err(EngineError::from)
    }

    pub async fn close(&self, index: usize) -> Result<Position, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Close { index, reply }).await?;
        rx.await.map_err(|_| EngineError::Unavailable)?.map_err(EngineError::from)
    }

    pub async fn deposit(&self, amount: f64) -> Result<f64, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Deposit { amount, reply }).await?;
        rx.await.map_err(|_| EngineError::Unavailable)?.map_err(EngineError::from)
    }

    pub async fn add_watch(&self, symbol: &str) -> Result<bool, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::AddWatch {
            symbol: symbol.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| EngineError::Unavailable)
    }

    pub async fn remove_watch(&self, symbol: &str) -> Result<bool, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::RemoveWatch {
            symbol: symbol.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| EngineError::Unavailable)
    }

    pub async fn set_active_symbol(&self, symbol: &str) -> Result<(), EngineError> {
        self.send(EngineCommand::SetActiveSymbol {
            symbol: symbol.to_string(),
        })
        .await
    }

    pub async fn set_timeframe(&self, timeframe: &str) -> Result<(), EngineError> {
        self.send(EngineCommand::SetTimeframe {
            timeframe: timeframe.to_string(),
        })
        .await
    }

    pub async fn snapshot(&self) -> Result<EngineSnapshot, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Snapshot { reply }).await?;
        rx.await.map_err(|_| EngineError::Unavailable)
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

/// Owns all mutable simulator state and drives the event loop.
pub struct Simulator {
    active_symbol: String,
    timeframe: String,
    watchlist: Vec<String>,
    ledger: Ledger,
    series: CandleSeries,
    buffer: Arc<PriceBuffer>,
    feed_status: Arc<RwLock<FeedStatus>>,
    store: StateStore,
    client: Arc<BinanceClient>,
    symbols_tx: watch::Sender<Vec<String>>,
    events_tx: mpsc::Sender<EngineEvent>,
    events_rx: Option<mpsc::Receiver<EngineEvent>>,
    seed_limit: u32,
    flush_interval: Duration,
}

impl Simulator {
    pub fn new(
        config: &EngineConfig,
        persisted: PersistedState,
        buffer: Arc<PriceBuffer>,
        feed_status: Arc<RwLock<FeedStatus>>,
        store: StateStore,
        client: Arc<BinanceClient>,
        symbols_tx: watch::Sender<Vec<String>>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(16);

        let ledger = Ledger::restore(
            persisted.balance,
            persisted.total_deposited,
            persisted.total_realized_profit,
            persisted.total_realized_loss,
            persisted.history,
        );

        Self {
            active_symbol: config.active_symbol.to_uppercase(),
            timeframe: config.timeframe.clone(),
            watchlist: persisted.watchlist,
            ledger,
            series: CandleSeries::new(&config.timeframe, config.max_candles),
            buffer,
            feed_status,
            store,
            client,
            symbols_tx,
            events_tx,
            events_rx: Some(events_rx),
            seed_limit: config.seed_limit,
            flush_interval: Duration::from_secs(config.flush_interval_secs.max(1)),
        }
    }

    /// Drive the engine until the command channel closes, then save once more
    /// and return. Dropping every `EngineHandle` therefore shuts the loop
    /// down; the feed supervisor follows when `symbols_tx` is dropped with
    /// the simulator.
    pub async fn run(mut self, mut commands: mpsc::Receiver<EngineCommand>) {
        let mut events = self
            .events_rx
            .take()
            .expect("engine loop started twice");

        self.push_subscription();
        self.spawn_history_fetch();

        let mut flush = tokio::time::interval(self.flush_interval);
        info!(
            flush_interval_s = self.flush_interval.as_secs(),
            watchlist = ?self.watchlist,
            active_symbol = %self.active_symbol,
            "engine loop started"
        );

        loop {
            tokio::select! {
                _ = flush.tick() => {
                    self.handle_flush(Utc::now().timestamp());
                }
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        info!("command channel closed — stopping engine loop");
                        break;
                    }
                },
                Some(event) = events.recv() => self.handle_event(event),
            }
        }

        self.save();
        info!("engine loop stopped");
    }

    // -------------------------------------------------------------------------
    // Flush handling
    // -------------------------------------------------------------------------

    /// Drain the tick buffer and apply it: mark-to-market every affected
    /// symbol, fold the active symbol's price into the chart, and persist if
    /// any position was realized. An empty window means nothing to do.
    fn handle_flush(&mut self, now_secs: i64) {
        let window = self.buffer.flush();
        if window.is_empty() {
            return;
        }

        let mut realized = false;
        for (symbol, price) in &window {
            let liquidated = self.ledger.apply_price(symbol, *price);
            realized |= !liquidated.is_empty();
        }

        if let Some(&price) = window.get(&self.active_symbol) {
            self.series.ingest(price, now_secs);
        }

        if realized {
            self.save();
        }
    }

    // -------------------------------------------------------------------------
    // Command handling
    // -------------------------------------------------------------------------

    fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Open {
                symbol,
                direction,
                margin,
                leverage,
                reply,
            } => {
                let result = self
                    .ledger
                    .open(&symbol.to_uppercase(), direction, margin, leverage);
                if result.is_ok() {
                    self.save();
                }
                let _ = reply.send(result);
            }
            EngineCommand::Close { index, reply } => {
                let result = self.ledger.close(index);
                if result.is_ok() {
                    self.save();
                }
                let _ = reply.send(result);
            }
            EngineCommand::Deposit { amount, reply } => {
                let result = self.ledger.deposit(amount);
                if result.is_ok() {
                    self.save();
                }
                let _ = reply.send(result);
            }
            EngineCommand::AddWatch { symbol, reply } => {
                let symbol = symbol.to_uppercase();
                let added = !self.watchlist.contains(&symbol);
                if added {
                    self.watchlist.push(symbol.clone());
                    info!(symbol = %symbol, "watchlist symbol added");
                    self.push_subscription();
                    self.save();
                }
                let _ = reply.send(added);
            }
            EngineCommand::RemoveWatch { symbol, reply } => {
                let symbol = symbol.to_uppercase();
                let before = self.watchlist.len();
                self.watchlist.retain(|s| s != &symbol);
                let removed = self.watchlist.len() != before;
                if removed {
                    info!(symbol = %symbol, "watchlist symbol removed");
                    self.push_subscription();
                    self.save();
                }
                let _ = reply.send(removed);
            }
            EngineCommand::SetActiveSymbol { symbol } => {
                let symbol = symbol.to_uppercase();
                if symbol != self.active_symbol {
                    info!(symbol = %symbol, "active chart symbol changed");
                    self.active_symbol = symbol;
                    self.series.clear();
                    self.push_subscription();
                    self.spawn_history_fetch();
                }
            }
            EngineCommand::SetTimeframe { timeframe } => {
                if timeframe != self.timeframe {
                    info!(timeframe = %timeframe, "chart timeframe changed");
                    self.timeframe = timeframe;
                    self.series.set_timeframe(&self.timeframe);
                    // Subscription set is unchanged; only the chart reseeds.
                    self.spawn_history_fetch();
                }
            }
            EngineCommand::Snapshot { reply } => {
                let _ = reply.send(self.build_snapshot());
            }
        }
    }

    fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::HistorySeeded {
                symbol,
                timeframe,
                candles,
            } => {
                if symbol != self.active_symbol || timeframe != self.timeframe {
                    debug!(
                        symbol = %symbol,
                        timeframe = %timeframe,
                        "stale history fetch dropped"
                    );
                    return;
                }
                info!(
                    symbol = %symbol,
                    timeframe = %timeframe,
                    bars = candles.len(),
                    "chart seeded from history"
                );
                self.series.seed(candles);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Union of the watchlist and the active chart symbol, watchlist order
    /// preserved.
    fn subscription_set(&self) -> Vec<String> {
        let mut set = self.watchlist.clone();
        if !set.contains(&self.active_symbol) {
            set.push(self.active_symbol.clone());
        }
        set
    }

    /// Push the current symbol set to the feed supervisor, triggering a full
    /// resubscription.
    fn push_subscription(&self) {
        let set = self.subscription_set();
        debug!(symbols = ?set, "subscription set pushed");
        let _ = self.symbols_tx.send(set);
    }

    /// Fetch historical bars for the active chart off-loop; the result comes
    /// back as a `HistorySeeded` event. A failed fetch is logged and the
    /// existing series stays intact.
    fn spawn_history_fetch(&self) {
        let client = self.client.clone();
        let events = self.events_tx.clone();
        let symbol = self.active_symbol.clone();
        let timeframe = self.timeframe.clone();
        let limit = self.seed_limit;

        tokio::spawn(async move {
            match client.get_klines(&symbol, &timeframe, limit).await {
                Ok(candles) => {
                    let _ = events
                        .send(EngineEvent::HistorySeeded {
                            symbol,
                            timeframe,
                            candles,
                        })
                        .await;
                }
                Err(e) => {
                    warn!(
                        symbol = %symbol,
                        timeframe = %timeframe,
                        error = %e,
                        "history fetch failed — keeping existing series"
                    );
                }
            }
        });
    }

    fn save(&self) {
        let state = PersistedState::capture(&self.ledger, &self.watchlist);
        if let Err(e) = self.store.save(&state) {
            // Degraded mode: the engine keeps running on in-memory state.
            warn!(error = %e, "failed to persist account snapshot");
        }
    }

    fn build_snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            server_time: Utc::now().timestamp_millis(),
            balance: self.ledger.balance(),
            total_deposited: self.ledger.total_deposited(),
            total_realized_profit: self.ledger.total_realized_profit(),
            total_realized_loss: self.ledger.total_realized_loss(),
            open_positions: self.ledger.open_positions().to_vec(),
            history: self.ledger.history().to_vec(),
            watchlist: self.watchlist.clone(),
            active_symbol: self.active_symbol.clone(),
            timeframe: self.timeframe.clone(),
            prices: self.ledger.prices().clone(),
            feed_status: *self.feed_status.read(),
            candles: self.series.bars(),
        }
    }
}

impl std::fmt::Debug for Simulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulator")
            .field("active_symbol", &self.active_symbol)
            .field("timeframe", &self.timeframe)
            .field("watchlist", &self.watchlist)
            .field("ledger", &self.ledger)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_simulator() -> (Simulator, watch::Receiver<Vec<String>>) {
        let state_path = std::env::temp_dir().join(format!(
            "paper_nexus_sim_{}.json",
            uuid::Uuid::new_v4()
        ));
        let config = EngineConfig {
            state_path: state_path.to_string_lossy().into_owned(),
            ..EngineConfig::default()
        };

        let (symbols_tx, symbols_rx) = watch::channel(Vec::new());
        let sim = Simulator::new(
            &config,
            PersistedState::default(),
            Arc::new(PriceBuffer::new()),
            Arc::new(RwLock::new(FeedStatus::Disconnected)),
            StateStore::new(&config.state_path),
            Arc::new(BinanceClient::new()),
            symbols_tx,
        );
        (sim, symbols_rx)
    }

    fn cleanup(sim: &Simulator) {
        std::fs::remove_file(sim.store.path()).ok();
    }

    #[test]
    fn subscription_set_is_watchlist_union_active() {
        let (mut sim, _rx) = test_simulator();

        // Default active symbol is already on the watchlist.
        assert_eq!(sim.subscription_set().len(), sim.watchlist.len());

        sim.active_symbol = "LINKUSDT".to_string();
        let set = sim.subscription_set();
        assert_eq!(set.len(), sim.watchlist.len() + 1);
        assert_eq!(set.last().unwrap(), "LINKUSDT");
        cleanup(&sim);
    }

    #[tokio::test]
    async fn add_watch_dedupes_and_pushes_subscription() {
        let (mut sim, rx) = test_simulator();

        let (reply, mut reply_rx) = oneshot::channel();
        sim.handle_command(EngineCommand::AddWatch {
            symbol: "linkusdt".to_string(),
            reply,
        });
        assert!(reply_rx.try_recv().unwrap());
        assert!(sim.watchlist.contains(&"LINKUSDT".to_string()));
        assert!(rx.borrow().contains(&"LINKUSDT".to_string()));

        let (reply, mut reply_rx) = oneshot::channel();
        sim.handle_command(EngineCommand::AddWatch {
            symbol: "LINKUSDT".to_string(),
            reply,
        });
        assert!(!reply_rx.try_recv().unwrap());
        cleanup(&sim);
    }

    #[tokio::test]
    async fn remove_watch_keeps_open_positions() {
        let (mut sim, _rx) = test_simulator();
        sim.ledger.apply_price("ETHUSDT", 2000.0);
        sim.ledger
            .open("ETHUSDT", Direction::Long, 10.0, 2.0)
            .unwrap();

        let (reply, mut reply_rx) = oneshot::channel();
        sim.handle_command(EngineCommand::RemoveWatch {
            symbol: "ETHUSDT".to_string(),
            reply,
        });
        assert!(reply_rx.try_recv().unwrap());
        assert!(!sim.watchlist.contains(&"ETHUSDT".to_string()));
        assert_eq!(sim.ledger.open_positions().len(), 1);
        cleanup(&sim);
    }

    #[test]
    fn flush_marks_ledger_and_charts_active_symbol_only() {
        let (mut sim, _rx) = test_simulator();

        sim.buffer.record("BTCUSDT", 37000.0);
        sim.buffer.record("ETHUSDT", 2000.0);
        sim.handle_flush(1_700_000_000);

        assert_eq!(sim.ledger.price("BTCUSDT"), Some(37000.0));
        assert_eq!(sim.ledger.price("ETHUSDT"), Some(2000.0));

        // Only the active symbol reaches the chart.
        assert_eq!(sim.series.len(), 1);
        assert_eq!(sim.series.last().unwrap().close, 37000.0);
        cleanup(&sim);
    }

    #[test]
    fn empty_flush_is_a_no_op() {
        let (mut sim, _rx) = test_simulator();
        sim.handle_flush(1_700_000_000);
        assert!(sim.series.is_empty());
        assert!(sim.ledger.prices().is_empty());
        cleanup(&sim);
    }

    #[test]
    fn liquidation_during_flush_persists_history() {
        let (mut sim, _rx) = test_simulator();

        sim.buffer.record("BTCUSDT", 100.0);
        sim.handle_flush(1_700_000_000);
        sim.ledger
            .open("BTCUSDT", Direction::Long, 10.0, 10.0)
            .unwrap();

        sim.buffer.record("BTCUSDT", 85.0);
        sim.handle_flush(1_700_000_001);

        assert!(sim.ledger.open_positions().is_empty());

        let saved = sim.store.load();
        assert_eq!(saved.history.len(), 1);
        assert_eq!(saved.balance, sim.ledger.balance());
        cleanup(&sim);
    }

    #[test]
    fn stale_history_seed_is_dropped() {
        let (mut sim, _rx) = test_simulator();

        sim.handle_event(EngineEvent::HistorySeeded {
            symbol: "DOTUSDT".to_string(),
            timeframe: sim.timeframe.clone(),
            candles: vec![Candle::opened_at(0, 1.0)],
        });
        assert!(sim.series.is_empty());

        sim.handle_event(EngineEvent::HistorySeeded {
            symbol: sim.active_symbol.clone(),
            timeframe: "4h".to_string(),
            candles: vec![Candle::opened_at(0, 1.0)],
        });
        assert!(sim.series.is_empty());

        sim.handle_event(EngineEvent::HistorySeeded {
            symbol: sim.active_symbol.clone(),
            timeframe: sim.timeframe.clone(),
            candles: vec![Candle::opened_at(0, 1.0)],
        });
        assert_eq!(sim.series.len(), 1);
        cleanup(&sim);
    }

    #[tokio::test]
    async fn snapshot_reflects_engine_state() {
        let (mut sim, _rx) = test_simulator();

        sim.buffer.record("BTCUSDT", 37000.0);
        sim.handle_flush(1_700_000_000);

        let (reply, mut reply_rx) = oneshot::channel();
        sim.handle_command(EngineCommand::Deposit {
            amount: 500.0,
            reply,
        });
        assert_eq!(reply_rx.try_recv().unwrap(), Ok(1500.0));

        let (reply, mut reply_rx) = oneshot::channel();
        sim.handle_command(EngineCommand::Snapshot { reply });
        let snapshot = reply_rx.try_recv().unwrap();

        assert_eq!(snapshot.balance, 1500.0);
        assert_eq!(snapshot.total_deposited, 500.0);
        assert_eq!(snapshot.prices["BTCUSDT"], 37000.0);
        assert_eq!(snapshot.candles.len(), 1);
        assert_eq!(snapshot.feed_status, FeedStatus::Disconnected);
        cleanup(&sim);
    }

    #[tokio::test]
    async fn handle_drives_running_loop_and_shutdown() {
        let (sim, _rx) = test_simulator();
        let path = sim.store.path().to_path_buf();

        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let handle = EngineHandle::new(cmd_tx);
        let engine = tokio::spawn(sim.run(cmd_rx));

        let balance = handle.deposit(250.0).await.unwrap();
        assert_eq!(balance, 1250.0);

        let err = handle.open("BTCUSDT", Direction::Long, 10.0, 5.0).await;
        assert_eq!(
            err,
            Err(EngineError::Ledger(LedgerError::NoPrice(
                "BTCUSDT".to_string()
            )))
        );

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.balance, 1250.0);

        // Dropping the last handle closes the command channel and stops the
        // loop after a final save.
        drop(handle);
        engine.await.unwrap();

        let store = StateStore::new(&path);
        assert_eq!(store.load().balance, 1250.0);
        std::fs::remove_file(&path).ok();
    }
}
