// =============================================================================
// Paper Nexus — paper-trading simulation engine
// =============================================================================
//
// Live exchange trade ticks drive leveraged paper positions with isolated
// margin, continuous P&L, deterministic liquidation, OHLC aggregation for the
// chart, and a durable account snapshot across sessions.
// =============================================================================

pub mod binance;
pub mod config;
pub mod ledger;
pub mod market_data;
pub mod persistence;
pub mod simulator;
pub mod types;
