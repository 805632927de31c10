// =============================================================================
// Engine Configuration — JSON-file settings with atomic save
// =============================================================================
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields never
// breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

pub(crate) fn default_watchlist() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "SOLUSDT".to_string(),
        "XRPUSDT".to_string(),
        "BNBUSDT".to_string(),
        "DOGEUSDT".to_string(),
    ]
}

fn default_active_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_timeframe() -> String {
    "1m".to_string()
}

fn default_flush_interval_secs() -> u64 {
    1
}

fn default_state_path() -> String {
    "paper_state.json".to_string()
}

fn default_seed_limit() -> u32 {
    200
}

fn default_max_candles() -> usize {
    500
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the simulation engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Symbols tracked for live pricing when no persisted watchlist exists.
    #[serde(default = "default_watchlist")]
    pub watchlist: Vec<String>,

    /// Symbol whose candles the chart aggregates.
    #[serde(default = "default_active_symbol")]
    pub active_symbol: String,

    /// Timeframe token for the chart ("1m", "4h", "1d", ...).
    #[serde(default = "default_timeframe")]
    pub timeframe: String,

    /// Wall-clock seconds between price-buffer flushes.
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// File slot for the persisted account snapshot.
    #[serde(default = "default_state_path")]
    pub state_path: String,

    /// Number of historical bars fetched when seeding the chart.
    #[serde(default = "default_seed_limit")]
    pub seed_limit: u32,

    /// Maximum candles retained in the chart series.
    #[serde(default = "default_max_candles")]
    pub max_candles: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            watchlist: default_watchlist(),
            active_symbol: default_active_symbol(),
            timeframe: default_timeframe(),
            flush_interval_secs: default_flush_interval_secs(),
            state_path: default_state_path(),
            seed_limit: default_seed_limit(),
            max_candles: default_max_candles(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            watchlist = ?config.watchlist,
            active_symbol = %config.active_symbol,
            timeframe = %config.timeframe,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }
}
