// =============================================================================
// Persistence Gateway — durable account snapshot in a single file slot
// =============================================================================
//
// Saves overwrite the prior snapshot atomically (tmp + rename); there is no
// versioning and no merge. Loads are best-effort: a missing or unreadable
// slot, or any parse failure, yields the documented defaults. Every field
// also carries a serde default so older snapshots keep loading as fields are
// added.
//
// Open positions are intentionally not part of the snapshot — a reload always
// starts with zero open positions.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::default_watchlist;
use crate::ledger::{Ledger, Position, HISTORY_CAP};

fn default_balance() -> f64 {
    1000.0
}

/// The durable account snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default = "default_balance")]
    pub balance: f64,

    #[serde(default = "default_watchlist")]
    pub watchlist: Vec<String>,

    /// Closed/liquidated positions, newest first, capped at [`HISTORY_CAP`].
    #[serde(default)]
    pub history: Vec<Position>,

    #[serde(default)]
    pub total_deposited: f64,

    #[serde(default)]
    pub total_realized_profit: f64,

    #[serde(default)]
    pub total_realized_loss: f64,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            balance: default_balance(),
            watchlist: default_watchlist(),
            history: Vec::new(),
            total_deposited: 0.0,
            total_realized_profit: 0.0,
            total_realized_loss: 0.0,
        }
    }
}

impl PersistedState {
    /// Capture the persistable slice of the ledger plus the watchlist.
    pub fn capture(ledger: &Ledger, watchlist: &[String]) -> Self {
        let mut history = ledger.history().to_vec();
        history.truncate(HISTORY_CAP);

        Self {
            balance: ledger.balance(),
            watchlist: watchlist.to_vec(),
            history,
            total_deposited: ledger.total_deposited(),
            total_realized_profit: ledger.total_realized_profit(),
            total_realized_loss: ledger.total_realized_loss(),
        }
    }
}

/// Reads and writes the snapshot slot.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist `state`, overwriting any prior snapshot. Atomic tmp + rename
    /// so a crash mid-write cannot corrupt the slot.
    pub fn save(&self, state: &PersistedState) -> Result<()> {
        let content = serde_json::to_string_pretty(state)
            .context("failed to serialise account snapshot to JSON")?;

        let tmp_path = self.path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp snapshot to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, &self.path).with_context(|| {
            format!("failed to rename tmp snapshot to {}", self.path.display())
        })?;

        Ok(())
    }

    /// Best-effort load. Absence or parse failure is treated identically to
    /// "no prior state": the defaults are returned and the error is logged,
    /// never propagated.
    pub fn load(&self) -> PersistedState {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                info!(
                    path = %self.path.display(),
                    error = %e,
                    "no prior snapshot — starting from defaults"
                );
                return PersistedState::default();
            }
        };

        match serde_json::from_str::<PersistedState>(&content) {
            Ok(mut state) => {
                state.history.truncate(HISTORY_CAP);
                info!(
                    path = %self.path.display(),
                    balance = state.balance,
                    history = state.history.len(),
                    "account snapshot loaded"
                );
                state
            }
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "unreadable snapshot — starting from defaults"
                );
                PersistedState::default()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;

    fn temp_store() -> StateStore {
        let path = std::env::temp_dir().join(format!(
            "paper_nexus_state_{}.json",
            uuid::Uuid::new_v4()
        ));
        StateStore::new(path)
    }

    #[test]
    fn load_missing_slot_yields_defaults() {
        let store = temp_store();
        let state = store.load();
        assert_eq!(state.balance, 1000.0);
        assert_eq!(state.watchlist, default_watchlist());
        assert!(state.history.is_empty());
        assert_eq!(state.total_deposited, 0.0);
    }

    #[test]
    fn load_corrupt_slot_yields_defaults() {
        let store = temp_store();
        std::fs::write(store.path(), "{ not json").unwrap();

        let state = store.load();
        assert_eq!(state.balance, 1000.0);
        assert!(state.history.is_empty());

        std::fs::remove_file(store.path()).ok();
    }

    #[test]
    fn missing_fields_fall_back_per_field() {
        let state: PersistedState =
            serde_json::from_str(r#"{ "balance": 420.0 }"#).unwrap();
        assert_eq!(state.balance, 420.0);
        assert_eq!(state.watchlist, default_watchlist());
        assert_eq!(state.total_realized_loss, 0.0);
    }

    #[test]
    fn roundtrip_preserves_account_but_not_open_positions() {
        let store = temp_store();

        let mut ledger = Ledger::new(1000.0);
        ledger.apply_price("BTCUSDT", 100.0);
        ledger.deposit(500.0).unwrap();
        ledger.open("BTCUSDT", Direction::Long, 10.0, 2.0).unwrap();
        ledger.close(0).unwrap();
        // Leave one position open; it must not survive the round trip.
        ledger.open("BTCUSDT", Direction::Short, 25.0, 3.0).unwrap();

        let watchlist = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];
        store
            .save(&PersistedState::capture(&ledger, &watchlist))
            .unwrap();

        let loaded = store.load();
        assert_eq!(loaded.balance, ledger.balance());
        assert_eq!(loaded.watchlist, watchlist);
        assert_eq!(loaded.history.len(), 1);
        assert_eq!(loaded.total_deposited, 500.0);

        let restored = Ledger::restore(
            loaded.balance,
            loaded.total_deposited,
            loaded.total_realized_profit,
            loaded.total_realized_loss,
            loaded.history,
        );
        assert!(restored.open_positions().is_empty());

        std::fs::remove_file(store.path()).ok();
    }

    #[test]
    fn capture_caps_history_to_newest_fifty() {
        let mut ledger = Ledger::new(100_000.0);
        ledger.apply_price("BTCUSDT", 100.0);
        for _ in 0..(HISTORY_CAP + 10) {
            ledger.open("BTCUSDT", Direction::Long, 1.0, 2.0).unwrap();
            ledger.close(0).unwrap();
        }

        let state = PersistedState::capture(&ledger, &[]);
        assert_eq!(state.history.len(), HISTORY_CAP);
        // Newest first: head of the capture matches head of ledger history.
        assert_eq!(state.history[0].id, ledger.history()[0].id);
    }

    #[test]
    fn save_overwrites_prior_snapshot() {
        let store = temp_store();

        let mut state = PersistedState::default();
        state.balance = 1.0;
        store.save(&state).unwrap();
        state.balance = 2.0;
        store.save(&state).unwrap();

        assert_eq!(store.load().balance, 2.0);
        std::fs::remove_file(store.path()).ok();
    }
}
