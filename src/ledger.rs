// =============================================================================
// Position Ledger — isolated-margin paper positions and account balance
// =============================================================================
//
// Life-cycle:
//   Open -> Closed     (manual close at the current mark price)
//   Open -> Liquidated (loss consumed the full margin; forced close at the
//                       precomputed liquidation price)
//
// All mutation goes through the ledger's methods; user-initiated operations
// are all-or-nothing and surface typed errors to the caller.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::types::{Direction, PositionStatus};

/// Most recent closed/liquidated positions retained, newest first.
pub const HISTORY_CAP: usize = 50;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// User-action failures. Feed and storage failures never surface here; they
/// are recovered where they occur.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LedgerError {
    #[error("insufficient balance: margin {margin} exceeds balance {balance}")]
    InsufficientBalance { margin: f64, balance: f64 },

    #[error("no known price for {0}")]
    NoPrice(String),

    #[error("amount must be positive, got {0}")]
    InvalidAmount(f64),

    #[error("no open position at index {0}")]
    IndexOutOfRange(usize),
}

// ---------------------------------------------------------------------------
// Position model
// ---------------------------------------------------------------------------

/// A single leveraged paper position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Unique identifier (UUID v4).
    pub id: String,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    /// Latest mark price applied to this position.
    pub current_price: f64,
    /// Collateral committed at open.
    pub margin: f64,
    pub leverage: f64,
    /// Notional value: margin x leverage.
    pub size: f64,
    /// Coins bought/sold: size / entry_price.
    pub quantity: f64,
    /// Fixed at open, never recomputed.
    pub liquidation_price: f64,
    #[serde(default)]
    pub pnl: f64,
    #[serde(default)]
    pub pnl_percent: f64,
    pub status: PositionStatus,
    pub opened_at: String,
    #[serde(default)]
    pub closed_at: Option<String>,
    #[serde(default)]
    pub close_price: Option<f64>,
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Owns the account balance, the open-position sequence (most recent first),
/// the closed/liquidated history, and the realized P&L accumulators.
///
/// Also holds the transient mark-price table rebuilt from the feed; it is
/// never persisted.
pub struct Ledger {
    balance: f64,
    total_deposited: f64,
    total_realized_profit: f64,
    total_realized_loss: f64,
    open: Vec<Position>,
    history: Vec<Position>,
    prices: HashMap<String, f64>,
}

impl Ledger {
    pub fn new(balance: f64) -> Self {
        Self {
            balance,
            total_deposited: 0.0,
            total_realized_profit: 0.0,
            total_realized_loss: 0.0,
            open: Vec::new(),
            history: Vec::new(),
            prices: HashMap::new(),
        }
    }

    /// Rebuild a ledger from persisted state. Open positions are never
    /// persisted, so a restored ledger always starts with zero of them.
    pub fn restore(
        balance: f64,
        total_deposited: f64,
        total_realized_profit: f64,
        total_realized_loss: f64,
        history: Vec<Position>,
    ) -> Self {
        Self {
            balance,
            total_deposited,
            total_realized_profit,
            total_realized_loss,
            open: Vec::new(),
            history,
            prices: HashMap::new(),
        }
    }

    // -------------------------------------------------------------------------
    // User-initiated operations
    // -------------------------------------------------------------------------

    /// Open a leveraged position at the current mark price.
    ///
    /// The balance is debited by `margin`; the liquidation price is the mark
    /// at which accumulated loss equals the full margin and is fixed for the
    /// life of the position.
    pub fn open(
        &mut self,
        symbol: &str,
        direction: Direction,
        margin: f64,
        leverage: f64,
    ) -> Result<Position, LedgerError> {
        if !(margin > 0.0 && margin.is_finite()) {
            return Err(LedgerError::InvalidAmount(margin));
        }
        if !(leverage > 0.0 && leverage.is_finite()) {
            return Err(LedgerError::InvalidAmount(leverage));
        }

        let entry_price = match self.prices.get(symbol) {
            Some(&p) if p > 0.0 => p,
            _ => return Err(LedgerError::NoPrice(symbol.to_string())),
        };

        if margin > self.balance {
            return Err(LedgerError::InsufficientBalance {
                margin,
                balance: self.balance,
            });
        }

        self.balance -= margin;

        let size = margin * leverage;
        let quantity = size / entry_price;
        let liquidation_price = match direction {
            Direction::Long => entry_price - margin / quantity,
            Direction::Short => entry_price + margin / quantity,
        };

        let pos = Position {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            direction,
            entry_price,
            current_price: entry_price,
            margin,
            leverage,
            size,
            quantity,
            liquidation_price,
            pnl: 0.0,
            pnl_percent: 0.0,
            status: PositionStatus::Open,
            opened_at: Utc::now().to_rfc3339(),
            closed_at: None,
            close_price: None,
        };

        info!(
            id = %pos.id,
            symbol,
            direction = %direction,
            entry_price,
            margin,
            leverage,
            liquidation_price,
            "position opened"
        );

        // Most-recent-first display contract.
        self.open.insert(0, pos.clone());
        Ok(pos)
    }

    /// Close the open position at `index`, crediting margin plus P&L back to
    /// the balance and moving the position to history.
    pub fn close(&mut self, index: usize) -> Result<Position, LedgerError> {
        if index >= self.open.len() {
            return Err(LedgerError::IndexOutOfRange(index));
        }

        let mut pos = self.open.remove(index);
        self.balance += pos.margin + pos.pnl;

        pos.status = PositionStatus::Closed;
        pos.close_price = Some(pos.current_price);
        pos.closed_at = Some(Utc::now().to_rfc3339());

        if pos.pnl >= 0.0 {
            self.total_realized_profit += pos.pnl;
        } else {
            self.total_realized_loss += -pos.pnl;
        }

        info!(
            id = %pos.id,
            symbol = %pos.symbol,
            close_price = pos.current_price,
            pnl = pos.pnl,
            balance = self.balance,
            "position closed"
        );

        self.push_history(pos.clone());
        Ok(pos)
    }

    /// Credit `amount` to the balance and the deposit accumulator.
    pub fn deposit(&mut self, amount: f64) -> Result<f64, LedgerError> {
        if !(amount > 0.0 && amount.is_finite()) {
            return Err(LedgerError::InvalidAmount(amount));
        }

        self.balance += amount;
        self.total_deposited += amount;

        info!(amount, balance = self.balance, "deposit credited");
        Ok(self.balance)
    }

    // -------------------------------------------------------------------------
    // Mark-to-market
    // -------------------------------------------------------------------------

    /// Apply a fresh mark price for `symbol`: update the price table, then
    /// recompute P&L for every open position referencing it.
    ///
    /// Positions whose loss reaches the full margin are force-closed at their
    /// precomputed liquidation price — not at the current mark — so the loss
    /// is exactly the margin regardless of how far price overshot. The margin
    /// is not returned to the balance. Returns the liquidated positions.
    pub fn apply_price(&mut self, symbol: &str, price: f64) -> Vec<Position> {
        self.prices.insert(symbol.to_string(), price);

        let mut liquidated = Vec::new();
        let mut i = 0;

        while i < self.open.len() {
            if self.open[i].symbol != symbol {
                i += 1;
                continue;
            }

            let pos = &mut self.open[i];
            pos.current_price = price;
            pos.pnl = match pos.direction {
                Direction::Long => (price - pos.entry_price) * pos.quantity,
                Direction::Short => (pos.entry_price - price) * pos.quantity,
            };
            pos.pnl_percent = pos.pnl / pos.margin * 100.0;

            if pos.pnl <= -pos.margin {
                let mut pos = self.open.remove(i);
                warn!(
                    id = %pos.id,
                    symbol = %pos.symbol,
                    direction = %pos.direction,
                    liquidation_price = pos.liquidation_price,
                    mark = price,
                    "position liquidated — margin forfeited"
                );

                pos.status = PositionStatus::Liquidated;
                pos.current_price = pos.liquidation_price;
                pos.close_price = Some(pos.liquidation_price);
                pos.closed_at = Some(Utc::now().to_rfc3339());
                pos.pnl = -pos.margin;
                pos.pnl_percent = -100.0;

                self.total_realized_loss += pos.margin;
                self.push_history(pos.clone());
                liquidated.push(pos);
            } else {
                i += 1;
            }
        }

        liquidated
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn balance(&self) -> f64 {
        self.balance
    }

    pub fn total_deposited(&self) -> f64 {
        self.total_deposited
    }

    pub fn total_realized_profit(&self) -> f64 {
        self.total_realized_profit
    }

    pub fn total_realized_loss(&self) -> f64 {
        self.total_realized_loss
    }

    /// Open positions, most recent first.
    pub fn open_positions(&self) -> &[Position] {
        &self.open
    }

    /// Closed and liquidated positions, newest first, capped at
    /// [`HISTORY_CAP`].
    pub fn history(&self) -> &[Position] {
        &self.history
    }

    pub fn price(&self, symbol: &str) -> Option<f64> {
        self.prices.get(symbol).copied()
    }

    /// Latest mark price per symbol (transient, rebuilt from the feed).
    pub fn prices(&self) -> &HashMap<String, f64> {
        &self.prices
    }

    fn push_history(&mut self, pos: Position) {
        self.history.insert(0, pos);
        self.history.truncate(HISTORY_CAP);
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("balance", &self.balance)
            .field("open_positions", &self.open.len())
            .field("history", &self.history.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
