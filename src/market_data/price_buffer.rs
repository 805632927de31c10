// =============================================================================
// Price Buffer — coalesces rapid ticks between flush cycles
// =============================================================================

use std::collections::HashMap;

use parking_lot::Mutex;

/// Last-write-wins tick buffer shared between the feed socket task and the
/// engine loop. Intermediate ticks inside a flush window are dropped; the
/// 1-second flush cadence is the engine's only throttle on update frequency.
pub struct PriceBuffer {
    window: Mutex<HashMap<String, f64>>,
}

impl PriceBuffer {
    pub fn new() -> Self {
        Self {
            window: Mutex::new(HashMap::new()),
        }
    }

    /// Record a tick, overwriting any prior buffered value for the symbol.
    /// Never blocks the caller beyond the lock's critical section.
    pub fn record(&self, symbol: &str, price: f64) {
        self.window.lock().insert(symbol.to_string(), price);
    }

    /// Drain the buffered window and clear it.
    ///
    /// An empty map means "nothing to do" for consumers, never "price
    /// unchanged".
    pub fn flush(&self) -> HashMap<String, f64> {
        std::mem::take(&mut *self.window.lock())
    }

    /// Number of symbols currently buffered (diagnostics only).
    pub fn pending(&self) -> usize {
        self.window.lock().len()
    }
}

impl Default for PriceBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_write_wins_within_window() {
        let buf = PriceBuffer::new();
        buf.record("BTCUSDT", 37000.0);
        buf.record("BTCUSDT", 37001.5);

        let window = buf.flush();
        assert_eq!(window.len(), 1);
        assert_eq!(window["BTCUSDT"], 37001.5);
    }

    #[test]
    fn flush_clears_the_window() {
        let buf = PriceBuffer::new();
        buf.record("ETHUSDT", 2000.0);

        assert_eq!(buf.flush().len(), 1);
        assert!(buf.flush().is_empty());
        assert_eq!(buf.pending(), 0);
    }

    #[test]
    fn flush_without_ticks_is_empty() {
        let buf = PriceBuffer::new();
        assert!(buf.flush().is_empty());
    }

    #[test]
    fn symbols_buffer_independently() {
        let buf = PriceBuffer::new();
        buf.record("BTCUSDT", 37000.0);
        buf.record("ETHUSDT", 2000.0);
        buf.record("ETHUSDT", 2001.0);

        let window = buf.flush();
        assert_eq!(window.len(), 2);
        assert_eq!(window["BTCUSDT"], 37000.0);
        assert_eq!(window["ETHUSDT"], 2001.0);
    }
}
