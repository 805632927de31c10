// =============================================================================
// Candle Aggregator — fixed-interval OHLC series for the active chart symbol
// =============================================================================

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// A single OHLC candle. `time` is the interval-aligned open time in epoch
/// seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Candle {
    /// A fresh candle opened at `time` with O=H=L=C set to `price`.
    pub fn opened_at(time: i64, price: f64) -> Self {
        Self {
            time,
            open: price,
            high: price,
            low: price,
            close: price,
        }
    }
}

/// Map a timeframe token to its interval in seconds.
///
/// "1m" -> 60, "4h" -> 14400, "1d" -> 86400. An unrecognized suffix (or an
/// unparseable count) falls back to 60 seconds.
pub fn interval_seconds(token: &str) -> i64 {
    if token.len() < 2 {
        return 60;
    }
    let (count, suffix) = token.split_at(token.len() - 1);
    let n: i64 = match count.parse() {
        Ok(n) if n > 0 => n,
        _ => return 60,
    };
    match suffix {
        "m" => n * 60,
        "h" => n * 3600,
        "d" => n * 86_400,
        _ => 60,
    }
}

/// Append/replace-last candle series. The last candle is mutated in place
/// until its interval elapses, then a new one is appended. No reordering, no
/// gap backfill: after a feed gap only one candle opens, at the current
/// boundary.
pub struct CandleSeries {
    candles: VecDeque<Candle>,
    interval: i64,
    max_candles: usize,
}

impl CandleSeries {
    pub fn new(timeframe: &str, max_candles: usize) -> Self {
        Self {
            candles: VecDeque::with_capacity(max_candles + 1),
            interval: interval_seconds(timeframe),
            max_candles,
        }
    }

    pub fn interval(&self) -> i64 {
        self.interval
    }

    /// Switch the aggregation interval. The existing series no longer matches
    /// the new timeframe, so it is discarded; `seed` repopulates it.
    pub fn set_timeframe(&mut self, timeframe: &str) {
        self.interval = interval_seconds(timeframe);
        self.candles.clear();
    }

    /// Drop all bars (used when the active symbol changes, before the
    /// historical reseed arrives).
    pub fn clear(&mut self) {
        self.candles.clear();
    }

    /// Replace the series wholesale with historical bars. The final seeded
    /// bar becomes the live candle.
    pub fn seed(&mut self, history: Vec<Candle>) {
        self.candles = history.into();
        self.trim();
        debug!(len = self.candles.len(), "candle series seeded");
    }

    /// Fold a price observed at `now_secs` into the series.
    ///
    /// If the live candle's interval has elapsed, one new candle opens at the
    /// floor-aligned current boundary; otherwise the live candle's close,
    /// high, and low are updated in place.
    pub fn ingest(&mut self, price: f64, now_secs: i64) {
        let aligned = (now_secs / self.interval) * self.interval;

        match self.candles.back_mut() {
            Some(last) if now_secs < last.time + self.interval => {
                last.close = price;
                if price > last.high {
                    last.high = price;
                }
                if price < last.low {
                    last.low = price;
                }
            }
            _ => {
                self.candles.push_back(Candle::opened_at(aligned, price));
                self.trim();
            }
        }
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.back()
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// Snapshot of the series, oldest first.
    pub fn bars(&self) -> Vec<Candle> {
        self.candles.iter().copied().collect()
    }

    fn trim(&mut self) {
        while self.candles.len() > self.max_candles {
            self.candles.pop_front();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_series(t0: i64) -> CandleSeries {
        let mut series = CandleSeries::new("1m", 500);
        series.seed(vec![
            Candle::opened_at(t0 - 60, 99.0),
            Candle {
                time: t0,
                open: 100.0,
                high: 101.0,
                low: 99.5,
                close: 100.5,
            },
        ]);
        series
    }

    #[test]
    fn timeframe_token_mapping() {
        assert_eq!(interval_seconds("1m"), 60);
        assert_eq!(interval_seconds("5m"), 300);
        assert_eq!(interval_seconds("4h"), 14_400);
        assert_eq!(interval_seconds("1d"), 86_400);
        assert_eq!(interval_seconds("7x"), 60);
        assert_eq!(interval_seconds(""), 60);
        assert_eq!(interval_seconds("m"), 60);
    }

    #[test]
    fn tick_within_interval_mutates_live_candle() {
        let t0 = 1_700_000_040; // 60-aligned
        let mut series = seeded_series(t0);

        series.ingest(102.0, t0 + 10);
        let last = *series.last().unwrap();
        assert_eq!(last.time, t0);
        assert_eq!(last.close, 102.0);
        assert_eq!(last.high, 102.0);
        assert_eq!(last.low, 99.5);
        assert_eq!(series.len(), 2);

        series.ingest(99.0, t0 + 30);
        let last = *series.last().unwrap();
        assert_eq!(last.close, 99.0);
        assert_eq!(last.high, 102.0);
        assert_eq!(last.low, 99.0);
    }

    #[test]
    fn tick_past_boundary_opens_new_candle() {
        let t0 = 1_700_000_040;
        let mut series = seeded_series(t0);

        series.ingest(103.0, t0 + 65);
        let last = *series.last().unwrap();
        assert_eq!(last.time, t0 + 60);
        assert_eq!(last.open, 103.0);
        assert_eq!(last.high, 103.0);
        assert_eq!(last.low, 103.0);
        assert_eq!(last.close, 103.0);
        assert_eq!(series.len(), 3);
    }

    #[test]
    fn feed_gap_opens_single_candle_at_current_boundary() {
        let t0 = 1_700_000_040;
        let mut series = seeded_series(t0);

        // Five empty intervals pass; only one bar opens, at the current
        // boundary, with no backfill.
        series.ingest(110.0, t0 + 5 * 60 + 12);
        assert_eq!(series.len(), 3);
        assert_eq!(series.last().unwrap().time, t0 + 5 * 60);
    }

    #[test]
    fn ingest_on_empty_series_opens_aligned_candle() {
        let mut series = CandleSeries::new("1m", 500);
        series.ingest(50.0, 1_700_000_095);
        let last = *series.last().unwrap();
        assert_eq!(last.time, 1_700_000_040);
        assert_eq!(last.open, 50.0);
    }

    #[test]
    fn seed_replaces_series_wholesale() {
        let mut series = seeded_series(1_700_000_040);
        series.seed(vec![Candle::opened_at(600, 1.0)]);
        assert_eq!(series.len(), 1);
        assert_eq!(series.last().unwrap().time, 600);
    }

    #[test]
    fn series_is_trimmed_to_cap() {
        let mut series = CandleSeries::new("1m", 3);
        for i in 0..6 {
            series.ingest(100.0 + i as f64, i * 60);
        }
        assert_eq!(series.len(), 3);
        let bars = series.bars();
        assert_eq!(bars[0].time, 180);
        assert_eq!(bars[2].time, 300);
    }

    #[test]
    fn set_timeframe_changes_interval_and_clears() {
        let mut series = seeded_series(1_700_000_040);
        series.set_timeframe("4h");
        assert_eq!(series.interval(), 14_400);
        assert!(series.is_empty());
    }
}
