// =============================================================================
// Binance REST API Client — public market data only
// =============================================================================
//
// The simulator never touches private endpoints; the only call is the public
// klines fetch used to seed the chart when the symbol or timeframe changes.
// =============================================================================

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::market_data::Candle;

/// Binance REST client for public market data.
#[derive(Clone)]
pub struct BinanceClient {
    base_url: String,
    client: reqwest::Client,
}

impl BinanceClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!("BinanceClient initialised (base_url=https://api.binance.com)");

        Self {
            base_url: "https://api.binance.com".to_string(),
            client,
        }
    }

    /// GET /api/v3/klines (public — no signature required).
    ///
    /// Returns candles parsed from Binance's array-of-arrays response format.
    /// Only the first five fields are consumed:
    ///   [0] openTime (ms), [1] open, [2] high, [3] low, [4] close
    #[instrument(skip(self), name = "binance::get_klines")]
    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Candle>> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/klines request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse klines response")?;

        if !status.is_success() {
            anyhow::bail!("Binance GET /api/v3/klines returned {}: {}", status, body);
        }

        let candles = parse_kline_rows(&body)?;
        debug!(symbol, interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }
}

impl Default for BinanceClient {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Parse the klines response body into candles, skipping malformed entries.
/// Open times arrive in milliseconds and are stored as epoch seconds.
fn parse_kline_rows(body: &serde_json::Value) -> Result<Vec<Candle>> {
    let raw = body.as_array().context("klines response is not an array")?;

    let mut candles = Vec::with_capacity(raw.len());

    for entry in raw {
        let arr = match entry.as_array() {
            Some(arr) if arr.len() >= 5 => arr,
            _ => {
                warn!("skipping malformed kline entry");
                continue;
            }
        };

        let open_time_ms = match arr[0].as_i64() {
            Some(t) => t,
            None => {
                warn!("skipping kline entry with non-numeric open time");
                continue;
            }
        };

        let open = parse_str_f64(&arr[1])?;
        let high = parse_str_f64(&arr[2])?;
        let low = parse_str_f64(&arr[3])?;
        let close = parse_str_f64(&arr[4])?;

        candles.push(Candle {
            time: open_time_ms / 1000,
            open,
            high,
            low,
            close,
        });
    }

    Ok(candles)
}

/// Parse a JSON value that may be either a string or a number into `f64`.
fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_kline_rows_consumes_first_five_fields() {
        let body: serde_json::Value = serde_json::from_str(
            r#"[
                [1700000000000, "37000.0", "37100.0", "36900.0", "37050.0",
                 "123.4", 1700000059999, "4567890.1", 1500, "60.1", "2224455.6", "0"],
                [1700000060000, "37050.0", "37060.0", "37000.0", "37020.0",
                 "98.7", 1700000119999, "3456789.0", 1200, "40.2", "1489000.3", "0"]
            ]"#,
        )
        .unwrap();

        let candles = parse_kline_rows(&body).expect("should parse");
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].time, 1_700_000_000);
        assert!((candles[0].open - 37000.0).abs() < f64::EPSILON);
        assert!((candles[0].high - 37100.0).abs() < f64::EPSILON);
        assert!((candles[0].low - 36900.0).abs() < f64::EPSILON);
        assert!((candles[0].close - 37050.0).abs() < f64::EPSILON);
        assert_eq!(candles[1].time, 1_700_000_060);
    }

    #[test]
    fn parse_kline_rows_skips_short_entries() {
        let body: serde_json::Value = serde_json::from_str(
            r#"[
                [1700000000000, "1.0"],
                [1700000060000, "2.0", "2.1", "1.9", "2.05"]
            ]"#,
        )
        .unwrap();

        let candles = parse_kline_rows(&body).expect("should parse");
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].time, 1_700_000_060);
    }

    #[test]
    fn parse_kline_rows_rejects_non_array_body() {
        let body: serde_json::Value =
            serde_json::from_str(r#"{ "code": -1121, "msg": "Invalid symbol." }"#).unwrap();
        assert!(parse_kline_rows(&body).is_err());
    }

    #[test]
    fn numeric_fields_may_be_strings_or_numbers() {
        let body: serde_json::Value = serde_json::from_str(
            r#"[[1700000000000, 37000.0, "37100.0", 36900.0, "37050.0"]]"#,
        )
        .unwrap();

        let candles = parse_kline_rows(&body).expect("should parse");
        assert!((candles[0].open - 37000.0).abs() < f64::EPSILON);
        assert!((candles[0].close - 37050.0).abs() < f64::EPSILON);
    }
}
