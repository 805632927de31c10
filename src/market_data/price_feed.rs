// =============================================================================
// Price Feed Adapter — multiplexed trade-tick subscription
// =============================================================================
//
// One combined-stream connection covers the union of the watchlist and the
// active chart symbol. A changed symbol set triggers a full resubscription
// (drop the socket, reconnect with the new union), not an incremental join.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

use crate::market_data::price_buffer::PriceBuffer;
use crate::types::FeedStatus;

const STREAM_ENDPOINT: &str = "wss://stream.binance.com:9443/stream";

/// Reconnect backoff bounds: 1 s doubling to a 30 s cap, reset after any
/// successful connect.
const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Why a single feed connection stopped.
enum FeedExit {
    /// The symbol set changed; reconnect immediately with the new union.
    Resubscribe,
    /// The socket ended or errored after a successful connect.
    Ended,
    /// The symbol-set channel closed; the engine is shutting down.
    Shutdown,
}

/// Build the combined-stream URL for a symbol set.
pub fn stream_url(symbols: &[String]) -> String {
    let streams: Vec<String> = symbols
        .iter()
        .map(|s| format!("{}@trade", s.to_lowercase()))
        .collect();
    format!("{STREAM_ENDPOINT}?streams={}", streams.join("/"))
}

/// Parse a trade message into `(symbol, price)`.
///
/// Expected shape (combined-stream envelope; a direct payload without the
/// `data` wrapper is also accepted):
/// ```json
/// { "stream": "btcusdt@trade", "data": { "s": "BTCUSDT", "p": "37000.00" } }
/// ```
fn parse_trade(text: &str) -> Result<(String, f64)> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse trade JSON")?;

    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    let symbol = data["s"]
        .as_str()
        .context("missing field s")?
        .to_uppercase();

    let price: f64 = data["p"]
        .as_str()
        .context("missing field p")?
        .parse()
        .context("failed to parse price")?;

    Ok((symbol, price))
}

/// Run one feed connection until it ends, errors, or the symbol set changes.
///
/// Every accepted tick is written straight into `buffer`; malformed or
/// non-trade messages are dropped without surfacing an error.
async fn run_price_feed(
    symbols: &[String],
    buffer: &Arc<PriceBuffer>,
    status: &Arc<RwLock<FeedStatus>>,
    resub: &mut watch::Receiver<Vec<String>>,
) -> Result<FeedExit> {
    let url = stream_url(symbols);
    info!(url = %url, count = symbols.len(), "connecting to trade stream");

    let (ws_stream, _response) = connect_async(url.as_str())
        .await
        .context("failed to connect to trade stream")?;

    info!(count = symbols.len(), "trade stream connected");
    *status.write() = FeedStatus::Connected;

    let (_write, mut read) = ws_stream.split();

    let exit = loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(msg)) => {
                    if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                        match parse_trade(&text) {
                            Ok((symbol, price)) => buffer.record(&symbol, price),
                            Err(e) => debug!(error = %e, "dropping unparseable feed message"),
                        }
                    }
                    // Ping / Pong / Binary / Close frames are ignored —
                    // tungstenite handles pong replies itself.
                }
                Some(Err(e)) => {
                    warn!(error = %e, "trade stream read error");
                    break FeedExit::Ended;
                }
                None => {
                    warn!("trade stream ended");
                    break FeedExit::Ended;
                }
            },
            changed = resub.changed() => match changed {
                Ok(()) => {
                    info!("symbol set changed — resubscribing");
                    break FeedExit::Resubscribe;
                }
                Err(_) => break FeedExit::Shutdown,
            },
        }
    };

    *status.write() = FeedStatus::Disconnected;
    Ok(exit)
}

/// Supervise the feed connection for the lifetime of the engine.
///
/// Reconnects with truncated exponential backoff after failures, immediately
/// after a resubscription request, and returns when the symbol-set channel
/// closes.
pub async fn run_feed_supervisor(
    buffer: Arc<PriceBuffer>,
    status: Arc<RwLock<FeedStatus>>,
    mut resub: watch::Receiver<Vec<String>>,
) {
    let mut backoff = BACKOFF_START;

    loop {
        let symbols = resub.borrow_and_update().clone();

        if symbols.is_empty() {
            if resub.changed().await.is_err() {
                break;
            }
            continue;
        }

        match run_price_feed(&symbols, &buffer, &status, &mut resub).await {
            Ok(FeedExit::Resubscribe) => {
                backoff = BACKOFF_START;
            }
            Ok(FeedExit::Ended) => {
                backoff = BACKOFF_START;
                warn!(delay_s = backoff.as_secs(), "trade stream closed — reconnecting");
                tokio::time::sleep(backoff).await;
            }
            Ok(FeedExit::Shutdown) => break,
            Err(e) => {
                warn!(error = %e, delay_s = backoff.as_secs(), "trade stream connect failed — retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BACKOFF_CAP);
            }
        }
    }

    *status.write() = FeedStatus::Disconnected;
    info!("feed supervisor stopped");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_contains_every_stream() {
        let url = stream_url(&["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
        assert!(url.starts_with("wss://stream.binance.com:9443/stream?streams="));
        assert!(url.contains("btcusdt@trade"));
        assert!(url.contains("ethusdt@trade"));
    }

    #[test]
    fn parse_combined_stream_trade() {
        let json = r#"{
            "stream": "btcusdt@trade",
            "data": { "e": "trade", "s": "BTCUSDT", "p": "37000.50", "q": "0.01" }
        }"#;
        let (symbol, price) = parse_trade(json).expect("should parse");
        assert_eq!(symbol, "BTCUSDT");
        assert!((price - 37000.50).abs() < f64::EPSILON);
    }

    #[test]
    fn parse_direct_payload_trade() {
        let json = r#"{ "e": "trade", "s": "ethusdt", "p": "2000.25" }"#;
        let (symbol, price) = parse_trade(json).expect("should parse");
        assert_eq!(symbol, "ETHUSDT");
        assert!((price - 2000.25).abs() < f64::EPSILON);
    }

    #[test]
    fn subscription_ack_is_dropped() {
        // Binance answers stream management requests with this shape; it has
        // no trade fields and must be rejected, not crash.
        assert!(parse_trade(r#"{ "result": null, "id": 1 }"#).is_err());
    }

    #[test]
    fn malformed_messages_are_rejected() {
        assert!(parse_trade("not json").is_err());
        assert!(parse_trade(r#"{ "data": { "s": "BTCUSDT" } }"#).is_err());
        assert!(parse_trade(r#"{ "data": { "s": "BTCUSDT", "p": "abc" } }"#).is_err());
        assert!(parse_trade(r#"{ "data": { "p": "100.0" } }"#).is_err());
    }
}
