// =============================================================================
// BTC streams — user-data WebSocket and mark-price ticker
// =============================================================================
//
// The user-data stream dispatches `ORDER_TRADE_UPDATE` frames into the
// lifecycle queue. The listen key is kept alive every 30 minutes from inside
// the read loop; a `listenKeyExpired` frame ends the run so the caller can
// re-login and reconnect.
//
// The ticker stream publishes the mark price to a watch channel; position
// refreshers and risk sizing read the latest value without touching REST.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::brokers::btc::BtcClient;
use crate::brokers::{EventQueue, OrderEvent, OrderEventKind};
use crate::types::Market;

const STREAM_BASE: &str = "wss://fstream.binance.com/ws";
/// Listen-key keepalive period (Binance expires keys after 60 minutes).
const KEEPALIVE_SECS: u64 = 30 * 60;

// =============================================================================
// User-data stream
// =============================================================================

/// Connect the user-data WebSocket and feed order events into `queue`.
/// Returns when the stream drops or the listen key expires; the caller owns
/// reconnection.
pub async fn run_user_stream(client: Arc<BtcClient>, queue: Arc<EventQueue>) -> Result<()> {
    let listen_key = match client.listen_key() {
        Some(key) => key,
        None => client
            .create_listen_key()
            .await
            .context("failed to create listen key")?,
    };

    let url = format!("{STREAM_BASE}/{listen_key}");
    info!("connecting to BTC user-data stream");

    let (ws_stream, _response) = tokio_tungstenite::connect_async(&url)
        .await
        .context("failed to connect to user-data WebSocket")?;
    info!("BTC user-data stream connected");

    let (_write, mut read) = ws_stream.split();
    let mut keepalive = tokio::time::interval(std::time::Duration::from_secs(KEEPALIVE_SECS));
    keepalive.tick().await; // first tick completes immediately

    loop {
        tokio::select! {
            _ = keepalive.tick() => {
                if let Err(e) = client.keepalive_listen_key().await {
                    warn!(error = %e, "listen key keepalive failed");
                }
            }
            frame = read.next() => match frame {
                Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                    match parse_user_frame(&text) {
                        Ok(UserFrame::Order(event)) => queue.push(event),
                        Ok(UserFrame::ListenKeyExpired) => {
                            warn!("listen key expired — reconnecting user stream");
                            return Ok(());
                        }
                        Ok(UserFrame::Other) => {}
                        Err(e) => warn!(error = %e, "failed to parse user-data frame"),
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "user-data stream read error");
                    return Err(e.into());
                }
                None => {
                    warn!("user-data stream ended");
                    return Ok(());
                }
            }
        }
    }
}

enum UserFrame {
    Order(OrderEvent),
    ListenKeyExpired,
    Other,
}

/// Map an `ORDER_TRADE_UPDATE` frame onto the lifecycle model.
///
/// Expected shape:
/// ```json
/// { "e": "ORDER_TRADE_UPDATE",
///   "o": { "i": 123, "X": "FILLED", "ap": "37000.0", "z": "0.010",
///          "l": "0.005", "L": "37001.0" } }
/// ```
fn parse_user_frame(text: &str) -> Result<UserFrame> {
    let root: Value = serde_json::from_str(text).context("failed to parse user-data JSON")?;

    match root.get("e").and_then(Value::as_str) {
        Some("listenKeyExpired") => return Ok(UserFrame::ListenKeyExpired),
        Some("ORDER_TRADE_UPDATE") => {}
        _ => return Ok(UserFrame::Other),
    }

    let order = root.get("o").context("ORDER_TRADE_UPDATE missing 'o'")?;
    let order_id = order
        .get("i")
        .and_then(Value::as_i64)
        .context("missing order id 'i'")?
        .to_string();

    let str_f64 = |key: &str| -> f64 {
        order
            .get(key)
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0)
    };

    let kind = match order.get("X").and_then(Value::as_str) {
        Some("NEW") => OrderEventKind::Submitted,
        Some("PARTIALLY_FILLED") => OrderEventKind::PartialFill {
            price: str_f64("L"),
            quantity: str_f64("l"),
        },
        Some("FILLED") => OrderEventKind::Filled {
            price: str_f64("ap"),
            quantity: str_f64("z"),
        },
        Some("CANCELED") => OrderEventKind::Cancelled {
            reason_code: String::new(),
        },
        Some("REJECTED") => OrderEventKind::Rejected {
            reason_code: String::new(),
        },
        Some("EXPIRED") | Some("EXPIRED_IN_MATCH") => OrderEventKind::Expired,
        other => {
            debug!(status = ?other, "ignoring order update status");
            return Ok(UserFrame::Other);
        }
    };

    Ok(UserFrame::Order(OrderEvent {
        market: Market::Btc,
        order_id,
        kind,
        raw: root,
    }))
}

// =============================================================================
// Mark-price ticker
// =============================================================================

/// Connect the mark-price stream for `symbol` and publish into `price_tx`.
/// Returns on disconnect; the caller reconnects.
pub async fn run_mark_price_stream(symbol: &str, price_tx: &watch::Sender<f64>) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("{STREAM_BASE}/{lower}@markPrice@1s");
    info!(symbol = %symbol, "connecting to mark-price stream");

    let (ws_stream, _response) = tokio_tungstenite::connect_async(&url)
        .await
        .context("failed to connect to mark-price WebSocket")?;
    info!(symbol = %symbol, "mark-price stream connected");

    let (_write, mut read) = ws_stream.split();
    loop {
        match read.next().await {
            Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                match parse_mark_price(&text) {
                    Ok(Some(price)) => {
                        let _ = price_tx.send(price);
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "failed to parse mark-price frame"),
                }
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(symbol = %symbol, error = %e, "mark-price stream read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol = %symbol, "mark-price stream ended");
                return Ok(());
            }
        }
    }
}

fn parse_mark_price(text: &str) -> Result<Option<f64>> {
    let root: Value = serde_json::from_str(text).context("failed to parse mark-price JSON")?;
    if root.get("e").and_then(Value::as_str) != Some("markPriceUpdate") {
        return Ok(None);
    }
    let price = root
        .get("p")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok());
    Ok(price)
}
