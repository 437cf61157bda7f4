// =============================================================================
// Signal model — TradingView webhook payloads and the strategy lexicon
// =============================================================================
//
// Upstream strategies are inconsistent about how they phrase a direction:
// Chinese labels (開多/平空), English words (LONG/CLOSE), signed integers
// ("+1"/"-1"/"0"), or any of those embedded in a free-text `message` field.
// Everything funnels through `parse_action` into a small canonical set; the
// pipeline resolves `Close` against live positions since a bare "CLOSE"
// doesn't say which side it closes.
// =============================================================================

use serde_json::Value;

use crate::error::CoreError;
use crate::types::Market;

/// Entry/exit classification from the webhook `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Entry,
    Exit,
}

/// Action as phrased by the strategy, before position-aware resolution.
/// `Close` means "close whatever is held".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawAction {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
    Close,
}

impl RawAction {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::OpenLong | Self::OpenShort)
    }

    fn kind(&self) -> SignalKind {
        if self.is_open() {
            SignalKind::Entry
        } else {
            SignalKind::Exit
        }
    }
}

/// Per-family TX quantities from the webhook body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxQuantities {
    pub txf: i64,
    pub mxf: i64,
    pub tmf: i64,
}

impl TxQuantities {
    pub fn is_empty(&self) -> bool {
        self.txf == 0 && self.mxf == 0 && self.tmf == 0
    }
}

/// A parsed, not-yet-validated strategy signal.
#[derive(Debug, Clone)]
pub struct Signal {
    pub market: Market,
    pub trade_id: String,
    pub kind: SignalKind,
    pub action: RawAction,
    pub tx_quantities: TxQuantities,
    /// BTC symbol; TX signals carry none.
    pub symbol: Option<String>,
    /// Explicit BTC quantity override. Absent means risk-sized.
    pub quantity: Option<f64>,
    /// Price hint from the strategy; may be zero.
    pub price: f64,
    pub time: Option<String>,
}

// =============================================================================
// Lexicon
// =============================================================================

/// Normalize a strategy action to a `RawAction`. Tries an exact (trimmed,
/// uppercased) match first, then substring search for lexicon tokens inside
/// free text. Returns `None` for unknown input.
pub fn parse_action(raw: &str) -> Option<RawAction> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let upper = trimmed.to_uppercase();
    let exact = match upper.as_str() {
        "開多" | "LONG" | "BUY" | "OPEN_LONG" | "+1" | "1" => Some(RawAction::OpenLong),
        "開空" | "SHORT" | "SELL" | "OPEN_SHORT" | "-1" => Some(RawAction::OpenShort),
        "平多" | "CLOSE_LONG" => Some(RawAction::CloseLong),
        "平空" | "CLOSE_SHORT" => Some(RawAction::CloseShort),
        "平倉" | "CLOSE" | "EXIT" | "FLAT" | "0" => Some(RawAction::Close),
        _ => None,
    };
    if exact.is_some() {
        return exact;
    }

    // Free-text scan. Closing tokens are checked before opening ones so that
    // "平多" inside a sentence never reads as "多".
    for (token, action) in [
        ("平多", RawAction::CloseLong),
        ("平空", RawAction::CloseShort),
        ("平倉", RawAction::Close),
        ("開多", RawAction::OpenLong),
        ("開空", RawAction::OpenShort),
        ("CLOSE", RawAction::Close),
        ("EXIT", RawAction::Close),
        ("LONG", RawAction::OpenLong),
        ("SHORT", RawAction::OpenShort),
    ] {
        if upper.contains(token) {
            return Some(action);
        }
    }
    None
}

// =============================================================================
// Webhook body parsing
// =============================================================================

/// A BTC-style body carries `symbol` or an `action`/`message` field; TX
/// bodies use `direction` plus per-family quantities.
pub fn looks_like_btc(body: &Value) -> bool {
    body.get("symbol").is_some()
        || body.get("action").is_some()
        || (body.get("message").is_some() && body.get("direction").is_none())
}

/// String-or-number field, as TradingView templates emit both.
fn field_string(body: &Value, key: &str) -> Option<String> {
    match body.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn field_i64(body: &Value, key: &str) -> i64 {
    match body.get(key) {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn field_f64(body: &Value, key: &str) -> Option<f64> {
    match body.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

impl Signal {
    /// Parse a TX webhook body:
    /// `{tradeId, type, direction, txf, mxf, tmf, price, time}`.
    pub fn from_tx_json(body: &Value) -> Result<Self, CoreError> {
        let direction_raw = field_string(body, "direction")
            .or_else(|| field_string(body, "message"))
            .ok_or_else(|| CoreError::UnrecognizedAction("<missing direction>".into()))?;
        let action = parse_action(&direction_raw)
            .ok_or_else(|| CoreError::UnrecognizedAction(direction_raw.clone()))?;

        let kind = match field_string(body, "type").as_deref() {
            Some("entry") => SignalKind::Entry,
            Some("exit") => SignalKind::Exit,
            _ => action.kind(),
        };

        let trade_id = field_string(body, "tradeId")
            .or_else(|| field_string(body, "trade_id"))
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Ok(Self {
            market: Market::Tx,
            trade_id,
            kind,
            action,
            tx_quantities: TxQuantities {
                txf: field_i64(body, "txf"),
                mxf: field_i64(body, "mxf"),
                tmf: field_i64(body, "tmf"),
            },
            symbol: None,
            quantity: None,
            price: field_f64(body, "price").unwrap_or(0.0),
            time: field_string(body, "time"),
        })
    }

    /// Parse a BTC webhook body:
    /// `{action | message, symbol, price, quantity?}`.
    pub fn from_btc_json(body: &Value) -> Result<Self, CoreError> {
        let action_raw = field_string(body, "action")
            .or_else(|| field_string(body, "message"))
            .or_else(|| field_string(body, "direction"))
            .ok_or_else(|| CoreError::UnrecognizedAction("<missing action>".into()))?;
        let action = parse_action(&action_raw)
            .ok_or_else(|| CoreError::UnrecognizedAction(action_raw.clone()))?;

        let trade_id = field_string(body, "tradeId")
            .or_else(|| field_string(body, "trade_id"))
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Ok(Self {
            market: Market::Btc,
            trade_id,
            kind: action.kind(),
            action,
            tx_quantities: TxQuantities::default(),
            symbol: field_string(body, "symbol").map(|s| s.to_uppercase()),
            quantity: field_f64(body, "quantity").filter(|q| *q > 0.0),
            price: field_f64(body, "price").unwrap_or(0.0),
            time: field_string(body, "time"),
        })
    }

    /// The dedup key: trade id + direction + a contract-family hint.
    pub fn dedup_key(&self) -> String {
        let family_hint = match self.market {
            Market::Tx => format!(
                "{}:{}:{}",
                self.tx_quantities.txf, self.tx_quantities.mxf, self.tx_quantities.tmf
            ),
            Market::Btc => self.symbol.clone().unwrap_or_default(),
        };
        format!("{}|{:?}|{}", self.trade_id, self.action, family_hint)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lexicon_exact_matches() {
        assert_eq!(parse_action("開多"), Some(RawAction::OpenLong));
        assert_eq!(parse_action("開空"), Some(RawAction::OpenShort));
        assert_eq!(parse_action("平多"), Some(RawAction::CloseLong));
        assert_eq!(parse_action("平空"), Some(RawAction::CloseShort));
        assert_eq!(parse_action("LONG"), Some(RawAction::OpenLong));
        assert_eq!(parse_action("short"), Some(RawAction::OpenShort));
        assert_eq!(parse_action("CLOSE"), Some(RawAction::Close));
        assert_eq!(parse_action("+1"), Some(RawAction::OpenLong));
        assert_eq!(parse_action("-1"), Some(RawAction::OpenShort));
        assert_eq!(parse_action("0"), Some(RawAction::Close));
    }

    #[test]
    fn lexicon_free_text_and_unknown() {
        assert_eq!(
            parse_action("strategy says: 平多 now"),
            Some(RawAction::CloseLong)
        );
        assert_eq!(
            parse_action("go LONG on breakout"),
            Some(RawAction::OpenLong)
        );
        // Close tokens win over their substrings.
        assert_eq!(parse_action("close long leg"), Some(RawAction::Close));
        assert_eq!(parse_action("do nothing"), None);
        assert_eq!(parse_action(""), None);
    }

    #[test]
    fn tx_body_parses() {
        let body = json!({
            "tradeId": "t1",
            "type": "entry",
            "direction": "開多",
            "txf": 1, "mxf": 0, "tmf": "2",
            "price": 22000,
            "time": "2025-07-01T09:00:00"
        });
        let s = Signal::from_tx_json(&body).unwrap();
        assert_eq!(s.market, Market::Tx);
        assert_eq!(s.trade_id, "t1");
        assert_eq!(s.kind, SignalKind::Entry);
        assert_eq!(s.action, RawAction::OpenLong);
        assert_eq!(s.tx_quantities, TxQuantities { txf: 1, mxf: 0, tmf: 2 });
        assert_eq!(s.price, 22000.0);
    }

    #[test]
    fn tx_body_unknown_direction_fails() {
        let body = json!({"tradeId": "t2", "direction": "sideways"});
        assert!(matches!(
            Signal::from_tx_json(&body),
            Err(CoreError::UnrecognizedAction(_))
        ));
    }

    #[test]
    fn btc_body_parses_with_action_variants() {
        let body = json!({"action": "LONG", "symbol": "btcusdt"});
        let s = Signal::from_btc_json(&body).unwrap();
        assert_eq!(s.market, Market::Btc);
        assert_eq!(s.action, RawAction::OpenLong);
        assert_eq!(s.symbol.as_deref(), Some("BTCUSDT"));
        assert!(s.quantity.is_none());

        let body = json!({"message": "訊號: 平倉", "symbol": "BTCUSDT", "quantity": 0.01});
        let s = Signal::from_btc_json(&body).unwrap();
        assert_eq!(s.action, RawAction::Close);
        assert_eq!(s.quantity, Some(0.01));
    }

    #[test]
    fn auto_detection() {
        assert!(looks_like_btc(&json!({"action": "LONG", "symbol": "BTCUSDT"})));
        assert!(looks_like_btc(&json!({"symbol": "ETHUSDT"})));
        assert!(!looks_like_btc(&json!({"direction": "開多", "txf": 1})));
    }

    #[test]
    fn dedup_key_separates_directions() {
        let a = Signal::from_tx_json(&json!({"tradeId": "t", "direction": "開多", "txf": 1})).unwrap();
        let b = Signal::from_tx_json(&json!({"tradeId": "t", "direction": "平多", "txf": 1})).unwrap();
        assert_ne!(a.dedup_key(), b.dedup_key());
        let a2 = Signal::from_tx_json(&json!({"tradeId": "t", "direction": "開多", "txf": 1})).unwrap();
        assert_eq!(a.dedup_key(), a2.dedup_key());
    }
}
