// =============================================================================
// Signal Pipeline — webhook intake to order submission
// =============================================================================
//
// Steps per signal: dedupe → calendar gate (TX; crypto trades around the
// clock) → direction resolution against live positions → rollover-aware
// contract selection → open/close preconditions → order construction
// (webhook orders are forced to market + IOC) → submission → registry
// insert + journal write + delayed submit notification.
//
// Open signals never auto-close an opposite position; they are rejected.
// Close signals require a matching same-side position and sell/buy the
// inverse of the held direction.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::app_state::Core;
use crate::brokers::btc::{floor_to_lot, MIN_LOT};
use crate::brokers::tx::TxOrderRequest;
use crate::brokers::{with_backoff, BrokerAdapter, Position};
use crate::error::{CoreError, CoreResult};
use crate::journal::{EntryKind, JournalEntry, ResolvedMeta};
use crate::notifier::Notifier;
use crate::registry::OrderMeta;
use crate::rollover::RolloverTransition;
use crate::signal::{RawAction, Signal};
use crate::types::{
    Contract, ContractFamily, Direction, Market, OcType, PriceType, Side, TimePolicy,
};

/// Deduplication window length.
const DEDUP_TTL: Duration = Duration::from_secs(30);
/// Submit notifications trail placement by this long so a fill notice from a
/// prior order is never overtaken.
pub(crate) const SUBMIT_NOTIFY_DELAY: Duration = Duration::from_secs(2);

// =============================================================================
// Deduplication
// =============================================================================

/// Sliding-window duplicate detector keyed by
/// `{trade_id, direction, family-hint}`.
pub struct DedupWindow {
    ttl: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self {
            ttl: DEDUP_TTL,
            seen: Mutex::new(HashMap::new()),
        }
    }
}

impl DedupWindow {
    #[cfg(test)]
    fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Record `key` if unseen within the window. Returns `false` for a
    /// duplicate. Expired keys are evicted on each call.
    pub fn check_and_record(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock();
        seen.retain(|_, t| now.duration_since(*t) < self.ttl);

        if seen.contains_key(key) {
            false
        } else {
            seen.insert(key.to_string(), now);
            true
        }
    }
}

// =============================================================================
// Direction resolution & sizing (pure helpers)
// =============================================================================

/// Resolve a strategy action against the held position side, applying the
/// open/close preconditions.
pub fn resolve_direction(action: RawAction, held: Option<Side>) -> CoreResult<Direction> {
    match action {
        RawAction::OpenLong => match held {
            Some(Side::Sell) => Err(CoreError::OppositePositionExists),
            _ => Ok(Direction::OpenLong),
        },
        RawAction::OpenShort => match held {
            Some(Side::Buy) => Err(CoreError::OppositePositionExists),
            _ => Ok(Direction::OpenShort),
        },
        RawAction::CloseLong => match held {
            Some(Side::Buy) => Ok(Direction::CloseLong),
            _ => Err(CoreError::NoPosition),
        },
        RawAction::CloseShort => match held {
            Some(Side::Sell) => Ok(Direction::CloseShort),
            _ => Err(CoreError::NoPosition),
        },
        RawAction::Close => match held {
            Some(Side::Buy) => Ok(Direction::CloseLong),
            Some(Side::Sell) => Ok(Direction::CloseShort),
            None => Err(CoreError::NoPosition),
        },
    }
}

/// Risk-sized BTC quantity: `available × risk × leverage / mark`, floored to
/// the minimum lot.
pub fn btc_order_quantity(available: f64, risk_fraction: f64, leverage: u32, mark: f64) -> f64 {
    if mark <= 0.0 {
        return MIN_LOT;
    }
    floor_to_lot(available * risk_fraction * leverage as f64 / mark)
}

// =============================================================================
// Notifications
// =============================================================================

/// Canonical identifier block used by submit, fill, and failure notices.
pub(crate) fn order_notice(
    title: &str,
    instrument: &str,
    direction: Direction,
    quantity: f64,
    price_desc: &str,
    is_manual: bool,
    reason: Option<&str>,
) -> String {
    let mut text = format!(
        "<b>{title}</b>\n商品: {instrument}\n類別: {}\n方向: {}\n數量: {quantity}\n價格: {price_desc}",
        if is_manual { "手動" } else { "自動" },
        direction.label(),
    );
    if let Some(reason) = reason {
        text.push_str(&format!("\n原因: {reason}"));
    }
    text
}

/// Fire-and-forget delayed send; ordering between submit (2 s) and fill
/// (5 s) notices rides on these delays.
pub(crate) fn notify_later(
    notifier: Arc<Notifier>,
    category: &'static str,
    text: String,
    delay: Duration,
) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        notifier.send_text(category, &text).await;
    });
}

// =============================================================================
// Entry point
// =============================================================================

/// Process one parsed signal. The returned string becomes the webhook
/// response message; duplicates are accepted-and-ignored.
pub async fn handle_signal(core: &Arc<Core>, signal: Signal) -> CoreResult<String> {
    if !core.dedup.check_and_record(&signal.dedup_key()) {
        info!(trade_id = %signal.trade_id, "duplicate signal ignored");
        return Ok("duplicate signal ignored".to_string());
    }

    match signal.market {
        Market::Tx => handle_tx_signal(core, signal).await,
        Market::Btc => handle_btc_signal(core, signal).await,
    }
}

// =============================================================================
// TX path
// =============================================================================

async fn handle_tx_signal(core: &Arc<Core>, signal: Signal) -> CoreResult<String> {
    let now = Local::now().naive_local();

    // Calendar gate.
    if !core.calendar.is_market_open_at(now) {
        warn!(trade_id = %signal.trade_id, "TX signal outside trading hours");
        let err = CoreError::OutsideTradingHours;
        core.tx_notifier
            .send_text(
                "submit-fail",
                &format!("<b>⚠️ 訊號已拒絕</b>\n原因: {}", err.operator_text()),
            )
            .await;
        return Err(err);
    }

    // Rollover is recomputed on every selection query.
    let contracts = core.contracts_snapshot();
    match core.rollover.evaluate(now, &contracts) {
        RolloverTransition::Entered => {
            core.tx_notifier
                .send_text("rollover", "<b>🔄 換倉開始</b>\n新倉單將指向次月合約")
                .await;
        }
        RolloverTransition::Exited { refresh_contracts } => {
            if refresh_contracts {
                if let Err(e) = core.refresh_tx_contracts().await {
                    warn!(error = %e, "contract refresh after rollover failed");
                }
            }
        }
        RolloverTransition::None => {}
    }
    let contracts = core.contracts_snapshot();

    let positions = with_backoff("tx.list_positions", || core.tx_client.list_positions()).await?;

    let requested: Vec<(ContractFamily, i64)> = [
        (ContractFamily::Txf, signal.tx_quantities.txf),
        (ContractFamily::Mxf, signal.tx_quantities.mxf),
        (ContractFamily::Tmf, signal.tx_quantities.tmf),
    ]
    .into_iter()
    .filter(|(_, qty)| *qty > 0)
    .collect();

    if requested.is_empty() {
        return Err(CoreError::UnrecognizedAction("no contract quantity".into()));
    }

    let mut placed = 0usize;
    let mut last_err = None;

    for (family, quantity) in requested {
        match place_tx_family_order(core, &signal, family, quantity, &contracts, &positions).await {
            Ok(_) => placed += 1,
            Err(e) => {
                warn!(family = %family, error = %e, "TX family order rejected");
                last_err = Some(e);
            }
        }
    }

    if placed > 0 {
        Ok("processed".to_string())
    } else {
        Err(last_err.unwrap_or(CoreError::NoPosition))
    }
}

/// Place one family's order: resolve direction, apply preconditions, select
/// the contract under rollover, submit, record, notify.
async fn place_tx_family_order(
    core: &Arc<Core>,
    signal: &Signal,
    family: ContractFamily,
    quantity: i64,
    contracts: &HashMap<ContractFamily, Vec<Contract>>,
    positions: &[Position],
) -> CoreResult<()> {
    let held = positions
        .iter()
        .find(|p| p.family == Some(family) && p.quantity > 0.0);

    let direction = resolve_direction(signal.action, held.map(|p| p.direction));

    let list = contracts.get(&family).map(Vec::as_slice).unwrap_or(&[]);
    let contract = match &direction {
        // Covers must target the contract actually held, not the rollover
        // selection.
        Ok(d) if !d.is_open() => held
            .and_then(|p| list.iter().find(|c| c.code == p.code).cloned())
            .or_else(|| core.rollover.active_contract(family, list)),
        _ => core.rollover.active_contract(family, list),
    };

    let (direction, contract) = match (direction, contract) {
        (Ok(d), Some(c)) => (d, c),
        (Err(e), _) => {
            journal_and_notify_failure(core, signal, family.display_name(), &e).await;
            return Err(e);
        }
        (_, None) => {
            let e = CoreError::Network(format!("no contract available for {family}"));
            journal_and_notify_failure(core, signal, family.display_name(), &e).await;
            return Err(e);
        }
    };

    let request = TxOrderRequest {
        contract: contract.clone(),
        side: direction.side(),
        quantity,
        oc: direction.oc(),
        price_type: PriceType::Market,
        time_policy: TimePolicy::Ioc,
        limit_price: 0.0,
    };

    match with_backoff("tx.place_order", || core.tx_client.place_order(&request)).await {
        Ok(ack) => {
            let meta = OrderMeta {
                market: Market::Tx,
                oc: direction.oc(),
                direction,
                family: Some(family),
                code: contract.code.clone(),
                quantity: quantity as f64,
                price_type: PriceType::Market,
                time_policy: TimePolicy::Ioc,
                is_manual: false,
                submitted_at: OrderMeta::now_timestamp(),
            };
            core.registry.insert(&ack.order_id, meta.clone());
            core.tx_journal.append(JournalEntry {
                kind: EntryKind::OrderSubmitted,
                order_id: ack.order_id.clone(),
                timestamp: meta.submitted_at.clone(),
                category: JournalEntry::category_for(false),
                raw: serde_json::json!({ "trade_id": signal.trade_id }),
                resolved: resolved_from_meta(&meta, signal.price),
                reason: None,
            });

            notify_later(
                core.tx_notifier.clone(),
                "submit-success",
                order_notice(
                    "📤 委託成功",
                    &contract.describe(),
                    direction,
                    quantity as f64,
                    "市價",
                    false,
                    None,
                ),
                SUBMIT_NOTIFY_DELAY,
            );
            info!(order_id = %ack.order_id, family = %family, direction = %direction, "TX order submitted");
            Ok(())
        }
        Err(e) => {
            journal_and_notify_failure(core, signal, &contract.describe(), &e).await;
            Err(e)
        }
    }
}

async fn journal_and_notify_failure(
    core: &Arc<Core>,
    signal: &Signal,
    instrument: &str,
    error: &CoreError,
) {
    let journal = core.journal(signal.market);
    let reason = error.operator_text();
    journal.append(JournalEntry {
        kind: EntryKind::Fail,
        order_id: signal.trade_id.clone(),
        timestamp: OrderMeta::now_timestamp(),
        category: JournalEntry::category_for(false),
        raw: serde_json::json!({ "trade_id": signal.trade_id }),
        resolved: ResolvedMeta {
            market: signal.market,
            code: instrument.to_string(),
            family: None,
            direction: None,
            oc: OcType::New,
            side: Side::Buy,
            quantity: 0.0,
            price: signal.price,
            is_manual: false,
        },
        reason: Some(reason.clone()),
    });

    core.notifier(signal.market)
        .send_text(
            "submit-fail",
            &format!("<b>❌ 委託失敗</b>\n商品: {instrument}\n原因: {reason}"),
        )
        .await;
}

// =============================================================================
// BTC path
// =============================================================================

async fn handle_btc_signal(core: &Arc<Core>, signal: Signal) -> CoreResult<String> {
    let symbol = signal
        .symbol
        .clone()
        .unwrap_or_else(|| core.btc_client.symbol().to_string());

    let positions = with_backoff("btc.list_positions", || core.btc_client.list_positions()).await?;
    let held = positions
        .iter()
        .find(|p| p.code == symbol && p.quantity > 0.0);

    let direction = match resolve_direction(signal.action, held.map(|p| p.direction)) {
        Ok(d) => d,
        Err(e) => {
            journal_and_notify_failure(core, &signal, &symbol, &e).await;
            return Err(e);
        }
    };

    // Covers close the held quantity; opens are risk-sized unless the
    // strategy pinned a quantity.
    let quantity = if direction.is_open() {
        match signal.quantity {
            Some(q) => floor_to_lot(q),
            None => {
                let available = with_backoff("btc.available_balance", || {
                    core.btc_client.available_balance()
                })
                .await?;
                let mark = current_mark_price(core).await?;
                btc_order_quantity(
                    available,
                    core.btc_client.settings().risk_fraction(),
                    core.btc_client.settings().leverage,
                    mark,
                )
            }
        }
    } else {
        held.map(|p| p.quantity).unwrap_or(0.0)
    };

    let reduce_only = !direction.is_open();
    match with_backoff("btc.place_order", || {
        core.btc_client.place_order(
            direction.side(),
            quantity,
            reduce_only,
            PriceType::Market,
            0.0,
        )
    })
    .await
    {
        Ok(ack) => {
            let meta = OrderMeta {
                market: Market::Btc,
                oc: direction.oc(),
                direction,
                family: None,
                code: symbol.clone(),
                quantity,
                price_type: PriceType::Market,
                time_policy: TimePolicy::Ioc,
                is_manual: false,
                submitted_at: OrderMeta::now_timestamp(),
            };
            core.registry.insert(&ack.order_id, meta.clone());
            core.btc_journal.append(JournalEntry {
                kind: EntryKind::OrderSubmitted,
                order_id: ack.order_id.clone(),
                timestamp: meta.submitted_at.clone(),
                category: JournalEntry::category_for(false),
                raw: serde_json::json!({ "trade_id": signal.trade_id }),
                resolved: resolved_from_meta(&meta, signal.price),
                reason: None,
            });

            notify_later(
                core.btc_notifier.clone(),
                "submit-success",
                order_notice("📤 委託成功", &symbol, direction, quantity, "市價", false, None),
                SUBMIT_NOTIFY_DELAY,
            );
            info!(order_id = %ack.order_id, symbol = %symbol, direction = %direction, "BTC order submitted");
            Ok("processed".to_string())
        }
        Err(e) => {
            journal_and_notify_failure(core, &signal, &symbol, &e).await;
            Err(e)
        }
    }
}

/// Latest mark price: ticker stream value when live, REST fallback otherwise.
async fn current_mark_price(core: &Arc<Core>) -> CoreResult<f64> {
    let streamed = *core.mark_price.borrow();
    if streamed > 0.0 {
        return Ok(streamed);
    }
    with_backoff("btc.mark_price", || core.btc_client.mark_price()).await
}

pub(crate) fn resolved_from_meta(meta: &OrderMeta, price: f64) -> ResolvedMeta {
    ResolvedMeta {
        market: meta.market,
        code: meta.code.clone(),
        family: meta.family,
        direction: Some(meta.direction),
        oc: meta.oc,
        side: meta.direction.side(),
        quantity: meta.quantity,
        price,
        is_manual: meta.is_manual,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_window_accepts_then_rejects() {
        let window = DedupWindow::default();
        assert!(window.check_and_record("t1|OpenLong|1:0:0"));
        assert!(!window.check_and_record("t1|OpenLong|1:0:0"));
        // A different direction is a different key.
        assert!(window.check_and_record("t1|CloseLong|1:0:0"));
    }

    #[test]
    fn dedup_window_expires_after_ttl() {
        let window = DedupWindow::with_ttl(Duration::from_millis(10));
        assert!(window.check_and_record("k"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(window.check_and_record("k"));
    }

    #[test]
    fn open_rejected_when_opposite_position_held() {
        assert!(matches!(
            resolve_direction(RawAction::OpenLong, Some(Side::Sell)),
            Err(CoreError::OppositePositionExists)
        ));
        assert!(matches!(
            resolve_direction(RawAction::OpenShort, Some(Side::Buy)),
            Err(CoreError::OppositePositionExists)
        ));
        // Same-side add-on is allowed.
        assert_eq!(
            resolve_direction(RawAction::OpenLong, Some(Side::Buy)).unwrap(),
            Direction::OpenLong
        );
        assert_eq!(
            resolve_direction(RawAction::OpenLong, None).unwrap(),
            Direction::OpenLong
        );
    }

    #[test]
    fn close_requires_matching_position() {
        assert!(matches!(
            resolve_direction(RawAction::CloseLong, None),
            Err(CoreError::NoPosition)
        ));
        assert!(matches!(
            resolve_direction(RawAction::CloseLong, Some(Side::Sell)),
            Err(CoreError::NoPosition)
        ));
        assert_eq!(
            resolve_direction(RawAction::CloseLong, Some(Side::Buy)).unwrap(),
            Direction::CloseLong
        );
        // Bare "close" resolves against whatever is held.
        assert_eq!(
            resolve_direction(RawAction::Close, Some(Side::Sell)).unwrap(),
            Direction::CloseShort
        );
        assert!(matches!(
            resolve_direction(RawAction::Close, None),
            Err(CoreError::NoPosition)
        ));
    }

    #[test]
    fn btc_quantity_formula() {
        // available × risk × leverage / mark, floored to 0.001.
        let qty = btc_order_quantity(1000.0, 0.8, 20, 65000.0);
        assert_eq!(qty, 0.246); // 16000 / 65000 = 0.24615…
        // Tiny balances still trade the minimum lot.
        assert_eq!(btc_order_quantity(1.0, 0.8, 20, 65000.0), MIN_LOT);
        // A dead mark price cannot divide.
        assert_eq!(btc_order_quantity(1000.0, 0.8, 20, 0.0), MIN_LOT);
    }

    #[test]
    fn notice_block_contains_identifier_fields() {
        let text = order_notice(
            "📤 委託成功",
            "大台 TXFG5 (2025/07/16)",
            Direction::OpenLong,
            1.0,
            "市價",
            false,
            None,
        );
        assert!(text.contains("TXFG5"));
        assert!(text.contains("開多"));
        assert!(text.contains("自動"));
        assert!(!text.contains("原因"));

        let failed = order_notice(
            "❌ 委託失敗",
            "BTCUSDT",
            Direction::CloseLong,
            0.5,
            "市價",
            false,
            Some("無對應持倉"),
        );
        assert!(failed.contains("原因: 無對應持倉"));
    }
}
