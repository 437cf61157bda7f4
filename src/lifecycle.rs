// =============================================================================
// Lifecycle Tracker — order state machine fed by broker events
// =============================================================================
//
// Three sources converge on the bounded event queue: the TX event stream,
// the BTC user-data stream, and the 30 s BTC polling fallback. Per order,
// events are processed in arrival order; the state machine is monotonic, so
// a late event for an already-finalized order is a no-op (registry miss +
// journaled terminal entry).
//
// BTC partial fills are coalesced — only the full fill notifies. TX open
// fills fetch the broker's average entry price within a 2 s budget; that
// price is the authoritative open for later FIFO matching.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::app_state::Core;
use crate::brokers::{BrokerAdapter, OrderEvent, OrderEventKind};
use crate::journal::{EntryKind, JournalEntry};
use crate::pipeline::{notify_later, order_notice, resolved_from_meta};
use crate::registry::OrderMeta;
use crate::types::{
    Direction, Market, OcType, OrderState, PriceType, Side, TimePolicy,
};

/// Fill notifications trail the event by this long; it exceeds the 2 s
/// submit delay so submit → fill ordering holds per order.
const FILL_NOTIFY_DELAY: Duration = Duration::from_secs(5);
/// Budget for the post-fill average-entry-price lookup.
const ENTRY_PRICE_BUDGET: Duration = Duration::from_secs(2);
/// BTC polling-fallback period.
const POLL_INTERVAL: Duration = Duration::from_secs(30);

// =============================================================================
// Reason dictionary
// =============================================================================

/// Translate a broker reason code into operator-facing text. This table is
/// the single source of truth for that text.
pub fn translate_reason(code: &str) -> String {
    match code {
        "" => "Order cancelled".to_string(),
        // TX gateway op codes.
        "11" => "Price not satisfied".to_string(),
        "21" => "Outside trading hours".to_string(),
        "31" => "Quantity exceeds limit".to_string(),
        "88" => "Insufficient margin".to_string(),
        // Binance futures error codes.
        "-1021" => "Timestamp outside of recvWindow".to_string(),
        "-2019" => "Insufficient margin".to_string(),
        "-2022" => "Reduce-only order rejected".to_string(),
        "-4131" => "Price not satisfied".to_string(),
        "-4164" => "Order notional too small".to_string(),
        other => format!("Broker code {other}"),
    }
}

// =============================================================================
// Tracker loop
// =============================================================================

/// Consume the lifecycle queue until shutdown, then drain what remains so
/// terminal states are journaled before exit.
pub async fn run_lifecycle_tracker(core: Arc<Core>) {
    info!("lifecycle tracker started");
    let mut shutdown = core.shutdown.clone();

    loop {
        tokio::select! {
            event = core.events.pop() => process_event(&core, event).await,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    while let Some(event) = core.events.try_pop() {
        process_event(&core, event).await;
    }
    info!("lifecycle tracker stopped");
}

/// Apply one event to the per-order state machine.
pub async fn process_event(core: &Arc<Core>, event: OrderEvent) {
    match &event.kind {
        OrderEventKind::Submitted => {
            debug!(order_id = %event.order_id, "order acknowledged by broker");
        }
        OrderEventKind::PartialFill { price, quantity } => {
            // Coalesced: the final FILLED frame carries the totals.
            debug!(
                order_id = %event.order_id,
                price,
                quantity,
                "partial fill (awaiting full fill)"
            );
        }
        OrderEventKind::Filled { price, quantity } => {
            handle_fill(core, &event, *price, *quantity).await;
        }
        OrderEventKind::Cancelled { reason_code } => {
            handle_terminal_failure(core, &event, OrderState::Cancelled, reason_code).await;
        }
        OrderEventKind::Rejected { reason_code } => {
            handle_terminal_failure(core, &event, OrderState::Rejected, reason_code).await;
        }
        OrderEventKind::Expired => {
            handle_terminal_failure(core, &event, OrderState::Expired, "21").await;
        }
    }
}

/// True when the order already reached a terminal state — a registry miss
/// with a journaled deal/cancel/fail entry for today.
fn already_finalized(core: &Core, market: Market, order_id: &str) -> bool {
    if core.registry.contains(order_id) {
        return false;
    }
    core.journal(market)
        .entries_for_date(chrono::Local::now().date_naive())
        .iter()
        .any(|e| {
            e.order_id == order_id
                && matches!(e.kind, EntryKind::Deal | EntryKind::Cancel | EntryKind::Fail)
        })
}

async fn handle_fill(core: &Arc<Core>, event: &OrderEvent, price: f64, quantity: f64) {
    if already_finalized(core, event.market, &event.order_id) {
        debug!(order_id = %event.order_id, "late fill event for finalized order — ignored");
        return;
    }

    let meta = lookup_or_reconstruct(core, event).await;

    // For TX opens, the broker's average entry price for the resulting
    // position is authoritative over the deal price.
    let authoritative_price = if event.market == Market::Tx && meta.oc == OcType::New {
        tx_entry_price(core, &meta.code).await.unwrap_or(price)
    } else {
        price
    };

    let mut resolved = resolved_from_meta(&meta, authoritative_price);
    resolved.quantity = quantity;
    core.journal(event.market).append(JournalEntry {
        kind: EntryKind::Deal,
        order_id: event.order_id.clone(),
        timestamp: OrderMeta::now_timestamp(),
        category: JournalEntry::category_for(meta.is_manual),
        raw: event.raw.clone(),
        resolved,
        reason: None,
    });

    let instrument = describe_instrument(core, &meta);
    notify_later(
        core.notifier(event.market).clone(),
        "deal",
        order_notice(
            "✅ 成交通知",
            &instrument,
            meta.direction,
            quantity,
            &format!("{authoritative_price}"),
            meta.is_manual,
            None,
        ),
        FILL_NOTIFY_DELAY,
    );

    core.registry.remove(&event.order_id);
    info!(
        order_id = %event.order_id,
        price = authoritative_price,
        quantity,
        "order filled"
    );
}

async fn handle_terminal_failure(
    core: &Arc<Core>,
    event: &OrderEvent,
    state: OrderState,
    reason_code: &str,
) {
    if already_finalized(core, event.market, &event.order_id) {
        debug!(order_id = %event.order_id, state = %state, "late event for finalized order — ignored");
        return;
    }

    let meta = lookup_or_reconstruct(core, event).await;
    let reason = translate_reason(reason_code);

    let kind = if state == OrderState::Rejected {
        EntryKind::Fail
    } else {
        EntryKind::Cancel
    };
    core.journal(event.market).append(JournalEntry {
        kind,
        order_id: event.order_id.clone(),
        timestamp: OrderMeta::now_timestamp(),
        category: JournalEntry::category_for(meta.is_manual),
        raw: event.raw.clone(),
        resolved: resolved_from_meta(&meta, 0.0),
        reason: Some(reason.clone()),
    });

    let instrument = describe_instrument(core, &meta);
    core.notifier(event.market)
        .send_text(
            "order-fail",
            &order_notice(
                "⚠️ 委託未成交",
                &instrument,
                meta.direction,
                meta.quantity,
                &format!("{}", meta.price_type),
                meta.is_manual,
                Some(&reason),
            ),
        )
        .await;

    core.registry.remove(&event.order_id);
    info!(order_id = %event.order_id, state = %state, reason = %reason, "order finalized without fill");
}

// =============================================================================
// Metadata reconstruction
// =============================================================================

/// Registry lookup with the fallback chain: today's journal submission,
/// then live-position inference, then `New` + manual.
async fn lookup_or_reconstruct(core: &Arc<Core>, event: &OrderEvent) -> OrderMeta {
    if let Some(meta) = core.registry.get(&event.order_id) {
        return meta;
    }
    warn!(order_id = %event.order_id, "unknown order id — reconstructing metadata");

    // (a) Today's journal may hold the submission.
    let today = chrono::Local::now().date_naive();
    let submission = core
        .journal(event.market)
        .entries_for_date(today)
        .into_iter()
        .find(|e| e.kind == EntryKind::OrderSubmitted && e.order_id == event.order_id);
    if let Some(entry) = submission {
        let r = entry.resolved;
        return OrderMeta {
            market: r.market,
            oc: r.oc,
            direction: r.direction.unwrap_or(Direction::OpenLong),
            family: r.family,
            code: r.code,
            quantity: r.quantity,
            price_type: PriceType::Market,
            time_policy: TimePolicy::Ioc,
            is_manual: r.is_manual,
            submitted_at: entry.timestamp,
        };
    }

    // (b) Infer oc from live positions: an opposite-side position means this
    // order covers it.
    let event_side = event_side(event);
    let positions = match event.market {
        Market::Tx => core.tx_client.list_positions().await.unwrap_or_default(),
        Market::Btc => core.btc_client.list_positions().await.unwrap_or_default(),
    };
    let side = event_side.unwrap_or(Side::Buy);
    let covers = positions
        .iter()
        .any(|p| p.quantity > 0.0 && p.direction == side.opposite());

    let (oc, direction) = if covers {
        match side {
            Side::Sell => (OcType::Cover, Direction::CloseLong),
            Side::Buy => (OcType::Cover, Direction::CloseShort),
        }
    } else {
        match side {
            Side::Buy => (OcType::New, Direction::OpenLong),
            Side::Sell => (OcType::New, Direction::OpenShort),
        }
    };

    OrderMeta {
        market: event.market,
        oc,
        direction,
        family: event_family(event),
        code: event_code(core, event),
        quantity: 0.0,
        price_type: PriceType::Market,
        time_policy: TimePolicy::Ioc,
        is_manual: true,
        submitted_at: OrderMeta::now_timestamp(),
    }
}

/// Order side from the raw broker payload, when it carries one.
fn event_side(event: &OrderEvent) -> Option<Side> {
    let side = match event.market {
        Market::Tx => event.raw.get("side").and_then(serde_json::Value::as_str),
        Market::Btc => event
            .raw
            .get("o")
            .and_then(|o| o.get("S"))
            .and_then(serde_json::Value::as_str),
    };
    match side {
        Some("BUY") | Some("Buy") => Some(Side::Buy),
        Some("SELL") | Some("Sell") => Some(Side::Sell),
        _ => None,
    }
}

fn event_code(core: &Core, event: &OrderEvent) -> String {
    match event.market {
        Market::Tx => event
            .raw
            .get("code")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("")
            .to_string(),
        Market::Btc => core.btc_client.symbol().to_string(),
    }
}

fn event_family(event: &OrderEvent) -> Option<crate::types::ContractFamily> {
    event
        .raw
        .get("code")
        .and_then(serde_json::Value::as_str)
        .and_then(crate::types::ContractFamily::from_code)
}

/// "大台 TXFG5 (2025/07/16)" when the contract is known, else the raw code.
fn describe_instrument(core: &Core, meta: &OrderMeta) -> String {
    if let Some(family) = meta.family {
        let contracts = core.tx_contracts.read();
        if let Some(contract) = contracts
            .get(&family)
            .and_then(|list| list.iter().find(|c| c.code == meta.code))
        {
            return contract.describe();
        }
        return format!("{} {}", family.display_name(), meta.code);
    }
    meta.code.clone()
}

/// Fresh average entry price for the position in `code`, within the 2 s
/// budget. `None` falls back to the deal price.
async fn tx_entry_price(core: &Arc<Core>, code: &str) -> Option<f64> {
    let lookup = core.tx_client.list_positions();
    match tokio::time::timeout(ENTRY_PRICE_BUDGET, lookup).await {
        Ok(Ok(positions)) => positions
            .iter()
            .find(|p| p.code == code && p.entry_price > 0.0)
            .map(|p| p.entry_price),
        Ok(Err(e)) => {
            warn!(code, error = %e, "entry-price lookup failed — using deal price");
            None
        }
        Err(_) => {
            warn!(code, "entry-price lookup timed out — using deal price");
            None
        }
    }
}

// =============================================================================
// BTC polling fallback
// =============================================================================

/// Every 30 s, query each live BTC order and synthesize a terminal event if
/// the user stream missed it.
pub async fn run_btc_poll_fallback(core: Arc<Core>) {
    info!("BTC order polling fallback started");
    let mut shutdown = core.shutdown.clone();
    let mut ticker = tokio::time::interval(POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
        if core.is_shutting_down() {
            break;
        }

        for (order_id, _meta) in core.registry.live_orders(Market::Btc) {
            let status = match core.btc_client.query_order(&order_id).await {
                Ok(status) => status,
                Err(e) => {
                    debug!(order_id = %order_id, error = %e, "order poll failed");
                    continue;
                }
            };
            if !status.state.is_terminal() {
                continue;
            }

            let kind = match status.state {
                OrderState::Filled => OrderEventKind::Filled {
                    price: status.avg_price,
                    quantity: status.executed_qty,
                },
                OrderState::Cancelled => OrderEventKind::Cancelled {
                    reason_code: String::new(),
                },
                OrderState::Rejected => OrderEventKind::Rejected {
                    reason_code: String::new(),
                },
                OrderState::Expired => OrderEventKind::Expired,
                OrderState::Submitted => unreachable!("terminal check above"),
            };

            warn!(order_id = %order_id, state = %status.state, "poll fallback caught missed terminal state");
            core.events.push(OrderEvent {
                market: Market::Btc,
                order_id,
                kind,
                raw: serde_json::json!({ "source": "poll" }),
            });
        }
    }
    info!("BTC order polling fallback stopped");
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::testing::core_fixture;

    #[test]
    fn fill_notice_always_trails_submit_notice() {
        // Per order, submit (2 s) must land before fill; the gap the
        // operator sees is at least 3 s.
        let gap = FILL_NOTIFY_DELAY.as_secs() as i64
            - crate::pipeline::SUBMIT_NOTIFY_DELAY.as_secs() as i64;
        assert!(gap >= 3);
    }

    #[test]
    fn reason_dictionary_known_codes() {
        assert_eq!(translate_reason("11"), "Price not satisfied");
        assert_eq!(translate_reason("88"), "Insufficient margin");
        assert_eq!(translate_reason("-2019"), "Insufficient margin");
        assert_eq!(translate_reason("21"), "Outside trading hours");
        assert_eq!(translate_reason(""), "Order cancelled");
        assert_eq!(translate_reason("-9999"), "Broker code -9999");
    }

    fn btc_meta(quantity: f64) -> OrderMeta {
        OrderMeta {
            market: Market::Btc,
            oc: OcType::New,
            direction: Direction::OpenLong,
            family: None,
            code: "BTCUSDT".to_string(),
            quantity,
            price_type: PriceType::Market,
            time_policy: TimePolicy::Ioc,
            is_manual: false,
            submitted_at: OrderMeta::now_timestamp(),
        }
    }

    #[tokio::test]
    async fn btc_fill_journals_and_clears_registry() {
        let (core, _handles) = core_fixture("fill");
        core.registry.insert("42", btc_meta(0.01));

        let event = OrderEvent {
            market: Market::Btc,
            order_id: "42".to_string(),
            kind: OrderEventKind::Filled { price: 65000.0, quantity: 0.01 },
            raw: serde_json::Value::Null,
        };
        process_event(&core, event).await;

        let today = chrono::Local::now().date_naive();
        let entries = core.btc_journal.entries_for_date(today);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, EntryKind::Deal);
        assert_eq!(entries[0].resolved.price, 65000.0);
        assert_eq!(entries[0].resolved.quantity, 0.01);
        assert!(!core.registry.contains("42"));
    }

    #[tokio::test]
    async fn late_duplicate_fill_is_a_noop() {
        let (core, _handles) = core_fixture("late-dup");
        core.registry.insert("42", btc_meta(0.01));

        let event = OrderEvent {
            market: Market::Btc,
            order_id: "42".to_string(),
            kind: OrderEventKind::Filled { price: 65000.0, quantity: 0.01 },
            raw: serde_json::Value::Null,
        };
        process_event(&core, event.clone()).await;
        process_event(&core, event).await;

        let today = chrono::Local::now().date_naive();
        assert_eq!(core.btc_journal.entries_for_date(today).len(), 1);
    }

    #[tokio::test]
    async fn cancel_after_fill_is_discarded() {
        let (core, _handles) = core_fixture("monotonic");
        core.registry.insert("42", btc_meta(0.01));

        process_event(
            &core,
            OrderEvent {
                market: Market::Btc,
                order_id: "42".to_string(),
                kind: OrderEventKind::Filled { price: 65000.0, quantity: 0.01 },
                raw: serde_json::Value::Null,
            },
        )
        .await;
        process_event(
            &core,
            OrderEvent {
                market: Market::Btc,
                order_id: "42".to_string(),
                kind: OrderEventKind::Cancelled { reason_code: String::new() },
                raw: serde_json::Value::Null,
            },
        )
        .await;

        let today = chrono::Local::now().date_naive();
        let entries = core.btc_journal.entries_for_date(today);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, EntryKind::Deal);
    }

    #[tokio::test]
    async fn rejection_journals_fail_with_translated_reason() {
        let (core, _handles) = core_fixture("reject");
        core.registry.insert("43", btc_meta(0.02));

        process_event(
            &core,
            OrderEvent {
                market: Market::Btc,
                order_id: "43".to_string(),
                kind: OrderEventKind::Rejected { reason_code: "-2019".to_string() },
                raw: serde_json::Value::Null,
            },
        )
        .await;

        let today = chrono::Local::now().date_naive();
        let entries = core.btc_journal.entries_for_date(today);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, EntryKind::Fail);
        assert_eq!(entries[0].reason.as_deref(), Some("Insufficient margin"));
        assert!(!core.registry.contains("43"));
    }

    #[tokio::test]
    async fn reconstruction_prefers_journal_submission() {
        let (core, _handles) = core_fixture("reconstruct");
        // A submission journaled earlier today, but absent from the registry
        // (process restarted in between).
        let today = chrono::Local::now().date_naive();
        core.btc_journal.append_on(
            today,
            JournalEntry {
                kind: EntryKind::OrderSubmitted,
                order_id: "77".to_string(),
                timestamp: OrderMeta::now_timestamp(),
                category: "auto".to_string(),
                raw: serde_json::Value::Null,
                resolved: resolved_from_meta(&btc_meta(0.05), 0.0),
                reason: None,
            },
        );

        let event = OrderEvent {
            market: Market::Btc,
            order_id: "77".to_string(),
            kind: OrderEventKind::Filled { price: 60000.0, quantity: 0.05 },
            raw: serde_json::Value::Null,
        };
        let meta = lookup_or_reconstruct(&core, &event).await;
        assert_eq!(meta.code, "BTCUSDT");
        assert_eq!(meta.quantity, 0.05);
        assert_eq!(meta.oc, OcType::New);
        assert!(!meta.is_manual);
    }
}
