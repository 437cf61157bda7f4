// =============================================================================
// Scheduler — wall-clock triggers with per-day idempotence
// =============================================================================
//
// A single 1 s tick loop sleeping between checks; no cron dependency so the
// behavior stays deterministic under clock skew. Each trigger is guarded by
// a last-fired-on date marker, so a minute-long match window fires exactly
// once per calendar day.
//
// Triggers (local time):
//   08:45  TX "system starting" notice (trading day + market open)
//   09:00  BTC "system starting" notice (crypto runs around the clock)
//   14:50  margin-requirement change check against the previous snapshot
//   23:58  BTC statistics → +30 s daily report → +30 s monthly (month end)
//   23:59  TX statistics → +30 s daily report → +30 s monthly (last trading
//          day); Saturdays count when the preceding Friday traded
//   00:05  rollover tick
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Local, NaiveDate, Timelike};
use tracing::{info, warn};

use crate::app_state::Core;
use crate::brokers::{AccountSnapshot, BrokerAdapter};
use crate::journal::{EntryKind, JournalEntry};
use crate::report;
use crate::rollover::RolloverTransition;
use crate::types::Market;

const TICK: Duration = Duration::from_secs(1);
/// Pause between statistics, daily report, and monthly report.
const CHAIN_PAUSE: Duration = Duration::from_secs(30);

/// Relative margin drift that counts as a requirement change.
const MARGIN_DRIFT_THRESHOLD: f64 = 0.005;

/// Per-day idempotence markers.
struct FiredMarkers {
    fired: HashMap<&'static str, NaiveDate>,
}

impl FiredMarkers {
    fn new() -> Self {
        Self {
            fired: HashMap::new(),
        }
    }

    /// True exactly once per `today` when the wall clock sits in the
    /// trigger's minute.
    fn should_fire(
        &mut self,
        key: &'static str,
        today: NaiveDate,
        now_hm: (u32, u32),
        at: (u32, u32),
    ) -> bool {
        if now_hm != at || self.fired.get(key) == Some(&today) {
            return false;
        }
        self.fired.insert(key, today);
        true
    }
}

/// Run the trigger loop until shutdown.
pub async fn run_scheduler(core: Arc<Core>) {
    info!("scheduler started");
    let mut shutdown = core.shutdown.clone();
    let mut markers = FiredMarkers::new();
    let mut last_tx_account: Option<AccountSnapshot> = None;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(TICK) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
        if core.is_shutting_down() {
            break;
        }

        let now = Local::now().naive_local();
        let today = now.date();
        let now_hm = (now.hour(), now.minute());

        // ── 08:45 TX session start ──────────────────────────────────
        if markers.should_fire("tx-start", today, now_hm, (8, 45)) {
            let trading = core.calendar.is_trading_day(today).unwrap_or(false);
            if trading && core.calendar.is_market_open_at(now) {
                core.tx_notifier
                    .send_text("system", "<b>🚀 TX 交易系統啟動</b>\n日盤開始監控訊號")
                    .await;
            }
        }

        // ── 09:00 BTC session start ─────────────────────────────────
        if markers.should_fire("btc-start", today, now_hm, (9, 0)) {
            core.btc_notifier
                .send_text("system", "<b>🚀 BTC 交易系統啟動</b>\n開始監控訊號")
                .await;
        }

        // ── 14:50 margin-requirement check ──────────────────────────
        if markers.should_fire("margin-check", today, now_hm, (14, 50)) {
            match core.tx_client.account_snapshot().await {
                Ok(account) => {
                    if let Some(previous) = &last_tx_account {
                        if let Some(notice) = margin_change_notice(previous, &account) {
                            core.tx_notifier.send_text("margin", &notice).await;
                        }
                    }
                    last_tx_account = Some(account);
                }
                Err(e) => warn!(error = %e, "margin check snapshot failed"),
            }
        }

        // ── 23:58 BTC end-of-day chain ──────────────────────────────
        if markers.should_fire("btc-eod", today, now_hm, (23, 58)) {
            let chain_core = core.clone();
            tokio::spawn(async move {
                end_of_day_chain(chain_core, Market::Btc, today, is_last_day_of_month(today))
                    .await;
            });
        }

        // ── 23:59 TX end-of-day chain ───────────────────────────────
        if markers.should_fire("tx-eod", today, now_hm, (23, 59)) {
            let trading = core.calendar.is_trading_day(today).unwrap_or(false);
            let saturday_tail = core
                .calendar
                .saturday_follows_trading_friday(today)
                .unwrap_or(false);
            if trading || saturday_tail {
                let month_end = core
                    .calendar
                    .is_last_trading_day_of_month(today)
                    .unwrap_or(false);
                let chain_core = core.clone();
                tokio::spawn(async move {
                    end_of_day_chain(chain_core, Market::Tx, today, month_end).await;
                });
            }
        }

        // ── 00:05 rollover tick ─────────────────────────────────────
        if markers.should_fire("rollover-tick", today, now_hm, (0, 5)) {
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
        }
    }

    info!("scheduler stopped");
}

// =============================================================================
// End-of-day chain
// =============================================================================

/// Statistics → (30 s) daily report → (30 s) monthly report when the period
/// closes a month.
async fn end_of_day_chain(core: Arc<Core>, market: Market, date: NaiveDate, month_end: bool) {
    let adapter: Arc<dyn BrokerAdapter> = match market {
        Market::Tx => core.tx_client.clone(),
        Market::Btc => core.btc_client.clone(),
    };

    let account = match adapter.account_snapshot().await {
        Ok(account) => account,
        Err(e) => {
            warn!(market = %market, error = %e, "EOD account snapshot failed");
            AccountSnapshot::default()
        }
    };

    let entries = core.journal(market).entries_for_date(date);
    core.notifier(market)
        .send_text("daily-stats", &stats_message(market, date, &entries, &account))
        .await;

    tokio::time::sleep(CHAIN_PAUSE).await;
    report::build_and_dispatch_daily(&core, market, date).await;

    if month_end {
        tokio::time::sleep(CHAIN_PAUSE).await;
        report::build_and_dispatch_monthly(&core, market, date).await;
    }
}

/// Day-level statistics summary for the notification channel.
fn stats_message(
    market: Market,
    date: NaiveDate,
    entries: &[JournalEntry],
    account: &AccountSnapshot,
) -> String {
    let submissions = entries
        .iter()
        .filter(|e| e.kind == EntryKind::OrderSubmitted)
        .count();
    let deals = entries.iter().filter(|e| e.kind == EntryKind::Deal).count();
    let cancels = entries.iter().filter(|e| e.kind == EntryKind::Cancel).count();
    let fails = entries.iter().filter(|e| e.kind == EntryKind::Fail).count();

    format!(
        "<b>📊 {} 每日統計 {}</b>\n委託: {submissions}\n成交: {deals}\n取消: {cancels}\n失敗: {fails}\n今日已實現損益: {:.2}\n手續費: {:.2}",
        market.tag(),
        date.format("%Y-%m-%d"),
        account.realized_pnl_today,
        account.fees_today,
    )
}

/// A notice when either margin requirement drifted beyond the threshold.
fn margin_change_notice(previous: &AccountSnapshot, current: &AccountSnapshot) -> Option<String> {
    let drifted = |old: f64, new: f64| {
        let base = old.abs().max(1.0);
        (new - old).abs() / base > MARGIN_DRIFT_THRESHOLD
    };

    if !drifted(previous.initial_margin, current.initial_margin)
        && !drifted(previous.maintenance_margin, current.maintenance_margin)
    {
        return None;
    }

    Some(format!(
        "<b>⚠️ 保證金異動</b>\n原始保證金: {:.0} → {:.0}\n維持保證金: {:.0} → {:.0}",
        previous.initial_margin,
        current.initial_margin,
        previous.maintenance_margin,
        current.maintenance_margin,
    ))
}

fn is_last_day_of_month(date: NaiveDate) -> bool {
    (date + chrono::Duration::days(1)).month() != date.month()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::ResolvedMeta;
    use crate::types::{Direction, OcType, Side};

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn markers_fire_once_per_day() {
        let mut markers = FiredMarkers::new();
        let today = d(2025, 7, 1);

        assert!(markers.should_fire("tx-start", today, (8, 45), (8, 45)));
        // Same minute, later second: suppressed.
        assert!(!markers.should_fire("tx-start", today, (8, 45), (8, 45)));
        // Wrong minute: never fires.
        assert!(!markers.should_fire("tx-start", today, (8, 46), (8, 45)));
        // Next day fires again.
        assert!(markers.should_fire("tx-start", d(2025, 7, 2), (8, 45), (8, 45)));
    }

    #[test]
    fn last_day_of_month() {
        assert!(is_last_day_of_month(d(2025, 7, 31)));
        assert!(!is_last_day_of_month(d(2025, 7, 30)));
        assert!(is_last_day_of_month(d(2024, 2, 29)));
    }

    #[test]
    fn margin_notice_only_on_drift() {
        let mut previous = AccountSnapshot::default();
        previous.initial_margin = 100_000.0;
        previous.maintenance_margin = 77_000.0;

        let mut unchanged = previous.clone();
        unchanged.initial_margin = 100_200.0; // 0.2% — below threshold
        assert!(margin_change_notice(&previous, &unchanged).is_none());

        let mut raised = previous.clone();
        raised.initial_margin = 112_000.0;
        let notice = margin_change_notice(&previous, &raised).unwrap();
        assert!(notice.contains("112000"));
    }

    #[test]
    fn stats_counts_by_entry_kind() {
        let resolved = ResolvedMeta {
            market: Market::Tx,
            code: "TXFG5".to_string(),
            family: None,
            direction: Some(Direction::OpenLong),
            oc: OcType::New,
            side: Side::Buy,
            quantity: 1.0,
            price: 0.0,
            is_manual: false,
        };
        let entry = |kind| JournalEntry {
            kind,
            order_id: "O".to_string(),
            timestamp: "2025-07-01 09:00:00".to_string(),
            category: "auto".to_string(),
            raw: serde_json::Value::Null,
            resolved: resolved.clone(),
            reason: None,
        };

        let entries = vec![
            entry(EntryKind::OrderSubmitted),
            entry(EntryKind::OrderSubmitted),
            entry(EntryKind::Deal),
            entry(EntryKind::Fail),
        ];
        let message = stats_message(
            Market::Tx,
            d(2025, 7, 1),
            &entries,
            &AccountSnapshot::default(),
        );
        assert!(message.contains("委託: 2"));
        assert!(message.contains("成交: 1"));
        assert!(message.contains("失敗: 1"));
    }
}
