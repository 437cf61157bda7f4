// =============================================================================
// Report Builder — daily and monthly XLSX workbooks
// =============================================================================
//
// Fixed four-block layout on a single sheet: overview, account state, close
// details (FIFO-paired open prices, scanning back up to 7 days of journals
// for cross-day closes), and open positions with live unrealized PnL.
// Header rows carry a blue fill, sub-headers grey; column widths uniform.
//
// The monthly workbook aggregates the overview across the month; account and
// open-position blocks reflect the snapshot at build time.
//
// Finished files are dispatched through the notifier as document
// attachments.
// =============================================================================

pub mod fifo;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use rust_xlsxwriter::{Color, Format, FormatAlign, Workbook};
use tracing::{info, warn};

use crate::app_state::Core;
use crate::brokers::{AccountSnapshot, BrokerAdapter, Position};
use crate::journal::{EntryKind, JournalEntry};
use crate::report::fifo::{match_closes, realized_by_family, CloseRow};
use crate::types::{ContractFamily, Market};

/// Journal files scanned beyond the report period for FIFO pairing.
const FIFO_LOOKBACK_FILES: usize = 7;

const COLUMN_WIDTH: f64 = 14.0;
const HEADER_FILL: u32 = 0x4472C4;
const SUB_HEADER_FILL: u32 = 0xD9D9D9;

// =============================================================================
// Entry points
// =============================================================================

/// Build today's report and send it as a document. Failures are logged; the
/// scheduler chain continues either way.
pub async fn build_and_dispatch_daily(core: &Arc<Core>, market: Market, date: NaiveDate) {
    let label = date.format("%Y-%m-%d").to_string();
    match build_report(core, market, date, false).await {
        Ok(path) => {
            core.notifier(market)
                .send_document(
                    "daily-report",
                    &path,
                    &format!("{} 交易日報 {label}", market.tag()),
                )
                .await;
        }
        Err(e) => warn!(market = %market, error = %e, "daily report build failed"),
    }
}

pub async fn build_and_dispatch_monthly(core: &Arc<Core>, market: Market, date: NaiveDate) {
    let label = date.format("%Y-%m").to_string();
    match build_report(core, market, date, true).await {
        Ok(path) => {
            core.notifier(market)
                .send_document(
                    "monthly-report",
                    &path,
                    &format!("{} 交易月報 {label}", market.tag()),
                )
                .await;
        }
        Err(e) => warn!(market = %market, error = %e, "monthly report build failed"),
    }
}

/// Assemble inputs and write the workbook. `monthly` widens the overview
/// period to the whole month.
async fn build_report(
    core: &Arc<Core>,
    market: Market,
    date: NaiveDate,
    monthly: bool,
) -> Result<PathBuf> {
    let adapter: Arc<dyn BrokerAdapter> = match market {
        Market::Tx => core.tx_client.clone(),
        Market::Btc => core.btc_client.clone(),
    };

    let account = adapter.account_snapshot().await.unwrap_or_else(|e| {
        warn!(market = %market, error = %e, "report account snapshot failed — using zeros");
        AccountSnapshot::default()
    });
    let positions = adapter.list_positions().await.unwrap_or_else(|e| {
        warn!(market = %market, error = %e, "report position list failed — using none");
        Vec::new()
    });

    let journal = core.journal(market);
    let (period_entries, lookback) = if monthly {
        (journal.entries_for_month(date), 31 + FIFO_LOOKBACK_FILES)
    } else {
        (journal.entries_for_date(date), 1 + FIFO_LOOKBACK_FILES)
    };

    let mut close_rows = match_closes(&journal.entries_recent(lookback));
    close_rows.retain(|row| match row.date {
        Some(d) if monthly => d.year() == date.year() && d.month() == date.month(),
        Some(d) => d == date,
        None => false,
    });

    let (dir, label) = if monthly {
        (
            format!("{}交易月報", market.tag()),
            date.format("%Y-%m").to_string(),
        )
    } else {
        (
            format!("{}交易日報", market.tag()),
            date.format("%Y-%m-%d").to_string(),
        )
    };
    std::fs::create_dir_all(&dir).with_context(|| format!("failed to create {dir}"))?;
    let path = PathBuf::from(dir).join(format!("{}_{label}.xlsx", market.tag()));

    write_workbook(&path, market, &label, &period_entries, &close_rows, &account, &positions)?;
    info!(market = %market, path = %path.display(), "report written");
    Ok(path)
}

// =============================================================================
// Workbook layout
// =============================================================================

fn write_workbook(
    path: &PathBuf,
    market: Market,
    period_label: &str,
    entries: &[JournalEntry],
    close_rows: &[CloseRow],
    account: &AccountSnapshot,
    positions: &[Position],
) -> Result<()> {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();

    for col in 0..8u16 {
        sheet.set_column_width(col, COLUMN_WIDTH)?;
    }

    let header = Format::new()
        .set_bold()
        .set_font_color(Color::White)
        .set_background_color(Color::RGB(HEADER_FILL))
        .set_align(FormatAlign::Center);
    let sub_header = Format::new()
        .set_bold()
        .set_background_color(Color::RGB(SUB_HEADER_FILL))
        .set_align(FormatAlign::Center);
    let number = Format::new().set_num_format("#,##0.00");

    let mut row = 0u32;

    // ── Block 1: overview ───────────────────────────────────────────────
    sheet.write_with_format(row, 0, format!("總覽 {period_label}"), &header)?;
    row += 1;

    let submissions = entries
        .iter()
        .filter(|e| e.kind == EntryKind::OrderSubmitted)
        .count();
    let deals: Vec<&JournalEntry> = entries.iter().filter(|e| e.kind == EntryKind::Deal).collect();
    let cancels = entries.iter().filter(|e| e.kind == EntryKind::Cancel).count();

    sheet.write_with_format(row, 0, "委託數", &sub_header)?;
    sheet.write_with_format(row, 1, "成交數", &sub_header)?;
    sheet.write_with_format(row, 2, "取消數", &sub_header)?;
    row += 1;
    sheet.write(row, 0, submissions as f64)?;
    sheet.write(row, 1, deals.len() as f64)?;
    sheet.write(row, 2, cancels as f64)?;
    row += 2;

    match market {
        Market::Tx => {
            let by_family = realized_by_family(close_rows);
            sheet.write_with_format(row, 0, "已實現損益", &sub_header)?;
            for (i, family) in ContractFamily::ALL.iter().enumerate() {
                sheet.write_with_format(row, (i + 1) as u16, family.display_name(), &sub_header)?;
            }
            row += 1;
            sheet.write(row, 0, "")?;
            for (i, family) in ContractFamily::ALL.iter().enumerate() {
                let value = by_family.get(family).copied().unwrap_or(0.0);
                sheet.write_with_format(row, (i + 1) as u16, value, &number)?;
            }
        }
        Market::Btc => {
            let volume: f64 = deals.iter().map(|e| e.resolved.quantity).sum();
            let notional: f64 = deals
                .iter()
                .map(|e| e.resolved.quantity * e.resolved.price)
                .sum();
            let avg_price = if volume > 0.0 { notional / volume } else { 0.0 };
            sheet.write_with_format(row, 0, "成交量", &sub_header)?;
            sheet.write_with_format(row, 1, "平均成交價", &sub_header)?;
            row += 1;
            sheet.write_with_format(row, 0, volume, &number)?;
            sheet.write_with_format(row, 1, avg_price, &number)?;
        }
    }
    row += 2;

    // ── Block 2: account state ──────────────────────────────────────────
    sheet.write_with_format(row, 0, "帳戶狀態", &header)?;
    row += 1;
    let account_fields: [(&str, f64); 10] = [
        ("錢包餘額", account.wallet_balance),
        ("可用餘額", account.available),
        ("保證金餘額", account.margin_balance),
        ("未實現損益", account.unrealized_pnl),
        ("原始保證金", account.initial_margin),
        ("維持保證金", account.maintenance_margin),
        ("今日手續費", account.fees_today),
        ("今日已實現", account.realized_pnl_today),
        ("7日已實現", account.realized_pnl_7d),
        ("30日已實現", account.realized_pnl_30d),
    ];
    for (i, (label, _)) in account_fields.iter().enumerate().take(5) {
        sheet.write_with_format(row, i as u16, *label, &sub_header)?;
    }
    for (i, (_, value)) in account_fields.iter().enumerate().take(5) {
        sheet.write_with_format(row + 1, i as u16, *value, &number)?;
    }
    for (i, (label, _)) in account_fields.iter().enumerate().skip(5) {
        sheet.write_with_format(row + 2, (i - 5) as u16, *label, &sub_header)?;
    }
    for (i, (_, value)) in account_fields.iter().enumerate().skip(5) {
        sheet.write_with_format(row + 3, (i - 5) as u16, *value, &number)?;
    }
    row += 5;

    // ── Block 3: close details ──────────────────────────────────────────
    sheet.write_with_format(row, 0, "平倉明細", &header)?;
    row += 1;
    for (col, label) in ["時間", "商品", "方向", "數量", "開倉價", "平倉價", "已實現損益"]
        .iter()
        .enumerate()
    {
        sheet.write_with_format(row, col as u16, *label, &sub_header)?;
    }
    row += 1;
    for close in close_rows {
        sheet.write(row, 0, close.timestamp.as_str())?;
        sheet.write(row, 1, close.code.as_str())?;
        sheet.write(
            row,
            2,
            close.direction.map(|d| d.label()).unwrap_or("平倉"),
        )?;
        sheet.write_with_format(row, 3, close.quantity, &number)?;
        sheet.write_with_format(row, 4, close.open_price, &number)?;
        sheet.write_with_format(row, 5, close.close_price, &number)?;
        sheet.write_with_format(row, 6, close.realized_pnl, &number)?;
        row += 1;
    }
    row += 1;

    // ── Block 4: open positions ─────────────────────────────────────────
    sheet.write_with_format(row, 0, "持倉", &header)?;
    row += 1;
    for (col, label) in ["商品", "方向", "數量", "開倉價", "標記價", "未實現損益", "槓桿"]
        .iter()
        .enumerate()
    {
        sheet.write_with_format(row, col as u16, *label, &sub_header)?;
    }
    row += 1;
    for position in positions {
        sheet.write(row, 0, position.code.as_str())?;
        sheet.write(row, 1, if position.direction == crate::types::Side::Buy { "多" } else { "空" })?;
        sheet.write_with_format(row, 2, position.quantity, &number)?;
        sheet.write_with_format(row, 3, position.entry_price, &number)?;
        sheet.write_with_format(row, 4, position.mark_price, &number)?;
        sheet.write_with_format(row, 5, position.unrealized_pnl, &number)?;
        sheet.write(row, 6, position.leverage as f64)?;
        row += 1;
    }

    workbook
        .save(path)
        .with_context(|| format!("failed to save workbook {}", path.display()))?;
    Ok(())
}
