// =============================================================================
// FIFO open/close matching and realized PnL
// =============================================================================
//
// Deals are replayed chronologically: opens queue lots per instrument key
// (contract family for TX, symbol for BTC); covers consume lots front-first.
// Realized PnL per close:
//   closed long  = (close − open) × quantity × point_value
//   closed short = (open − close) × quantity × point_value
// with point value 200/50/10 for TXF/MXF/TMF and 1 for USDT perpetuals.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use chrono::NaiveDate;

use crate::journal::{EntryKind, JournalEntry};
use crate::types::{ContractFamily, Direction, OcType, Side};

/// One matched close fill, ready for a report row.
#[derive(Debug, Clone)]
pub struct CloseRow {
    pub date: Option<NaiveDate>,
    pub timestamp: String,
    pub order_id: String,
    pub code: String,
    pub family: Option<ContractFamily>,
    pub direction: Option<Direction>,
    pub quantity: f64,
    /// Weighted average of the matched open lots.
    pub open_price: f64,
    pub close_price: f64,
    pub realized_pnl: f64,
}

#[derive(Debug, Clone)]
struct OpenLot {
    price: f64,
    remaining: f64,
}

fn instrument_key(entry: &JournalEntry) -> String {
    match entry.resolved.family {
        Some(family) => family.code().to_string(),
        None => entry.resolved.code.clone(),
    }
}

fn point_value(family: Option<ContractFamily>) -> f64 {
    family.map(|f| f.point_value()).unwrap_or(1.0)
}

fn entry_date(entry: &JournalEntry) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(entry.timestamp.get(..10)?, "%Y-%m-%d").ok()
}

/// Whether a cover closed a long position. Explicit direction wins; the
/// order side decides otherwise (a cover-sell closes longs).
fn closes_long(entry: &JournalEntry) -> bool {
    match entry.resolved.direction {
        Some(Direction::CloseLong) => true,
        Some(Direction::CloseShort) => false,
        _ => entry.resolved.side == Side::Sell,
    }
}

/// Replay `entries` (oldest first) and produce one row per cover fill.
/// Unmatched quantity — an open outside the scan window — contributes zero
/// PnL rather than inventing an open price.
pub fn match_closes(entries: &[JournalEntry]) -> Vec<CloseRow> {
    let mut lots: HashMap<String, VecDeque<OpenLot>> = HashMap::new();
    let mut rows = Vec::new();

    for entry in entries {
        if entry.kind != EntryKind::Deal {
            continue;
        }
        let key = instrument_key(entry);

        match entry.resolved.oc {
            OcType::New => {
                lots.entry(key).or_default().push_back(OpenLot {
                    price: entry.resolved.price,
                    remaining: entry.resolved.quantity,
                });
            }
            OcType::Cover => {
                let queue = lots.entry(key).or_default();
                let close_price = entry.resolved.price;
                let mut to_match = entry.resolved.quantity;
                let mut matched_qty = 0.0;
                let mut matched_cost = 0.0;

                while to_match > 0.0 {
                    let Some(front) = queue.front_mut() else {
                        break;
                    };
                    let take = front.remaining.min(to_match);
                    matched_qty += take;
                    matched_cost += take * front.price;
                    front.remaining -= take;
                    to_match -= take;
                    if front.remaining <= 0.0 {
                        queue.pop_front();
                    }
                }

                let open_price = if matched_qty > 0.0 {
                    matched_cost / matched_qty
                } else {
                    0.0
                };
                let pv = point_value(entry.resolved.family);
                let signed = if closes_long(entry) {
                    close_price - open_price
                } else {
                    open_price - close_price
                };
                let realized_pnl = signed * matched_qty * pv;

                rows.push(CloseRow {
                    date: entry_date(entry),
                    timestamp: entry.timestamp.clone(),
                    order_id: entry.order_id.clone(),
                    code: entry.resolved.code.clone(),
                    family: entry.resolved.family,
                    direction: entry.resolved.direction,
                    quantity: entry.resolved.quantity,
                    open_price,
                    close_price,
                    realized_pnl,
                });
            }
        }
    }

    rows
}

/// Realized PnL per family across the given rows.
pub fn realized_by_family(rows: &[CloseRow]) -> HashMap<ContractFamily, f64> {
    let mut totals = HashMap::new();
    for row in rows {
        if let Some(family) = row.family {
            *totals.entry(family).or_insert(0.0) += row.realized_pnl;
        }
    }
    totals
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::ResolvedMeta;
    use crate::types::Market;

    fn deal(
        order_id: &str,
        day: u32,
        oc: OcType,
        direction: Direction,
        price: f64,
        quantity: f64,
    ) -> JournalEntry {
        JournalEntry {
            kind: EntryKind::Deal,
            order_id: order_id.to_string(),
            timestamp: format!("2025-07-{day:02} 09:00:00"),
            category: "auto".to_string(),
            raw: serde_json::Value::Null,
            resolved: ResolvedMeta {
                market: Market::Tx,
                code: "TXFG5".to_string(),
                family: Some(ContractFamily::Txf),
                direction: Some(direction),
                oc,
                side: direction.side(),
                quantity,
                price,
                is_manual: false,
            },
            reason: None,
        }
    }

    #[test]
    fn fifo_matching_worked_example() {
        // Opens [O₁@100 q=2, O₂@110 q=1]; C@120 q=2 then C@130 q=1 on a
        // TXF long.
        let entries = vec![
            deal("O1", 1, OcType::New, Direction::OpenLong, 100.0, 2.0),
            deal("O2", 1, OcType::New, Direction::OpenLong, 110.0, 1.0),
            deal("C1", 2, OcType::Cover, Direction::CloseLong, 120.0, 2.0),
            deal("C2", 2, OcType::Cover, Direction::CloseLong, 130.0, 1.0),
        ];

        let rows = match_closes(&entries);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].open_price, 100.0);
        assert_eq!(rows[0].realized_pnl, (120.0 - 100.0) * 2.0 * 200.0); // 8000
        assert_eq!(rows[1].open_price, 110.0);
        assert_eq!(rows[1].realized_pnl, (130.0 - 110.0) * 1.0 * 200.0); // 4000
    }

    #[test]
    fn close_splits_a_lot_across_covers() {
        let entries = vec![
            deal("O1", 1, OcType::New, Direction::OpenLong, 100.0, 3.0),
            deal("C1", 1, OcType::Cover, Direction::CloseLong, 110.0, 1.0),
            deal("C2", 1, OcType::Cover, Direction::CloseLong, 120.0, 2.0),
        ];
        let rows = match_closes(&entries);
        assert_eq!(rows[0].realized_pnl, 10.0 * 1.0 * 200.0);
        assert_eq!(rows[1].realized_pnl, 20.0 * 2.0 * 200.0);
    }

    #[test]
    fn short_close_negates() {
        let entries = vec![
            deal("O1", 1, OcType::New, Direction::OpenShort, 100.0, 1.0),
            deal("C1", 1, OcType::Cover, Direction::CloseShort, 90.0, 1.0),
        ];
        let rows = match_closes(&entries);
        // Short from 100 covered at 90: +10 points.
        assert_eq!(rows[0].realized_pnl, 10.0 * 1.0 * 200.0);
    }

    #[test]
    fn cross_instrument_queues_are_independent() {
        let mut mxf_open = deal("M1", 1, OcType::New, Direction::OpenLong, 100.0, 1.0);
        mxf_open.resolved.family = Some(ContractFamily::Mxf);
        mxf_open.resolved.code = "MXFG5".to_string();
        let mut mxf_close = deal("M2", 1, OcType::Cover, Direction::CloseLong, 110.0, 1.0);
        mxf_close.resolved.family = Some(ContractFamily::Mxf);
        mxf_close.resolved.code = "MXFG5".to_string();

        let entries = vec![
            deal("O1", 1, OcType::New, Direction::OpenLong, 200.0, 1.0),
            mxf_open,
            mxf_close,
            deal("C1", 1, OcType::Cover, Direction::CloseLong, 210.0, 1.0),
        ];
        let rows = match_closes(&entries);
        assert_eq!(rows.len(), 2);
        // MXF point value 50.
        assert_eq!(rows[0].realized_pnl, 10.0 * 50.0);
        assert_eq!(rows[1].realized_pnl, 10.0 * 200.0);

        let by_family = realized_by_family(&rows);
        assert_eq!(by_family[&ContractFamily::Mxf], 500.0);
        assert_eq!(by_family[&ContractFamily::Txf], 2000.0);
    }

    #[test]
    fn unmatched_close_contributes_zero_pnl() {
        let entries = vec![deal("C1", 1, OcType::Cover, Direction::CloseLong, 120.0, 2.0)];
        let rows = match_closes(&entries);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].realized_pnl, 0.0);
        assert_eq!(rows[0].open_price, 0.0);
    }
}
