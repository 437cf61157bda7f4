// =============================================================================
// Rollover Engine — current-month vs next-month contract selection
// =============================================================================
//
// The night session of delivery day opens with the new month as "current",
// so the pre-delivery window runs from `nearest_delivery − 1 day` until
// delivery-day 15:00 local. Inside the window, newly issued orders target
// the next-month contract (R2); at 15:00 the engine deactivates and the
// refreshed contract list makes the new month R1.
//
// The engine is the only writer of rollover state; everyone else reads
// snapshots.
// =============================================================================

use std::collections::HashMap;

use chrono::{NaiveDate, NaiveDateTime, Timelike};
use parking_lot::RwLock;
use tracing::info;

use crate::types::{Contract, ContractFamily};

/// Hour (local) at which delivery day flips to the new month.
const SESSION_FLIP_HOUR: u32 = 15;

#[derive(Debug, Clone, Default)]
pub struct RolloverState {
    pub active: bool,
    pub started_on: Option<NaiveDate>,
    /// Snapshot of the next-month contract per family, taken on entry.
    pub next_month: HashMap<ContractFamily, Contract>,
}

/// Outcome of an `evaluate` pass.
#[derive(Debug, Clone, PartialEq)]
pub enum RolloverTransition {
    None,
    /// Entered the window; emit the one-time "rollover started" notice.
    Entered,
    /// Left the window. `refresh_contracts` means delivery has passed and
    /// current contract references must be re-fetched.
    Exited { refresh_contracts: bool },
}

#[derive(Default)]
pub struct RolloverEngine {
    state: RwLock<RolloverState>,
}

impl RolloverEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.state.read().active
    }

    pub fn snapshot(&self) -> RolloverState {
        self.state.read().clone()
    }

    /// The earliest delivery among current-month (R1) contracts.
    fn nearest_delivery(contracts: &HashMap<ContractFamily, Vec<Contract>>) -> Option<NaiveDate> {
        contracts
            .values()
            .filter_map(|list| {
                list.iter()
                    .find(|c| c.is_r1)
                    .or_else(|| list.first())
                    .map(|c| c.delivery_date)
            })
            .min()
    }

    /// The next-month contract for one family: R2, falling back to the
    /// second-earliest delivery.
    fn next_month_contract(list: &[Contract]) -> Option<Contract> {
        list.iter()
            .find(|c| c.is_r2)
            .or_else(|| list.get(1))
            .cloned()
    }

    /// Recompute the window against `now` and the current contract lists
    /// (each sorted by delivery date). Called on every selection query and
    /// on the daily 00:05 tick.
    pub fn evaluate(
        &self,
        now: NaiveDateTime,
        contracts: &HashMap<ContractFamily, Vec<Contract>>,
    ) -> RolloverTransition {
        let Some(nearest) = Self::nearest_delivery(contracts) else {
            return RolloverTransition::None;
        };

        let today = now.date();
        let window_start = nearest - chrono::Duration::days(1);
        let in_window = today >= window_start
            && (today < nearest || (today == nearest && now.hour() < SESSION_FLIP_HOUR));

        let mut state = self.state.write();
        if in_window && !state.active {
            state.active = true;
            state.started_on = Some(today);
            state.next_month = ContractFamily::ALL
                .iter()
                .filter_map(|family| {
                    contracts
                        .get(family)
                        .and_then(|list| Self::next_month_contract(list))
                        .map(|c| (*family, c))
                })
                .collect();

            info!(
                nearest_delivery = %nearest,
                next_month = ?state.next_month.values().map(|c| c.code.clone()).collect::<Vec<_>>(),
                "rollover window entered"
            );
            return RolloverTransition::Entered;
        }

        if !in_window && state.active {
            state.active = false;
            state.started_on = None;
            state.next_month.clear();

            let refresh_contracts = today >= nearest;
            info!(refresh_contracts, "rollover window exited");
            return RolloverTransition::Exited { refresh_contracts };
        }

        RolloverTransition::None
    }

    /// The contract new orders should target: the next-month snapshot while
    /// rolling over, otherwise R1 (fallback: earliest delivery).
    pub fn active_contract(&self, family: ContractFamily, list: &[Contract]) -> Option<Contract> {
        if let Some(next) = self.state.read().next_month.get(&family) {
            return Some(next.clone());
        }
        list.iter()
            .find(|c| c.is_r1)
            .or_else(|| list.first())
            .cloned()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn contract(code: &str, family: ContractFamily, delivery: NaiveDate, role: u8) -> Contract {
        Contract {
            code: code.to_string(),
            family,
            delivery_date: delivery,
            is_r1: role == 1,
            is_r2: role == 2,
        }
    }

    /// TXF with delivery on 2025-07-16 (third Wednesday).
    fn contracts() -> HashMap<ContractFamily, Vec<Contract>> {
        let mut map = HashMap::new();
        map.insert(
            ContractFamily::Txf,
            vec![
                contract("TXFG5", ContractFamily::Txf, d(2025, 7, 16), 1),
                contract("TXFH5", ContractFamily::Txf, d(2025, 8, 20), 2),
            ],
        );
        map.insert(
            ContractFamily::Mxf,
            vec![
                contract("MXFG5", ContractFamily::Mxf, d(2025, 7, 16), 1),
                contract("MXFH5", ContractFamily::Mxf, d(2025, 8, 20), 2),
            ],
        );
        map
    }

    #[test]
    fn window_opens_the_day_before_delivery() {
        let engine = RolloverEngine::new();
        let c = contracts();

        // Two days out: nothing.
        let t = d(2025, 7, 14).and_hms_opt(10, 0, 0).unwrap();
        assert_eq!(engine.evaluate(t, &c), RolloverTransition::None);
        assert!(!engine.is_active());

        // D−1 at 23:59: active, next-month snapshot taken.
        let t = d(2025, 7, 15).and_hms_opt(23, 59, 0).unwrap();
        assert_eq!(engine.evaluate(t, &c), RolloverTransition::Entered);
        assert!(engine.is_active());
        let list = &c[&ContractFamily::Txf];
        assert_eq!(
            engine.active_contract(ContractFamily::Txf, list).unwrap().code,
            "TXFH5"
        );

        // Re-evaluating inside the window is not a new transition.
        assert_eq!(engine.evaluate(t, &c), RolloverTransition::None);
    }

    #[test]
    fn window_closes_at_delivery_day_session_flip() {
        let engine = RolloverEngine::new();
        let c = contracts();

        let t = d(2025, 7, 16).and_hms_opt(14, 59, 59).unwrap();
        assert_eq!(engine.evaluate(t, &c), RolloverTransition::Entered);

        // 15:00:01 on delivery day: window over, contracts must refresh.
        let t = d(2025, 7, 16).and_hms_opt(15, 0, 1).unwrap();
        assert_eq!(
            engine.evaluate(t, &c),
            RolloverTransition::Exited { refresh_contracts: true }
        );
        assert!(!engine.is_active());

        // Back to R1 selection.
        let list = &c[&ContractFamily::Txf];
        assert_eq!(
            engine.active_contract(ContractFamily::Txf, list).unwrap().code,
            "TXFG5"
        );
    }

    #[test]
    fn window_exit_without_refresh_when_delivery_moves_away() {
        let engine = RolloverEngine::new();
        let c = contracts();
        let t = d(2025, 7, 15).and_hms_opt(10, 0, 0).unwrap();
        assert_eq!(engine.evaluate(t, &c), RolloverTransition::Entered);

        // Contract list refreshed early; nearest delivery now ≥ 2 days out.
        let mut refreshed = HashMap::new();
        refreshed.insert(
            ContractFamily::Txf,
            vec![contract("TXFH5", ContractFamily::Txf, d(2025, 8, 20), 1)],
        );
        assert_eq!(
            engine.evaluate(t, &refreshed),
            RolloverTransition::Exited { refresh_contracts: false }
        );
    }

    #[test]
    fn next_month_falls_back_to_second_earliest() {
        let engine = RolloverEngine::new();
        let mut c = HashMap::new();
        // No R2 flag anywhere.
        c.insert(
            ContractFamily::Tmf,
            vec![
                contract("TMFG5", ContractFamily::Tmf, d(2025, 7, 16), 1),
                contract("TMFH5", ContractFamily::Tmf, d(2025, 8, 20), 0),
            ],
        );
        let t = d(2025, 7, 15).and_hms_opt(9, 0, 0).unwrap();
        assert_eq!(engine.evaluate(t, &c), RolloverTransition::Entered);
        assert_eq!(
            engine
                .active_contract(ContractFamily::Tmf, &c[&ContractFamily::Tmf])
                .unwrap()
                .code,
            "TMFH5"
        );
    }
}
