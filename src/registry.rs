// =============================================================================
// Order Registry — order-id → submission metadata, mirrored to disk
// =============================================================================
//
// Every successful placement inserts; every terminal lifecycle event removes
// after the journal write completes. The map is rewritten to
// `order_mapping.json` after each mutation so broker callbacks arriving
// after a restart can still be interpreted.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Local;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::journal::{EntryKind, TradeJournal};
use crate::types::{ContractFamily, Direction, Market, OcType, PriceType, TimePolicy};

/// Submission metadata kept for the lifetime of a live order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderMeta {
    pub market: Market,
    pub oc: OcType,
    pub direction: Direction,
    #[serde(default)]
    pub family: Option<ContractFamily>,
    /// Contract code (TX) or symbol (BTC).
    pub code: String,
    pub quantity: f64,
    pub price_type: PriceType,
    pub time_policy: TimePolicy,
    #[serde(default)]
    pub is_manual: bool,
    /// Local wall-clock, `YYYY-MM-DD HH:MM:SS`.
    pub submitted_at: String,
}

impl OrderMeta {
    pub fn now_timestamp() -> String {
        Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
    }
}

/// Concurrent order-id → metadata map with a disk mirror.
pub struct OrderRegistry {
    path: PathBuf,
    inner: Mutex<HashMap<String, OrderMeta>>,
}

impl OrderRegistry {
    /// Load the mirror from `path`; a missing file starts empty, an
    /// unparseable one is discarded with a warning (orders will be
    /// reconstructed from the journal as callbacks arrive).
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let map = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<HashMap<String, OrderMeta>>(&content) {
                Ok(map) => {
                    info!(path = %path.display(), orders = map.len(), "order registry loaded");
                    map
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "order registry unparseable — starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Self {
            path,
            inner: Mutex::new(map),
        }
    }

    fn persist_locked(&self, map: &HashMap<String, OrderMeta>) {
        match serde_json::to_string_pretty(map) {
            Ok(content) => {
                let tmp = self.path.with_extension("json.tmp");
                let write =
                    std::fs::write(&tmp, content).and_then(|_| std::fs::rename(&tmp, &self.path));
                if let Err(e) = write {
                    error!(path = %self.path.display(), error = %e, "order registry persist failed");
                }
            }
            Err(e) => error!(error = %e, "order registry serialization failed"),
        }
    }

    pub fn insert(&self, order_id: impl Into<String>, meta: OrderMeta) {
        let order_id = order_id.into();
        let mut map = self.inner.lock();
        map.insert(order_id, meta);
        self.persist_locked(&map);
    }

    /// Remove and return the metadata; a miss means the order was already
    /// finalized elsewhere (idempotent late callbacks).
    pub fn remove(&self, order_id: &str) -> Option<OrderMeta> {
        let mut map = self.inner.lock();
        let meta = map.remove(order_id);
        if meta.is_some() {
            self.persist_locked(&map);
        }
        meta
    }

    pub fn get(&self, order_id: &str) -> Option<OrderMeta> {
        self.inner.lock().get(order_id).cloned()
    }

    pub fn contains(&self, order_id: &str) -> bool {
        self.inner.lock().contains_key(order_id)
    }

    /// Live order ids for one market (polling fallback input).
    pub fn live_orders(&self, market: Market) -> Vec<(String, OrderMeta)> {
        self.inner
            .lock()
            .iter()
            .filter(|(_, meta)| meta.market == market)
            .map(|(id, meta)| (id.clone(), meta.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Force a persist (shutdown path).
    pub fn persist(&self) {
        let map = self.inner.lock();
        self.persist_locked(&map);
    }

    /// Drop entries whose terminal state is already journaled for today —
    /// deals, cancels, and fails that landed while the process was down.
    pub fn prune_terminal(&self, journal: &TradeJournal) {
        let today = Local::now().date_naive();
        let terminal_ids: Vec<String> = journal
            .entries_for_date(today)
            .into_iter()
            .filter(|e| {
                matches!(
                    e.kind,
                    EntryKind::Deal | EntryKind::Cancel | EntryKind::Fail
                )
            })
            .map(|e| e.order_id)
            .collect();

        if terminal_ids.is_empty() {
            return;
        }

        let mut map = self.inner.lock();
        let before = map.len();
        for id in &terminal_ids {
            map.remove(id);
        }
        if map.len() != before {
            info!(pruned = before - map.len(), "registry pruned from journal");
            self.persist_locked(&map);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "tvbridge-registry-{}-{}.json",
            std::process::id(),
            tag
        ))
    }

    fn meta(market: Market) -> OrderMeta {
        OrderMeta {
            market,
            oc: OcType::New,
            direction: Direction::OpenLong,
            family: Some(ContractFamily::Txf),
            code: "TXFG5".to_string(),
            quantity: 1.0,
            price_type: PriceType::Market,
            time_policy: TimePolicy::Ioc,
            is_manual: false,
            submitted_at: "2025-07-01 09:00:00".to_string(),
        }
    }

    #[test]
    fn insert_persist_reload() {
        let path = temp_path("roundtrip");
        std::fs::remove_file(&path).ok();

        let registry = OrderRegistry::load(&path);
        registry.insert("O1", meta(Market::Tx));
        registry.insert("B1", meta(Market::Btc));
        assert_eq!(registry.len(), 2);

        // A fresh load sees the mirror.
        let reloaded = OrderRegistry::load(&path);
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.get("O1").unwrap().code, "TXFG5");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn remove_is_idempotent() {
        let path = temp_path("remove");
        std::fs::remove_file(&path).ok();

        let registry = OrderRegistry::load(&path);
        registry.insert("O1", meta(Market::Tx));
        assert!(registry.remove("O1").is_some());
        assert!(registry.remove("O1").is_none());
        assert!(registry.is_empty());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn live_orders_filters_by_market() {
        let path = temp_path("live");
        std::fs::remove_file(&path).ok();

        let registry = OrderRegistry::load(&path);
        registry.insert("O1", meta(Market::Tx));
        registry.insert("B1", meta(Market::Btc));
        let btc = registry.live_orders(Market::Btc);
        assert_eq!(btc.len(), 1);
        assert_eq!(btc[0].0, "B1");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn prune_terminal_drops_journaled_orders() {
        let path = temp_path("prune");
        std::fs::remove_file(&path).ok();
        let dir = std::env::temp_dir().join(format!("tvbridge-registry-journal-{}", std::process::id()));
        std::fs::remove_dir_all(&dir).ok();

        let journal = TradeJournal::new(Market::Tx, &dir);
        let today = Local::now().date_naive();
        journal.append_on(
            today,
            crate::journal::JournalEntry {
                kind: EntryKind::Deal,
                order_id: "O1".to_string(),
                timestamp: OrderMeta::now_timestamp(),
                category: "auto".to_string(),
                raw: serde_json::Value::Null,
                resolved: crate::journal::ResolvedMeta {
                    market: Market::Tx,
                    code: "TXFG5".to_string(),
                    family: Some(ContractFamily::Txf),
                    direction: Some(Direction::OpenLong),
                    oc: OcType::New,
                    side: Side::Buy,
                    quantity: 1.0,
                    price: 22000.0,
                    is_manual: false,
                },
                reason: None,
            },
        );

        let registry = OrderRegistry::load(&path);
        registry.insert("O1", meta(Market::Tx));
        registry.insert("O2", meta(Market::Tx));
        registry.prune_terminal(&journal);
        assert!(registry.get("O1").is_none());
        assert!(registry.get("O2").is_some());

        std::fs::remove_file(&path).ok();
        std::fs::remove_dir_all(&dir).ok();
    }
}
