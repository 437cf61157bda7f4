// =============================================================================
// Central Application State — TVBridge gateway
// =============================================================================
//
// The single source of truth for the process. Broker clients are process-wide
// singletons owned here; every subsystem receives `Arc<Core>` and reads
// through per-resource locks. Supervisors capture references but never own
// the context.
//
// Thread safety:
//   - parking_lot locks per resource class (registry, rollover, contracts,
//     connection state).
//   - The lifecycle queue and the mark-price watch channel carry cross-task
//     data flow.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::info;

use crate::brokers::btc::BtcClient;
use crate::brokers::tx::TxClient;
use crate::brokers::EventQueue;
use crate::config::calendar::TradingCalendar;
use crate::config::ServerSettings;
use crate::error::CoreResult;
use crate::journal::TradeJournal;
use crate::notifier::Notifier;
use crate::pipeline::DedupWindow;
use crate::registry::OrderRegistry;
use crate::rollover::RolloverEngine;
use crate::types::{Contract, ContractFamily, Market};

/// Per-market connection bookkeeping, maintained by the supervisor and read
/// by the health endpoint.
#[derive(Debug, Clone, Default)]
pub struct ConnState {
    pub logged_in: bool,
    pub last_probe_at: Option<Instant>,
    pub reconnect_attempts: u32,
    pub reconnecting: bool,
    pub session_started_at: Option<Instant>,
}

/// Central context shared across all async tasks via `Arc<Core>`.
pub struct Core {
    pub server: ServerSettings,
    pub calendar: TradingCalendar,

    // ── Broker clients (process-wide singletons) ────────────────────────
    pub tx_client: Arc<TxClient>,
    pub btc_client: Arc<BtcClient>,

    // ── Persistence ─────────────────────────────────────────────────────
    pub tx_journal: Arc<TradeJournal>,
    pub btc_journal: Arc<TradeJournal>,
    pub registry: Arc<OrderRegistry>,

    // ── Engines ─────────────────────────────────────────────────────────
    pub rollover: Arc<RolloverEngine>,
    pub dedup: DedupWindow,

    // ── Notification ────────────────────────────────────────────────────
    pub tx_notifier: Arc<Notifier>,
    pub btc_notifier: Arc<Notifier>,

    // ── Event flow ──────────────────────────────────────────────────────
    pub events: Arc<EventQueue>,
    /// Latest BTC mark price from the ticker stream (0.0 until first frame).
    pub mark_price: watch::Receiver<f64>,

    // ── Contract references (refreshed per session / rollover exit) ────
    pub tx_contracts: RwLock<HashMap<ContractFamily, Vec<Contract>>>,

    // ── Connection state ────────────────────────────────────────────────
    pub tx_conn: RwLock<ConnState>,
    pub btc_conn: RwLock<ConnState>,

    // ── Lifetime ────────────────────────────────────────────────────────
    pub shutdown: watch::Receiver<bool>,
    pub start_time: Instant,
}

impl Core {
    pub fn journal(&self, market: Market) -> &Arc<TradeJournal> {
        match market {
            Market::Tx => &self.tx_journal,
            Market::Btc => &self.btc_journal,
        }
    }

    pub fn notifier(&self, market: Market) -> &Arc<Notifier> {
        match market {
            Market::Tx => &self.tx_notifier,
            Market::Btc => &self.btc_notifier,
        }
    }

    pub fn conn(&self, market: Market) -> &RwLock<ConnState> {
        match market {
            Market::Tx => &self.tx_conn,
            Market::Btc => &self.btc_conn,
        }
    }

    /// Re-fetch the contract lists for every family. Called on session start
    /// and when the rollover engine invalidates current references.
    pub async fn refresh_tx_contracts(&self) -> CoreResult<()> {
        let mut fresh = HashMap::new();
        for family in ContractFamily::ALL {
            let contracts = self.tx_client.list_contracts(family).await?;
            fresh.insert(family, contracts);
        }

        let total: usize = fresh.values().map(Vec::len).sum();
        *self.tx_contracts.write() = fresh;
        info!(total, "TX contract references refreshed");
        Ok(())
    }

    /// Snapshot of the current contract lists.
    pub fn contracts_snapshot(&self) -> HashMap<ContractFamily, Vec<Contract>> {
        self.tx_contracts.read().clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

// =============================================================================
// Test fixture
// =============================================================================
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::config::{BtcSettings, EnvFile, TxSettings};
    use crate::notifier::Notifier;

    /// Channel ends that must outlive the fixture `Core`.
    pub struct FixtureHandles {
        pub shutdown_tx: watch::Sender<bool>,
        pub mark_price_tx: watch::Sender<f64>,
        pub temp_dir: std::path::PathBuf,
    }

    impl Drop for FixtureHandles {
        fn drop(&mut self) {
            std::fs::remove_dir_all(&self.temp_dir).ok();
        }
    }

    /// A fully offline `Core`: unconfigured notifiers, temp-dir journals and
    /// registry, empty calendar. No constructor here performs I/O beyond
    /// temp-dir creation.
    pub fn core_fixture(tag: &str) -> (Arc<Core>, FixtureHandles) {
        let temp_dir =
            std::env::temp_dir().join(format!("tvbridge-core-{}-{tag}", std::process::id()));
        std::fs::remove_dir_all(&temp_dir).ok();
        std::fs::create_dir_all(&temp_dir).unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (mark_price_tx, mark_price_rx) = watch::channel(0.0);

        let tx_settings = TxSettings::from_env(&EnvFile::empty("tx.env"));
        let btc_settings = BtcSettings::from_env(&EnvFile::empty("btc.env"));

        let core = Arc::new(Core {
            server: ServerSettings::default(),
            calendar: TradingCalendar::default(),
            tx_client: Arc::new(TxClient::new(tx_settings.clone())),
            btc_client: Arc::new(BtcClient::new(btc_settings.clone())),
            tx_journal: Arc::new(TradeJournal::new(Market::Tx, temp_dir.join("TXtransdata"))),
            btc_journal: Arc::new(TradeJournal::new(Market::Btc, temp_dir.join("BTCtransdata"))),
            registry: Arc::new(OrderRegistry::load(temp_dir.join("order_mapping.json"))),
            rollover: Arc::new(RolloverEngine::new()),
            dedup: DedupWindow::default(),
            tx_notifier: Arc::new(Notifier::new(tx_settings.telegram)),
            btc_notifier: Arc::new(Notifier::new(btc_settings.telegram)),
            events: Arc::new(EventQueue::default()),
            mark_price: mark_price_rx,
            tx_contracts: RwLock::new(HashMap::new()),
            tx_conn: RwLock::new(ConnState::default()),
            btc_conn: RwLock::new(ConnState::default()),
            shutdown: shutdown_rx,
            start_time: Instant::now(),
        });

        (
            core,
            FixtureHandles {
                shutdown_tx,
                mark_price_tx,
                temp_dir,
            },
        )
    }
}
