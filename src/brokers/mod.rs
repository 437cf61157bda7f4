// =============================================================================
// Broker adapters — the narrow surface the core depends on
// =============================================================================
//
// Each backend (TX gateway, Binance USDT-M) implements `BrokerAdapter` for
// the operations the supervisor and reporting need generically; order
// placement stays on the concrete clients because the request shapes differ
// per market. Vendor drift is absorbed inside the adapter modules — nothing
// above this layer sees a broker SDK type.
// =============================================================================

pub mod btc;
pub mod btc_stream;
pub mod tx;

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::warn;

use crate::error::{CoreError, CoreResult};
use crate::types::{ContractFamily, Market, Side};

// =============================================================================
// Broker-facing value types
// =============================================================================

/// Read-only position snapshot from a broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Contract code (TX) or symbol (BTC).
    pub code: String,
    #[serde(default)]
    pub family: Option<ContractFamily>,
    pub direction: Side,
    pub quantity: f64,
    pub entry_price: f64,
    #[serde(default)]
    pub mark_price: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
    #[serde(default)]
    pub liquidation_price: Option<f64>,
    #[serde(default)]
    pub leverage: u32,
    #[serde(default)]
    pub margin_type: String,
}

/// Account snapshot with multi-horizon realized PnL.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub wallet_balance: f64,
    pub available: f64,
    pub margin_balance: f64,
    pub unrealized_pnl: f64,
    pub initial_margin: f64,
    pub maintenance_margin: f64,
    pub fees_today: f64,
    pub realized_pnl_today: f64,
    pub realized_pnl_7d: f64,
    pub realized_pnl_30d: f64,
}

/// Broker acknowledgement of a placed order.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: String,
}

/// A lifecycle event from a broker push channel, user stream, or the polling
/// fallback.
#[derive(Debug, Clone)]
pub struct OrderEvent {
    pub market: Market,
    pub order_id: String,
    pub kind: OrderEventKind,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderEventKind {
    Submitted,
    /// BTC partial fill; coalesced by the lifecycle tracker.
    PartialFill { price: f64, quantity: f64 },
    /// Full fill. `price` is the broker's average fill price.
    Filled { price: f64, quantity: f64 },
    Cancelled { reason_code: String },
    Rejected { reason_code: String },
    Expired,
}

// =============================================================================
// Event queue
// =============================================================================

/// Default lifecycle queue capacity.
const EVENT_QUEUE_CAP: usize = 1024;

/// Bounded queue feeding the lifecycle tracker. When full, the oldest event
/// is dropped with a warning — operational safety over completeness.
pub struct EventQueue {
    inner: Mutex<VecDeque<OrderEvent>>,
    notify: Notify,
    capacity: usize,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::with_capacity(EVENT_QUEUE_CAP)
    }
}

impl EventQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            capacity,
        }
    }

    pub fn push(&self, event: OrderEvent) {
        {
            let mut queue = self.inner.lock();
            if queue.len() >= self.capacity {
                let dropped = queue.pop_front();
                warn!(
                    order_id = dropped.as_ref().map(|e| e.order_id.as_str()).unwrap_or(""),
                    "lifecycle queue full — dropping oldest event"
                );
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    /// Await the next event. Cancel-safe: a notify permit is retained across
    /// the wait when no event has arrived yet.
    pub async fn pop(&self) -> OrderEvent {
        loop {
            if let Some(event) = self.inner.lock().pop_front() {
                return event;
            }
            self.notify.notified().await;
        }
    }

    pub fn try_pop(&self) -> Option<OrderEvent> {
        self.inner.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

// =============================================================================
// Adapter trait
// =============================================================================

/// The generic operations the supervisor, scheduler, and report builder need
/// from either backend.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    fn market(&self) -> Market;

    /// Blocking login; `AuthFailed` / `CertificateInvalid` / `Network`.
    async fn login(&self) -> CoreResult<()>;

    /// Idempotent, best-effort.
    async fn logout(&self);

    /// Cheap health probe (account snapshot or ping).
    async fn probe(&self) -> bool;

    async fn list_positions(&self) -> CoreResult<Vec<Position>>;

    async fn account_snapshot(&self) -> CoreResult<AccountSnapshot>;

    /// Broker server time, milliseconds UTC.
    async fn server_time(&self) -> CoreResult<i64>;
}

// =============================================================================
// Retry helper
// =============================================================================

/// Retry a transient-failure-prone operation with 2 s / 4 s backoff, capped
/// at three attempts. Business errors surface immediately.
pub async fn with_backoff<T, F, Fut>(op_name: &str, mut op: F) -> CoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = CoreResult<T>>,
{
    const MAX_ATTEMPTS: u32 = 3;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                let wait_secs = 2 * attempt as u64;
                warn!(op = op_name, attempt, wait_secs, error = %e, "transient failure — retrying");
                tokio::time::sleep(std::time::Duration::from_secs(wait_secs)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Map a reqwest transport error into the core taxonomy.
pub fn transport_error(context: &str, e: reqwest::Error) -> CoreError {
    CoreError::Network(format!("{context}: {e}"))
}
