// =============================================================================
// TX broker adapter — REST gateway client + order-event stream
// =============================================================================
//
// The production broker ships a vendor SDK; this adapter talks to its gateway
// over a narrow REST surface plus one WebSocket pushing order events (the
// Rust rendition of the SDK's order callback). Session state is a bearer
// token held for 12 hours — the supervisor forces a re-login before expiry.
//
// Business responses carry `op_code` / `op_msg`; `op_code == "00"` is
// success, `C*` codes are certificate failures, anything else is a broker
// business rejection.
// =============================================================================

use std::sync::Arc;

use chrono::NaiveDate;
use futures_util::StreamExt;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::brokers::{
    transport_error, AccountSnapshot, BrokerAdapter, EventQueue, OrderAck, OrderEvent,
    OrderEventKind, Position,
};
use crate::config::TxSettings;
use crate::error::{CoreError, CoreResult};
use crate::types::{Contract, ContractFamily, Market, OcType, PriceType, Side, TimePolicy};

/// Order placement request, gateway-native field names.
#[derive(Debug, Clone)]
pub struct TxOrderRequest {
    pub contract: Contract,
    pub side: Side,
    pub quantity: i64,
    pub oc: OcType,
    pub price_type: PriceType,
    pub time_policy: TimePolicy,
    pub limit_price: f64,
}

/// TX gateway REST client.
pub struct TxClient {
    settings: TxSettings,
    client: reqwest::Client,
    /// Bearer token from the last successful login.
    session_token: RwLock<Option<String>>,
}

impl TxClient {
    pub fn new(settings: TxSettings) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!(gateway = %settings.gateway_url, "TxClient initialised");
        Self {
            settings,
            client,
            session_token: RwLock::new(None),
        }
    }

    pub fn settings(&self) -> &TxSettings {
        &self.settings
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.settings.gateway_url, path)
    }

    fn bearer(&self) -> String {
        self.session_token.read().clone().unwrap_or_default()
    }

    /// POST a JSON body to a gateway endpoint and apply the op-code
    /// convention to the response.
    async fn post_checked(&self, path: &str, body: Value) -> CoreResult<Value> {
        let resp = self
            .client
            .post(self.url(path))
            .bearer_auth(self.bearer())
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(path, e))?;

        Self::check_business(path, resp).await
    }

    async fn get_checked(&self, path: &str) -> CoreResult<Value> {
        let resp = self
            .client
            .get(self.url(path))
            .bearer_auth(self.bearer())
            .send()
            .await
            .map_err(|e| transport_error(path, e))?;

        Self::check_business(path, resp).await
    }

    async fn check_business(path: &str, resp: reqwest::Response) -> CoreResult<Value> {
        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| CoreError::Network(format!("{path}: malformed response: {e}")))?;

        if status.as_u16() == 401 {
            return Err(CoreError::AuthFailed(format!("{path}: session rejected")));
        }
        if !status.is_success() {
            return Err(CoreError::Network(format!("{path}: HTTP {status}: {body}")));
        }

        let op_code = body.get("op_code").and_then(Value::as_str).unwrap_or("00");
        if op_code != "00" {
            let message = body
                .get("op_msg")
                .and_then(Value::as_str)
                .unwrap_or("unknown broker error")
                .to_string();
            if op_code.starts_with('C') {
                return Err(CoreError::CertificateInvalid(message));
            }
            return Err(CoreError::BrokerBusiness {
                code: op_code.to_string(),
                message,
            });
        }
        Ok(body)
    }

    // -------------------------------------------------------------------------
    // Contracts
    // -------------------------------------------------------------------------

    /// List the contracts of one family, sorted by delivery date. The gateway
    /// marks the current month R1 and the next month R2.
    pub async fn list_contracts(&self, family: ContractFamily) -> CoreResult<Vec<Contract>> {
        let body = self
            .get_checked(&format!("/v1/contracts?family={}", family.code()))
            .await?;

        let raw = body
            .get("contracts")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut contracts = Vec::with_capacity(raw.len());
        for entry in &raw {
            let Some(code) = entry.get("code").and_then(Value::as_str) else {
                continue;
            };
            let Some(delivery) = entry
                .get("delivery_date")
                .and_then(Value::as_str)
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y/%m/%d").ok())
            else {
                warn!(code, "contract entry without parseable delivery date — skipped");
                continue;
            };
            let role = entry.get("role").and_then(Value::as_str).unwrap_or("");
            contracts.push(Contract {
                code: code.to_string(),
                family,
                delivery_date: delivery,
                is_r1: role == "R1",
                is_r2: role == "R2",
            });
        }

        contracts.sort_by_key(|c| c.delivery_date);
        debug!(family = %family, count = contracts.len(), "contracts listed");
        Ok(contracts)
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// Submit an order; the gateway assigns the order id synchronously.
    pub async fn place_order(&self, request: &TxOrderRequest) -> CoreResult<OrderAck> {
        let body = serde_json::json!({
            "code": request.contract.code,
            "side": request.side.wire(),
            "quantity": request.quantity,
            "oc": request.oc.to_string(),
            "price_type": request.price_type.to_string(),
            "order_type": request.time_policy.to_string(),
            "limit_price": request.limit_price,
        });

        debug!(
            code = %request.contract.code,
            side = %request.side,
            quantity = request.quantity,
            oc = %request.oc,
            "placing TX order"
        );

        let resp = self.post_checked("/v1/order", body).await?;
        let order_id = resp
            .get("order_id")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::Network("/v1/order: response missing order_id".into()))?
            .to_string();

        info!(order_id = %order_id, code = %request.contract.code, "TX order placed");
        Ok(OrderAck { order_id })
    }

    pub async fn cancel_order(&self, order_id: &str) -> CoreResult<()> {
        let resp = self
            .client
            .delete(self.url(&format!("/v1/order/{order_id}")))
            .bearer_auth(self.bearer())
            .send()
            .await
            .map_err(|e| transport_error("/v1/order", e))?;
        Self::check_business("/v1/order", resp).await?;
        info!(order_id, "TX order cancelled");
        Ok(())
    }
}

// =============================================================================
// BrokerAdapter
// =============================================================================

#[async_trait::async_trait]
impl BrokerAdapter for TxClient {
    fn market(&self) -> Market {
        Market::Tx
    }

    /// Login then activate the signing certificate. The two failure classes
    /// are kept distinct so the operator notification names the real problem.
    async fn login(&self) -> CoreResult<()> {
        let body = serde_json::json!({
            "api_key": self.settings.api_key,
            "secret_key": self.settings.secret_key,
            "person_id": self.settings.person_id,
        });

        let resp = self
            .client
            .post(self.url("/v1/login"))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("/v1/login", e))?;

        let status = resp.status();
        let payload: Value = resp
            .json()
            .await
            .map_err(|e| CoreError::Network(format!("/v1/login: malformed response: {e}")))?;

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(CoreError::AuthFailed(
                payload
                    .get("op_msg")
                    .and_then(Value::as_str)
                    .unwrap_or("credentials rejected")
                    .to_string(),
            ));
        }
        if !status.is_success() {
            return Err(CoreError::Network(format!("/v1/login: HTTP {status}")));
        }

        let token = payload
            .get("token")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::AuthFailed("/v1/login: no session token".into()))?;
        *self.session_token.write() = Some(token.to_string());

        // Certificate activation rides on the fresh session.
        self.post_checked(
            "/v1/ca/activate",
            serde_json::json!({
                "person_id": self.settings.person_id,
                "ca_path": self.settings.ca_path,
                "ca_password": self.settings.ca_password,
            }),
        )
        .await?;

        info!("TX login + certificate activation complete");
        Ok(())
    }

    async fn logout(&self) {
        if self.session_token.read().is_none() {
            return;
        }
        if let Err(e) = self.post_checked("/v1/logout", Value::Null).await {
            debug!(error = %e, "TX logout failed (ignored)");
        }
        *self.session_token.write() = None;
        info!("TX logged out");
    }

    async fn probe(&self) -> bool {
        self.get_checked("/v1/account").await.is_ok()
    }

    async fn list_positions(&self) -> CoreResult<Vec<Position>> {
        let body = self.get_checked("/v1/positions").await?;
        let raw = body
            .get("positions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut positions = Vec::with_capacity(raw.len());
        for entry in &raw {
            let Some(code) = entry.get("code").and_then(Value::as_str) else {
                continue;
            };
            let direction = match entry.get("direction").and_then(Value::as_str) {
                Some("Buy") | Some("BUY") => Side::Buy,
                Some("Sell") | Some("SELL") => Side::Sell,
                _ => continue,
            };
            positions.push(Position {
                code: code.to_string(),
                family: ContractFamily::from_code(code),
                direction,
                quantity: entry.get("quantity").and_then(Value::as_f64).unwrap_or(0.0),
                entry_price: entry
                    .get("entry_price")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0),
                mark_price: entry.get("mark_price").and_then(Value::as_f64).unwrap_or(0.0),
                unrealized_pnl: entry.get("pnl").and_then(Value::as_f64).unwrap_or(0.0),
                liquidation_price: None,
                leverage: 0,
                margin_type: String::new(),
            });
        }
        Ok(positions)
    }

    async fn account_snapshot(&self) -> CoreResult<AccountSnapshot> {
        let body = self.get_checked("/v1/account").await?;
        let f = |key: &str| body.get(key).and_then(Value::as_f64).unwrap_or(0.0);
        Ok(AccountSnapshot {
            wallet_balance: f("wallet_balance"),
            available: f("available"),
            margin_balance: f("margin_balance"),
            unrealized_pnl: f("unrealized_pnl"),
            initial_margin: f("initial_margin"),
            maintenance_margin: f("maintenance_margin"),
            fees_today: f("fees_today"),
            realized_pnl_today: f("realized_pnl_today"),
            realized_pnl_7d: f("realized_pnl_7d"),
            realized_pnl_30d: f("realized_pnl_30d"),
        })
    }

    async fn server_time(&self) -> CoreResult<i64> {
        let body = self.get_checked("/v1/time").await?;
        body.get("server_time")
            .and_then(Value::as_i64)
            .ok_or_else(|| CoreError::Network("/v1/time: missing server_time".into()))
    }
}

// =============================================================================
// Order-event stream
// =============================================================================

/// Connect to the gateway's order-event WebSocket and push each frame into
/// the lifecycle queue. Returns on disconnect so the caller can reconnect.
pub async fn run_event_stream(client: Arc<TxClient>, queue: Arc<EventQueue>) -> anyhow::Result<()> {
    let ws_url = format!(
        "{}/v1/stream?token={}",
        client.settings.gateway_url.replacen("http", "ws", 1),
        client.bearer()
    );
    info!("connecting to TX order-event stream");

    let (ws_stream, _response) = tokio_tungstenite::connect_async(&ws_url).await?;
    info!("TX order-event stream connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                match parse_event_frame(&text) {
                    Ok(Some(event)) => queue.push(event),
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "failed to parse TX event frame"),
                }
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(error = %e, "TX event stream read error");
                return Err(e.into());
            }
            None => {
                warn!("TX event stream ended");
                return Ok(());
            }
        }
    }
}

/// Map a gateway event frame onto the lifecycle model. `FuturesDeal` with
/// non-zero quantity is a fill; `FuturesOrder` carries status transitions.
fn parse_event_frame(text: &str) -> anyhow::Result<Option<OrderEvent>> {
    let root: Value = serde_json::from_str(text)?;
    let Some(event_name) = root.get("event").and_then(Value::as_str) else {
        return Ok(None);
    };
    let Some(order_id) = root.get("order_id").and_then(Value::as_str) else {
        return Ok(None);
    };
    let order_id = order_id.to_string();

    let kind = match event_name {
        "OrderSubmitted" => OrderEventKind::Submitted,
        "FuturesDeal" => {
            let quantity = root.get("quantity").and_then(Value::as_f64).unwrap_or(0.0);
            if quantity <= 0.0 {
                return Ok(None);
            }
            OrderEventKind::Filled {
                price: root.get("price").and_then(Value::as_f64).unwrap_or(0.0),
                quantity,
            }
        }
        "FuturesOrder" => {
            let op_code = root
                .get("op_code")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            match root.get("status").and_then(Value::as_str) {
                Some("Cancelled") => OrderEventKind::Cancelled { reason_code: op_code },
                Some("Failed") | Some("Rejected") => {
                    OrderEventKind::Rejected { reason_code: op_code }
                }
                Some("Expired") => OrderEventKind::Expired,
                _ => OrderEventKind::Submitted,
            }
        }
        _ => return Ok(None),
    };

    Ok(Some(OrderEvent {
        market: Market::Tx,
        order_id,
        kind,
        raw: root,
    }))
}
