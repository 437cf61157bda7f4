// =============================================================================
// BTC broker adapter — Binance USDT-M futures, HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. All signed requests
// carry X-MBX-APIKEY as a header and a recvWindow of 5 000 ms.
//
// Signed timestamps use the cached broker-server clock offset; until the
// first successful time sync the local clock minus a 1 s safety margin is
// used instead.
// =============================================================================

use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::brokers::{
    transport_error, AccountSnapshot, BrokerAdapter, OrderAck, Position,
};
use crate::config::BtcSettings;
use crate::error::{CoreError, CoreResult};
use crate::types::{Market, OrderState, PriceType, Side};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;
/// Safety margin applied when no server-time sync has happened yet.
const CLOCK_SAFETY_MS: i64 = 1000;

/// Minimum order lot; quantities are floored to this step.
pub const MIN_LOT: f64 = 0.001;

/// Status + fill info from an order query (polling fallback).
#[derive(Debug, Clone)]
pub struct BtcOrderStatus {
    pub state: OrderState,
    pub avg_price: f64,
    pub executed_qty: f64,
}

/// Binance USDT-M REST client.
pub struct BtcClient {
    settings: BtcSettings,
    base_url: String,
    client: reqwest::Client,
    /// serverTime − localTime from the last sync.
    clock_offset_ms: RwLock<Option<i64>>,
    listen_key: RwLock<Option<String>>,
}

impl BtcClient {
    pub fn new(settings: BtcSettings) -> Self {
        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&settings.api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!("BtcClient initialised (base_url=https://fapi.binance.com)");
        Self {
            settings,
            base_url: "https://fapi.binance.com".to_string(),
            client,
            clock_offset_ms: RwLock::new(None),
            listen_key: RwLock::new(None),
        }
    }

    pub fn settings(&self) -> &BtcSettings {
        &self.settings
    }

    pub fn symbol(&self) -> &str {
        &self.settings.symbol
    }

    pub fn listen_key(&self) -> Option<String> {
        self.listen_key.read().clone()
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.settings.secret_key.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn local_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as i64
    }

    /// Timestamp for signed requests: broker clock when synced, otherwise
    /// local minus the safety margin.
    fn timestamp_ms(&self) -> i64 {
        match *self.clock_offset_ms.read() {
            Some(offset) => Self::local_ms() + offset,
            None => Self::local_ms() - CLOCK_SAFETY_MS,
        }
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = self.timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    /// Map a non-success response to the core taxonomy. Binance business
    /// errors come back as `{code, msg}` with negative codes; the key-level
    /// rejections are authentication failures, everything else is a business
    /// error.
    async fn check(path: &str, resp: reqwest::Response) -> CoreResult<Value> {
        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| CoreError::Network(format!("{path}: malformed response: {e}")))?;

        if status.is_success() {
            return Ok(body);
        }

        let code = body.get("code").and_then(Value::as_i64).unwrap_or(0);
        let msg = body
            .get("msg")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();

        match code {
            -2014 | -2015 | -1022 => Err(CoreError::AuthFailed(msg)),
            0 => Err(CoreError::Network(format!("{path}: HTTP {status}: {body}"))),
            _ => Err(CoreError::BrokerBusiness {
                code: code.to_string(),
                message: msg,
            }),
        }
    }

    async fn signed_get(&self, path: &str, params: &str) -> CoreResult<Value> {
        let url = format!("{}{}?{}", self.base_url, path, self.signed_query(params));
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| transport_error(path, e))?;
        Self::check(path, resp).await
    }

    async fn signed_send(&self, method: reqwest::Method, path: &str, params: &str) -> CoreResult<Value> {
        let url = format!("{}{}?{}", self.base_url, path, self.signed_query(params));
        let resp = self
            .client
            .request(method, &url)
            .send()
            .await
            .map_err(|e| transport_error(path, e))?;
        Self::check(path, resp).await
    }

    fn parse_str_f64(value: &Value) -> f64 {
        match value {
            Value::String(s) => s.parse().unwrap_or(0.0),
            Value::Number(n) => n.as_f64().unwrap_or(0.0),
            _ => 0.0,
        }
    }

    // -------------------------------------------------------------------------
    // Time sync
    // -------------------------------------------------------------------------

    /// GET /fapi/v1/time and cache the clock offset for signing.
    pub async fn sync_server_time(&self) -> CoreResult<i64> {
        let url = format!("{}/fapi/v1/time", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| transport_error("/fapi/v1/time", e))?;
        let body = Self::check("/fapi/v1/time", resp).await?;

        let server_time = body
            .get("serverTime")
            .and_then(Value::as_i64)
            .ok_or_else(|| CoreError::Network("/fapi/v1/time: missing serverTime".into()))?;
        *self.clock_offset_ms.write() = Some(server_time - Self::local_ms());
        Ok(server_time)
    }

    // -------------------------------------------------------------------------
    // Listen key (user-data stream)
    // -------------------------------------------------------------------------

    /// POST /fapi/v1/listenKey — create or refresh the user-data stream key.
    pub async fn create_listen_key(&self) -> CoreResult<String> {
        let url = format!("{}/fapi/v1/listenKey", self.base_url);
        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| transport_error("/fapi/v1/listenKey", e))?;
        let body = Self::check("/fapi/v1/listenKey", resp).await?;

        let key = body
            .get("listenKey")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::Network("/fapi/v1/listenKey: missing listenKey".into()))?
            .to_string();
        *self.listen_key.write() = Some(key.clone());
        debug!("listen key created");
        Ok(key)
    }

    /// PUT /fapi/v1/listenKey — keepalive (required every 60 min; sent every 30).
    pub async fn keepalive_listen_key(&self) -> CoreResult<()> {
        let url = format!("{}/fapi/v1/listenKey", self.base_url);
        let resp = self
            .client
            .put(&url)
            .send()
            .await
            .map_err(|e| transport_error("/fapi/v1/listenKey", e))?;
        Self::check("/fapi/v1/listenKey", resp).await?;
        debug!("listen key keepalive sent");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Market data
    // -------------------------------------------------------------------------

    /// GET /fapi/v1/premiumIndex — current mark price.
    pub async fn mark_price(&self) -> CoreResult<f64> {
        let url = format!(
            "{}/fapi/v1/premiumIndex?symbol={}",
            self.base_url, self.settings.symbol
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| transport_error("/fapi/v1/premiumIndex", e))?;
        let body = Self::check("/fapi/v1/premiumIndex", resp).await?;
        Ok(Self::parse_str_f64(body.get("markPrice").unwrap_or(&Value::Null)))
    }

    /// USDT available balance from /fapi/v2/balance — the cheap input to
    /// risk sizing (the full account snapshot hits the income endpoint).
    pub async fn available_balance(&self) -> CoreResult<f64> {
        let body = self.signed_get("/fapi/v2/balance", "").await?;
        let available = body
            .as_array()
            .and_then(|rows| {
                rows.iter()
                    .find(|row| row.get("asset").and_then(Value::as_str) == Some("USDT"))
            })
            .map(|row| Self::parse_str_f64(row.get("availableBalance").unwrap_or(&Value::Null)))
            .unwrap_or(0.0);
        Ok(available)
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// POST /fapi/v1/order. Webhook orders are MARKET; `reduce_only` marks
    /// cover orders so they can never flip the position.
    pub async fn place_order(
        &self,
        side: Side,
        quantity: f64,
        reduce_only: bool,
        price_type: PriceType,
        limit_price: f64,
    ) -> CoreResult<OrderAck> {
        let mut params = format!(
            "symbol={}&side={}&quantity={quantity}",
            self.settings.symbol,
            side.wire()
        );
        match price_type {
            PriceType::Market => params.push_str("&type=MARKET"),
            PriceType::Limit => {
                params.push_str(&format!("&type=LIMIT&timeInForce=IOC&price={limit_price}"))
            }
        }
        if reduce_only {
            params.push_str("&reduceOnly=true");
        }

        debug!(
            symbol = %self.settings.symbol,
            side = %side,
            quantity,
            reduce_only,
            "placing BTC order"
        );

        let body = self
            .signed_send(reqwest::Method::POST, "/fapi/v1/order", &params)
            .await?;
        let order_id = body
            .get("orderId")
            .and_then(Value::as_i64)
            .ok_or_else(|| CoreError::Network("/fapi/v1/order: missing orderId".into()))?;

        info!(order_id, symbol = %self.settings.symbol, "BTC order placed");
        Ok(OrderAck {
            order_id: order_id.to_string(),
        })
    }

    pub async fn cancel_order(&self, order_id: &str) -> CoreResult<()> {
        let params = format!("symbol={}&orderId={order_id}", self.settings.symbol);
        self.signed_send(reqwest::Method::DELETE, "/fapi/v1/order", &params)
            .await?;
        info!(order_id, "BTC order cancelled");
        Ok(())
    }

    /// GET /fapi/v1/order — used by the polling fallback to detect orders
    /// whose terminal event was missed on the user stream.
    pub async fn query_order(&self, order_id: &str) -> CoreResult<BtcOrderStatus> {
        let params = format!("symbol={}&orderId={order_id}", self.settings.symbol);
        let body = self.signed_get("/fapi/v1/order", &params).await?;

        let state = match body.get("status").and_then(Value::as_str) {
            Some("NEW") | Some("PARTIALLY_FILLED") => OrderState::Submitted,
            Some("FILLED") => OrderState::Filled,
            Some("CANCELED") => OrderState::Cancelled,
            Some("REJECTED") => OrderState::Rejected,
            Some("EXPIRED") | Some("EXPIRED_IN_MATCH") => OrderState::Expired,
            other => {
                warn!(status = ?other, order_id, "unknown order status — treating as submitted");
                OrderState::Submitted
            }
        };

        Ok(BtcOrderStatus {
            state,
            avg_price: Self::parse_str_f64(body.get("avgPrice").unwrap_or(&Value::Null)),
            executed_qty: Self::parse_str_f64(body.get("executedQty").unwrap_or(&Value::Null)),
        })
    }

    // -------------------------------------------------------------------------
    // Income (authoritative realized-PnL source)
    // -------------------------------------------------------------------------

    /// Sum /fapi/v1/income over `[start_ms, now]` for one income type.
    async fn income_sum(&self, income_type: &str, start_ms: i64) -> CoreResult<f64> {
        let params = format!("incomeType={income_type}&startTime={start_ms}&limit=1000");
        let body = self.signed_get("/fapi/v1/income", &params).await?;
        let total = body
            .as_array()
            .map(|rows| {
                rows.iter()
                    .map(|row| Self::parse_str_f64(row.get("income").unwrap_or(&Value::Null)))
                    .sum()
            })
            .unwrap_or(0.0);
        Ok(total)
    }
}

// =============================================================================
// BrokerAdapter
// =============================================================================

#[async_trait::async_trait]
impl BrokerAdapter for BtcClient {
    fn market(&self) -> Market {
        Market::Btc
    }

    /// Sync the clock, apply margin mode + leverage, and open a listen key.
    /// Margin-type errors for "already set" are tolerated.
    async fn login(&self) -> CoreResult<()> {
        self.sync_server_time().await?;

        let params = format!(
            "symbol={}&marginType={}",
            self.settings.symbol, self.settings.margin_type
        );
        match self
            .signed_send(reqwest::Method::POST, "/fapi/v1/marginType", &params)
            .await
        {
            Ok(_) => {}
            // -4046: "No need to change margin type."
            Err(CoreError::BrokerBusiness { ref code, .. }) if code == "-4046" => {}
            Err(e) => return Err(e),
        }

        let params = format!(
            "symbol={}&leverage={}",
            self.settings.symbol, self.settings.leverage
        );
        self.signed_send(reqwest::Method::POST, "/fapi/v1/leverage", &params)
            .await?;

        self.create_listen_key().await?;

        info!(
            symbol = %self.settings.symbol,
            leverage = self.settings.leverage,
            margin_type = %self.settings.margin_type,
            "BTC login complete"
        );
        Ok(())
    }

    async fn logout(&self) {
        // Signed sessions are stateless; just drop the listen key.
        if self.listen_key.read().is_some() {
            let url = format!("{}/fapi/v1/listenKey", self.base_url);
            if let Err(e) = self.client.delete(&url).send().await {
                debug!(error = %e, "listen key close failed (ignored)");
            }
            *self.listen_key.write() = None;
        }
        info!("BTC logged out");
    }

    async fn probe(&self) -> bool {
        self.signed_get("/fapi/v2/balance", "").await.is_ok()
    }

    async fn list_positions(&self) -> CoreResult<Vec<Position>> {
        let params = format!("symbol={}", self.settings.symbol);
        let body = self.signed_get("/fapi/v2/positionRisk", &params).await?;
        let rows = body.as_array().cloned().unwrap_or_default();

        let mut positions = Vec::new();
        for row in &rows {
            let amount = Self::parse_str_f64(row.get("positionAmt").unwrap_or(&Value::Null));
            if amount == 0.0 {
                continue;
            }
            positions.push(Position {
                code: row
                    .get("symbol")
                    .and_then(Value::as_str)
                    .unwrap_or(&self.settings.symbol)
                    .to_string(),
                family: None,
                direction: if amount > 0.0 { Side::Buy } else { Side::Sell },
                quantity: amount.abs(),
                entry_price: Self::parse_str_f64(row.get("entryPrice").unwrap_or(&Value::Null)),
                mark_price: Self::parse_str_f64(row.get("markPrice").unwrap_or(&Value::Null)),
                unrealized_pnl: Self::parse_str_f64(
                    row.get("unRealizedProfit").unwrap_or(&Value::Null),
                ),
                liquidation_price: Some(Self::parse_str_f64(
                    row.get("liquidationPrice").unwrap_or(&Value::Null),
                )),
                leverage: Self::parse_str_f64(row.get("leverage").unwrap_or(&Value::Null)) as u32,
                margin_type: row
                    .get("marginType")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_uppercase(),
            });
        }
        Ok(positions)
    }

    /// GET /fapi/v2/account for balances and margins; the income endpoint
    /// supplies fees and the multi-horizon realized PnL.
    async fn account_snapshot(&self) -> CoreResult<AccountSnapshot> {
        let body = self.signed_get("/fapi/v2/account", "").await?;
        let f = |key: &str| Self::parse_str_f64(body.get(key).unwrap_or(&Value::Null));

        let now = Self::local_ms();
        let day_start = now - now % 86_400_000;
        let fees_today = self.income_sum("COMMISSION", day_start).await.unwrap_or(0.0);
        let realized_pnl_today = self
            .income_sum("REALIZED_PNL", day_start)
            .await
            .unwrap_or(0.0);
        let realized_pnl_7d = self
            .income_sum("REALIZED_PNL", now - 7 * 86_400_000)
            .await
            .unwrap_or(0.0);
        let realized_pnl_30d = self
            .income_sum("REALIZED_PNL", now - 30 * 86_400_000)
            .await
            .unwrap_or(0.0);

        Ok(AccountSnapshot {
            wallet_balance: f("totalWalletBalance"),
            available: f("availableBalance"),
            margin_balance: f("totalMarginBalance"),
            unrealized_pnl: f("totalUnrealizedProfit"),
            initial_margin: f("totalInitialMargin"),
            maintenance_margin: f("totalMaintMargin"),
            fees_today: fees_today.abs(),
            realized_pnl_today,
            realized_pnl_7d,
            realized_pnl_30d,
        })
    }

    async fn server_time(&self) -> CoreResult<i64> {
        self.sync_server_time().await
    }
}

impl std::fmt::Debug for BtcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtcClient")
            .field("symbol", &self.settings.symbol)
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Floor a risk-sized quantity to the minimum lot, with the lot itself as
/// the floor value. The epsilon keeps exact multiples (2.5 → 2500 lots)
/// from losing a lot to float representation.
pub fn floor_to_lot(quantity: f64) -> f64 {
    let floored = (quantity * 1000.0 + 1e-6).floor() / 1000.0;
    floored.max(MIN_LOT)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantity_floors_to_lot() {
        assert_eq!(floor_to_lot(0.123456), 0.123);
        assert_eq!(floor_to_lot(0.0009), MIN_LOT);
        assert_eq!(floor_to_lot(0.001), 0.001);
        assert_eq!(floor_to_lot(2.5), 2.5);
    }

    #[test]
    fn signing_is_deterministic_hmac_sha256() {
        let mut settings = BtcSettings::from_env(&crate::config::EnvFile::empty("btc.env"));
        settings.secret_key = "test-secret".into();
        let client = BtcClient::new(settings);

        // Known-answer: HMAC-SHA256("symbol=BTCUSDT", "test-secret").
        let sig = client.sign("symbol=BTCUSDT");
        assert_eq!(sig.len(), 64);
        assert_eq!(sig, client.sign("symbol=BTCUSDT"));
        assert_ne!(sig, client.sign("symbol=ETHUSDT"));
    }

    #[test]
    fn timestamp_applies_safety_margin_without_sync() {
        let settings = BtcSettings::from_env(&crate::config::EnvFile::empty("btc.env"));
        let client = BtcClient::new(settings);
        let local = BtcClient::local_ms();
        let ts = client.timestamp_ms();
        assert!(ts <= local - CLOCK_SAFETY_MS + 50);

        *client.clock_offset_ms.write() = Some(0);
        let ts = client.timestamp_ms();
        assert!((ts - BtcClient::local_ms()).abs() < 50);
    }
}
