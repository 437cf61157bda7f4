// =============================================================================
// Webhook endpoints — Axum 0.7
// =============================================================================
//
// `POST /webhook` accepts TX bodies, auto-detecting BTC-style payloads (a
// `symbol` or `action` field) and routing them accordingly; `POST
// /webhook/btc` forces the BTC path. Responses are `{success, message}`:
// 200 for handled signals (including duplicates and business rejections,
// which were answered by the broker or the preconditions), 400 for bodies
// we cannot parse, 500 when the gateway itself failed.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::app_state::Core;
use crate::error::CoreError;
use crate::pipeline;
use crate::signal::{looks_like_btc, Signal};
use crate::types::Market;

// =============================================================================
// Router construction
// =============================================================================

pub fn router(core: Arc<Core>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/webhook", post(webhook_auto))
        .route("/webhook/btc", post(webhook_btc))
        .layer(cors)
        .with_state(core)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    tx_logged_in: bool,
    btc_logged_in: bool,
    live_orders: usize,
    server_time: i64,
}

async fn health(State(core): State<Arc<Core>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: core.start_time.elapsed().as_secs(),
        tx_logged_in: core.tx_conn.read().logged_in,
        btc_logged_in: core.btc_conn.read().logged_in,
        live_orders: core.registry.len(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Webhooks
// =============================================================================

#[derive(Serialize)]
struct WebhookResponse {
    success: bool,
    message: String,
}

fn respond(
    status: StatusCode,
    success: bool,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        Json(WebhookResponse {
            success,
            message: message.into(),
        }),
    )
        .into_response()
}

async fn webhook_auto(State(core): State<Arc<Core>>, body: String) -> impl IntoResponse {
    let value: Value = match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "unparseable webhook body");
            return respond(StatusCode::BAD_REQUEST, false, "unparseable body");
        }
    };

    let market = if looks_like_btc(&value) {
        Market::Btc
    } else {
        Market::Tx
    };
    dispatch(core, market, value).await
}

async fn webhook_btc(State(core): State<Arc<Core>>, body: String) -> impl IntoResponse {
    let value: Value = match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "unparseable webhook body");
            return respond(StatusCode::BAD_REQUEST, false, "unparseable body");
        }
    };
    dispatch(core, Market::Btc, value).await
}

async fn dispatch(
    core: Arc<Core>,
    market: Market,
    value: Value,
) -> axum::response::Response {
    let parsed = match market {
        Market::Tx => Signal::from_tx_json(&value),
        Market::Btc => Signal::from_btc_json(&value),
    };
    let signal = match parsed {
        Ok(signal) => signal,
        Err(e) => {
            warn!(market = %market, error = %e, "webhook rejected at parse");
            return respond(StatusCode::BAD_REQUEST, false, e.operator_text());
        }
    };

    info!(
        market = %market,
        trade_id = %signal.trade_id,
        action = ?signal.action,
        "webhook signal received"
    );

    match pipeline::handle_signal(&core, signal).await {
        Ok(message) => respond(StatusCode::OK, true, message),
        // Business rejections were handled (journaled + notified); the
        // webhook itself succeeded.
        Err(
            e @ (CoreError::OutsideTradingHours
            | CoreError::NoPosition
            | CoreError::OppositePositionExists
            | CoreError::DuplicateSignal
            | CoreError::BrokerBusiness { .. }),
        ) => respond(StatusCode::OK, false, e.operator_text()),
        Err(e @ CoreError::UnrecognizedAction(_)) => {
            respond(StatusCode::BAD_REQUEST, false, e.operator_text())
        }
        Err(e) => {
            warn!(market = %market, error = %e, "webhook processing failed");
            respond(StatusCode::INTERNAL_SERVER_ERROR, false, e.operator_text())
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::testing::core_fixture;
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_endpoint_reports_state() {
        let (core, _handles) = core_fixture("api-health");
        let app = router(core);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("GET")
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["status"], "ok");
        assert_eq!(value["live_orders"], 0);
    }

    #[tokio::test]
    async fn unparseable_body_is_a_400() {
        let (core, _handles) = core_fixture("api-badjson");
        let app = router(core);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/webhook")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_direction_is_a_400() {
        let (core, _handles) = core_fixture("api-unknown-action");
        let app = router(core);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/webhook")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(
                        r#"{"tradeId":"t1","direction":"sideways","txf":1}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn tx_signal_outside_hours_is_handled_with_200() {
        // The fixture calendar is empty, so every instant is "closed";
        // the gate rejects but the webhook is answered.
        let (core, _handles) = core_fixture("api-closed");
        let app = router(core);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/webhook")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(
                        r#"{"tradeId":"t1","type":"entry","direction":"開多","txf":1}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["message"], "非交易時間");
    }

    #[tokio::test]
    async fn duplicate_signal_is_acknowledged() {
        let (core, _handles) = core_fixture("api-dup");

        // Seed the dedup window with the same key the webhook will compute.
        let body = r#"{"tradeId":"t9","type":"entry","direction":"開多","txf":1}"#;
        let value: Value = serde_json::from_str(body).unwrap();
        let signal = Signal::from_tx_json(&value).unwrap();
        assert!(core.dedup.check_and_record(&signal.dedup_key()));

        let app = router(core);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/webhook")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["message"], "duplicate signal ignored");
    }
}
