// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Public: POST /webhook, GET /health, GET /health/{component}. Everything
// else requires a valid bearer token via the `AuthClaims` extractor.
// Handlers never expose stack traces; failures return structured
// `{error, correlation_id}` bodies.
//
// CORS is configured permissively for development; tighten allowed origins
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;
use uuid::Uuid;

use crate::api::auth::AuthClaims;
use crate::api::webhook;
use crate::app_state::AppState;
use crate::store::{AuditFilter, RiskLimitsPatch};
use crate::types::TradingMode;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/webhook", post(webhook::handle))
        .route("/health", get(health))
        .route("/health/:component", get(health_component))
        // ── Authenticated ───────────────────────────────────────────
        .route("/metrics", get(metrics_composite))
        .route("/metrics/signals", get(metrics_signals))
        .route("/metrics/positions", get(metrics_positions))
        .route("/metrics/latency", get(metrics_latency))
        .route("/risk-limits", get(get_risk_limits))
        .route("/risk-limits", put(put_risk_limits))
        .route("/exit-signals", get(exit_signals))
        .route("/audit", get(audit_log))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

fn internal_error(err: impl std::fmt::Display) -> (StatusCode, Json<serde_json::Value>) {
    let correlation_id = Uuid::new_v4().to_string();
    warn!(correlation_id = %correlation_id, error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({
            "error": "internal error",
            "correlation_id": correlation_id,
        })),
    )
}

// =============================================================================
// Health (public)
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mode = state.mode();
    let last_signal_at = *state.last_signal_at.read();
    let last_order_at = *state.last_order_at.read();
    let report = state
        .health
        .composite(mode, last_signal_at, last_order_at)
        .await;

    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

async fn health_component(
    State(state): State<Arc<AppState>>,
    Path(component): Path<String>,
) -> impl IntoResponse {
    match state.health.component(&component).await {
        Some(report) => {
            let status = if report.health.healthy {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            (status, Json(serde_json::to_value(report).unwrap_or_default()))
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": format!("unknown component '{component}'"),
            })),
        ),
    }
}

// =============================================================================
// Metrics (authenticated)
// =============================================================================

async fn metrics_composite(
    _auth: AuthClaims,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let positions = state
        .store
        .position_aggregates()
        .await
        .map_err(internal_error)?;

    Ok(Json(serde_json::json!({
        "signals": state.metrics.signal_metrics(),
        "positions": positions,
        "latency": state.metrics.latency_metrics(),
        "cache": state.cache.stats(),
        "rate_limits": state.rate_limiter.stats(),
        "dedup": state.pipeline.dedup_stats(),
    })))
}

async fn metrics_signals(
    _auth: AuthClaims,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    Json(serde_json::json!({
        "signals": state.metrics.signal_metrics(),
        "dedup": state.pipeline.dedup_stats(),
    }))
}

async fn metrics_positions(
    _auth: AuthClaims,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let aggregates = state
        .store
        .position_aggregates()
        .await
        .map_err(internal_error)?;

    // Journal statistics over recent closed positions.
    let closed = state
        .store
        .closed_positions(500)
        .await
        .map_err(internal_error)?;
    let total_trades = closed.len();
    let journal = if total_trades == 0 {
        serde_json::json!({
            "total_trades": 0,
            "win_rate": 0.0,
            "total_net_pnl": "0",
            "profit_factor": 0.0,
        })
    } else {
        let wins = closed
            .iter()
            .filter(|p| {
                p.realized_pnl
                    .map(|pnl| pnl > rust_decimal::Decimal::ZERO)
                    .unwrap_or(false)
            })
            .count();
        let total_net: rust_decimal::Decimal =
            closed.iter().filter_map(|p| p.realized_pnl).sum();
        let gross_profit: rust_decimal::Decimal = closed
            .iter()
            .filter_map(|p| p.realized_pnl)
            .filter(|pnl| *pnl > rust_decimal::Decimal::ZERO)
            .sum();
        let gross_loss: rust_decimal::Decimal = closed
            .iter()
            .filter_map(|p| p.realized_pnl)
            .filter(|pnl| *pnl < rust_decimal::Decimal::ZERO)
            .map(|pnl| -pnl)
            .sum();
        let profit_factor = if !gross_loss.is_zero() {
            use rust_decimal::prelude::ToPrimitive;
            (gross_profit / gross_loss).to_f64().unwrap_or(0.0)
        } else if !gross_profit.is_zero() {
            f64::INFINITY
        } else {
            0.0
        };
        serde_json::json!({
            "total_trades": total_trades,
            "win_rate": wins as f64 / total_trades as f64,
            "total_net_pnl": total_net,
            "profit_factor": profit_factor,
        })
    };

    Ok(Json(serde_json::json!({
        "positions": aggregates,
        "journal": journal,
    })))
}

async fn metrics_latency(
    _auth: AuthClaims,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    Json(serde_json::json!({
        "latency": state.metrics.latency_metrics(),
    }))
}

// =============================================================================
// Risk limits (authenticated)
// =============================================================================

#[derive(Debug, Deserialize)]
struct ModeQuery {
    #[serde(default)]
    mode: Option<String>,
}

fn resolve_mode(state: &AppState, query: &ModeQuery) -> Result<TradingMode, (StatusCode, Json<serde_json::Value>)> {
    match query.mode.as_deref() {
        None => Ok(state.mode()),
        Some(raw) => raw.trim().to_uppercase().parse::<TradingMode>().map_err(|_| {
            (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": format!("invalid mode '{raw}' — use PAPER or LIVE"),
                })),
            )
        }),
    }
}

async fn get_risk_limits(
    _auth: AuthClaims,
    State(state): State<Arc<AppState>>,
    Query(query): Query<ModeQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let mode = resolve_mode(&state, &query)?;
    let limits = state
        .store
        .active_risk_limits(mode)
        .await
        .map_err(internal_error)?;
    Ok(Json(limits))
}

async fn put_risk_limits(
    _auth: AuthClaims,
    State(state): State<Arc<AppState>>,
    Query(query): Query<ModeQuery>,
    Json(patch): Json<RiskLimitsPatch>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let mode = resolve_mode(&state, &query)?;
    let limits = state
        .store
        .upsert_risk_limits(mode, &patch)
        .await
        .map_err(internal_error)?;
    Ok(Json(limits))
}

// =============================================================================
// Exit signals (authenticated)
// =============================================================================

#[derive(Debug, Deserialize)]
struct ExitSignalsQuery {
    #[serde(default)]
    refresh: Option<bool>,
}

async fn exit_signals(
    _auth: AuthClaims,
    State(state): State<Arc<AppState>>,
    Query(query): Query<ExitSignalsQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    if query.refresh == Some(true) {
        // Re-mark open positions before evaluating so the alerts reflect
        // current premiums.
        if let Err(e) = crate::workers::position_refresher::run_once(&state).await {
            warn!(error = %e, "refresh before exit evaluation failed");
        }
    }

    let alerts = crate::workers::exit_monitor::collect_alerts(&state)
        .await
        .map_err(internal_error)?;
    Ok(Json(serde_json::json!({
        "count": alerts.len(),
        "alerts": alerts,
    })))
}

// =============================================================================
// Audit (authenticated)
// =============================================================================

async fn audit_log(
    _auth: AuthClaims,
    State(state): State<Arc<AppState>>,
    Query(filter): Query<AuditFilter>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let entries = state
        .audit_query
        .query(&filter)
        .await
        .map_err(internal_error)?;
    Ok(Json(serde_json::json!({
        "count": entries.len(),
        "entries": entries,
    })))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::config::EngineConfig;
    use crate::store::Store;

    fn test_state(jwt_secret: Option<&str>) -> Arc<AppState> {
        let mut config = EngineConfig::default();
        config.jwt_secret = jwt_secret.map(str::to_string);
        Arc::new(AppState::with_store(
            config,
            Store::open_in_memory().unwrap(),
        ))
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn webhook_accepts_parseable_json() {
        let state = test_state(None);
        let app = router(state);

        let response = app
            .oneshot(
                Request::post("/webhook")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"trend":"BULLISH","ticker":"SPY","current_price":502.15,"score":8.5}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ACCEPTED");
        assert!(body["correlation_id"].as_str().is_some());
        assert!(body["processing_time_ms"].as_f64().is_some());
    }

    #[tokio::test]
    async fn webhook_rejects_bad_json_with_400() {
        let state = test_state(None);
        let app = router(state);

        let response = app
            .oneshot(
                Request::post("/webhook")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn webhook_get_is_method_not_allowed() {
        let state = test_state(None);
        let app = router(state);

        let response = app
            .oneshot(Request::get("/webhook").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn webhook_signature_enforced_when_configured() {
        let mut config = EngineConfig::default();
        config.webhook_secret = Some("shhh".into());
        let state = Arc::new(AppState::with_store(
            config,
            Store::open_in_memory().unwrap(),
        ));
        let app = router(state);

        // Missing/invalid signature -> 401.
        let response = app
            .clone()
            .oneshot(
                Request::post("/webhook")
                    .body(Body::from(r#"{"test":true}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // Correct signature -> 200.
        use hmac::{Hmac, Mac};
        let mut mac = Hmac::<sha2::Sha256>::new_from_slice(b"shhh").unwrap();
        mac.update(br#"{"test":true}"#);
        let signature = hex::encode(mac.finalize().into_bytes());

        let response = app
            .oneshot(
                Request::post("/webhook")
                    .header("x-signature", signature)
                    .body(Body::from(r#"{"test":true}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn health_is_public_and_reports_components() {
        let state = test_state(None);
        let app = router(state);

        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["healthy"], true);
        assert!(body["components"]["DATABASE"]["healthy"].as_bool().unwrap());

        let response = app
            .oneshot(Request::get("/health/gex").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn health_degrades_to_503() {
        let state = test_state(None);
        state
            .degraded
            .mark_unhealthy(crate::observability::degraded::Component::Gex, "down");
        let app = router(state);

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn metrics_require_bearer_token() {
        let state = test_state(Some("test-secret"));
        let app = router(state);

        let response = app
            .clone()
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let token = crate::api::auth::issue_token("test-secret", "ops").unwrap();
        let response = app
            .oneshot(
                Request::get("/metrics")
                    .header("authorization", format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body["signals"]["acceptance_rate"].as_f64().is_some());
    }

    #[tokio::test]
    async fn risk_limits_roundtrip_with_allow_list() {
        let state = test_state(Some("test-secret"));
        let app = router(state);
        let token = crate::api::auth::issue_token("test-secret", "ops").unwrap();

        // Unknown fields in the payload are silently ignored.
        let response = app
            .clone()
            .oneshot(
                Request::put("/risk-limits?mode=PAPER")
                    .header("authorization", format!("Bearer {token}"))
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"max_open_positions": 3, "mystery_field": 99}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["max_open_positions"], 3);

        let response = app
            .oneshot(
                Request::get("/risk-limits?mode=PAPER")
                    .header("authorization", format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["max_open_positions"], 3);
    }

    #[tokio::test]
    async fn invalid_mode_is_a_client_error() {
        let state = test_state(Some("test-secret"));
        let app = router(state);
        let token = crate::api::auth::issue_token("test-secret", "ops").unwrap();

        let response = app
            .oneshot(
                Request::get("/risk-limits?mode=MAYBE")
                    .header("authorization", format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn exit_signals_empty_when_no_positions() {
        let state = test_state(Some("test-secret"));
        let app = router(state);
        let token = crate::api::auth::issue_token("test-secret", "ops").unwrap();

        let response = app
            .oneshot(
                Request::get("/exit-signals")
                    .header("authorization", format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["count"], 0);
    }
}
