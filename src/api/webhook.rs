// =============================================================================
// Webhook intake — POST /webhook with optional HMAC verification
// =============================================================================
//
// Responds 200/ACCEPTED as soon as normalization returns; everything past
// parsing runs on a background task keyed by the correlation id. 400 is
// reserved for JSON syntax errors; a configured shared secret turns on
// `x-signature` HMAC-SHA256 verification (401 on mismatch).
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::app_state::AppState;

type HmacSha256 = Hmac<Sha256>;

/// Compare two byte slices in constant time. The comparison always examines
/// every byte even after a mismatch, preventing timing side-channels.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Hex HMAC-SHA256 of `body` under `secret`.
fn signature_for(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

pub async fn handle(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let started = Instant::now();

    // ── Signature check (when a shared secret is configured) ────────────
    if let Some(secret) = state.config.read().webhook_secret.clone() {
        let presented = headers
            .get("x-signature")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        let expected = signature_for(&secret, &body);
        if !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
            warn!("webhook signature mismatch");
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({
                    "error": "invalid signature",
                    "correlation_id": Uuid::new_v4().to_string(),
                })),
            );
        }
    }

    // ── Parse: 400 only for JSON syntax errors ──────────────────────────
    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "webhook body is not valid JSON");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": "invalid JSON",
                    "correlation_id": Uuid::new_v4().to_string(),
                })),
            );
        }
    };

    // ── Normalize synchronously, process in the background ──────────────
    let receipt = state.pipeline.ingest(payload);
    let processing_time_ms = started.elapsed().as_secs_f64() * 1000.0;

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ACCEPTED",
            "correlation_id": receipt.correlation_id,
            "source": receipt.source,
            "processing_time_ms": processing_time_ms,
        })),
    )
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_stable_hex() {
        let sig = signature_for("secret", b"{\"a\":1}");
        assert_eq!(sig.len(), 64);
        assert_eq!(sig, signature_for("secret", b"{\"a\":1}"));
        assert_ne!(sig, signature_for("other", b"{\"a\":1}"));
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }
}
