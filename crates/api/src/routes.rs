//! HTTP surface
//!
//! One webhook intake endpoint plus health and consistency-check routes.
//! Response policy for the webhook endpoint: 400 tells the gateway the
//! request itself was bad, 200 acknowledges events a redelivery cannot fix,
//! 500 asks the gateway to redeliver after a transient failure.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use vendly_billing::{BillingError, SIGNATURE_HEADER};

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/gateway", post(gateway_webhook))
        .route("/admin/invariants", get(run_invariants))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(&state.pool).await {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ok", "database": "up" })),
        ),
        Err(e) => {
            tracing::error!(error = %e, "Health check database probe failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "status": "degraded", "database": "down" })),
            )
        }
    }
}

/// Webhook intake. The raw body bytes feed both signature verification and
/// parsing; any body transformation before HMAC would break verification.
async fn gateway_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    match state.billing.webhooks.handle(&body, signature).await {
        Ok(()) => StatusCode::OK,
        Err(e) => status_for(&e),
    }
}

/// Maps processing outcomes to the gateway's retry semantics.
fn status_for(error: &BillingError) -> StatusCode {
    if matches!(error, BillingError::InvalidSignature) {
        StatusCode::BAD_REQUEST
    } else if error.is_acknowledgeable() {
        // Redelivering a malformed or conflicting event cannot change the
        // outcome, so acknowledge and rely on the audit row.
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

async fn run_invariants(State(state): State<AppState>) -> Response {
    match state.billing.invariants.run_all_checks().await {
        Ok(summary) => {
            let code = if summary.healthy {
                StatusCode::OK
            } else {
                StatusCode::CONFLICT
            };
            (code, Json(summary)).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "Invariant check run failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "invariant check failed" })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_signature_is_rejected_as_bad_request() {
        assert_eq!(
            status_for(&BillingError::InvalidSignature),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn permanent_failures_are_acknowledged() {
        assert_eq!(
            status_for(&BillingError::malformed("bad json")),
            StatusCode::OK
        );
        assert_eq!(
            status_for(&BillingError::conflict("undefined transition")),
            StatusCode::OK
        );
        assert_eq!(
            status_for(&BillingError::AccountNotFound("buyer@example.com".into())),
            StatusCode::OK
        );
        assert_eq!(
            status_for(&BillingError::SubscriptionNotFound("SUB_1".into())),
            StatusCode::OK
        );
    }

    #[test]
    fn transient_failures_request_redelivery() {
        assert_eq!(
            status_for(&BillingError::UpstreamTimeout),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_for(&BillingError::Database("connection reset".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_for(&BillingError::Upstream {
                status: Some(502),
                message: "bad gateway".into()
            }),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
