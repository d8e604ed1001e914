//! HTTP surface: webhook intake, probes and a session snapshot.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use linear::{validate_webhook_timestamp, verify_webhook_signature, WebhookPayload};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::orchestrator::{Orchestrator, StatusSnapshot};

/// Header carrying the hex HMAC-SHA256 of the raw body.
pub const SIGNATURE_HEADER: &str = "linear-signature";

/// Shared state for every handler.
#[derive(Clone)]
pub struct ServerState {
    pub orchestrator: Orchestrator,
    pub webhook_secret: Option<String>,
    pub webhook_max_age_ms: i64,
    /// Cancelled when the service starts shutting down
    pub shutdown: CancellationToken,
}

pub fn build_router(state: ServerState) -> Router {
    Router::new()
        .route("/webhook", post(webhook_handler))
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/sessions", get(sessions))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

async fn readiness_check(State(state): State<ServerState>) -> Result<Json<Value>, StatusCode> {
    if state.shutdown.is_cancelled() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    let live = state.orchestrator.context().registry.live_count().await;
    Ok(Json(json!({ "status": "ready", "liveSessions": live })))
}

async fn sessions(State(state): State<ServerState>) -> Json<StatusSnapshot> {
    Json(state.orchestrator.status().await)
}

/// Verify, parse and hand off one webhook.
///
/// The trigger is handled in a background task so Linear gets its
/// acknowledgement without waiting for workspace setup or agent startup.
pub async fn webhook_handler(
    State(state): State<ServerState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, StatusCode> {
    if state.shutdown.is_cancelled() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    let delivery_id = headers
        .get("linear-delivery")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");

    if let Some(secret) = &state.webhook_secret {
        let Some(signature) = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok())
        else {
            warn!(delivery_id, "Missing Linear-Signature header");
            return Err(StatusCode::UNAUTHORIZED);
        };
        if !verify_webhook_signature(&body, signature, secret) {
            warn!(delivery_id, "Invalid webhook signature");
            return Err(StatusCode::UNAUTHORIZED);
        }
        debug!(delivery_id, "Webhook signature verified");
    }

    let payload: WebhookPayload = serde_json::from_slice(&body).map_err(|e| {
        error!(delivery_id, error = %e, "Failed to parse webhook payload");
        StatusCode::BAD_REQUEST
    })?;

    if let Some(timestamp) = payload.webhook_timestamp {
        if !validate_webhook_timestamp(timestamp, state.webhook_max_age_ms) {
            warn!(delivery_id, timestamp, "Webhook timestamp is stale");
            return Err(StatusCode::UNAUTHORIZED);
        }
    }

    info!(
        delivery_id,
        notification = ?payload.notification.kind,
        action = %payload.action,
        "Received Linear webhook"
    );

    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        orchestrator.handle_webhook(&payload).await;
    });

    Ok(Json(json!({ "status": "accepted" })))
}
