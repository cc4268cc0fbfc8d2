use std::sync::Arc;

use {
    axum::{
        Json, Router,
        body::Bytes,
        extract::State,
        http::{HeaderMap, StatusCode},
        response::{IntoResponse, Response},
        routing::{get, post},
    },
    parley_common::{Error, now_ms},
    parley_session::SessionState,
    serde::Deserialize,
    serde_json::json,
    tracing::{info, warn},
};

use crate::{
    health::{self, HealthStatus},
    state::GatewayState,
};

/// Build the HTTP router (shared between production startup and tests).
pub fn build_gateway_app(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/webhook", post(webhook_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/qr", get(qr_handler))
        .with_state(state)
}

// ── Handlers ─────────────────────────────────────────────────────────────────

fn outcome(status: StatusCode, success: bool, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "success": success, "message": message.into() })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct WebhookRequest {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SendMessage {
    to: String,
    text: String,
}

#[derive(Debug, Deserialize)]
struct Broadcast {
    recipients: Vec<String>,
    text: String,
}

async fn webhook_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(auth) = &state.auth else {
        return outcome(StatusCode::NOT_FOUND, false, "webhook disabled");
    };
    if let Err(e) = auth.verify_request(&headers, &body, now_ms()) {
        warn!(error = %e, "webhook rejected");
        return outcome(StatusCode::UNAUTHORIZED, false, "unauthorized");
    }

    let request: WebhookRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return outcome(StatusCode::BAD_REQUEST, false, format!("invalid body: {e}")),
    };
    info!(event = %request.event, "webhook received");

    match request.event.as_str() {
        "ping" => outcome(StatusCode::OK, true, "pong"),
        "send_message" => {
            let msg: SendMessage = match serde_json::from_value(request.data) {
                Ok(m) => m,
                Err(e) => {
                    return outcome(StatusCode::BAD_REQUEST, false, format!("invalid data: {e}"));
                },
            };
            match state.session.send(&msg.to, &msg.text).await {
                Ok(receipt) => (
                    StatusCode::OK,
                    Json(json!({
                        "success": true,
                        "message": "sent",
                        "message_id": receipt.message_id,
                    })),
                )
                    .into_response(),
                Err(e) => send_failure(&e),
            }
        },
        "broadcast" => {
            let msg: Broadcast = match serde_json::from_value(request.data) {
                Ok(m) => m,
                Err(e) => {
                    return outcome(StatusCode::BAD_REQUEST, false, format!("invalid data: {e}"));
                },
            };
            let state_now = state.session.state();
            if state_now != SessionState::Connected {
                return send_failure(&Error::not_connected(state_now));
            }
            let total = msg.recipients.len();
            let mut sent = 0usize;
            for to in &msg.recipients {
                match state.session.send(to, &msg.text).await {
                    Ok(_) => sent += 1,
                    Err(e) => warn!(to = %to, error = %e, "broadcast delivery failed"),
                }
            }
            (
                StatusCode::OK,
                Json(json!({
                    "success": sent == total,
                    "message": format!("sent to {sent} of {total}"),
                    "sent": sent,
                    "failed": total - sent,
                })),
            )
                .into_response()
        },
        other => outcome(StatusCode::BAD_REQUEST, false, format!("unknown event: {other}")),
    }
}

fn send_failure(err: &Error) -> Response {
    match err {
        Error::NotConnected { .. } => {
            outcome(StatusCode::SERVICE_UNAVAILABLE, false, err.to_string())
        },
        _ => {
            warn!(error = %err, "webhook send failed");
            outcome(StatusCode::BAD_GATEWAY, false, err.to_string())
        },
    }
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let report = health::report(&state).await;
    let code = if report.status == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(report))
}

async fn status_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let session = state.session.snapshot();
    Json(json!({
        "version": state.version,
        "uptime_ms": state.uptime_ms(),
        "session": session,
        "commands": {
            "registered": state.dispatcher.len(),
            "executed": state.dispatcher.executed(),
            "usage": state.dispatcher.usage(),
        },
        "plugins": state.plugins.names().await,
        "middlewares": state.pipeline.names(),
        "messages": {
            "processed": state.stats.processed(),
            "rejected": state.stats.rejected(),
        },
        "rate_limit": {
            "window_ms": state.rate_limit.window_ms,
            "max_requests": state.rate_limit.max_requests,
            "tracked_conversations": state.limiter.tracked(),
        },
    }))
}

async fn qr_handler(State(state): State<Arc<GatewayState>>) -> Response {
    match state.session.credential() {
        Some(qr) => Json(json!({
            "qr": qr,
            "issued_at": state.session.snapshot().last_credential_at_ms,
        }))
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": "no pairing code available",
                "state": state.session.state(),
            })),
        )
            .into_response(),
    }
}
