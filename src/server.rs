//! HTTP surface: LINE webhook, paid-user administration, liveness.
//!
//! The webhook body is taken as raw bytes so the signature is checked
//! against exactly what LINE signed, before any JSON parsing.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bot::{AppState, BatchOutcome};
use crate::platform::line::WebhookPayload;
use crate::signature::{self, SIGNATURE_HEADER};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error("userId is required")]
    MissingUserId,

    #[error("User {0} is not a paid user")]
    UserNotFound(String),

    #[error("Admin token missing or invalid")]
    AdminUnauthorized,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Self::InvalidSignature => (StatusCode::FORBIDDEN, "invalid_signature"),
            Self::MalformedPayload(_) => (StatusCode::BAD_REQUEST, "malformed_payload"),
            Self::MissingUserId => (StatusCode::BAD_REQUEST, "missing_user_id"),
            Self::UserNotFound(_) => (StatusCode::NOT_FOUND, "user_not_found"),
            Self::AdminUnauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
        };

        (
            status,
            Json(json!({ "error": code, "message": self.to_string() })),
        )
            .into_response()
    }
}

#[derive(Debug, Deserialize)]
struct PaidUserRequest {
    #[serde(rename = "userId", default)]
    user_id: Option<String>,
}

/// Creates the router with all routes and middleware.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(liveness))
        .route("/webhook", post(webhook))
        .route("/add-paid-user", post(add_paid_user))
        .route("/remove-paid-user", post(remove_paid_user))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(inject_request_id))
        .with_state(state)
}

/// Adds an X-Request-Id header to every response.
async fn inject_request_id(mut req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    req.extensions_mut().insert(request_id.clone());

    let mut response = next.run(req).await;
    if let Ok(header_value) = request_id.parse() {
        response.headers_mut().insert("X-Request-Id", header_value);
    }
    response
}

async fn liveness() -> &'static str {
    "Fortune relay is running"
}

async fn webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    if !signature::verify(&body, signature, state.channel_secret()) {
        warn!("Rejected webhook delivery with a missing or invalid signature");
        return Err(ApiError::InvalidSignature);
    }

    let payload: WebhookPayload = serde_json::from_slice(&body)
        .map_err(|e| ApiError::MalformedPayload(e.to_string()))?;

    debug!(
        "Webhook for {} with {} event(s)",
        payload.destination.as_deref().unwrap_or("unknown destination"),
        payload.events.len()
    );

    match state.handle_events(&payload.events).await {
        BatchOutcome::Completed => Ok(Json(json!({ "status": "ok" })).into_response()),
        BatchOutcome::Unauthorized { user_id } => {
            info!("Aborted webhook batch at unentitled user {}", user_id);
            Ok((
                StatusCode::FORBIDDEN,
                Json(json!({ "status": "unauthorized" })),
            )
                .into_response())
        }
    }
}

async fn add_paid_user(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize_admin(&state, &headers)?;
    let user_id = parse_user_id(&body)?;

    state.grant(&user_id).await;

    Ok(Json(json!({
        "status": "success",
        "message": format!("User {} added to paid users", user_id),
    })))
}

async fn remove_paid_user(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize_admin(&state, &headers)?;
    let user_id = parse_user_id(&body)?;

    if !state.revoke(&user_id).await {
        return Err(ApiError::UserNotFound(user_id));
    }

    Ok(Json(json!({
        "status": "success",
        "message": format!("User {} removed from paid users", user_id),
    })))
}

/// Enforces the admin bearer token when one is configured.
fn authorize_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.admin_token() else {
        return Ok(());
    };

    let provided = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);

    match provided {
        Some(token) if signature::timing_safe_eq(token.as_bytes(), expected.as_bytes()) => Ok(()),
        _ => {
            warn!("Rejected admin request without a valid token");
            Err(ApiError::AdminUnauthorized)
        }
    }
}

/// Pulls `userId` out of an admin request body, verbatim. A body that is
/// not JSON at all is treated the same as one without the field.
fn parse_user_id(body: &[u8]) -> Result<String, ApiError> {
    serde_json::from_slice::<PaidUserRequest>(body)
        .ok()
        .and_then(|req| req.user_id)
        .filter(|id| !id.is_empty())
        .ok_or(ApiError::MissingUserId)
}

/// Binds `addr` and serves until Ctrl-C or SIGTERM.
pub async fn serve(state: Arc<AppState>, addr: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    info!("Listening on {}", addr);

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
