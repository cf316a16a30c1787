//! HTTP surface: health, email verification links, and event ingress for a
//! gateway relay.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use crate::chat::{IncomingMessage, MemberHandle};

use super::dispatcher::{JoinOutcome, MessageOutcome, OnboardingDispatcher, VerifyOutcome};

/// Shared state for onboarding routes.
#[derive(Clone)]
pub struct OnboardingRouteState {
    pub dispatcher: Arc<OnboardingDispatcher>,
}

/// GET /health
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "onboard-bot",
    }))
}

/// GET /verify/{code}
///
/// Target of the link emailed to members. Clicking it twice is fine.
async fn verify(
    State(state): State<OnboardingRouteState>,
    Path(code): Path<String>,
) -> impl IntoResponse {
    let outcome = state.dispatcher.verify_code(&code).await;
    let status = match &outcome {
        VerifyOutcome::Verified | VerifyOutcome::AlreadyVerified => StatusCode::OK,
        VerifyOutcome::NotAwaitingVerification { .. } => StatusCode::CONFLICT,
        VerifyOutcome::NotFound => StatusCode::NOT_FOUND,
        VerifyOutcome::Failed => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(outcome))
}

/// POST /api/events/member-joined
async fn member_joined(
    State(state): State<OnboardingRouteState>,
    Json(member): Json<MemberHandle>,
) -> impl IntoResponse {
    let outcome = state.dispatcher.on_member_joined(&member).await;
    let status = match outcome {
        JoinOutcome::Failed => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::OK,
    };
    (status, Json(outcome))
}

/// POST /api/events/message
async fn message(
    State(state): State<OnboardingRouteState>,
    Json(message): Json<IncomingMessage>,
) -> impl IntoResponse {
    let outcome = state.dispatcher.on_message(&message).await;
    let status = match outcome {
        MessageOutcome::Failed => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::OK,
    };
    (status, Json(outcome))
}

/// Build the onboarding HTTP routes.
pub fn onboarding_routes(state: OnboardingRouteState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/verify/{code}", get(verify))
        .route("/api/events/member-joined", post(member_joined))
        .route("/api/events/message", post(message))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
