use super::state::AppState;
use crate::error::VoiceError;
use crate::session::SessionSnapshot;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Serialize;
use tracing::{error, info};

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ControlResponse {
    pub status: String,
    pub message: String,
    pub session: SessionSnapshot,
}

#[derive(Debug, Serialize)]
pub struct TranscriptResponse {
    pub session_id: Option<String>,
    pub transcript: String,
    pub reply_text: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(e: VoiceError) -> axum::response::Response {
    let status = match e {
        VoiceError::CaptureUnavailable(_) | VoiceError::AlreadyCapturing => StatusCode::CONFLICT,
        VoiceError::SessionClosed => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
        .into_response()
}

fn control_response(state: &AppState, status: &str, message: &str) -> axum::response::Response {
    (
        StatusCode::OK,
        Json(ControlResponse {
            status: status.to_string(),
            message: message.to_string(),
            session: state.session.snapshot(),
        }),
    )
        .into_response()
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /session/start
/// Start the hands-free loop
pub async fn start_session(State(state): State<AppState>) -> impl IntoResponse {
    info!("Start requested over HTTP");

    match state.session.start().await {
        Ok(()) => control_response(&state, "listening", "Session started"),
        Err(e) => {
            error!("Failed to start session: {}", e);
            error_response(e)
        }
    }
}

/// POST /session/stop
/// Stop capture, playback and the connection
pub async fn stop_session(State(state): State<AppState>) -> impl IntoResponse {
    info!("Stop requested over HTTP");

    match state.session.stop().await {
        Ok(()) => control_response(&state, "stopped", "Session stopped"),
        Err(e) => {
            error!("Failed to stop session: {}", e);
            error_response(e)
        }
    }
}

/// POST /session/end
/// Stop and discard the server-side conversation
pub async fn end_conversation(State(state): State<AppState>) -> impl IntoResponse {
    info!("End of conversation requested over HTTP");

    match state.session.end_conversation().await {
        Ok(()) => control_response(&state, "ended", "Conversation ended"),
        Err(e) => {
            error!("Failed to end conversation: {}", e);
            error_response(e)
        }
    }
}

/// GET /session/status
pub async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.session.snapshot()))
}

/// GET /session/transcript
pub async fn get_transcript(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.session.snapshot();

    (
        StatusCode::OK,
        Json(TranscriptResponse {
            session_id: snapshot.session_id,
            transcript: snapshot.transcript,
            reply_text: snapshot.reply_text,
        }),
    )
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
