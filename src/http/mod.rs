//! HTTP API server for local control
//!
//! This module provides a REST API for driving the voice session:
//! - POST /session/start - Start listening
//! - POST /session/stop - Stop capture, playback and the connection
//! - POST /session/end - Stop and forget the server session
//! - GET /session/status - Current session snapshot
//! - GET /session/transcript - Latest transcript and reply text
//! - GET /health - Health check

mod handlers;
mod routes;
mod state;

pub use routes::create_router;
pub use state::AppState;
