//! Voice session management
//!
//! This module provides the `SessionEngine` that runs the hands-free loop:
//! - Capture and endpoint detection
//! - Sending utterances and resuming the server session across links
//! - Gapless reply playback and automatic return to listening
//! - Inactivity and reconnect timers
//!
//! Callers drive it through a cloneable `SessionHandle` and observe it via
//! `SessionSnapshot`s.

mod config;
mod engine;
mod handle;
mod state;

pub use config::{SendMode, SessionConfig};
pub use engine::SessionEngine;
pub use handle::{Command, SessionHandle};
pub use state::{Assignment, ConnectionStatus, Session, SessionSnapshot, SessionState};
