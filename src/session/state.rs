use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Where the conversation loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    /// Capturing, hearing speech (or nothing yet)
    Listening,
    /// Capturing, timing trailing silence
    AwaitingEndpoint,
    /// Handing the finished utterance to the transport
    Streaming,
    AwaitingReply,
    Playing,
    /// Tearing down after stop
    Closing,
}

impl SessionState {
    /// Whether `self -> next` is a legal transition
    pub fn can_transition(self, next: SessionState) -> bool {
        use SessionState::*;

        match (self, next) {
            // Stop is available from anywhere
            (_, Closing) => true,
            (Closing, Idle) => true,
            (Idle, Listening) => true,
            (Listening, AwaitingEndpoint) | (AwaitingEndpoint, Listening) => true,
            (Listening | AwaitingEndpoint, Streaming) => true,
            (Streaming, AwaitingReply) => true,
            // A reply can arrive before the utterance is even finished
            (Listening | AwaitingEndpoint | Streaming | AwaitingReply, Playing) => true,
            // Auto-resume after a reply, or after a lost turn
            (Playing | AwaitingReply, Listening) => true,
            (s, n) => s == n,
        }
    }

    /// Capture is expected to be running
    pub fn is_capturing(self) -> bool {
        matches!(self, SessionState::Listening | SessionState::AwaitingEndpoint)
    }
}

/// Result of a server session assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    Assigned,
    Unchanged,
    /// A different id arrived after one was already assigned; ignored
    Conflict,
}

/// Conversation context that outlives individual connections
#[derive(Debug)]
pub struct Session {
    session_id: Option<String>,
    state: SessionState,
    last_activity: Instant,
}

impl Session {
    pub fn new() -> Self {
        Self {
            session_id: None,
            state: SessionState::Idle,
            last_activity: Instant::now(),
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `next` if the transition is legal; returns whether it happened
    pub fn transition(&mut self, next: SessionState) -> bool {
        if self.state == next {
            return true;
        }
        if !self.state.can_transition(next) {
            warn!("Ignoring illegal transition {:?} -> {:?}", self.state, next);
            return false;
        }
        debug!("Session {:?} -> {:?}", self.state, next);
        self.state = next;
        true
    }

    /// Store the server-issued id; immutable once set
    pub fn assign_id(&mut self, id: &str) -> Assignment {
        match &self.session_id {
            None => {
                self.session_id = Some(id.to_string());
                Assignment::Assigned
            }
            Some(existing) if existing == id => Assignment::Unchanged,
            Some(_) => Assignment::Conflict,
        }
    }

    /// Forget the id; only on explicit end of conversation
    pub fn reset_id(&mut self) -> Option<String> {
        self.session_id.take()
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Link health as shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Retries exhausted
    Failed,
}

/// Everything a UI collaborator needs, published after every event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub is_recording: bool,
    /// Microphone live or reply audio playing
    pub is_active: bool,
    /// Analyzer level while capturing, 0 otherwise
    pub activity_level: f32,
    pub transcript: String,
    pub reply_text: String,
    pub session_id: Option<String>,
    pub connection: ConnectionStatus,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub utterances_sent: u64,
    pub replies_played: u64,
    pub payloads_dropped: u64,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            is_recording: false,
            is_active: false,
            activity_level: 0.0,
            transcript: String::new(),
            reply_text: String::new(),
            session_id: None,
            connection: ConnectionStatus::Disconnected,
            last_error: None,
            started_at: None,
            utterances_sent: 0,
            replies_played: 0,
            payloads_dropped: 0,
        }
    }
}
