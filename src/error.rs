use thiserror::Error;

/// Failures surfaced by the voice session engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VoiceError {
    /// Microphone missing, busy or permission denied
    #[error("Capture unavailable: {0}")]
    CaptureUnavailable(String),

    #[error("Capture already running")]
    AlreadyCapturing,

    /// Network or handshake failure (retried while the session is active)
    #[error("Connection failure: {0}")]
    ConnectionFailure(String),

    /// Reconnection gave up after the configured number of attempts
    #[error("Disconnected after {attempts} failed connection attempts")]
    Disconnected { attempts: u32 },

    /// A single reply payload could not be decoded (non-fatal)
    #[error("Decode failure: {0}")]
    DecodeFailure(String),

    /// Inbound message that matched no known kind (non-fatal)
    #[error("Protocol anomaly: {0}")]
    ProtocolAnomaly(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The session engine task is no longer running
    #[error("Session engine closed")]
    SessionClosed,
}

pub type VoiceResult<T> = std::result::Result<T, VoiceError>;
