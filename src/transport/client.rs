use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::connection::{ConnectionHandle, Connector, LinkEvent};
use crate::audio::AudioFrame;
use crate::error::{VoiceError, VoiceResult};
use crate::protocol::{Inbound, Outbound};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// Backoff between reconnection attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive failed attempts before giving up
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt number `attempt` (1-based), doubling up to the cap
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }

    pub fn exhausted(&self, failed_attempts: u32) -> bool {
        failed_attempts >= self.max_attempts
    }
}

/// Something the link produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(Inbound),
    /// The link went away without the client asking
    Closed { reason: Option<String> },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub connections_opened: u64,
    pub frames_sent: u64,
    pub clips_sent: u64,
    pub utterances_ended: u64,
}

/// Owns the single live link and speaks the voice-turn protocol over it
pub struct Transport {
    url: String,
    connector: Arc<dyn Connector>,
    state: TransportState,
    handle: Option<ConnectionHandle>,
    /// A send found the link dead; reported as a close by `next_event`
    lost: Option<String>,
    stats: TransportStats,
}

impl Transport {
    pub fn new(url: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        Self {
            url: url.into(),
            connector,
            state: TransportState::Disconnected,
            handle: None,
            lost: None,
            stats: TransportStats::default(),
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == TransportState::Open && self.handle.is_some()
    }

    /// A link exists whose events still need reading
    pub fn has_link(&self) -> bool {
        self.handle.is_some()
    }

    pub fn stats(&self) -> TransportStats {
        self.stats
    }

    /// Open a fresh link and resume `session_id` on it
    ///
    /// Any previous link is fully released before the new one is requested.
    pub async fn connect(&mut self, session_id: Option<&str>) -> VoiceResult<()> {
        self.release().await;

        self.state = TransportState::Connecting;
        let handle = match self.connector.connect(&self.url).await {
            Ok(handle) => handle,
            Err(e) => {
                self.state = TransportState::Disconnected;
                return Err(VoiceError::ConnectionFailure(format!("{:#}", e)));
            }
        };

        self.handle = Some(handle);
        self.state = TransportState::Open;
        self.stats.connections_opened += 1;

        if let Some(id) = session_id {
            info!("Resuming session {}", id);
            self.send(Outbound::SessionResume(id.to_string())).await?;
        }

        Ok(())
    }

    pub async fn send(&mut self, message: Outbound) -> VoiceResult<()> {
        let handle = match (&self.handle, self.state) {
            (Some(handle), TransportState::Open) => handle,
            _ => {
                return Err(VoiceError::ConnectionFailure(format!(
                    "cannot send {} while {:?}",
                    message.kind(),
                    self.state
                )))
            }
        };

        let kind = message.kind();
        if let Err(e) = handle.send(message.into_wire()).await {
            warn!("Failed to send {}: {}", kind, e);
            // The link task is gone and its close event with it
            self.handle = None;
            self.state = TransportState::Disconnected;
            self.lost = Some(format!("{} send failed: {}", kind, e));
            return Err(VoiceError::ConnectionFailure(e.to_string()));
        }

        Ok(())
    }

    /// Streaming mode: forward one capture frame as raw PCM16LE
    pub async fn send_frame(&mut self, frame: &AudioFrame) -> VoiceResult<()> {
        self.send(Outbound::Audio(frame.to_pcm_bytes())).await?;
        self.stats.frames_sent += 1;
        Ok(())
    }

    /// Batch mode: send a complete encoded utterance
    pub async fn send_clip(&mut self, clip: Vec<u8>) -> VoiceResult<()> {
        debug!("Sending utterance clip ({} bytes)", clip.len());
        self.send(Outbound::Clip(clip)).await?;
        self.stats.clips_sent += 1;
        Ok(())
    }

    pub async fn end_utterance(&mut self) -> VoiceResult<()> {
        self.send(Outbound::EndOfUtterance).await?;
        self.stats.utterances_ended += 1;
        Ok(())
    }

    /// Wait for the next inbound message or close
    ///
    /// Pends forever when there is no link, so it can sit in a `select!`.
    /// A link found dead by a failed send is reported here as closed.
    pub async fn next_event(&mut self) -> TransportEvent {
        if let Some(reason) = self.lost.take() {
            return TransportEvent::Closed {
                reason: Some(reason),
            };
        }

        let event = match self.handle.as_mut() {
            Some(handle) => handle.recv().await,
            None => std::future::pending().await,
        };

        match event {
            LinkEvent::Message(message) => TransportEvent::Message(Inbound::from_wire(message)),
            LinkEvent::Closed { reason } => {
                self.handle = None;
                self.state = TransportState::Disconnected;
                TransportEvent::Closed { reason }
            }
        }
    }

    /// Close the link on purpose (idempotent)
    pub async fn disconnect(&mut self) {
        if self.handle.is_none() {
            self.lost = None;
            self.state = TransportState::Disconnected;
            return;
        }

        info!("Closing connection to {}", self.url);
        self.state = TransportState::Closing;
        self.release().await;
    }

    async fn release(&mut self) {
        self.lost = None;
        if let Some(handle) = self.handle.take() {
            handle.close().await;
        }
        self.state = TransportState::Disconnected;
    }
}
