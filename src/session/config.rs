use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::audio::EndpointConfig;
use crate::playback::PlaybackConfig;
use crate::transport::ReconnectPolicy;

/// How captured audio reaches the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SendMode {
    /// Accumulate the utterance, send one WAV clip at the endpoint
    Batch,
    /// Forward every capture frame as it arrives
    Streaming,
}

/// Configuration for a voice session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Voice-turn endpoint (e.g. "ws://127.0.0.1:8000/ws/audio")
    pub server_url: String,

    pub send_mode: SendMode,

    /// Close the link after this long without inbound traffic
    /// Default: 120 seconds
    pub inactivity_timeout: Duration,

    /// Close the link each time a reply finishes playing
    pub close_after_reply: bool,

    pub endpoint: EndpointConfig,

    pub playback: PlaybackConfig,

    pub reconnect: ReconnectPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8000/ws/audio".to_string(),
            send_mode: SendMode::Batch,
            inactivity_timeout: Duration::from_secs(120), // 2 minutes
            close_after_reply: false,
            endpoint: EndpointConfig::default(),
            playback: PlaybackConfig::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}
