use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::audio::{AudioBackendConfig, EndpointConfig};
use crate::playback::PlaybackConfig;
use crate::session::{SendMode, SessionConfig};
use crate::transport::ReconnectPolicy;

/// Top-level client configuration
///
/// Every section has defaults, so an empty (or missing) file is valid.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub endpoint: EndpointSection,
    pub playback: PlaybackSection,
    pub session: SessionSection,
    pub reconnect: ReconnectSection,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "handsfree-voice".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Voice-turn endpoint
    pub url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8000/ws/audio".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub buffer_duration_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            buffer_duration_ms: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EndpointSection {
    /// ActivityLevel below which a frame counts as silence
    pub silence_threshold: f32,
    /// Continuous silence required before an utterance ends
    pub silence_duration_ms: u64,
}

impl Default for EndpointSection {
    fn default() -> Self {
        let defaults = EndpointConfig::default();
        Self {
            silence_threshold: defaults.silence_threshold,
            silence_duration_ms: defaults.silence_duration.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyFormat {
    /// Sniff the container (WAV, MP3, FLAC, OGG)
    Auto,
    /// Raw little-endian 16-bit mono PCM at `playback.sample_rate`
    Pcm16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PlaybackSection {
    pub sample_rate: u32,
    pub reply_format: ReplyFormat,
}

impl Default for PlaybackSection {
    fn default() -> Self {
        Self {
            sample_rate: 24000,
            reply_format: ReplyFormat::Auto,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionSection {
    pub send_mode: SendMode,
    pub inactivity_timeout_secs: u64,
    pub close_after_reply: bool,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            send_mode: SendMode::Batch,
            inactivity_timeout_secs: 120,
            close_after_reply: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectSection {
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            backoff_ms: 200,
            max_backoff_ms: 5000,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "127.0.0.1".to_string(),
            port: 8765,
        }
    }
}

impl Config {
    /// Load from an optional file at `path`, overlaid by `HANDSFREE__*` env vars
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("HANDSFREE").separator("__"))
            .build()
            .with_context(|| format!("Failed to read config from {}", path))?;

        let cfg: Self = settings
            .try_deserialize()
            .context("Failed to parse config")?;
        cfg.validate()?;

        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.audio.sample_rate == 0 || self.playback.sample_rate == 0 {
            anyhow::bail!("Sample rates must be positive");
        }
        if self.audio.channels == 0 {
            anyhow::bail!("audio.channels must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.endpoint.silence_threshold) {
            anyhow::bail!(
                "endpoint.silence_threshold must be within [0, 1], got {}",
                self.endpoint.silence_threshold
            );
        }
        if self.reconnect.max_attempts == 0 {
            anyhow::bail!("reconnect.max_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn backend_config(&self) -> AudioBackendConfig {
        AudioBackendConfig {
            target_sample_rate: self.audio.sample_rate,
            target_channels: self.audio.channels,
            buffer_duration_ms: self.audio.buffer_duration_ms,
        }
    }

    pub fn endpoint_config(&self) -> EndpointConfig {
        EndpointConfig {
            silence_threshold: self.endpoint.silence_threshold,
            silence_duration: Duration::from_millis(self.endpoint.silence_duration_ms),
        }
    }

    pub fn playback_config(&self) -> PlaybackConfig {
        PlaybackConfig {
            output_sample_rate: self.playback.sample_rate,
            reply_format: self.playback.reply_format,
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_backoff: Duration::from_millis(self.reconnect.backoff_ms),
            max_backoff: Duration::from_millis(self.reconnect.max_backoff_ms),
            max_attempts: self.reconnect.max_attempts,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            server_url: self.server.url.clone(),
            send_mode: self.session.send_mode,
            inactivity_timeout: Duration::from_secs(self.session.inactivity_timeout_secs),
            close_after_reply: self.session.close_after_reply,
            endpoint: self.endpoint_config(),
            playback: self.playback_config(),
            reconnect: self.reconnect_policy(),
        }
    }
}
