use anyhow::Result;
use tokio::sync::mpsc;

use super::file::FileBackend;
use super::microphone::MicrophoneBackend;

/// Audio sample data (16-bit PCM, interleaved)
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Raw audio samples (i16 PCM, interleaved)
    pub samples: Vec<i16>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub channels: u16,
    /// Timestamp in milliseconds since capture started
    pub timestamp_ms: u64,
}

impl AudioFrame {
    /// Little-endian PCM16 bytes, the streaming-mode wire form
    pub fn to_pcm_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    pub fn duration_ms(&self) -> u64 {
        let per_channel = self.samples.len() as u64 / u64::from(self.channels.max(1));
        per_channel * 1000 / u64::from(self.sample_rate.max(1))
    }
}

/// Configuration for audio backend
#[derive(Debug, Clone)]
pub struct AudioBackendConfig {
    /// Target sample rate
    pub target_sample_rate: u32,
    /// Target channel count (1 = mono)
    pub target_channels: u16,
    /// Frame duration in milliseconds (the analysis tick)
    pub buffer_duration_ms: u64,
}

impl AudioBackendConfig {
    /// Samples per frame across all channels
    pub fn samples_per_frame(&self) -> usize {
        let per_channel = self.target_sample_rate as u64 * self.buffer_duration_ms / 1000;
        (per_channel.max(1) * u64::from(self.target_channels.max(1))) as usize
    }
}

impl Default for AudioBackendConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: 16000, // 16kHz speech
            target_channels: 1,        // Mono
            buffer_duration_ms: 20,    // 20ms ticks
        }
    }
}

/// Audio capture backend trait
///
/// Implementations:
/// - Microphone: cpal default input device
/// - File: replays a WAV file (testing, offline runs)
#[async_trait::async_trait]
pub trait AudioBackend: Send + Sync {
    /// Start capturing audio
    ///
    /// Returns a channel receiver that will receive audio frames. May wait on
    /// device acquisition; dropping the future and calling `stop` releases
    /// anything acquired so far.
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>>;

    /// Stop capturing audio (idempotent)
    async fn stop(&mut self) -> Result<()>;

    /// Check if backend is currently capturing
    fn is_capturing(&self) -> bool;

    /// Get backend name for logging
    fn name(&self) -> &str;
}

/// Audio backend factory
pub struct AudioBackendFactory;

impl AudioBackendFactory {
    /// Create audio backend for the given source
    pub fn create(source: AudioSource, config: AudioBackendConfig) -> Result<Box<dyn AudioBackend>> {
        match source {
            AudioSource::Microphone => Ok(Box::new(MicrophoneBackend::new(config))),
            AudioSource::File(path) => Ok(Box::new(FileBackend::open(path, config)?)),
        }
    }
}

/// Audio source type
#[derive(Debug, Clone)]
pub enum AudioSource {
    /// Default microphone input
    Microphone,
    /// WAV file replayed in real time
    File(String),
}
