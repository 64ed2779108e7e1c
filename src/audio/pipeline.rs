//! Capture pipeline
//!
//! Owns the capture backend and everything that consumes its frames: the
//! amplitude analyzer, the endpoint detector and (in batch mode) the
//! utterance clip. At most one capture is live; frames that arrive after
//! `stop` are discarded.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::analyzer::AmplitudeAnalyzer;
use super::backend::{AudioBackend, AudioFrame};
use super::clip::UtteranceClip;
use super::endpoint::{EndpointConfig, EndpointDetector, EndpointEvent};
use crate::error::{VoiceError, VoiceResult};

/// What one processed frame produced
#[derive(Debug, Clone, PartialEq)]
pub struct FrameOutcome {
    pub level: f32,
    pub voiced: bool,
    pub endpoint: Option<EndpointEvent>,
}

pub struct CapturePipeline {
    backend: Box<dyn AudioBackend>,
    frames: Option<mpsc::Receiver<AudioFrame>>,
    analyzer: AmplitudeAnalyzer,
    detector: EndpointDetector,
    clip: UtteranceClip,
    capturing: bool,
}

impl CapturePipeline {
    pub fn new(backend: Box<dyn AudioBackend>, endpoint: EndpointConfig) -> Self {
        Self {
            backend,
            frames: None,
            analyzer: AmplitudeAnalyzer::new(),
            detector: EndpointDetector::new(endpoint),
            clip: UtteranceClip::new(),
            capturing: false,
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing
    }

    pub fn level(&self) -> f32 {
        if self.capturing {
            self.analyzer.level()
        } else {
            0.0
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Acquire the capture source and begin delivering frames
    ///
    /// Safe to cancel: dropping this future and then calling `stop` releases
    /// whatever the backend acquired so far.
    pub async fn start(&mut self) -> VoiceResult<()> {
        if self.capturing || self.backend.is_capturing() {
            return Err(VoiceError::AlreadyCapturing);
        }

        self.analyzer.reset();
        self.detector.reset();

        let frames = self.backend.start().await.map_err(|e| {
            warn!("Capture acquisition failed on {}: {:#}", self.backend.name(), e);
            VoiceError::CaptureUnavailable(format!("{:#}", e))
        })?;

        self.frames = Some(frames);
        self.capturing = true;
        info!("Capture started ({})", self.backend.name());
        Ok(())
    }

    /// Release the capture source (idempotent)
    pub async fn stop(&mut self) {
        let was_capturing = self.capturing;
        self.capturing = false;
        // Dropping the receiver discards frames still in flight
        self.frames = None;
        self.analyzer.reset();
        self.detector.reset();

        if let Err(e) = self.backend.stop().await {
            warn!("Failed to stop {}: {:#}", self.backend.name(), e);
        }

        if was_capturing {
            info!("Capture stopped");
        }
    }

    /// Next frame from the live capture
    ///
    /// Pends forever while not capturing. `None` means the source ended on
    /// its own.
    pub async fn next_frame(&mut self) -> Option<AudioFrame> {
        match self.frames.as_mut() {
            Some(frames) => frames.recv().await,
            None => std::future::pending().await,
        }
    }

    /// Run one frame through the analyzer and endpoint detector
    ///
    /// Returns `None` for a late frame that arrived after `stop`.
    pub fn process(&mut self, frame: &AudioFrame) -> Option<FrameOutcome> {
        if !self.capturing {
            debug!("Dropping frame at {}ms after capture stopped", frame.timestamp_ms);
            return None;
        }

        let level = self.analyzer.analyze(frame);
        let voiced = level >= self.detector.config().silence_threshold;
        let endpoint = self.detector.observe(level, frame.timestamp_ms + frame.duration_ms());

        Some(FrameOutcome {
            level,
            voiced,
            endpoint,
        })
    }

    /// True while trailing silence is being timed
    pub fn is_timing_silence(&self) -> bool {
        self.capturing && self.detector.is_timing_silence()
    }

    pub fn clip_mut(&mut self) -> &mut UtteranceClip {
        &mut self.clip
    }

    /// Encode and clear the accumulated utterance; `None` when nothing was captured
    pub fn take_clip(&mut self) -> anyhow::Result<Option<Vec<u8>>> {
        if self.clip.is_empty() {
            return Ok(None);
        }

        let meta = self.clip.metadata().clone();
        let wav = self.clip.to_wav(meta.sample_rate)?;
        self.clip.clear();

        debug!(
            "Encoded utterance clip: {} frames, {}ms..{}ms, {} bytes",
            meta.frame_count,
            meta.start_ms,
            meta.end_ms,
            wav.len()
        );
        Ok(Some(wav))
    }
}
