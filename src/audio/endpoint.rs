//! Utterance endpointing
//!
//! A debounced hysteresis detector: an utterance ends once the activity
//! level has stayed under a threshold for longer than a tunable duration.
//! Time comes from frame timestamps, so detection is sample-accurate and
//! independent of how late a frame is processed.

use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EndpointConfig {
    /// Activity below this level counts as silence
    pub silence_threshold: f32,
    /// Silence must last strictly longer than this to end an utterance
    pub silence_duration: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            // 4 of 128 on an 8-bit scale: typical room noise reads as silence
            silence_threshold: 4.0 / 128.0,
            silence_duration: Duration::from_millis(1500),
        }
    }
}

/// Utterance boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointEvent {
    /// Where the trailing silence began
    pub silence_started_ms: u64,
    /// Frame time at which the endpoint fired
    pub fired_at_ms: u64,
}

#[derive(Debug, Clone)]
pub struct EndpointDetector {
    config: EndpointConfig,
    /// Start of the current sub-threshold run
    silence_started_ms: Option<u64>,
}

impl EndpointDetector {
    pub fn new(config: EndpointConfig) -> Self {
        Self {
            config,
            silence_started_ms: None,
        }
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Feed one activity sample taken at `now_ms`
    pub fn observe(&mut self, level: f32, now_ms: u64) -> Option<EndpointEvent> {
        if level >= self.config.silence_threshold {
            if self.silence_started_ms.take().is_some() {
                debug!("Speech resumed at {}ms", now_ms);
            }
            return None;
        }

        match self.silence_started_ms {
            None => {
                debug!("Silence started at {}ms", now_ms);
                self.silence_started_ms = Some(now_ms);
                None
            }
            Some(started) => {
                let elapsed = Duration::from_millis(now_ms.saturating_sub(started));
                if elapsed > self.config.silence_duration {
                    self.silence_started_ms = None;
                    Some(EndpointEvent {
                        silence_started_ms: started,
                        fired_at_ms: now_ms,
                    })
                } else {
                    None
                }
            }
        }
    }

    /// True while a sub-threshold run is being timed
    pub fn is_timing_silence(&self) -> bool {
        self.silence_started_ms.is_some()
    }

    pub fn reset(&mut self) {
        self.silence_started_ms = None;
    }
}
