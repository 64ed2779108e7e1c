use super::backend::AudioFrame;

/// Full-scale magnitude of a 16-bit sample
const FULL_SCALE: f32 = 32768.0;

/// Rolling amplitude measurement over capture frames
///
/// Only the most recent level is kept; the endpoint detector owns any
/// history it needs.
#[derive(Debug, Default, Clone)]
pub struct AmplitudeAnalyzer {
    level: f32,
}

impl AmplitudeAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Measure a frame and return its activity level in [0, 1]
    pub fn analyze(&mut self, frame: &AudioFrame) -> f32 {
        self.level = activity_level(&frame.samples);
        self.level
    }

    /// Level of the last analyzed frame
    pub fn level(&self) -> f32 {
        self.level
    }

    pub fn reset(&mut self) {
        self.level = 0.0;
    }
}

/// Mean absolute deviation from the zero-crossing midpoint, normalized to [0, 1]
pub fn activity_level(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let total: u64 = samples.iter().map(|&s| u64::from(s.unsigned_abs())).sum();
    let mean = total as f32 / samples.len() as f32;

    (mean / FULL_SCALE).clamp(0.0, 1.0)
}
