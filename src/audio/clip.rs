use anyhow::{Context, Result};
use std::io::Cursor;

use super::backend::AudioFrame;

/// Metadata for an accumulated utterance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClipMetadata {
    /// Timestamp of the first frame (ms since capture started)
    pub start_ms: u64,
    /// Timestamp of the last frame
    pub end_ms: u64,
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_count: usize,
    pub frame_count: usize,
}

/// Accumulates one utterance of capture frames in arrival order
///
/// Batch mode sends the whole clip as a WAV file once the utterance ends;
/// streaming mode uses it to hold frames while the connection is not open.
#[derive(Debug, Default)]
pub struct UtteranceClip {
    frames: Vec<AudioFrame>,
    metadata: ClipMetadata,
}

impl UtteranceClip {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: AudioFrame) {
        if self.frames.is_empty() {
            self.metadata.start_ms = frame.timestamp_ms;
            self.metadata.sample_rate = frame.sample_rate;
            self.metadata.channels = frame.channels;
        }

        self.metadata.end_ms = frame.timestamp_ms;
        self.metadata.sample_count += frame.samples.len();
        self.metadata.frame_count += 1;
        self.frames.push(frame);
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn metadata(&self) -> &ClipMetadata {
        &self.metadata
    }

    /// Hand the buffered frames over, leaving the clip empty
    pub fn drain_frames(&mut self) -> Vec<AudioFrame> {
        self.metadata = ClipMetadata::default();
        std::mem::take(&mut self.frames)
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.metadata = ClipMetadata::default();
    }

    /// Encode as a 16-bit PCM WAV file
    pub fn to_wav(&self, default_rate: u32) -> Result<Vec<u8>> {
        let spec = hound::WavSpec {
            channels: self.metadata.channels.max(1),
            sample_rate: if self.metadata.sample_rate == 0 {
                default_rate
            } else {
                self.metadata.sample_rate
            },
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).context("Failed to create WAV writer")?;

            for frame in &self.frames {
                for &sample in &frame.samples {
                    writer
                        .write_sample(sample)
                        .context("Failed to write sample to WAV")?;
                }
            }

            writer.finalize().context("Failed to finalize WAV clip")?;
        }

        Ok(cursor.into_inner())
    }
}
