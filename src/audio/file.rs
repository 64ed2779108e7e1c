use anyhow::{bail, Context, Result};
use hound::WavReader;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::backend::{AudioBackend, AudioBackendConfig, AudioFrame};
use super::resample::resample;

pub struct AudioFile {
    pub path: String,
    pub duration_seconds: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<i16>,
}

impl AudioFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening audio file: {}", path.display());

        let reader = WavReader::open(path).context("Failed to open WAV file")?;

        let spec = reader.spec();
        let samples: Vec<i16> = reader
            .into_samples::<i16>()
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read audio samples")?;

        let duration_seconds = samples.len() as f64 / (spec.sample_rate as f64 * spec.channels as f64);

        info!(
            "Audio file loaded: {:.1}s, {}Hz, {} channels, {} samples",
            duration_seconds,
            spec.sample_rate,
            spec.channels,
            samples.len()
        );

        Ok(Self {
            path: path.display().to_string(),
            duration_seconds,
            sample_rate: spec.sample_rate,
            channels: spec.channels,
            samples,
        })
    }

    /// Samples as mono at `target_rate`, ready for the capture pipeline
    ///
    /// Channels are averaged, then any rate is resampled to the target.
    pub fn to_mono(&self, target_rate: u32) -> Result<Vec<i16>> {
        let channels = usize::from(self.channels.max(1));
        let mono: Vec<f32> = self
            .samples
            .chunks_exact(channels)
            .map(|frame| {
                let sum: f32 = frame.iter().map(|&s| f32::from(s)).sum();
                sum / channels as f32 / 32768.0
            })
            .collect();

        if self.sample_rate != target_rate {
            debug!("Resampling {} {}Hz -> {}Hz", self.path, self.sample_rate, target_rate);
        }
        let converted = resample(&mono, self.sample_rate, target_rate)
            .with_context(|| format!("Failed to convert {} to {}Hz", self.path, target_rate))?;

        Ok(converted
            .into_iter()
            .map(|s| (s * 32768.0).round().clamp(-32768.0, 32767.0) as i16)
            .collect())
    }
}

/// Replays mono samples as capture frames
///
/// Capture can be stopped and restarted; replay resumes where it left off,
/// the way a live microphone keeps running between turns. When the samples
/// run out the frame channel closes.
pub struct FileBackend {
    config: AudioBackendConfig,
    samples: Arc<Vec<i16>>,
    cursor: Arc<AtomicUsize>,
    realtime: bool,
    task: Option<JoinHandle<()>>,
}

impl FileBackend {
    /// Open a WAV file, converted to the configured rate, paced in real time
    pub fn open(path: impl AsRef<Path>, config: AudioBackendConfig) -> Result<Self> {
        let file = AudioFile::open(path)?;
        let samples = file.to_mono(config.target_sample_rate)?;
        Ok(Self::from_samples(samples, config, true))
    }

    pub fn from_samples(samples: Vec<i16>, config: AudioBackendConfig, realtime: bool) -> Self {
        Self {
            config,
            samples: Arc::new(samples),
            cursor: Arc::new(AtomicUsize::new(0)),
            realtime,
            task: None,
        }
    }

    /// Append silence so a trailing utterance can still be endpointed
    pub fn with_trailing_silence(mut self, silence: Duration) -> Self {
        let extra = (u128::from(self.config.target_sample_rate) * silence.as_millis() / 1000) as usize;
        let mut samples = self.samples.as_ref().clone();
        samples.resize(samples.len() + extra, 0);
        self.samples = Arc::new(samples);
        self
    }

    /// Samples not yet delivered
    pub fn remaining(&self) -> usize {
        self.samples
            .len()
            .saturating_sub(self.cursor.load(Ordering::SeqCst))
    }
}

#[async_trait::async_trait]
impl AudioBackend for FileBackend {
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>> {
        if self.task.is_some() {
            bail!("Already capturing");
        }

        let (tx, rx) = mpsc::channel(64);
        let samples = Arc::clone(&self.samples);
        let cursor = Arc::clone(&self.cursor);
        let frame_len = self.config.samples_per_frame();
        let sample_rate = self.config.target_sample_rate;
        let tick = Duration::from_millis(self.config.buffer_duration_ms.max(1));
        let realtime = self.realtime;

        debug!(
            "File replay starting at sample {} of {}",
            cursor.load(Ordering::SeqCst),
            samples.len()
        );

        self.task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);

            loop {
                let start = cursor.load(Ordering::SeqCst);
                if start >= samples.len() {
                    debug!("File replay exhausted");
                    break;
                }

                if realtime {
                    interval.tick().await;
                }

                let end = (start + frame_len).min(samples.len());
                let frame = AudioFrame {
                    samples: samples[start..end].to_vec(),
                    sample_rate,
                    channels: 1,
                    timestamp_ms: start as u64 * 1000 / u64::from(sample_rate),
                };

                if tx.send(frame).await.is_err() {
                    break;
                }
                cursor.store(end, Ordering::SeqCst);
            }
        }));

        Ok(rx)
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.task.is_some()
    }

    fn name(&self) -> &str {
        "file replay"
    }
}

impl Drop for FileBackend {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
