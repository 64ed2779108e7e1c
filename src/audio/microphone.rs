//! Microphone capture via cpal
//!
//! cpal streams are not `Send` on every platform, so the stream lives on a
//! dedicated thread for its whole lifetime. The thread reports acquisition
//! success or failure once, then parks until it is told to stop; dropping the
//! stream there releases the device.

use anyhow::{bail, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::backend::{AudioBackend, AudioBackendConfig, AudioFrame};
use super::resample::StreamResampler;

/// Frames buffered between the device callback and the pipeline
const FRAME_CHANNEL_CAPACITY: usize = 64;

/// Exclusive capture from the default input device
pub struct MicrophoneBackend {
    config: AudioBackendConfig,
    worker: Option<StreamWorker>,
}

struct StreamWorker {
    stop_tx: std_mpsc::Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl StreamWorker {
    fn signal_stop(&self) {
        // The thread may already be gone after a failed acquisition
        let _ = self.stop_tx.send(());
    }
}

impl MicrophoneBackend {
    pub fn new(config: AudioBackendConfig) -> Self {
        if config.target_channels != 1 {
            warn!(
                "Microphone backend captures mono; ignoring requested {} channels",
                config.target_channels
            );
        }

        Self {
            config,
            worker: None,
        }
    }

    async fn shutdown(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.signal_stop();
            if let Some(thread) = worker.thread.take() {
                match tokio::task::spawn_blocking(move || thread.join()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => error!("Microphone thread panicked"),
                    Err(e) => error!("Failed to join microphone thread: {}", e),
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl AudioBackend for MicrophoneBackend {
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>> {
        if self.worker.is_some() {
            bail!("Already capturing");
        }

        let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel();
        let config = self.config.clone();

        let thread = std::thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || run_input_stream(config, frame_tx, ready_tx, stop_rx))
            .context("Failed to spawn microphone thread")?;

        // Registered before awaiting so a cancelled start can still be stopped
        self.worker = Some(StreamWorker {
            stop_tx,
            thread: Some(thread),
        });

        match ready_rx.await {
            Ok(Ok(device_name)) => {
                info!(
                    "Microphone capture started on '{}' ({}Hz mono, {}ms frames)",
                    device_name, self.config.target_sample_rate, self.config.buffer_duration_ms
                );
                Ok(frame_rx)
            }
            Ok(Err(reason)) => {
                self.shutdown().await;
                bail!(reason)
            }
            Err(_) => {
                self.shutdown().await;
                bail!("Microphone thread exited before the device was ready")
            }
        }
    }

    async fn stop(&mut self) -> Result<()> {
        if self.worker.is_none() {
            return Ok(());
        }

        info!("Stopping microphone capture");
        self.shutdown().await;
        info!("Microphone capture stopped");

        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.worker.is_some()
    }

    fn name(&self) -> &str {
        "cpal microphone"
    }
}

impl Drop for MicrophoneBackend {
    fn drop(&mut self) {
        if let Some(worker) = &self.worker {
            worker.signal_stop();
        }
    }
}

/// Body of the capture thread: acquire, report, park, release
fn run_input_stream(
    config: AudioBackendConfig,
    frame_tx: mpsc::Sender<AudioFrame>,
    ready_tx: oneshot::Sender<std::result::Result<String, String>>,
    stop_rx: std_mpsc::Receiver<()>,
) {
    let stream = match open_input_stream(&config, frame_tx) {
        Ok((stream, device_name)) => {
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(format!("Failed to start input stream: {}", e)));
                return;
            }
            if ready_tx.send(Ok(device_name)).is_err() {
                // Start was cancelled while the device was being acquired
                debug!("Microphone start abandoned, releasing device");
                return;
            }
            stream
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e.to_string()));
            return;
        }
    };

    // Either an explicit stop or the backend being dropped ends capture
    let _ = stop_rx.recv();
    drop(stream);
    debug!("Microphone stream released");
}

fn open_input_stream(
    config: &AudioBackendConfig,
    frame_tx: mpsc::Sender<AudioFrame>,
) -> Result<(cpal::Stream, String)> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .context("No input device available")?;
    let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());

    let target_rate = cpal::SampleRate(config.target_sample_rate);

    // Prefer a native mono f32 config at the target rate, otherwise convert
    let preferred = device
        .supported_input_configs()
        .context("Failed to query input configs")?
        .find(|c| {
            c.channels() == 1
                && c.sample_format() == SampleFormat::F32
                && c.min_sample_rate() <= target_rate
                && c.max_sample_rate() >= target_rate
        })
        .map(|c| c.with_sample_rate(target_rate));

    let supported = match preferred {
        Some(c) => c,
        None => device
            .default_input_config()
            .context("Failed to query default input config")?,
    };

    let sample_format = supported.sample_format();
    let stream_config = supported.config();

    debug!(
        device = %device_name,
        device_rate = stream_config.sample_rate.0,
        device_channels = stream_config.channels,
        ?sample_format,
        "Opening input stream"
    );

    let assembler = FrameAssembler::new(
        stream_config.sample_rate.0,
        stream_config.channels,
        config,
        frame_tx,
    )?;

    let stream = match sample_format {
        SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, assembler)?,
        SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, assembler)?,
        SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, assembler)?,
        other => bail!("Unsupported input sample format: {:?}", other),
    };

    Ok((stream, device_name))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut assembler: FrameAssembler,
) -> Result<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let stream = device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                assembler.push(data.iter().map(|s| s.to_sample::<f32>()));
            },
            |err| {
                error!("Microphone stream error: {}", err);
            },
            None,
        )
        .context("Failed to build input stream")?;

    Ok(stream)
}

/// Names of the available input devices
pub fn list_input_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .context("Failed to enumerate input devices")?;

    Ok(devices.filter_map(|d| d.name().ok()).collect())
}

/// Converts device callbacks into fixed-size mono frames at the target rate
///
/// Channels are averaged, then the mono signal is band-limited and resampled.
/// Timestamps are derived from the emitted sample count, so they advance
/// exactly with the audio rather than with callback jitter.
pub(crate) struct FrameAssembler {
    device_channels: usize,
    resampler: StreamResampler,
    /// Device-rate mono samples from the current callback
    mono: Vec<f32>,
    pending: Vec<i16>,
    frame_len: usize,
    emitted: u64,
    sample_rate: u32,
    tx: mpsc::Sender<AudioFrame>,
}

impl FrameAssembler {
    pub(crate) fn new(
        device_rate: u32,
        device_channels: u16,
        config: &AudioBackendConfig,
        tx: mpsc::Sender<AudioFrame>,
    ) -> Result<Self> {
        let frame_len =
            (u64::from(config.target_sample_rate) * config.buffer_duration_ms / 1000).max(1) as usize;

        Ok(Self {
            device_channels: usize::from(device_channels.max(1)),
            resampler: StreamResampler::new(device_rate, config.target_sample_rate)?,
            mono: Vec::new(),
            pending: Vec::with_capacity(frame_len),
            frame_len,
            emitted: 0,
            sample_rate: config.target_sample_rate,
            tx,
        })
    }

    pub(crate) fn push(&mut self, data: impl Iterator<Item = f32>) {
        let mut frame_sum = 0.0f32;
        let mut in_frame = 0usize;

        self.mono.clear();
        for sample in data {
            frame_sum += sample;
            in_frame += 1;
            if in_frame == self.device_channels {
                self.mono.push(frame_sum / self.device_channels as f32);
                frame_sum = 0.0;
                in_frame = 0;
            }
        }

        let converted = match self.resampler.process(&self.mono) {
            Ok(converted) => converted,
            Err(e) => {
                warn!("Dropping {} microphone samples: {:#}", self.mono.len(), e);
                return;
            }
        };

        for value in converted {
            self.pending
                .push((value * 32767.0).clamp(-32768.0, 32767.0) as i16);
            if self.pending.len() == self.frame_len {
                self.emit();
            }
        }
    }

    fn emit(&mut self) {
        let samples = std::mem::replace(&mut self.pending, Vec::with_capacity(self.frame_len));
        let timestamp_ms = self.emitted * 1000 / u64::from(self.sample_rate);
        self.emitted += samples.len() as u64;

        let frame = AudioFrame {
            samples,
            sample_rate: self.sample_rate,
            channels: 1,
            timestamp_ms,
        };

        // Never block the device callback
        if let Err(e) = self.tx.try_send(frame) {
            warn!("Dropping microphone frame at {}ms: {}", timestamp_ms, e);
        }
    }
}
