//! Audio output
//!
//! The scheduler decides *when* each buffer plays; a sink renders buffers at
//! those times against its own sample clock and reports completions.

use anyhow::{bail, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::decode::PlaybackBuffer;

pub type EntryId = u64;

pub type CompletionSender = mpsc::UnboundedSender<EntryId>;
pub type CompletionReceiver = mpsc::UnboundedReceiver<EntryId>;

/// Channel on which a sink reports finished entries
pub fn completion_channel() -> (CompletionSender, CompletionReceiver) {
    mpsc::unbounded_channel()
}

/// A buffer's slot on the output timeline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledEntry {
    pub id: EntryId,
    /// Seconds on the sink clock
    pub start: f64,
    pub duration: f64,
}

impl ScheduledEntry {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Something that can play buffers at given clock offsets
pub trait AudioSink: Send {
    /// Seconds rendered since creation or the last `stop_all`
    fn clock(&self) -> f64;

    /// Play `buffer` starting at `entry.start`; report `entry.id` when done
    fn schedule(&mut self, entry: &ScheduledEntry, buffer: PlaybackBuffer) -> Result<()>;

    /// Silence everything and reset the clock to zero
    fn stop_all(&mut self);

    fn sample_rate(&self) -> u32;
}

struct Voice {
    id: EntryId,
    start_frame: u64,
    samples: Vec<f32>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// State shared between the sink and the device callback
struct Timeline {
    position: u64,
    voices: Vec<Voice>,
    completions: CompletionSender,
}

impl Timeline {
    /// Mix the next `frames` output frames into `out` (mono, one value per frame)
    fn render(&mut self, out: &mut [f32]) {
        out.fill(0.0);
        let frames = out.len() as u64;
        let window_start = self.position;
        let window_end = window_start + frames;

        for voice in &self.voices {
            if voice.start_frame >= window_end || voice.end_frame() <= window_start {
                continue;
            }
            let from = voice.start_frame.max(window_start);
            let to = voice.end_frame().min(window_end);
            for t in from..to {
                out[(t - window_start) as usize] += voice.samples[(t - voice.start_frame) as usize];
            }
        }

        self.position = window_end;

        let position = self.position;
        let completions = &self.completions;
        self.voices.retain(|voice| {
            if voice.end_frame() <= position {
                let _ = completions.send(voice.id);
                false
            } else {
                true
            }
        });
    }
}

/// Default output device, fed from a sample-accurate timeline
pub struct CpalSink {
    timeline: Arc<Mutex<Timeline>>,
    sample_rate: u32,
    stop_tx: std_mpsc::Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl CpalSink {
    /// Open the default output device, preferring `preferred_rate`
    pub fn new(preferred_rate: u32, completions: CompletionSender) -> Result<Self> {
        let timeline = Arc::new(Mutex::new(Timeline {
            position: 0,
            voices: Vec::new(),
            completions,
        }));

        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel();
        let shared = Arc::clone(&timeline);

        let thread = std::thread::Builder::new()
            .name("playback-output".to_string())
            .spawn(move || run_output_stream(preferred_rate, shared, ready_tx, stop_rx))
            .context("Failed to spawn playback thread")?;

        let sample_rate = match ready_rx.recv() {
            Ok(Ok(rate)) => rate,
            Ok(Err(reason)) => {
                let _ = thread.join();
                bail!(reason)
            }
            Err(_) => {
                let _ = thread.join();
                bail!("Playback thread exited before the device was ready")
            }
        };

        Ok(Self {
            timeline,
            sample_rate,
            stop_tx,
            thread: Some(thread),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Timeline> {
        // A panic inside the callback must not take playback control down with it
        self.timeline.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl AudioSink for CpalSink {
    fn clock(&self) -> f64 {
        self.lock().position as f64 / f64::from(self.sample_rate)
    }

    fn schedule(&mut self, entry: &ScheduledEntry, buffer: PlaybackBuffer) -> Result<()> {
        if buffer.sample_rate != self.sample_rate {
            bail!(
                "Buffer at {}Hz cannot play on a {}Hz output",
                buffer.sample_rate,
                self.sample_rate
            );
        }

        let start_frame = (entry.start * f64::from(self.sample_rate)).round() as u64;
        let mut timeline = self.lock();
        if start_frame < timeline.position {
            warn!(
                "Entry {} scheduled {} frames in the past",
                entry.id,
                timeline.position - start_frame
            );
        }
        timeline.voices.push(Voice {
            id: entry.id,
            start_frame,
            samples: buffer.samples,
        });
        Ok(())
    }

    fn stop_all(&mut self) {
        let mut timeline = self.lock();
        if !timeline.voices.is_empty() {
            debug!("Silencing {} playback buffers", timeline.voices.len());
        }
        timeline.voices.clear();
        timeline.position = 0;
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Playback thread panicked");
            }
        }
    }
}

fn run_output_stream(
    preferred_rate: u32,
    timeline: Arc<Mutex<Timeline>>,
    ready_tx: std_mpsc::Sender<std::result::Result<u32, String>>,
    stop_rx: std_mpsc::Receiver<()>,
) {
    let (stream, rate) = match open_output_stream(preferred_rate, timeline) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready_tx.send(Err(format!("{:#}", e)));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(format!("Failed to start output stream: {}", e)));
        return;
    }

    if ready_tx.send(Ok(rate)).is_err() {
        return;
    }

    let _ = stop_rx.recv();
    drop(stream);
    debug!("Output stream released");
}

fn open_output_stream(
    preferred_rate: u32,
    timeline: Arc<Mutex<Timeline>>,
) -> Result<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .context("No output device available")?;
    let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());
    let target_rate = cpal::SampleRate(preferred_rate);

    let preferred = device
        .supported_output_configs()
        .context("Failed to query output configs")?
        .find(|c| c.min_sample_rate() <= target_rate && c.max_sample_rate() >= target_rate)
        .map(|c| c.with_sample_rate(target_rate));

    let supported = match preferred {
        Some(c) => c,
        None => device
            .default_output_config()
            .context("Failed to query default output config")?,
    };

    let sample_format = supported.sample_format();
    let config = supported.config();
    let rate = config.sample_rate.0;

    info!(
        "Playback on '{}' ({}Hz, {} channels, {:?})",
        device_name, rate, config.channels, sample_format
    );

    let stream = match sample_format {
        SampleFormat::F32 => build_output::<f32>(&device, &config, timeline)?,
        SampleFormat::I16 => build_output::<i16>(&device, &config, timeline)?,
        SampleFormat::U16 => build_output::<u16>(&device, &config, timeline)?,
        other => bail!("Unsupported output sample format: {:?}", other),
    };

    Ok((stream, rate))
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    timeline: Arc<Mutex<Timeline>>,
) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = usize::from(config.channels.max(1));
    let mut mono = Vec::new();

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                mono.resize(data.len() / channels, 0.0);
                match timeline.lock() {
                    Ok(mut timeline) => timeline.render(&mut mono),
                    Err(poisoned) => poisoned.into_inner().render(&mut mono),
                }
                for (frame, &value) in data.chunks_mut(channels).zip(mono.iter()) {
                    let sample = T::from_sample(value.clamp(-1.0, 1.0));
                    frame.fill(sample);
                }
            },
            |err| {
                error!("Playback stream error: {}", err);
            },
            None,
        )
        .context("Failed to build output stream")?;

    Ok(stream)
}
