// Test doubles for driving the session engine without devices or a network
#![allow(dead_code)]

use anyhow::{bail, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use handsfree_voice::audio::{AudioBackend, AudioFrame};
use handsfree_voice::playback::{
    completion_channel, AudioSink, CompletionSender, PlaybackBuffer, ScheduledEntry,
};
use handsfree_voice::session::{SendMode, SessionConfig, SessionEngine, SessionHandle, SessionSnapshot};
use handsfree_voice::transport::{
    ConnectionHandle, Connector, LinkEvent, Outgoing, ReconnectPolicy, WireMessage,
};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

pub const FRAME_MS: u64 = 20;
pub const FRAME_SAMPLES: usize = 320;

// ============================================================================
// Connector
// ============================================================================

/// The server's half of one in-memory link
pub struct ServerEnd {
    pub outgoing: mpsc::Receiver<Outgoing>,
    pub incoming: mpsc::Sender<LinkEvent>,
}

impl ServerEnd {
    pub async fn say(&self, text: &str) {
        self.incoming
            .send(LinkEvent::Message(WireMessage::Text(text.to_string())))
            .await
            .expect("client side of the link is gone");
    }

    /// Next message the client sent, or `None` once it closed the link
    pub async fn next_message(&mut self) -> Option<WireMessage> {
        match self.outgoing.recv().await {
            Some(Outgoing::Message(message)) => Some(message),
            Some(Outgoing::Close) | None => None,
        }
    }

    /// Everything sent so far, without waiting
    pub fn drain(&mut self) -> Vec<Outgoing> {
        let mut sent = Vec::new();
        while let Ok(item) = self.outgoing.try_recv() {
            sent.push(item);
        }
        sent
    }
}

#[derive(Default)]
pub struct LinkControl {
    pub attempts: AtomicU32,
    pub fail: AtomicBool,
}

pub struct MemoryConnector {
    control: Arc<LinkControl>,
    links: mpsc::UnboundedSender<ServerEnd>,
}

#[async_trait::async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, _url: &str) -> Result<ConnectionHandle> {
        self.control.attempts.fetch_add(1, Ordering::SeqCst);
        if self.control.fail.load(Ordering::SeqCst) {
            bail!("connection refused");
        }

        let (out_tx, out_rx) = mpsc::channel(1024);
        let (in_tx, in_rx) = mpsc::channel(1024);
        let _ = self.links.send(ServerEnd {
            outgoing: out_rx,
            incoming: in_tx,
        });

        Ok(ConnectionHandle::new(out_tx, in_rx, None))
    }
}

// ============================================================================
// Capture backend
// ============================================================================

#[derive(Default)]
pub struct MicControl {
    pub starts: AtomicU32,
    pub stops: AtomicU32,
    pub fail: AtomicBool,
    /// Acquisition never completes (waiting on a permission prompt)
    pub hang: AtomicBool,
    pub entered: Notify,
}

/// Hands the test a frame sender for every capture start
pub struct ScriptedBackend {
    control: Arc<MicControl>,
    mics: mpsc::UnboundedSender<mpsc::Sender<AudioFrame>>,
    running: bool,
}

#[async_trait::async_trait]
impl AudioBackend for ScriptedBackend {
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>> {
        if self.running {
            bail!("Already capturing");
        }

        self.control.starts.fetch_add(1, Ordering::SeqCst);
        self.control.entered.notify_one();

        if self.control.fail.load(Ordering::SeqCst) {
            bail!("microphone permission denied");
        }
        if self.control.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let (tx, rx) = mpsc::channel(64);
        let _ = self.mics.send(tx);
        self.running = true;
        Ok(rx)
    }

    async fn stop(&mut self) -> Result<()> {
        if self.running {
            self.running = false;
            self.control.stops.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.running
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

// ============================================================================
// Audio sink
// ============================================================================

#[derive(Debug, Default)]
pub struct SinkLog {
    pub entries: Vec<ScheduledEntry>,
    pub stop_alls: u32,
    pub clock: f64,
}

pub struct RecordingSink {
    log: Arc<Mutex<SinkLog>>,
}

impl AudioSink for RecordingSink {
    fn clock(&self) -> f64 {
        self.log.lock().unwrap().clock
    }

    fn schedule(&mut self, entry: &ScheduledEntry, _buffer: PlaybackBuffer) -> Result<()> {
        self.log.lock().unwrap().entries.push(*entry);
        Ok(())
    }

    fn stop_all(&mut self) {
        let mut log = self.log.lock().unwrap();
        log.stop_alls += 1;
        log.clock = 0.0;
    }

    fn sample_rate(&self) -> u32 {
        24000
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub handle: SessionHandle,
    pub links: mpsc::UnboundedReceiver<ServerEnd>,
    pub mics: mpsc::UnboundedReceiver<mpsc::Sender<AudioFrame>>,
    pub mic: Arc<MicControl>,
    pub link: Arc<LinkControl>,
    pub sink: Arc<Mutex<SinkLog>>,
    pub completions: CompletionSender,
    pub task: JoinHandle<()>,
}

impl Harness {
    pub async fn next_link(&mut self) -> ServerEnd {
        tokio::time::timeout(Duration::from_secs(30), self.links.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped")
    }

    pub async fn next_mic(&mut self) -> mpsc::Sender<AudioFrame> {
        tokio::time::timeout(Duration::from_secs(30), self.mics.recv())
            .await
            .expect("timed out waiting for capture to start")
            .expect("backend dropped")
    }

    pub async fn wait_until(
        &self,
        what: &str,
        predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> SessionSnapshot {
        let mut updates = self.handle.subscribe();
        let snapshot = tokio::time::timeout(Duration::from_secs(30), updates.wait_for(predicate))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
            .expect("engine stopped publishing")
            .clone();
        snapshot
    }

    pub fn scheduled(&self) -> Vec<ScheduledEntry> {
        self.sink.lock().unwrap().entries.clone()
    }

    pub fn set_clock(&self, seconds: f64) {
        self.sink.lock().unwrap().clock = seconds;
    }
}

pub fn test_config(mode: SendMode) -> SessionConfig {
    SessionConfig {
        server_url: "mem://assistant/ws/audio".to_string(),
        send_mode: mode,
        inactivity_timeout: Duration::from_secs(600),
        reconnect: ReconnectPolicy {
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(1),
            max_attempts: 3,
        },
        ..SessionConfig::default()
    }
}

pub fn harness(config: SessionConfig) -> Harness {
    let mic = Arc::new(MicControl::default());
    let link = Arc::new(LinkControl::default());
    let sink = Arc::new(Mutex::new(SinkLog::default()));

    let (mics_tx, mics_rx) = mpsc::unbounded_channel();
    let (links_tx, links_rx) = mpsc::unbounded_channel();
    let (completions_tx, completions_rx) = completion_channel();

    let backend = ScriptedBackend {
        control: Arc::clone(&mic),
        mics: mics_tx,
        running: false,
    };
    let connector = MemoryConnector {
        control: Arc::clone(&link),
        links: links_tx,
    };
    let recording = RecordingSink {
        log: Arc::clone(&sink),
    };

    let (engine, handle) = SessionEngine::new(
        config,
        Box::new(backend),
        Arc::new(connector),
        Box::new(recording),
        completions_rx,
    );

    Harness {
        handle,
        links: links_rx,
        mics: mics_rx,
        mic,
        link,
        sink,
        completions: completions_tx,
        task: engine.spawn(),
    }
}

// ============================================================================
// Audio helpers
// ============================================================================

pub fn voiced(timestamp_ms: u64) -> AudioFrame {
    AudioFrame {
        samples: (0..FRAME_SAMPLES)
            .map(|i| if i % 2 == 0 { 8000 } else { -8000 })
            .collect(),
        sample_rate: 16000,
        channels: 1,
        timestamp_ms,
    }
}

pub fn silent(timestamp_ms: u64) -> AudioFrame {
    AudioFrame {
        samples: vec![0; FRAME_SAMPLES],
        sample_rate: 16000,
        channels: 1,
        timestamp_ms,
    }
}

/// `voiced_frames` of speech followed by `silence_ms` of silence
pub fn utterance(voiced_frames: u64, silence_ms: u64) -> Vec<AudioFrame> {
    let mut frames: Vec<AudioFrame> = (0..voiced_frames).map(|i| voiced(i * FRAME_MS)).collect();
    let start = voiced_frames * FRAME_MS;
    frames.extend((0..silence_ms / FRAME_MS).map(|i| silent(start + i * FRAME_MS)));
    frames
}

/// Feed frames until capture stops accepting them
pub async fn feed(mic: &mpsc::Sender<AudioFrame>, frames: Vec<AudioFrame>) -> usize {
    let mut delivered = 0;
    for frame in frames {
        if mic.send(frame).await.is_err() {
            break;
        }
        delivered += 1;
    }
    delivered
}

/// Base64 WAV of silence at the sink rate
pub fn reply_payload(seconds: f64) -> String {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 24000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for _ in 0..(seconds * 24000.0).round() as usize {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();
    }
    STANDARD.encode(cursor.into_inner())
}
