//! Session lifecycle manager
//!
//! One task owns every resource (capture pipeline, transport, playback) and
//! reacts to four event sources from a single `select!` loop: control
//! commands, capture frames, link events and playback completions, plus
//! the reconnect and inactivity deadlines. Handlers run one at a time, so
//! no state is shared or locked; every handler checks that the resource it
//! was woken for is still live.

use chrono::Utc;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::config::{SendMode, SessionConfig};
use super::handle::{Command, SessionHandle, COMMAND_CAPACITY};
use super::state::{Assignment, ConnectionStatus, Session, SessionSnapshot, SessionState};
use crate::audio::{AudioBackend, AudioFrame, CapturePipeline, EndpointEvent};
use crate::error::{VoiceError, VoiceResult};
use crate::playback::{AudioSink, CompletionReceiver, EntryId, PlaybackScheduler, PlaybackStatus};
use crate::protocol::Inbound;
use crate::transport::{Connector, Transport, TransportEvent};

pub struct SessionEngine {
    config: SessionConfig,
    session: Session,
    capture: CapturePipeline,
    transport: Transport,
    playback: PlaybackScheduler,

    commands: mpsc::Receiver<Command>,
    /// Commands that arrived while an acquisition was in progress
    deferred: VecDeque<Command>,
    snapshot: watch::Sender<SessionSnapshot>,

    is_recording: bool,
    started_at: Option<chrono::DateTime<Utc>>,
    transcript: String,
    reply_text: String,
    connection: ConnectionStatus,
    last_error: Option<String>,

    /// Current utterance contains at least one voiced frame
    heard_speech: bool,
    pending_clip: Option<Vec<u8>>,
    pending_end: bool,
    /// Inactivity fired while reply audio was still playing
    close_after_drain: bool,

    inactivity_deadline: Option<Instant>,
    reconnect_deadline: Option<Instant>,
    failed_attempts: u32,

    utterances_sent: u64,
    replies_played: u64,
}

impl SessionEngine {
    pub fn new(
        config: SessionConfig,
        backend: Box<dyn AudioBackend>,
        connector: Arc<dyn Connector>,
        sink: Box<dyn AudioSink>,
        completions: CompletionReceiver,
    ) -> (Self, SessionHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());

        let engine = Self {
            capture: CapturePipeline::new(backend, config.endpoint),
            transport: Transport::new(config.server_url.clone(), connector),
            playback: PlaybackScheduler::new(config.playback, sink, completions),
            config,
            session: Session::new(),
            commands: command_rx,
            deferred: VecDeque::new(),
            snapshot: snapshot_tx,
            is_recording: false,
            started_at: None,
            transcript: String::new(),
            reply_text: String::new(),
            connection: ConnectionStatus::Disconnected,
            last_error: None,
            heard_speech: false,
            pending_clip: None,
            pending_end: false,
            close_after_drain: false,
            inactivity_deadline: None,
            reconnect_deadline: None,
            failed_attempts: 0,
            utterances_sent: 0,
            replies_played: 0,
        };

        (engine, SessionHandle::new(command_tx, snapshot_rx))
    }

    /// Run the engine on its own task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        info!(
            "Session engine running ({:?} mode, {})",
            self.config.send_mode,
            self.capture.backend_name()
        );

        loop {
            if let Some(command) = self.deferred.pop_front() {
                if !self.handle_command(command).await {
                    break;
                }
                self.publish();
                continue;
            }

            let inactivity = self.inactivity_deadline;
            let reconnect = self.reconnect_deadline;

            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            break;
                        }
                    }
                    None => {
                        debug!("All session handles dropped");
                        break;
                    }
                },
                frame = self.capture.next_frame() => self.on_frame(frame).await,
                event = self.transport.next_event() => self.on_transport_event(event).await,
                id = self.playback.next_completion() => self.on_playback_complete(id).await,
                _ = sleep_until(reconnect) => self.on_reconnect_due().await,
                _ = sleep_until(inactivity) => self.on_inactivity().await,
            }

            self.publish();
        }

        self.stop_session().await;
        self.publish();
        info!("Session engine stopped");
    }

    /// Returns false when the loop should exit
    ///
    /// Snapshots are published before replying, so callers see the outcome.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Start(reply) => {
                let result = self.start_session().await;
                self.publish();
                let _ = reply.send(result);
            }
            Command::Stop(reply) => {
                self.stop_session().await;
                self.publish();
                let _ = reply.send(());
            }
            Command::EndConversation(reply) => {
                self.stop_session().await;
                if let Some(id) = self.session.reset_id() {
                    info!("Conversation {} ended", id);
                }
                self.transcript.clear();
                self.reply_text.clear();
                self.publish();
                let _ = reply.send(());
            }
            Command::Shutdown => return false,
        }
        true
    }

    async fn start_session(&mut self) -> VoiceResult<()> {
        if self.is_recording {
            debug!("Session already running");
            return Ok(());
        }

        info!("Starting voice session");
        self.transcript.clear();
        self.reply_text.clear();
        self.last_error = None;
        self.is_recording = true;
        self.started_at = Some(Utc::now());
        self.failed_attempts = 0;
        self.publish();

        let acquired = match self.begin_capture().await {
            Ok(acquired) => acquired,
            Err(e) => {
                error!("Cannot start session: {}", e);
                self.last_error = Some(e.to_string());
                self.stop_session().await;
                return Err(e);
            }
        };

        if acquired && !self.transport.has_link() {
            self.connect_link().await;
        }

        Ok(())
    }

    /// Stop everything; safe from any state and idempotent
    async fn stop_session(&mut self) {
        let already_stopped = !self.is_recording
            && self.session.state() == SessionState::Idle
            && !self.capture.is_capturing()
            && !self.transport.has_link()
            && self.playback.is_idle();
        if already_stopped {
            debug!("Session already stopped");
            return;
        }

        info!("Stopping voice session");
        self.session.transition(SessionState::Closing);
        self.is_recording = false;

        self.capture.stop().await;
        self.capture.clip_mut().clear();
        self.playback.stop_all();
        self.transport.disconnect().await;

        self.heard_speech = false;
        self.pending_clip = None;
        self.pending_end = false;
        self.close_after_drain = false;
        self.inactivity_deadline = None;
        self.reconnect_deadline = None;
        self.failed_attempts = 0;
        if self.connection != ConnectionStatus::Failed {
            self.connection = ConnectionStatus::Disconnected;
        }

        self.session.transition(SessionState::Idle);
        info!("Voice session stopped");
    }

    /// Acquire the microphone; a stop arriving meanwhile wins
    ///
    /// `Ok(false)` means the acquisition was cancelled.
    async fn begin_capture(&mut self) -> VoiceResult<bool> {
        self.heard_speech = false;
        self.capture.clip_mut().clear();

        let started =
            interruptible(self.capture.start(), &mut self.commands, &mut self.deferred).await;

        match started {
            Some(Ok(())) => {
                self.session.transition(SessionState::Listening);
                Ok(true)
            }
            Some(Err(e)) => {
                self.capture.stop().await;
                Err(e)
            }
            None => {
                debug!("Capture acquisition cancelled");
                self.capture.stop().await;
                Ok(false)
            }
        }
    }

    /// Restart capture after a finished turn
    async fn resume_listening(&mut self) {
        if !self.is_recording || self.capture.is_capturing() {
            return;
        }

        debug!("Resuming listening");
        if let Err(e) = self.begin_capture().await {
            error!("Cannot resume listening: {}", e);
            self.last_error = Some(e.to_string());
            self.stop_session().await;
        }
    }

    /// Open a new link, resuming the session id; returns whether it is open
    async fn connect_link(&mut self) -> bool {
        self.reconnect_deadline = None;
        self.connection = if self.failed_attempts == 0 {
            ConnectionStatus::Connecting
        } else {
            ConnectionStatus::Reconnecting {
                attempt: self.failed_attempts + 1,
            }
        };
        self.publish();

        let session_id = self.session.session_id().map(str::to_owned);
        let connected = interruptible(
            self.transport.connect(session_id.as_deref()),
            &mut self.commands,
            &mut self.deferred,
        )
        .await;

        match connected {
            Some(Ok(())) => {
                info!("Connected to {}", self.config.server_url);
                self.connection = ConnectionStatus::Connected;
                self.failed_attempts = 0;
                self.session.touch();
                self.reset_inactivity();
                true
            }
            Some(Err(e)) => {
                warn!("{}", e);
                self.transport.disconnect().await;
                self.failed_attempts += 1;
                if self.config.reconnect.exhausted(self.failed_attempts) {
                    self.give_up().await;
                } else {
                    self.schedule_reconnect();
                }
                false
            }
            None => {
                debug!("Connection attempt cancelled");
                self.transport.disconnect().await;
                false
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        if !self.is_recording {
            self.connection = ConnectionStatus::Disconnected;
            return;
        }

        let attempt = self.failed_attempts + 1;
        let delay = self.config.reconnect.delay_for(attempt);
        info!("Reconnecting in {:?} (attempt {})", delay, attempt);
        self.connection = ConnectionStatus::Reconnecting { attempt };
        self.reconnect_deadline = Some(Instant::now() + delay);
    }

    async fn give_up(&mut self) {
        let attempts = self.failed_attempts;
        let e = VoiceError::Disconnected { attempts };
        error!("{}", e);
        self.connection = ConnectionStatus::Failed;
        self.stop_session().await;
        self.last_error = Some(e.to_string());
    }

    async fn on_reconnect_due(&mut self) {
        self.reconnect_deadline = None;
        if !self.is_recording {
            return;
        }

        if !self.connect_link().await {
            return;
        }

        let flushed = self.flush_pending().await;
        // The turn in flight was lost with the old link; start a new one
        if !flushed && self.session.state() == SessionState::AwaitingReply {
            self.session.transition(SessionState::Listening);
            self.resume_listening().await;
        }
    }

    /// Bring the link back on demand after a deliberate close
    async fn ensure_link(&mut self) {
        if self.transport.has_link() || self.reconnect_deadline.is_some() {
            return;
        }
        if self.connect_link().await {
            self.flush_pending().await;
        }
    }

    /// Send whatever was held back while the link was down
    ///
    /// Returns whether an end-of-utterance went out.
    async fn flush_pending(&mut self) -> bool {
        if !self.transport.is_open() {
            return false;
        }

        if self.config.send_mode == SendMode::Streaming {
            for frame in self.capture.clip_mut().drain_frames() {
                if let Err(e) = self.transport.send_frame(&frame).await {
                    warn!("Dropping buffered audio: {}", e);
                    return false;
                }
            }
        }

        if let Some(clip) = self.pending_clip.take() {
            if let Err(e) = self.transport.send_clip(clip.clone()).await {
                warn!("Utterance clip not sent: {}", e);
                self.pending_clip = Some(clip);
                return false;
            }
        }

        if self.pending_end {
            if let Err(e) = self.transport.end_utterance().await {
                warn!("End of utterance not sent: {}", e);
                return false;
            }
            self.pending_end = false;
            self.utterances_sent += 1;
            return true;
        }

        false
    }

    async fn on_frame(&mut self, frame: Option<AudioFrame>) {
        let frame = match frame {
            Some(frame) => frame,
            None => {
                info!("Capture source ended");
                self.stop_session().await;
                return;
            }
        };

        let outcome = match self.capture.process(&frame) {
            Some(outcome) => outcome,
            None => return,
        };

        if outcome.voiced {
            self.heard_speech = true;
            self.session.transition(SessionState::Listening);
        } else if self.capture.is_timing_silence() {
            self.session.transition(SessionState::AwaitingEndpoint);
        }

        match self.config.send_mode {
            SendMode::Batch => self.capture.clip_mut().push(frame),
            SendMode::Streaming => self.stream_frame(frame, outcome.voiced).await,
        }

        if let Some(event) = outcome.endpoint {
            self.on_utterance_end(event).await;
        }
    }

    async fn stream_frame(&mut self, frame: AudioFrame, voiced: bool) {
        if self.transport.is_open() && self.capture.clip_mut().is_empty() {
            if let Err(e) = self.transport.send_frame(&frame).await {
                debug!("Holding frame back: {}", e);
                self.capture.clip_mut().push(frame);
            }
            return;
        }

        // Link down: keep the utterance from its first voiced frame on
        if voiced || !self.capture.clip_mut().is_empty() {
            self.capture.clip_mut().push(frame);
        }
        if voiced {
            self.ensure_link().await;
        }
    }

    async fn on_utterance_end(&mut self, event: EndpointEvent) {
        if !self.heard_speech {
            debug!("Discarding silent utterance");
            self.capture.clip_mut().clear();
            return;
        }

        info!(
            "Utterance ended after {}ms of silence",
            event.fired_at_ms.saturating_sub(event.silence_started_ms)
        );

        self.heard_speech = false;
        self.capture.stop().await;
        self.reply_text.clear();
        self.session.transition(SessionState::Streaming);

        if self.config.send_mode == SendMode::Batch {
            match self.capture.take_clip() {
                Ok(clip) => self.pending_clip = clip,
                Err(e) => error!("Failed to encode utterance: {:#}", e),
            }
        }
        self.pending_end = true;

        if self.transport.is_open() {
            self.flush_pending().await;
        } else {
            self.ensure_link().await;
        }

        self.session.transition(SessionState::AwaitingReply);
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message(message) => {
                self.reset_inactivity();
                self.session.touch();
                self.on_inbound(message).await;
            }
            TransportEvent::Closed { reason } => {
                warn!(
                    "Connection lost: {}",
                    reason.as_deref().unwrap_or("no reason given")
                );
                self.connection = ConnectionStatus::Disconnected;
                self.inactivity_deadline = None;
                if self.is_recording {
                    self.schedule_reconnect();
                }
            }
        }
    }

    async fn on_inbound(&mut self, message: Inbound) {
        match message {
            Inbound::SessionAssigned(id) => match self.session.assign_id(&id) {
                Assignment::Assigned => info!("Session id assigned: {}", id),
                Assignment::Unchanged => debug!("Session id confirmed: {}", id),
                Assignment::Conflict => warn!(
                    "Ignoring session id {} (already {})",
                    id,
                    self.session.session_id().unwrap_or_default()
                ),
            },
            Inbound::StreamToken(token) => self.reply_text.push_str(&token),
            Inbound::MicTranscript(text) => {
                debug!("Transcript: {}", text);
                self.transcript = text;
            }
            Inbound::AudioPayload(payload) => self.on_reply_audio(&payload).await,
            Inbound::Unrecognized(description) => {
                warn!("{}", VoiceError::ProtocolAnomaly(description));
            }
        }
    }

    async fn on_reply_audio(&mut self, payload: &str) {
        if !self.is_recording {
            debug!("Ignoring reply audio while stopped");
            return;
        }

        if let Err(e) = self.playback.enqueue_payload(payload) {
            warn!("Dropping reply audio: {}", e);
            return;
        }

        if self.capture.is_capturing() {
            self.capture.stop().await;
            self.capture.clip_mut().clear();
            self.heard_speech = false;
        }
        self.session.transition(SessionState::Playing);
    }

    async fn on_playback_complete(&mut self, id: EntryId) {
        match self.playback.complete(id) {
            Some(PlaybackStatus::Idle) => self.on_playback_idle().await,
            Some(PlaybackStatus::Busy { queued }) => debug!("{} reply buffers left", queued),
            None => debug!("Stale completion for #{}", id),
        }
    }

    async fn on_playback_idle(&mut self) {
        self.replies_played += 1;
        debug!("Playback idle");

        if self.close_after_drain {
            self.close_after_drain = false;
            self.close_idle_link().await;
        } else if self.config.close_after_reply && self.transport.has_link() {
            info!("Reply finished; closing connection");
            self.transport.disconnect().await;
            self.connection = ConnectionStatus::Disconnected;
            self.inactivity_deadline = None;
        }

        if self.session.state() == SessionState::Playing {
            self.session.transition(SessionState::Listening);
            self.resume_listening().await;
        }
    }

    async fn on_inactivity(&mut self) {
        self.inactivity_deadline = None;
        if !self.transport.has_link() {
            // No link and no retry pending: the turn in flight cannot complete
            if self.reconnect_deadline.is_none()
                && self.session.state() == SessionState::AwaitingReply
            {
                self.session.transition(SessionState::Listening);
                self.resume_listening().await;
            }
            return;
        }

        if !self.playback.is_idle() {
            debug!("Inactive, closing once playback drains");
            self.close_after_drain = true;
            return;
        }

        self.close_idle_link().await;

        if self.session.state() == SessionState::AwaitingReply {
            self.session.transition(SessionState::Listening);
            self.resume_listening().await;
        }
    }

    async fn close_idle_link(&mut self) {
        info!(
            "No server activity for {:?}; closing connection",
            self.session.last_activity().elapsed()
        );
        self.transport.disconnect().await;
        self.connection = ConnectionStatus::Disconnected;
        self.inactivity_deadline = None;
    }

    fn reset_inactivity(&mut self) {
        self.inactivity_deadline = Some(Instant::now() + self.config.inactivity_timeout);
    }

    fn publish(&self) {
        let next = SessionSnapshot {
            state: self.session.state(),
            is_recording: self.is_recording,
            is_active: self.capture.is_capturing() || !self.playback.is_idle(),
            activity_level: self.capture.level(),
            transcript: self.transcript.clone(),
            reply_text: self.reply_text.clone(),
            session_id: self.session.session_id().map(str::to_owned),
            connection: self.connection,
            last_error: self.last_error.clone(),
            started_at: self.started_at,
            utterances_sent: self.utterances_sent,
            replies_played: self.replies_played,
            payloads_dropped: self.playback.stats().dropped,
        };

        self.snapshot.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

/// Await `future` unless a cancelling command arrives first
///
/// Other commands are queued in `deferred` and handled once the current
/// one finishes. Returns `None` when cancelled.
async fn interruptible<F: Future>(
    future: F,
    commands: &mut mpsc::Receiver<Command>,
    deferred: &mut VecDeque<Command>,
) -> Option<F::Output> {
    tokio::pin!(future);

    loop {
        tokio::select! {
            biased;

            command = commands.recv() => match command {
                Some(command) => {
                    let cancel = command.cancels_acquisition();
                    deferred.push_back(command);
                    if cancel {
                        return None;
                    }
                }
                None => return None,
            },
            output = &mut future => return Some(output),
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
