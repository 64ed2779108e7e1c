//! Gapless playback scheduling
//!
//! Each buffer starts at `max(clock, previous start + previous duration)`,
//! so reply fragments play strictly in arrival order with no overlap and no
//! gap, however unevenly they arrive.

use std::collections::VecDeque;
use tracing::{debug, info, warn};

use super::decode::{decode_payload, PlaybackBuffer, PlaybackConfig};
use super::output::{AudioSink, CompletionReceiver, EntryId, ScheduledEntry};
use crate::error::{VoiceError, VoiceResult};

/// Whether anything is left to play after a completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStatus {
    Idle,
    Busy { queued: usize },
}

/// Ordered start offsets, independent of any device
#[derive(Debug, Default)]
pub struct PlaybackQueue {
    entries: VecDeque<ScheduledEntry>,
    next_start: f64,
    next_id: EntryId,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next slot for a buffer of `duration` seconds
    pub fn schedule(&mut self, duration: f64, clock: f64) -> ScheduledEntry {
        let start = clock.max(self.next_start);
        self.next_id += 1;

        let entry = ScheduledEntry {
            id: self.next_id,
            start,
            duration,
        };
        self.next_start = entry.end();
        self.entries.push_back(entry);
        entry
    }

    /// Drop a finished entry; `None` if it was not queued (e.g. after `stop_all`)
    pub fn complete(&mut self, id: EntryId) -> Option<PlaybackStatus> {
        let index = self.entries.iter().position(|e| e.id == id)?;
        self.entries.remove(index);

        Some(if self.entries.is_empty() {
            PlaybackStatus::Idle
        } else {
            PlaybackStatus::Busy {
                queued: self.entries.len(),
            }
        })
    }

    /// Forget every entry and rewind the schedule to zero
    pub fn stop_all(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        self.next_start = 0.0;
        dropped
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> impl Iterator<Item = &ScheduledEntry> {
        self.entries.iter()
    }

    /// Where the next buffer would start if the clock were behind it
    pub fn next_start(&self) -> f64 {
        self.next_start
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    pub scheduled: u64,
    pub completed: u64,
    pub dropped: u64,
}

/// Decodes reply payloads and feeds them to a sink in schedule order
pub struct PlaybackScheduler {
    config: PlaybackConfig,
    queue: PlaybackQueue,
    sink: Box<dyn AudioSink>,
    completions: CompletionReceiver,
    stats: PlaybackStats,
}

impl PlaybackScheduler {
    pub fn new(config: PlaybackConfig, sink: Box<dyn AudioSink>, completions: CompletionReceiver) -> Self {
        let mut config = config;
        if sink.sample_rate() != config.output_sample_rate {
            info!(
                "Output runs at {}Hz; decoding replies to match",
                sink.sample_rate()
            );
            config.output_sample_rate = sink.sample_rate();
        }

        Self {
            config,
            queue: PlaybackQueue::new(),
            sink,
            completions,
            stats: PlaybackStats::default(),
        }
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }

    /// Decode and enqueue one payload
    ///
    /// A payload that fails to decode is dropped; the queue is untouched.
    pub fn enqueue_payload(&mut self, payload: &str) -> VoiceResult<ScheduledEntry> {
        let buffer = match decode_payload(payload, &self.config) {
            Ok(buffer) => buffer,
            Err(e) => {
                self.stats.dropped += 1;
                return Err(e);
            }
        };
        self.enqueue(buffer)
    }

    pub fn enqueue(&mut self, buffer: PlaybackBuffer) -> VoiceResult<ScheduledEntry> {
        let entry = self.queue.schedule(buffer.duration_secs(), self.sink.clock());

        if let Err(e) = self.sink.schedule(&entry, buffer) {
            self.queue.complete(entry.id);
            self.stats.dropped += 1;
            return Err(VoiceError::DecodeFailure(format!("{:#}", e)));
        }

        self.stats.scheduled += 1;
        debug!(
            "Scheduled reply audio #{} at {:.3}s for {:.3}s ({} queued)",
            entry.id,
            entry.start,
            entry.duration,
            self.queue.len()
        );
        Ok(entry)
    }

    /// Wait for the sink to finish an entry
    pub async fn next_completion(&mut self) -> EntryId {
        match self.completions.recv().await {
            Some(id) => id,
            // Sink gone: nothing will ever complete again
            None => std::future::pending().await,
        }
    }

    /// Record a finished entry; stale ids from before `stop_all` return `None`
    pub fn complete(&mut self, id: EntryId) -> Option<PlaybackStatus> {
        let status = self.queue.complete(id);
        if status.is_some() {
            self.stats.completed += 1;
            debug!("Reply audio #{} finished", id);
        }
        status
    }

    /// Halt everything playing or queued and rewind the clock
    pub fn stop_all(&mut self) {
        let dropped = self.queue.stop_all();
        self.sink.stop_all();
        if dropped > 0 {
            warn!("Stopped playback with {} buffers outstanding", dropped);
        }
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> PlaybackStats {
        self.stats
    }
}
