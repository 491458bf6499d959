//! Gapless playback of model audio.
//!
//! ## Scheduling
//!
//! ```text
//! chunk ─decode─► PlaybackBuffer
//!                     │  start = max(next_start_time, sink.current_time())
//!                     ▼
//!           sink.start_source(id, buffer, start)
//!                     │  next_start_time = start + duration
//!                     ▼
//!              scheduled set ◄── reap_finished() on end-of-playback
//! ```
//!
//! Buffers play back to back in arrival order. `interrupt()` stops everything
//! that is scheduled, empties the set and resets `next_start_time` to 0 so the
//! next chunk re-anchors on the sink clock.

pub mod output;
pub mod speaker;
pub mod timeline;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::codec::{self, EncodedChunk, PlaybackBuffer};
use crate::error::Result;

pub use output::OutputRenderer;
pub use timeline::{Timeline, TimelineSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SourceId(pub u64);

/// The output side of the audio graph.
///
/// Times are seconds on the sink's own monotonic clock.
pub trait AudioSink: Send + 'static {
    fn current_time(&self) -> f64;

    /// Play `buffer` starting at `when`.
    fn start_source(&mut self, id: SourceId, buffer: Arc<PlaybackBuffer>, when: f64);

    /// Stop a source immediately, whether or not it has started.
    fn stop_source(&mut self, id: SourceId);

    /// Sources that played to the end since the last call.
    fn take_finished(&mut self) -> Vec<SourceId>;
}

/// A buffer that is scheduled or currently playing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledSource {
    pub id: SourceId,
    pub start_time: f64,
    pub duration: f64,
    pub frames: usize,
}

impl ScheduledSource {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackSnapshot {
    pub next_start_time: f64,
    pub scheduled: Vec<ScheduledSource>,
}

pub struct PlaybackScheduler {
    sink: Box<dyn AudioSink>,
    output_sample_rate: u32,
    output_channels: u16,
    next_start_time: f64,
    scheduled: BTreeMap<SourceId, ScheduledSource>,
    next_id: u64,
}

impl PlaybackScheduler {
    pub fn new(sink: Box<dyn AudioSink>, output_sample_rate: u32, output_channels: u16) -> Self {
        Self {
            sink,
            output_sample_rate,
            output_channels,
            next_start_time: 0.0,
            scheduled: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Decode `chunk` and schedule it right after everything already queued.
    ///
    /// Returns `Ok(None)` for an empty chunk; nothing is scheduled.
    ///
    /// # Errors
    /// `VoxError::Payload` if the chunk is not valid base64.
    pub fn enqueue(&mut self, chunk: &EncodedChunk) -> Result<Option<ScheduledSource>> {
        if chunk.is_empty() {
            debug!("ignoring empty audio chunk");
            return Ok(None);
        }
        let bytes = codec::decode_base64(chunk.data())?;
        let buffer =
            codec::build_playback_buffer(&bytes, self.output_sample_rate, self.output_channels);
        Ok(self.schedule_buffer(buffer))
    }

    /// Schedule an already decoded buffer. Empty buffers are ignored.
    pub fn schedule_buffer(&mut self, buffer: PlaybackBuffer) -> Option<ScheduledSource> {
        if buffer.is_empty() {
            debug!("ignoring empty playback buffer");
            return None;
        }

        self.next_start_time = self.next_start_time.max(self.sink.current_time());

        let id = SourceId(self.next_id);
        self.next_id += 1;

        let source = ScheduledSource {
            id,
            start_time: self.next_start_time,
            duration: buffer.duration_secs(),
            frames: buffer.frames(),
        };

        self.sink
            .start_source(id, Arc::new(buffer), source.start_time);
        self.next_start_time += source.duration;
        self.scheduled.insert(id, source);

        debug!(
            id = id.0,
            start = source.start_time,
            duration = source.duration,
            queued = self.scheduled.len(),
            "scheduled playback buffer"
        );
        Some(source)
    }

    /// Drop sources the sink finished playing. Returns how many were removed.
    pub fn reap_finished(&mut self) -> usize {
        self.sink
            .take_finished()
            .into_iter()
            .filter(|id| self.scheduled.remove(id).is_some())
            .count()
    }

    /// Hard cut-over: stop every scheduled source, empty the set, reset the
    /// clock anchor. Returns how many sources were stopped.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.scheduled.len();
        for id in std::mem::take(&mut self.scheduled).into_keys() {
            self.sink.stop_source(id);
        }
        self.next_start_time = 0.0;
        if stopped > 0 {
            debug!(stopped, "playback interrupted");
        }
        stopped
    }

    /// Interrupt and also discard pending end-of-playback notifications.
    pub fn clear(&mut self) {
        self.interrupt();
        let _ = self.sink.take_finished();
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn scheduled_len(&self) -> usize {
        self.scheduled.len()
    }

    pub fn is_idle(&self) -> bool {
        self.scheduled.is_empty()
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        PlaybackSnapshot {
            next_start_time: self.next_start_time,
            scheduled: self.scheduled.values().copied().collect(),
        }
    }
}

impl std::fmt::Debug for PlaybackScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackScheduler")
            .field("next_start_time", &self.next_start_time)
            .field("scheduled", &self.scheduled.len())
            .finish_non_exhaustive()
    }
}
