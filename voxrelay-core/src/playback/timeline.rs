//! Sample-accurate mixing timeline.
//!
//! Sources sit at absolute frame positions. `render` mixes whatever overlaps
//! the requested window into an interleaved output buffer, advances the clock
//! and records sources whose last frame has played. The output callback
//! calls `render`; the scheduler talks to it through `TimelineSink`.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use super::{AudioSink, SourceId};
use crate::audio::resample::resample_once;
use crate::codec::PlaybackBuffer;

struct TimelineSource {
    id: SourceId,
    start_frame: u64,
    buffer: Arc<PlaybackBuffer>,
}

impl TimelineSource {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.buffer.frames() as u64
    }
}

pub struct Timeline {
    sample_rate: u32,
    channels: u16,
    gain: f32,
    /// Frames rendered so far; the clock.
    position: u64,
    sources: Vec<TimelineSource>,
    finished: Vec<SourceId>,
    /// Bumped whenever a source is cut before it finished.
    cuts: u64,
}

impl Timeline {
    pub fn new(sample_rate: u32, channels: u16, gain: f32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            channels: channels.max(1),
            gain,
            position: 0,
            sources: Vec::with_capacity(64),
            finished: Vec::with_capacity(64),
            cuts: 0,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn set_gain(&mut self, gain: f32) {
        self.gain = gain;
    }

    pub fn position_frames(&self) -> u64 {
        self.position
    }

    pub fn current_time(&self) -> f64 {
        self.position as f64 / self.sample_rate as f64
    }

    pub fn active_sources(&self) -> usize {
        self.sources.len()
    }

    /// How many sources were removed before they finished.
    pub fn cuts(&self) -> u64 {
        self.cuts
    }

    /// Place `buffer` at `when` seconds. Buffers at another rate are
    /// resampled to the timeline rate first; `TimelineSink` does that before
    /// it takes the lock, so the output callback never waits on it.
    pub fn add(&mut self, id: SourceId, buffer: Arc<PlaybackBuffer>, when: f64) {
        let buffer = if buffer.sample_rate == self.sample_rate {
            buffer
        } else {
            match self.convert(&buffer) {
                Some(converted) => Arc::new(converted),
                None => {
                    self.finished.push(id);
                    return;
                }
            }
        };

        if buffer.is_empty() {
            self.finished.push(id);
            return;
        }

        let start_frame = (when.max(0.0) * self.sample_rate as f64).round() as u64;
        self.sources.push(TimelineSource {
            id,
            start_frame,
            buffer,
        });
    }

    fn convert(&self, buffer: &PlaybackBuffer) -> Option<PlaybackBuffer> {
        convert_rate(buffer, self.sample_rate)
    }

    /// Remove a source without reporting it as finished.
    pub fn remove(&mut self, id: SourceId) -> bool {
        let before = self.sources.len();
        self.sources.retain(|s| s.id != id);
        let removed = self.sources.len() != before;
        if removed {
            self.cuts += 1;
        }
        removed
    }

    /// Mix the next `out.len() / channels` frames into `out` (interleaved).
    pub fn render(&mut self, out: &mut [f32]) {
        out.fill(0.0);
        let ch = usize::from(self.channels);
        let frames = (out.len() / ch) as u64;
        if frames == 0 {
            return;
        }
        let window_start = self.position;
        let window_end = window_start + frames;

        for source in &self.sources {
            let from = source.start_frame.max(window_start);
            let to = source.end_frame().min(window_end);
            if from >= to {
                continue;
            }
            let last_channel = source.buffer.channel_count() - 1;
            for frame in from..to {
                let src_idx = (frame - source.start_frame) as usize;
                let out_base = (frame - window_start) as usize * ch;
                for c in 0..ch {
                    out[out_base + c] += source.buffer.channels[c.min(last_channel)][src_idx];
                }
            }
        }

        for sample in out.iter_mut() {
            *sample = (*sample * self.gain).clamp(-1.0, 1.0);
        }

        self.position = window_end;
        let finished = &mut self.finished;
        self.sources.retain(|s| {
            if s.end_frame() <= window_end {
                finished.push(s.id);
                false
            } else {
                true
            }
        });
    }

    pub fn take_finished(&mut self) -> Vec<SourceId> {
        std::mem::take(&mut self.finished)
    }
}

fn convert_rate(buffer: &PlaybackBuffer, sample_rate: u32) -> Option<PlaybackBuffer> {
    let mut channels = Vec::with_capacity(buffer.channel_count());
    for channel in &buffer.channels {
        match resample_once(channel, buffer.sample_rate, sample_rate) {
            Ok(samples) => channels.push(samples),
            Err(e) => {
                warn!("dropping playback buffer: {e}");
                return None;
            }
        }
    }
    Some(PlaybackBuffer {
        sample_rate,
        channels,
    })
}

/// `AudioSink` over a shared `Timeline`.
#[derive(Clone)]
pub struct TimelineSink {
    timeline: Arc<Mutex<Timeline>>,
    sample_rate: u32,
}

impl TimelineSink {
    pub fn new(sample_rate: u32, channels: u16, gain: f32) -> Self {
        Self::from_shared(Arc::new(Mutex::new(Timeline::new(sample_rate, channels, gain))))
    }

    pub fn from_shared(timeline: Arc<Mutex<Timeline>>) -> Self {
        let sample_rate = timeline.lock().sample_rate();
        Self {
            timeline,
            sample_rate,
        }
    }

    /// The timeline, for whoever drives `render` (output callback, tests).
    pub fn shared(&self) -> Arc<Mutex<Timeline>> {
        Arc::clone(&self.timeline)
    }
}

impl AudioSink for TimelineSink {
    fn current_time(&self) -> f64 {
        self.timeline.lock().current_time()
    }

    fn start_source(&mut self, id: SourceId, buffer: Arc<PlaybackBuffer>, when: f64) {
        let buffer = if buffer.sample_rate == self.sample_rate {
            buffer
        } else {
            match convert_rate(&buffer, self.sample_rate) {
                Some(converted) => Arc::new(converted),
                None => {
                    self.timeline.lock().finished.push(id);
                    return;
                }
            }
        };
        // Only the push happens under the lock the output callback renders with.
        self.timeline.lock().add(id, buffer, when);
    }

    fn stop_source(&mut self, id: SourceId) {
        self.timeline.lock().remove(id);
    }

    fn take_finished(&mut self) -> Vec<SourceId> {
        self.timeline.lock().take_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn mono(sample_rate: u32, samples: Vec<f32>) -> Arc<PlaybackBuffer> {
        Arc::new(PlaybackBuffer {
            sample_rate,
            channels: vec![samples],
        })
    }

    #[test]
    fn back_to_back_sources_render_without_gap_or_overlap() {
        let mut timeline = Timeline::new(8, 1, 1.0);
        timeline.add(SourceId(0), mono(8, vec![0.1; 4]), 0.0);
        timeline.add(SourceId(1), mono(8, vec![0.2; 4]), 0.5);

        let mut out = [0f32; 8];
        timeline.render(&mut out);
        assert_eq!(out, [0.1, 0.1, 0.1, 0.1, 0.2, 0.2, 0.2, 0.2]);
        assert_eq!(timeline.take_finished(), vec![SourceId(0), SourceId(1)]);
        assert_abs_diff_eq!(timeline.current_time(), 1.0);
    }

    #[test]
    fn source_spanning_windows_finishes_in_the_last_one() {
        let mut timeline = Timeline::new(8, 1, 1.0);
        timeline.add(SourceId(7), mono(8, vec![0.5; 6]), 0.25);

        let mut out = [0f32; 4];
        timeline.render(&mut out);
        assert_eq!(out, [0.0, 0.0, 0.5, 0.5]);
        assert!(timeline.take_finished().is_empty());

        timeline.render(&mut out);
        assert_eq!(out, [0.5, 0.5, 0.5, 0.5]);
        assert_eq!(timeline.take_finished(), vec![SourceId(7)]);
        assert_eq!(timeline.active_sources(), 0);
    }

    #[test]
    fn removed_source_is_silent_and_not_reported() {
        let mut timeline = Timeline::new(8, 1, 1.0);
        timeline.add(SourceId(1), mono(8, vec![0.5; 8]), 0.0);
        assert!(timeline.remove(SourceId(1)));
        assert!(!timeline.remove(SourceId(1)));
        assert_eq!(timeline.cuts(), 1);

        let mut out = [1f32; 8];
        timeline.render(&mut out);
        assert!(out.iter().all(|s| *s == 0.0));
        assert!(timeline.take_finished().is_empty());
    }

    #[test]
    fn mono_source_fills_every_output_channel_with_gain_and_clamp() {
        let mut timeline = Timeline::new(8, 2, 2.0);
        timeline.add(SourceId(0), mono(8, vec![0.25, 0.75]), 0.0);

        let mut out = [0f32; 4];
        timeline.render(&mut out);
        assert_eq!(out, [0.5, 0.5, 1.0, 1.0]);
    }

    #[test]
    fn foreign_rate_buffer_is_resampled_to_timeline_rate() {
        let mut timeline = Timeline::new(48_000, 1, 1.0);
        timeline.add(SourceId(0), mono(24_000, vec![0.0; 480]), 0.0);
        let mut out = vec![0f32; 2_000];
        timeline.render(&mut out);
        assert_eq!(timeline.take_finished(), vec![SourceId(0)]);
    }

    #[test]
    fn sink_converts_foreign_rate_before_placing() {
        let mut sink = TimelineSink::new(48_000, 1, 1.0);
        sink.start_source(SourceId(0), mono(24_000, vec![0.25; 480]), 0.0);
        sink.start_source(SourceId(1), mono(24_000, vec![0.25; 480]), 0.02);

        // Converted buffers are exactly 960 frames each and abut at frame 960.
        let shared = sink.shared();
        shared.lock().render(&mut vec![0f32; 959]);
        assert!(sink.take_finished().is_empty());
        shared.lock().render(&mut [0f32; 1]);
        assert_eq!(sink.take_finished(), vec![SourceId(0)]);
        shared.lock().render(&mut vec![0f32; 960]);
        assert_eq!(sink.take_finished(), vec![SourceId(1)]);
    }

    #[test]
    fn sink_reports_clock_from_rendered_frames() {
        let mut sink = TimelineSink::new(100, 1, 1.0);
        assert_eq!(sink.current_time(), 0.0);
        sink.start_source(SourceId(3), mono(100, vec![0.1; 10]), 0.0);
        let shared = sink.shared();
        shared.lock().render(&mut [0f32; 50]);
        assert_abs_diff_eq!(sink.current_time(), 0.5);
        assert_eq!(sink.take_finished(), vec![SourceId(3)]);
    }
}
