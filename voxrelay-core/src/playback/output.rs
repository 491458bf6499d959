//! Device-rate rendering of a model-rate timeline.
//!
//! The timeline mixes at the rate the session delivers (24 kHz). Speakers run
//! at their own rate, so the mixed stream goes through one persistent rubato
//! converter: consecutive chunks stay one continuous signal with no per-chunk
//! filter warm-up at their boundaries.
//!
//! ```text
//! Timeline::render (model rate) ─► FastFixedOut ─► FIFO ─► output callback
//! ```
//!
//! All buffers are allocated up front; `fill` runs inside the output callback.
//! After a cut (`Timeline::cuts` changes) the FIFO and the converter history
//! are dropped so interrupted audio does not leak into the next reply.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use rubato::{FastFixedOut, PolynomialDegree, Resampler};
use tracing::error;

use super::timeline::Timeline;
use crate::error::{Result, VoxError};

/// Output frames produced per converter call.
const CHUNK_FRAMES: usize = 256;

/// Largest callback we expect, in frames, for FIFO pre-allocation.
const MAX_CALLBACK_FRAMES: usize = 8_192;

struct RateStage {
    resampler: FastFixedOut<f32>,
    /// Interleaved timeline render scratch.
    mix: Vec<f32>,
    planar_in: Vec<Vec<f32>>,
    planar_out: Vec<Vec<f32>>,
    /// Converter delay still to discard, in output frames.
    skip: usize,
}

/// Pulls audio from a shared `Timeline` at the device rate.
pub struct OutputRenderer {
    timeline: Arc<Mutex<Timeline>>,
    channels: usize,
    stage: Option<RateStage>,
    fifo: VecDeque<f32>,
    cuts: u64,
}

impl OutputRenderer {
    /// # Errors
    /// `VoxError::Playback` if rubato rejects the rate pair.
    pub fn new(timeline: Arc<Mutex<Timeline>>, device_rate: u32) -> Result<Self> {
        let (timeline_rate, channels, cuts) = {
            let t = timeline.lock();
            (t.sample_rate(), usize::from(t.channels()), t.cuts())
        };
        if device_rate == 0 {
            return Err(VoxError::Playback("device sample rate is 0".into()));
        }

        let stage = if device_rate == timeline_rate {
            None
        } else {
            let resampler = FastFixedOut::<f32>::new(
                device_rate as f64 / timeline_rate as f64,
                1.0,
                PolynomialDegree::Cubic,
                CHUNK_FRAMES,
                channels,
            )
            .map_err(|e| VoxError::Playback(format!("output resampler init: {e}")))?;
            let max_in = resampler.input_frames_max();
            let max_out = resampler.output_frames_max();
            let skip = resampler.output_delay();
            Some(RateStage {
                resampler,
                mix: vec![0.0; max_in * channels],
                planar_in: vec![vec![0.0; max_in]; channels],
                planar_out: vec![vec![0.0; max_out]; channels],
                skip,
            })
        };

        Ok(Self {
            timeline,
            channels,
            stage,
            fifo: VecDeque::with_capacity((MAX_CALLBACK_FRAMES + CHUNK_FRAMES * 2) * channels),
            cuts,
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn is_passthrough(&self) -> bool {
        self.stage.is_none()
    }

    /// Fill `out` (interleaved, device rate and channel count).
    pub fn fill(&mut self, out: &mut [f32]) {
        let Some(stage) = self.stage.as_mut() else {
            self.timeline.lock().render(out);
            return;
        };

        let cuts = self.timeline.lock().cuts();
        if cuts != self.cuts {
            self.cuts = cuts;
            self.fifo.clear();
            stage.resampler.reset();
            stage.skip = stage.resampler.output_delay();
        }

        let ch = self.channels;
        while self.fifo.len() < out.len() {
            let needed = stage.resampler.input_frames_next();
            let mix = &mut stage.mix[..needed * ch];
            self.timeline.lock().render(mix);
            for (f, frame) in mix.chunks_exact(ch).enumerate() {
                for (c, sample) in frame.iter().enumerate() {
                    stage.planar_in[c][f] = *sample;
                }
            }

            let produced =
                match stage
                    .resampler
                    .process_into_buffer(&stage.planar_in, &mut stage.planar_out, None)
                {
                    Ok((_consumed, produced)) => produced,
                    Err(e) => {
                        error!("output resampler error: {e}");
                        break;
                    }
                };

            let start = stage.skip.min(produced);
            stage.skip -= start;
            for f in start..produced {
                for c in 0..ch {
                    self.fifo.push_back(stage.planar_out[c][f]);
                }
            }
        }

        for sample in out.iter_mut() {
            *sample = self.fifo.pop_front().unwrap_or(0.0);
        }
    }
}
