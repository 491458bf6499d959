//! Sample-rate conversion using rubato's `FastFixedIn` resampler.
//!
//! Microphones rarely run at 16 kHz and speakers rarely at 24 kHz, so audio
//! crosses a rate boundary on both sides of the session:
//!
//! ```text
//! device rate ──RateConverter──► 16 kHz capture frames
//! 24 kHz timeline ──OutputRenderer──► output device rate
//! foreign-rate buffer ──resample_once──► timeline rate
//! ```
//!
//! When the two rates match `RateConverter` is a passthrough and no rubato
//! session is created.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::error;

use crate::error::{Result, VoxError};

/// Streaming converter for mono f32 audio between two fixed rates.
pub struct RateConverter {
    /// `None` when source rate == target rate (passthrough mode).
    resampler: Option<FastFixedIn<f32>>,
    /// Holds partial input chunks between calls.
    input_buf: Vec<f32>,
    chunk_size: usize,
    /// Pre-allocated output buffer: `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
}

impl RateConverter {
    /// # Errors
    /// `VoxError::AudioStream` if rubato rejects the ratio or chunk size.
    pub fn new(source_rate: u32, target_rate: u32, chunk_size: usize) -> Result<Self> {
        if source_rate == target_rate {
            return Ok(Self {
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
            });
        }

        let resampler = fixed_resampler(source_rate, target_rate, chunk_size)?;
        let max_out = resampler.output_frames_max();
        let output_buf = vec![vec![0f32; max_out]; 1];

        tracing::info!(
            source_rate,
            target_rate,
            chunk_size,
            max_out,
            "resampling enabled"
        );

        Ok(Self {
            resampler: Some(resampler),
            input_buf: Vec::new(),
            chunk_size,
            output_buf,
        })
    }

    /// Feed samples and return whatever output is ready (may be empty).
    ///
    /// Input accumulates until a full `chunk_size` block is available; the
    /// remainder is kept for the next call.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.input_buf.extend_from_slice(samples);

        let mut result = Vec::new();

        while self.input_buf.len() >= self.chunk_size {
            let input_slice = &self.input_buf[..self.chunk_size];

            match resampler.process_into_buffer(&[input_slice], &mut self.output_buf, None) {
                Ok((_consumed, produced)) => {
                    result.extend_from_slice(&self.output_buf[0][..produced]);
                }
                Err(e) => {
                    error!("resampler process error: {e}");
                }
            }

            self.input_buf.drain(..self.chunk_size);
        }

        result
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}

/// Resample one complete block in a single pass.
///
/// The result holds exactly `round(len * target / source)` frames aligned to
/// the input: the resampler's output delay is skipped and its tail flushed
/// with silence. Used for whole buffers that are not part of a continuous
/// stream; continuous output goes through `playback::output::OutputRenderer`.
pub fn resample_once(samples: &[f32], source_rate: u32, target_rate: u32) -> Result<Vec<f32>> {
    if source_rate == target_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let ratio = target_rate as f64 / source_rate as f64;
    let expected = (samples.len() as f64 * ratio).round() as usize;

    let mut resampler = fixed_resampler(source_rate, target_rate, samples.len())?;
    let delay = resampler.output_delay();
    let mut out = Vec::with_capacity(expected + delay);

    let mut block = vec![samples.to_vec()];
    let silence = vec![0f32; samples.len()];
    while out.len() < expected + delay {
        let mut produced = resampler
            .process(&block, None)
            .map_err(|e| VoxError::AudioStream(format!("resample: {e}")))?;
        out.append(&mut produced[0]);
        block[0].copy_from_slice(&silence);
    }

    out.drain(..delay);
    out.truncate(expected);
    Ok(out)
}

fn fixed_resampler(source_rate: u32, target_rate: u32, chunk_size: usize) -> Result<FastFixedIn<f32>> {
    if source_rate == 0 || target_rate == 0 {
        return Err(VoxError::AudioStream(format!(
            "invalid resample rates {source_rate} -> {target_rate}"
        )));
    }
    let ratio = target_rate as f64 / source_rate as f64;
    FastFixedIn::<f32>::new(
        ratio,
        1.0, // fixed ratio
        PolynomialDegree::Cubic,
        chunk_size,
        1, // mono
    )
    .map_err(|e| VoxError::AudioStream(format!("resampler init: {e}")))
}
