//! Tone-generating microphone for demos and hardware-free runs.

use std::f32::consts::TAU;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::debug;

use super::{CaptureRequest, CaptureStream, Microphone};
use crate::buffering::{AudioProducer, Producer};
use crate::error::{Result, VoxError};

/// Emits a sine tone in real-time sized blocks.
#[derive(Debug, Clone)]
pub struct SyntheticMicrophone {
    pub frequency_hz: f32,
    pub amplitude: f32,
    /// Device rate to simulate. `None` uses the requested capture rate.
    pub sample_rate: Option<u32>,
    /// Samples delivered per simulated callback.
    pub block_size: usize,
}

impl Default for SyntheticMicrophone {
    fn default() -> Self {
        Self {
            frequency_hz: 440.0,
            amplitude: 0.25,
            sample_rate: None,
            block_size: 256,
        }
    }
}

struct SyntheticStream {
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    sample_rate: u32,
}

impl CaptureStream for SyntheticStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for SyntheticStream {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Microphone for SyntheticMicrophone {
    fn open(
        &mut self,
        request: &CaptureRequest,
        mut producer: AudioProducer,
        running: Arc<AtomicBool>,
    ) -> Result<Box<dyn CaptureStream>> {
        let sample_rate = self.sample_rate.unwrap_or(request.target_sample_rate);
        if sample_rate == 0 || self.block_size == 0 {
            return Err(VoxError::Microphone(
                "synthetic microphone needs a non-zero rate and block size".into(),
            ));
        }

        let block_size = self.block_size;
        let step = TAU * self.frequency_hz / sample_rate as f32;
        let amplitude = self.amplitude;
        let block_period = Duration::from_secs_f64(block_size as f64 / sample_rate as f64);
        let flag = Arc::clone(&running);

        let worker = std::thread::Builder::new()
            .name("voxrelay-synthetic-mic".into())
            .spawn(move || {
                let mut phase = 0f32;
                let mut block = vec![0f32; block_size];
                while flag.load(Ordering::Acquire) {
                    for sample in block.iter_mut() {
                        *sample = amplitude * phase.sin();
                        phase = (phase + step) % TAU;
                    }
                    let written = producer.push_slice(&block);
                    if written < block.len() {
                        debug!(dropped = block.len() - written, "synthetic mic ring full");
                    }
                    std::thread::sleep(block_period);
                }
            })?;

        Ok(Box::new(SyntheticStream {
            running,
            worker: Some(worker),
            sample_rate,
        }))
    }
}
