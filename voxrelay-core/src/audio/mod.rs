//! Microphone access.
//!
//! # Design constraints
//!
//! The device input callback runs on an OS audio thread at elevated priority.
//! It must not allocate on the steady-state path, block on a lock, or perform
//! I/O. Implementations push mono f32 samples straight into the SPSC ring
//! producer, whose `push_slice` is lock-free.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS), so a `CaptureStream` is created and dropped on the capture thread.
//! `Microphone` itself is `Send` and only describes how to open a device.

pub mod device;
pub mod resample;
pub mod synthetic;

use std::sync::{atomic::AtomicBool, Arc};

#[cfg(feature = "audio-cpal")]
use std::sync::atomic::Ordering;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    SampleFormat, Stream, StreamConfig,
};
#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

#[cfg(feature = "audio-cpal")]
use crate::buffering::Producer;
use crate::{
    buffering::AudioProducer,
    error::{Result, VoxError},
};

pub use synthetic::SyntheticMicrophone;

/// What the capture pipeline asks of a microphone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    /// Device name to prefer; falls back to the default input.
    pub preferred_device: Option<String>,
    /// Rate the pipeline will deliver to the session. Devices may run at a
    /// different rate; the capture loop resamples.
    pub target_sample_rate: u32,
}

/// A live microphone stream. Dropping it releases the device.
pub trait CaptureStream {
    /// Rate the device actually delivers samples at (Hz).
    fn sample_rate(&self) -> u32;

    /// Stop delivering samples. Safe to call more than once.
    fn stop(&mut self);
}

/// Opens microphone streams that feed an `AudioProducer`.
pub trait Microphone: Send + 'static {
    /// Request access to the device and start pushing mono f32 samples.
    ///
    /// The callback must check `running` and no-op once it is `false`.
    ///
    /// # Errors
    /// `VoxError::Microphone` when access is denied or the stream cannot be
    /// built, `VoxError::NoInputDevice` when there is nothing to open.
    fn open(
        &mut self,
        request: &CaptureRequest,
        producer: AudioProducer,
        running: Arc<AtomicBool>,
    ) -> Result<Box<dyn CaptureStream>>;
}

/// The system microphone via cpal.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalMicrophone;

#[cfg(feature = "audio-cpal")]
struct CpalCaptureStream {
    stream: Stream,
    running: Arc<AtomicBool>,
    sample_rate: u32,
}

#[cfg(feature = "audio-cpal")]
impl CaptureStream for CpalCaptureStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn stop(&mut self) {
        if self.running.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.stream.pause() {
                warn!("failed to pause input stream: {e}");
            }
        }
    }
}

#[cfg(feature = "audio-cpal")]
fn push_mono(producer: &mut AudioProducer, samples: &[f32]) {
    let written = producer.push_slice(samples);
    if written < samples.len() {
        warn!("capture ring full: dropped {} samples", samples.len() - written);
    }
}

/// Average interleaved frames down to mono into `mix`, converting each
/// sample with `to_f32`.
#[cfg(feature = "audio-cpal")]
fn downmix<T: Copy>(data: &[T], channels: usize, mix: &mut Vec<f32>, to_f32: impl Fn(T) -> f32) {
    let frames = data.len() / channels;
    mix.resize(frames, 0.0);
    for (f, slot) in mix.iter_mut().enumerate() {
        let base = f * channels;
        let sum: f32 = data[base..base + channels].iter().map(|s| to_f32(*s)).sum();
        *slot = sum / channels as f32;
    }
}

#[cfg(feature = "audio-cpal")]
fn select_input_device(host: &cpal::Host, preferred: Option<&str>) -> Result<cpal::Device> {
    if let Some(preferred_name) = preferred {
        match host.input_devices() {
            Ok(mut devices) => {
                if let Some(device) =
                    devices.find(|d| d.name().map(|n| n == preferred_name).unwrap_or(false))
                {
                    return Ok(device);
                }
                warn!(preferred_name, "preferred input device not found, falling back");
            }
            Err(e) => warn!("failed to list input devices while resolving preference: {e}"),
        }
    }

    if let Some(default) = host.default_input_device() {
        return Ok(default);
    }

    let mut devices = host
        .input_devices()
        .map_err(|e| VoxError::Microphone(e.to_string()))?;
    let fallback = devices.next().ok_or(VoxError::NoInputDevice)?;
    warn!("no default input device, falling back to first available input");
    Ok(fallback)
}

#[cfg(feature = "audio-cpal")]
impl Microphone for CpalMicrophone {
    fn open(
        &mut self,
        request: &CaptureRequest,
        mut producer: AudioProducer,
        running: Arc<AtomicBool>,
    ) -> Result<Box<dyn CaptureStream>> {
        let host = cpal::default_host();
        let device = select_input_device(&host, request.preferred_device.as_deref())?;

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = device
            .default_input_config()
            .map_err(|e| VoxError::Microphone(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        let ch = usize::from(channels.max(1));

        info!(
            sample_rate,
            channels,
            target_sample_rate = request.target_sample_rate,
            "input config selected"
        );

        let config = StreamConfig {
            channels,
            sample_rate: supported.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };

        let on_error = |err| error!("input stream error: {err}");

        let stream = match supported.sample_format() {
            SampleFormat::F32 => {
                let running = Arc::clone(&running);
                let mut mix: Vec<f32> = Vec::new();
                device.build_input_stream(
                    &config,
                    move |data: &[f32], _info| {
                        if !running.load(Ordering::Relaxed) {
                            return;
                        }
                        if ch == 1 {
                            push_mono(&mut producer, data);
                        } else {
                            downmix(data, ch, &mut mix, |s| s);
                            push_mono(&mut producer, &mix);
                        }
                    },
                    on_error,
                    None,
                )
            }
            SampleFormat::I16 => {
                let running = Arc::clone(&running);
                let mut mix: Vec<f32> = Vec::new();
                device.build_input_stream(
                    &config,
                    move |data: &[i16], _info| {
                        if !running.load(Ordering::Relaxed) {
                            return;
                        }
                        downmix(data, ch, &mut mix, |s| s as f32 / 32768.0);
                        push_mono(&mut producer, &mix);
                    },
                    on_error,
                    None,
                )
            }
            SampleFormat::U8 => {
                let running = Arc::clone(&running);
                let mut mix: Vec<f32> = Vec::new();
                device.build_input_stream(
                    &config,
                    move |data: &[u8], _info| {
                        if !running.load(Ordering::Relaxed) {
                            return;
                        }
                        downmix(data, ch, &mut mix, |s| (s as f32 - 128.0) / 128.0);
                        push_mono(&mut producer, &mix);
                    },
                    on_error,
                    None,
                )
            }
            fmt => {
                return Err(VoxError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| VoxError::Microphone(e.to_string()))?;

        stream
            .play()
            .map_err(|e| VoxError::Microphone(e.to_string()))?;

        Ok(Box::new(CpalCaptureStream {
            stream,
            running,
            sample_rate,
        }))
    }
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl Microphone for CpalMicrophone {
    fn open(
        &mut self,
        _request: &CaptureRequest,
        _producer: AudioProducer,
        _running: Arc<AtomicBool>,
    ) -> Result<Box<dyn CaptureStream>> {
        Err(VoxError::Microphone(
            "compiled without audio-cpal feature".into(),
        ))
    }
}
