//! Speaker output via cpal.
//!
//! The output stream lives on its own thread (`cpal::Stream` is `!Send`) and
//! renders the shared `Timeline` in its callback. The timeline runs at the
//! model's rate with the device's channel count; an `OutputRenderer` carries
//! the mixed stream over to the device rate in one continuous pass.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::info;

use super::timeline::TimelineSink;
#[cfg(feature = "audio-cpal")]
use super::output::OutputRenderer;
use crate::error::{Result, VoxError};

/// Handle to the running output stream. Dropping it closes the device.
pub struct Speaker {
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    sample_rate: u32,
    channels: u16,
}

impl Speaker {
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Stop rendering and release the device. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
            info!("speaker closed");
        }
    }
}

impl Drop for Speaker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(feature = "audio-cpal")]
impl Speaker {
    /// Open the preferred (or default) output device and return the sink the
    /// playback scheduler should write to. The sink's clock runs at
    /// `timeline_rate` (the scheduler's output rate).
    ///
    /// # Errors
    /// `VoxError::Playback` when no output device exists or the stream cannot
    /// be built; `VoxError::Timeout` if the device does not open in `timeout`.
    pub fn open(
        preferred_device: Option<&str>,
        timeline_rate: u32,
        gain: f32,
        timeout: Duration,
    ) -> Result<(Self, TimelineSink)> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let preferred = preferred_device.map(str::to_owned);
        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<(TimelineSink, u32, u16)>>();

        let worker = std::thread::Builder::new()
            .name("voxrelay-speaker".into())
            .spawn(move || {
                let stream = match build_output_stream(preferred.as_deref(), timeline_rate, gain) {
                    Ok((stream, sink, rate, channels)) => {
                        let _ = open_tx.send(Ok((sink, rate, channels)));
                        stream
                    }
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };
                while flag.load(Ordering::Acquire) {
                    std::thread::sleep(Duration::from_millis(20));
                }
                // Stream drops here, on the thread that built it.
                drop(stream);
            })?;

        match open_rx.recv_timeout(timeout) {
            Ok(Ok((sink, sample_rate, channels))) => Ok((
                Self {
                    running,
                    worker: Some(worker),
                    sample_rate,
                    channels,
                },
                sink,
            )),
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                running.store(false, Ordering::Release);
                Err(VoxError::Timeout("output device".into()))
            }
        }
    }
}

#[cfg(feature = "audio-cpal")]
fn build_output_stream(
    preferred: Option<&str>,
    timeline_rate: u32,
    gain: f32,
) -> Result<(cpal::Stream, TimelineSink, u32, u16)> {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{SampleFormat, StreamConfig};
    use tracing::{error, warn};

    let host = cpal::default_host();
    let preferred_device = preferred.and_then(|name| {
        let found = host
            .output_devices()
            .ok()
            .and_then(|mut devices| devices.find(|d| d.name().map(|n| n == name).unwrap_or(false)));
        if found.is_none() {
            warn!(name, "preferred output device not found, falling back");
        }
        found
    });
    let device = preferred_device
        .or_else(|| host.default_output_device())
        .ok_or_else(|| VoxError::Playback("no output device available".into()))?;

    let supported = device
        .default_output_config()
        .map_err(|e| VoxError::Playback(e.to_string()))?;
    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels();

    info!(
        device = device.name().unwrap_or_default().as_str(),
        sample_rate, channels, "opening output device"
    );

    let sink = TimelineSink::new(timeline_rate, channels, gain);
    let mut renderer = OutputRenderer::new(sink.shared(), sample_rate)?;
    let config = StreamConfig {
        channels,
        sample_rate: supported.sample_rate(),
        buffer_size: cpal::BufferSize::Default,
    };
    let on_error = |err| error!("output stream error: {err}");

    let stream = match supported.sample_format() {
        SampleFormat::F32 => device.build_output_stream(
            &config,
            move |data: &mut [f32], _info| renderer.fill(data),
            on_error,
            None,
        ),
        SampleFormat::I16 => {
            let mut scratch: Vec<f32> = Vec::with_capacity(8_192);
            device.build_output_stream(
                &config,
                move |data: &mut [i16], _info| {
                    scratch.resize(data.len(), 0.0);
                    renderer.fill(&mut scratch);
                    for (out, s) in data.iter_mut().zip(&scratch) {
                        *out = (s * 32767.0) as i16;
                    }
                },
                on_error,
                None,
            )
        }
        SampleFormat::U16 => {
            let mut scratch: Vec<f32> = Vec::with_capacity(8_192);
            device.build_output_stream(
                &config,
                move |data: &mut [u16], _info| {
                    scratch.resize(data.len(), 0.0);
                    renderer.fill(&mut scratch);
                    for (out, s) in data.iter_mut().zip(&scratch) {
                        *out = ((s + 1.0) * 32767.5) as u16;
                    }
                },
                on_error,
                None,
            )
        }
        fmt => {
            return Err(VoxError::Playback(format!(
                "unsupported sample format: {fmt:?}"
            )))
        }
    }
    .map_err(|e| VoxError::Playback(e.to_string()))?;

    stream
        .play()
        .map_err(|e| VoxError::Playback(e.to_string()))?;

    Ok((stream, sink, sample_rate, channels))
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl Speaker {
    pub fn open(
        _preferred_device: Option<&str>,
        _timeline_rate: u32,
        _gain: f32,
        _timeout: Duration,
    ) -> Result<(Self, TimelineSink)> {
        Err(VoxError::Playback(
            "compiled without audio-cpal feature".into(),
        ))
    }
}
