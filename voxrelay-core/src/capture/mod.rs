//! Capture loop: microphone ring → fixed frames → codec → session.
//!
//! ## Per iteration
//!
//! ```text
//! 1. Drain the ring buffer (device rate, mono)
//! 2. Resample to the capture rate (16 kHz by default)
//! 3. Cut fixed frames of `frame_size` samples
//! 4. For each frame: check `running`, encode, send through RealtimeSender
//! ```
//!
//! Frames leave in capture order, one send per frame. With no open session the
//! frame is dropped and counted.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
    audio::{resample::RateConverter, CaptureRequest, Microphone},
    buffering::{create_audio_ring, AudioConsumer, Consumer},
    codec,
    engine::diagnostics::RelayDiagnostics,
    error::{Result, VoxError},
    session::RealtimeSender,
};

/// Samples drained from the ring per iteration.
const DRAIN_CHUNK: usize = 960;

/// Sleep when the ring is empty (avoids busy-waiting a core).
const EMPTY_SLEEP: Duration = Duration::from_millis(2);

/// Everything the capture loop needs, passed as one struct.
pub struct CaptureContext {
    pub consumer: AudioConsumer,
    pub running: Arc<AtomicBool>,
    pub sender: RealtimeSender,
    pub device_sample_rate: u32,
    pub target_sample_rate: u32,
    pub frame_size: usize,
    pub diagnostics: Arc<RelayDiagnostics>,
}

/// Run the capture loop until `ctx.running` becomes false.
pub fn run(mut ctx: CaptureContext) {
    let mut resampler = match RateConverter::new(
        ctx.device_sample_rate,
        ctx.target_sample_rate,
        DRAIN_CHUNK,
    ) {
        Ok(r) => r,
        Err(e) => {
            error!("failed to create capture resampler: {e}");
            ctx.running.store(false, Ordering::Release);
            return;
        }
    };

    info!(
        device_rate = ctx.device_sample_rate,
        target_rate = ctx.target_sample_rate,
        frame_size = ctx.frame_size,
        "capture loop started"
    );

    let frame_size = ctx.frame_size.max(1);
    let mut raw = vec![0f32; DRAIN_CHUNK];
    let mut pending: Vec<f32> = Vec::with_capacity(frame_size * 4);

    'capture: loop {
        if !ctx.running.load(Ordering::Acquire) {
            break;
        }

        let n = ctx.consumer.pop_slice(&mut raw);
        if n == 0 {
            std::thread::sleep(EMPTY_SLEEP);
            continue;
        }
        ctx.diagnostics
            .samples_captured
            .fetch_add(n, Ordering::Relaxed);

        pending.extend(resampler.process(&raw[..n]));

        while pending.len() >= frame_size {
            if !ctx.running.load(Ordering::Acquire) {
                break 'capture;
            }
            let chunk = codec::encode_outbound(&pending[..frame_size], ctx.target_sample_rate);
            pending.drain(..frame_size);

            if ctx.sender.send(&chunk) {
                ctx.diagnostics.frames_sent.fetch_add(1, Ordering::Relaxed);
            } else {
                let dropped = ctx.diagnostics.frames_dropped.fetch_add(1, Ordering::Relaxed);
                if dropped % 200 == 0 {
                    debug!(dropped = dropped + 1, "no open session, dropping capture frames");
                }
            }
        }
    }

    info!("capture loop stopped");
}

/// A running capture thread. The microphone stream is created and dropped on
/// that thread.
pub struct CaptureHandle {
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    /// Open the microphone and start the capture loop.
    ///
    /// Blocks until the device is open, access is refused, or `timeout`
    /// elapses.
    ///
    /// # Errors
    /// Whatever `Microphone::open` reports, or `VoxError::Timeout`.
    pub fn start(
        microphone: Arc<Mutex<Box<dyn Microphone>>>,
        request: CaptureRequest,
        frame_size: usize,
        sender: RealtimeSender,
        diagnostics: Arc<RelayDiagnostics>,
        timeout: Duration,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<u32>>();

        let worker = std::thread::Builder::new()
            .name("voxrelay-capture".into())
            .spawn(move || {
                let (producer, consumer) = create_audio_ring();
                let opened = microphone
                    .lock()
                    .open(&request, producer, Arc::clone(&flag));
                let mut stream = match opened {
                    Ok(stream) => {
                        if open_tx.send(Ok(stream.sample_rate())).is_err() {
                            // start() gave up waiting; release the device.
                            flag.store(false, Ordering::Release);
                            let mut stream = stream;
                            stream.stop();
                            return;
                        }
                        stream
                    }
                    Err(e) => {
                        flag.store(false, Ordering::Release);
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };

                run(CaptureContext {
                    consumer,
                    running: Arc::clone(&flag),
                    sender,
                    device_sample_rate: stream.sample_rate(),
                    target_sample_rate: request.target_sample_rate,
                    frame_size,
                    diagnostics,
                });

                stream.stop();
                drop(stream);
            })?;

        match open_rx.recv_timeout(timeout) {
            Ok(Ok(rate)) => {
                info!(device_rate = rate, "microphone open");
                Ok(Self {
                    running,
                    worker: Some(worker),
                })
            }
            Ok(Err(e)) => {
                warn!("microphone open failed: {e}");
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                running.store(false, Ordering::Release);
                Err(VoxError::Timeout("microphone access".into()))
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && self.worker.is_some()
    }

    /// Stop capture, join the thread and release the device. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("capture thread panicked");
            }
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::CaptureStream;
    use crate::buffering::{AudioProducer, Producer};
    use crate::codec::EncodedChunk;
    use crate::error::Result;
    use crate::ipc::events::ConversationState;
    use crate::session::{SessionHandle, SessionLink, SessionSlot};
    use std::time::Instant;

    struct RecordingLink(Arc<Mutex<Vec<EncodedChunk>>>);

    impl SessionLink for RecordingLink {
        fn send_realtime_input(&mut self, chunk: &EncodedChunk) -> Result<()> {
            self.0.lock().push(chunk.clone());
            Ok(())
        }

        fn close(&mut self) {}
    }

    /// Pushes a fixed block once, then idles.
    struct OneShotMic {
        samples: Vec<f32>,
        stopped: Arc<AtomicBool>,
    }

    struct OneShotStream {
        stopped: Arc<AtomicBool>,
    }

    impl CaptureStream for OneShotStream {
        fn sample_rate(&self) -> u32 {
            16_000
        }

        fn stop(&mut self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    impl Microphone for OneShotMic {
        fn open(
            &mut self,
            _request: &CaptureRequest,
            mut producer: AudioProducer,
            _running: Arc<AtomicBool>,
        ) -> Result<Box<dyn CaptureStream>> {
            producer.push_slice(&self.samples);
            Ok(Box::new(OneShotStream {
                stopped: Arc::clone(&self.stopped),
            }))
        }
    }

    struct DeniedMic;

    impl Microphone for DeniedMic {
        fn open(
            &mut self,
            _request: &CaptureRequest,
            _producer: AudioProducer,
            _running: Arc<AtomicBool>,
        ) -> Result<Box<dyn CaptureStream>> {
            Err(VoxError::Microphone("permission denied".into()))
        }
    }

    fn request() -> CaptureRequest {
        CaptureRequest {
            preferred_device: None,
            target_sample_rate: 16_000,
        }
    }

    fn open_sender(sent: &Arc<Mutex<Vec<EncodedChunk>>>) -> RealtimeSender {
        let slot: SessionSlot = Arc::new(Mutex::new(Some(SessionHandle::new(
            1,
            Box::new(RecordingLink(Arc::clone(sent))),
        ))));
        RealtimeSender::new(slot, Arc::new(Mutex::new(ConversationState::Open)))
    }

    fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) {
        let start = Instant::now();
        while !cond() {
            assert!(start.elapsed() < timeout, "condition not met in {timeout:?}");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn sends_one_chunk_per_full_frame_in_order() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let stopped = Arc::new(AtomicBool::new(false));
        let samples: Vec<f32> = (0..600).map(|i| (i % 256) as f32 / 512.0).collect();
        let mic: Box<dyn Microphone> = Box::new(OneShotMic {
            samples: samples.clone(),
            stopped: Arc::clone(&stopped),
        });
        let diagnostics = Arc::new(RelayDiagnostics::default());

        let mut handle = CaptureHandle::start(
            Arc::new(Mutex::new(mic)),
            request(),
            256,
            open_sender(&sent),
            Arc::clone(&diagnostics),
            Duration::from_secs(1),
        )
        .expect("capture starts");

        wait_for(Duration::from_secs(2), || sent.lock().len() == 2);
        handle.stop();
        handle.stop();
        assert!(stopped.load(Ordering::SeqCst));
        assert!(!handle.is_running());

        let sent = sent.lock();
        assert_eq!(sent.len(), 2, "88 leftover samples must not be sent");
        assert_eq!(sent[0], codec::encode_outbound(&samples[..256], 16_000));
        assert_eq!(sent[1], codec::encode_outbound(&samples[256..512], 16_000));
        assert_eq!(diagnostics.snapshot().frames_sent, 2);
    }

    #[test]
    fn frames_are_dropped_without_open_session() {
        let stopped = Arc::new(AtomicBool::new(false));
        let mic: Box<dyn Microphone> = Box::new(OneShotMic {
            samples: vec![0.1; 512],
            stopped,
        });
        let diagnostics = Arc::new(RelayDiagnostics::default());
        let sender = RealtimeSender::new(
            Arc::new(Mutex::new(None)),
            Arc::new(Mutex::new(ConversationState::Idle)),
        );

        let mut handle = CaptureHandle::start(
            Arc::new(Mutex::new(mic)),
            request(),
            256,
            sender,
            Arc::clone(&diagnostics),
            Duration::from_secs(1),
        )
        .expect("capture starts");

        wait_for(Duration::from_secs(2), || {
            diagnostics.snapshot().frames_dropped == 2
        });
        handle.stop();
        assert_eq!(diagnostics.snapshot().frames_sent, 0);
    }

    #[test]
    fn denied_microphone_is_reported() {
        let mic: Box<dyn Microphone> = Box::new(DeniedMic);
        let err = CaptureHandle::start(
            Arc::new(Mutex::new(mic)),
            request(),
            256,
            RealtimeSender::new(
                Arc::new(Mutex::new(None)),
                Arc::new(Mutex::new(ConversationState::Open)),
            ),
            Arc::new(RelayDiagnostics::default()),
            Duration::from_secs(1),
        )
        .err()
        .expect("denied mic must fail");
        assert!(matches!(err, VoxError::Microphone(_)));
    }
}
