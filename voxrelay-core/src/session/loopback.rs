//! `LoopbackTransport`: echoes every realtime input back as model audio.
//!
//! Lets the whole capture → session → playback path run without network
//! access or an API key for the real service. Input arrives at the capture
//! rate; the echo is re-rated to the model's output rate so it plays back at
//! the speed it was recorded.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use tracing::debug;

use super::{
    emit, wire::ClientMessage, ConnectRequest, ServerContent, SessionEvent, SessionEventSender,
    SessionLink, VoiceTransport,
};
use crate::audio::resample::resample_once;
use crate::codec::{self, EncodedChunk};
use crate::config::DEFAULT_OUTPUT_SAMPLE_RATE;
use crate::error::{Result, VoxError};

/// Counters shared between the transport and whoever inspects it.
#[derive(Debug, Default)]
pub struct LoopbackStats {
    pub connects: AtomicUsize,
    pub chunks_received: AtomicUsize,
    pub closes: AtomicUsize,
}

#[derive(Debug, Default, Clone)]
pub struct LoopbackTransport {
    /// Send an `interrupted` signal after every N echoed chunks.
    pub interrupt_every: Option<usize>,
    /// Simulated connection latency.
    pub connect_delay: Option<Duration>,
    /// Rate of the echoed model audio; 24 kHz when unset.
    pub echo_sample_rate: Option<u32>,
    pub stats: Arc<LoopbackStats>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VoiceTransport for LoopbackTransport {
    fn connect(
        &mut self,
        request: &ConnectRequest,
        events: SessionEventSender,
    ) -> Result<Box<dyn SessionLink>> {
        if request.credential.trim().is_empty() {
            return Err(VoxError::Connect("loopback rejected empty API key".into()));
        }
        if let Some(delay) = self.connect_delay {
            std::thread::sleep(delay);
        }

        // Same setup a real transport would send first.
        let setup = ClientMessage::setup(&request.setup).to_json()?;
        debug!(setup = %setup, "loopback session setup");

        self.stats.connects.fetch_add(1, Ordering::SeqCst);
        emit(&events, SessionEvent::Opened);

        Ok(Box::new(LoopbackLink {
            events,
            interrupt_every: self.interrupt_every.filter(|n| *n > 0),
            echo_rate: self
                .echo_sample_rate
                .filter(|r| *r > 0)
                .unwrap_or(DEFAULT_OUTPUT_SAMPLE_RATE),
            echoed: 0,
            closed: false,
            stats: Arc::clone(&self.stats),
        }))
    }
}

struct LoopbackLink {
    events: SessionEventSender,
    interrupt_every: Option<usize>,
    echo_rate: u32,
    echoed: usize,
    closed: bool,
    stats: Arc<LoopbackStats>,
}

impl LoopbackLink {
    /// The chunk as the model would answer it: same audio at `echo_rate`.
    fn echo_of(&self, chunk: &EncodedChunk) -> Result<EncodedChunk> {
        match chunk.sample_rate() {
            Some(rate) if rate != self.echo_rate => {
                let samples = codec::decode_inbound(chunk.data())?;
                let echoed = resample_once(&samples, rate, self.echo_rate)?;
                Ok(codec::encode_outbound(&echoed, self.echo_rate))
            }
            _ => Ok(chunk.clone()),
        }
    }
}

impl SessionLink for LoopbackLink {
    fn send_realtime_input(&mut self, chunk: &EncodedChunk) -> Result<()> {
        if self.closed {
            return Err(VoxError::Session("loopback session is closed".into()));
        }
        self.stats.chunks_received.fetch_add(1, Ordering::SeqCst);
        let echo = self.echo_of(chunk)?;
        emit(&self.events, SessionEvent::Message(ServerContent::audio(echo)));
        self.echoed += 1;

        if let Some(every) = self.interrupt_every {
            if self.echoed % every == 0 {
                emit(&self.events, SessionEvent::Message(ServerContent::interruption()));
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
        emit(&self.events, SessionEvent::Closed(Some("client closed".into())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VoiceConfig;
    use crate::session::{session_event_channel, SessionSetup};

    fn request(credential: &str) -> ConnectRequest {
        ConnectRequest {
            credential: credential.into(),
            setup: SessionSetup::from_config(&VoiceConfig::default()),
        }
    }

    #[test]
    fn echoes_input_and_interrupts_on_schedule() {
        let (tx, rx) = session_event_channel(16);
        let mut transport = LoopbackTransport {
            interrupt_every: Some(2),
            ..LoopbackTransport::default()
        };
        let mut link = transport.connect(&request("key"), tx).expect("connect");
        assert_eq!(rx.try_recv(), Ok(SessionEvent::Opened));

        let chunk = EncodedChunk::new("audio/pcm;rate=24000", "AAA=");
        link.send_realtime_input(&chunk).expect("send 1");
        link.send_realtime_input(&chunk).expect("send 2");

        let received: Vec<SessionEvent> = rx.try_iter().collect();
        assert_eq!(
            received,
            vec![
                SessionEvent::Message(ServerContent::audio(chunk.clone())),
                SessionEvent::Message(ServerContent::audio(chunk.clone())),
                SessionEvent::Message(ServerContent::interruption()),
            ]
        );

        link.close();
        link.close();
        assert_eq!(
            rx.try_iter().collect::<Vec<_>>(),
            vec![SessionEvent::Closed(Some("client closed".into()))]
        );
        assert!(link.send_realtime_input(&chunk).is_err());
        assert_eq!(transport.stats.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn capture_rate_input_is_echoed_at_output_rate() {
        let (tx, rx) = session_event_channel(16);
        let mut transport = LoopbackTransport::new();
        let mut link = transport.connect(&request("key"), tx).expect("connect");
        assert_eq!(rx.try_recv(), Ok(SessionEvent::Opened));

        // 20 ms at 16 kHz must come back as 20 ms at 24 kHz.
        let input: Vec<f32> = (0..320)
            .map(|i| (i as f32 * std::f32::consts::TAU * 200.0 / 16_000.0).sin() * 0.5)
            .collect();
        link.send_realtime_input(&codec::encode_outbound(&input, 16_000))
            .expect("send");

        let Ok(SessionEvent::Message(content)) = rx.try_recv() else {
            panic!("expected an echoed message");
        };
        let echoed = content.inline_audio().next().expect("echoed audio");
        assert_eq!(echoed.sample_rate(), Some(24_000));
        let samples = codec::decode_inbound(echoed.data()).expect("decode");
        assert_eq!(samples.len(), 480);
        assert!(samples.iter().any(|s| s.abs() > 0.3));
    }

    #[test]
    fn rejects_empty_credential() {
        let (tx, _rx) = session_event_channel(4);
        let err = LoopbackTransport::new()
            .connect(&request("  "), tx)
            .err()
            .expect("empty key must fail");
        assert!(matches!(err, VoxError::Connect(_)));
    }
}
