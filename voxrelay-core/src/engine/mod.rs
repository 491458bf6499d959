//! `ConversationEngine`: the single authority over one voice conversation.
//!
//! ## Lifecycle
//!
//! ```text
//! ConversationEngine::new()                          idle
//!     └─► start(api_key)       → connecting ─► open   (or error)
//!             ├─► start_capture() / stop_capture()    only meaningful while open
//!             ├─► reset()      → close handle, connecting ─► open
//!             └─► end()        → closed: capture stopped, handle closed,
//!                                playback cleared
//! ```
//!
//! Nothing is retried automatically. A failed connect leaves the engine in
//! `error` until the user calls `reset()`.
//!
//! ## Threading
//!
//! Each session generation gets one event loop thread (`session_loop`), the
//! only consumer of that session's event channel. Capture runs on its own
//! thread (`capture`). The scheduler and the session handle sit behind
//! `parking_lot::Mutex`es; the handle is never handed out, only a
//! `RealtimeSender`.

pub mod diagnostics;
mod session_loop;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{
    audio::{CaptureRequest, Microphone},
    capture::CaptureHandle,
    config::VoiceConfig,
    error::{Result, VoxError},
    ipc::events::{ConversationState, ModelTextEvent, SessionStatusEvent, TurnCompleteEvent},
    playback::{AudioSink, PlaybackScheduler, PlaybackSnapshot},
    session::{
        session_event_channel, ConnectRequest, RealtimeSender, SessionHandle, SessionLink,
        SessionSetup, SessionSlot, VoiceTransport,
    },
};

use diagnostics::{DiagnosticsSnapshot, RelayDiagnostics};

/// Broadcast channel capacity for UI events.
const BROADCAST_CAP: usize = 256;

/// Conversation state plus the generation counter that guards it.
///
/// A generation identifies one session attempt. Bumping it retires the event
/// loop of the previous attempt.
#[derive(Clone)]
pub(crate) struct StatusCell {
    state: Arc<Mutex<ConversationState>>,
    generation: Arc<AtomicU64>,
    tx: broadcast::Sender<SessionStatusEvent>,
}

impl StatusCell {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            state: Arc::new(Mutex::new(ConversationState::Idle)),
            generation: Arc::new(AtomicU64::new(0)),
            tx,
        }
    }

    pub(crate) fn get(&self) -> ConversationState {
        *self.state.lock()
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    fn publish(&self, state: &mut ConversationState, new_state: ConversationState, detail: Option<String>) {
        let changed = *state != new_state;
        *state = new_state;
        if changed || detail.is_some() {
            let _ = self.tx.send(SessionStatusEvent {
                state: new_state,
                detail,
            });
        }
    }

    /// Transition on behalf of `generation`; ignored once it is stale.
    pub(crate) fn set_if_current(
        &self,
        generation: u64,
        new_state: ConversationState,
        detail: Option<String>,
    ) -> bool {
        let mut state = self.state.lock();
        if !self.is_current(generation) {
            debug!(generation, ?new_state, "ignoring transition from stale session");
            return false;
        }
        self.publish(&mut state, new_state, detail);
        true
    }

    /// Start a new generation in `connecting`.
    fn begin_generation(&self) -> u64 {
        let mut state = self.state.lock();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.publish(&mut state, ConversationState::Connecting, None);
        generation
    }

    /// Retire the current generation, optionally moving to `new_state`.
    fn retire(&self, new_state: Option<ConversationState>) {
        let mut state = self.state.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        if let Some(new_state) = new_state {
            self.publish(&mut state, new_state, None);
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.tx.subscribe()
    }
}

/// The top-level conversation handle.
///
/// `ConversationEngine` is `Send + Sync`; wrap it in an `Arc` to share it
/// between UI handlers.
pub struct ConversationEngine {
    config: VoiceConfig,
    transport: Arc<Mutex<Box<dyn VoiceTransport>>>,
    microphone: Arc<Mutex<Box<dyn Microphone>>>,
    status: StatusCell,
    session: SessionSlot,
    scheduler: Arc<Mutex<PlaybackScheduler>>,
    capture: Mutex<Option<CaptureHandle>>,
    /// API key from `start`, reused by `reset`. Memory only.
    credential: Mutex<Option<String>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    /// Serialises start / reset / end.
    lifecycle: Mutex<()>,
    text_tx: broadcast::Sender<ModelTextEvent>,
    turn_tx: broadcast::Sender<TurnCompleteEvent>,
    seq: Arc<AtomicU64>,
    diagnostics: Arc<RelayDiagnostics>,
}

impl ConversationEngine {
    /// Create an idle engine. Nothing is opened until `start()`.
    pub fn new(
        mut config: VoiceConfig,
        transport: impl VoiceTransport,
        microphone: impl Microphone,
        sink: impl AudioSink,
    ) -> Self {
        config.normalize();
        let (text_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (turn_tx, _) = broadcast::channel(BROADCAST_CAP);
        let scheduler = PlaybackScheduler::new(
            Box::new(sink),
            config.output_sample_rate,
            config.output_channels,
        );

        Self {
            config,
            transport: Arc::new(Mutex::new(Box::new(transport))),
            microphone: Arc::new(Mutex::new(Box::new(microphone))),
            status: StatusCell::new(),
            session: Arc::new(Mutex::new(None)),
            scheduler: Arc::new(Mutex::new(scheduler)),
            capture: Mutex::new(None),
            credential: Mutex::new(None),
            event_loop: Mutex::new(None),
            lifecycle: Mutex::new(()),
            text_tx,
            turn_tx,
            seq: Arc::new(AtomicU64::new(0)),
            diagnostics: Arc::new(RelayDiagnostics::default()),
        }
    }

    /// Open the voice session.
    ///
    /// Blocks until the transport connects, fails, or `connect_timeout`
    /// elapses. The session counts as open once the service confirms it
    /// (`state()` becomes `Open`).
    ///
    /// # Errors
    /// - `VoxError::InvalidState` unless the engine is idle.
    /// - `VoxError::MissingCredential` for an empty API key.
    /// - The transport's error, or `VoxError::Timeout`; the engine is then in
    ///   `error`.
    pub fn start(&self, credential: &str) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();

        let actual = self.status.get();
        if actual != ConversationState::Idle {
            return Err(VoxError::InvalidState {
                expected: ConversationState::Idle,
                actual,
            });
        }
        let credential = credential.trim();
        if credential.is_empty() {
            return Err(VoxError::MissingCredential);
        }

        *self.credential.lock() = Some(credential.to_string());
        self.diagnostics.reset();
        info!("starting conversation");
        self.open_session(credential.to_string())
    }

    /// Close the current session (if any) and open a fresh one with the
    /// credential given to `start`.
    ///
    /// Valid in any state. Capture keeps running; callers stop it first if
    /// they want silence during the reconnect.
    ///
    /// # Errors
    /// `VoxError::MissingCredential` if `start` never ran, otherwise the same
    /// failures as `start`.
    pub fn reset(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();

        let credential = self
            .credential
            .lock()
            .clone()
            .ok_or(VoxError::MissingCredential)?;

        info!("resetting conversation");
        self.status.retire(None);
        self.close_handle();
        self.join_event_loop();
        self.open_session(credential)
    }

    /// End the conversation: stop capture, close the session, silence
    /// playback. Idempotent.
    pub fn end(&self) {
        let _lifecycle = self.lifecycle.lock();

        self.status.retire(Some(ConversationState::Closed));
        self.stop_capture();
        self.close_handle();
        self.scheduler.lock().clear();
        self.join_event_loop();
        debug!("conversation ended");
    }

    /// Start streaming the microphone to the session.
    ///
    /// Returns `Ok(false)` without touching the microphone when no session is
    /// open, and `Ok(true)` if capture is (already) running.
    ///
    /// # Errors
    /// Microphone failures (`VoxError::Microphone`, `VoxError::NoInputDevice`,
    /// `VoxError::Timeout`); they are not retried.
    pub fn start_capture(&self) -> Result<bool> {
        if self.status.get() != ConversationState::Open {
            debug!(state = ?self.status.get(), "no open session; capture not started");
            return Ok(false);
        }

        let mut capture = self.capture.lock();
        if capture.as_ref().is_some_and(CaptureHandle::is_running) {
            return Ok(true);
        }

        let request = CaptureRequest {
            preferred_device: self.config.preferred_input_device.clone(),
            target_sample_rate: self.config.capture_sample_rate,
        };
        let handle = CaptureHandle::start(
            Arc::clone(&self.microphone),
            request,
            self.config.capture_frame_size,
            self.realtime_sender(),
            Arc::clone(&self.diagnostics),
            self.config.permission_timeout(),
        )
        .inspect_err(|e| error!("capture failed to start: {e}"))?;

        *capture = Some(handle);
        info!("capture started");
        Ok(true)
    }

    /// Stop streaming the microphone and release it. Idempotent.
    pub fn stop_capture(&self) {
        if let Some(mut handle) = self.capture.lock().take() {
            handle.stop();
            info!("capture stopped");
        }
    }

    pub fn state(&self) -> ConversationState {
        self.status.get()
    }

    pub fn is_capturing(&self) -> bool {
        self.capture
            .lock()
            .as_ref()
            .is_some_and(CaptureHandle::is_running)
    }

    pub fn config(&self) -> &VoiceConfig {
        &self.config
    }

    /// Capability to push chunks into whatever session is open.
    pub fn realtime_sender(&self) -> RealtimeSender {
        RealtimeSender::new(Arc::clone(&self.session), Arc::clone(&self.status.state))
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.status.subscribe()
    }

    pub fn subscribe_text(&self) -> broadcast::Receiver<ModelTextEvent> {
        self.text_tx.subscribe()
    }

    pub fn subscribe_turns(&self) -> broadcast::Receiver<TurnCompleteEvent> {
        self.turn_tx.subscribe()
    }

    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    pub fn playback_snapshot(&self) -> PlaybackSnapshot {
        self.scheduler.lock().snapshot()
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn open_session(&self, credential: String) -> Result<()> {
        let generation = self.status.begin_generation();
        let (events_tx, events_rx) = session_event_channel(self.config.event_channel_capacity);

        let ctx = session_loop::SessionLoopContext {
            generation,
            events: events_rx,
            status: self.status.clone(),
            scheduler: Arc::clone(&self.scheduler),
            session: Arc::clone(&self.session),
            text_tx: self.text_tx.clone(),
            turn_tx: self.turn_tx.clone(),
            seq: Arc::clone(&self.seq),
            diagnostics: Arc::clone(&self.diagnostics),
        };
        let event_loop = std::thread::Builder::new()
            .name(format!("voxrelay-session-{generation}"))
            .spawn(move || session_loop::run(ctx))?;
        *self.event_loop.lock() = Some(event_loop);

        let request = ConnectRequest {
            credential,
            setup: SessionSetup::from_config(&self.config),
        };
        let transport = Arc::clone(&self.transport);
        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<Box<dyn SessionLink>>>();

        std::thread::Builder::new()
            .name(format!("voxrelay-connect-{generation}"))
            .spawn(move || {
                let result = transport.lock().connect(&request, events_tx);
                if let Err(std::sync::mpsc::SendError(Ok(mut link))) = open_tx.send(result) {
                    warn!(generation, "session opened after connect was abandoned; closing it");
                    link.close();
                }
            })?;

        match open_rx.recv_timeout(self.config.connect_timeout()) {
            Ok(Ok(link)) => {
                let handle = SessionHandle::new(generation, link);
                let stale = {
                    // Checked under the slot lock: a close seen after this
                    // point finds the handle in the slot and releases it.
                    let mut slot = self.session.lock();
                    let live = self.status.is_current(generation)
                        && !matches!(
                            self.status.get(),
                            ConversationState::Closed | ConversationState::Error
                        );
                    if live {
                        *slot = Some(handle);
                        None
                    } else {
                        Some(handle)
                    }
                };
                match stale {
                    None => {
                        info!(generation, "voice session connected");
                        Ok(())
                    }
                    Some(handle) => {
                        warn!(generation, "voice session closed while opening; dropping link");
                        handle.close();
                        Err(VoxError::Session("voice session closed while opening".into()))
                    }
                }
            }
            Ok(Err(e)) => Err(self.fail_connect(generation, e)),
            Err(_) => Err(self.fail_connect(
                generation,
                VoxError::Timeout("voice session to open".into()),
            )),
        }
    }

    fn fail_connect(&self, generation: u64, e: VoxError) -> VoxError {
        error!(generation, "voice session failed to open: {e}");
        self.status
            .set_if_current(generation, ConversationState::Error, Some(e.to_string()));
        // A late link from this attempt must not flip the state back.
        self.status.retire(None);
        e
    }

    fn close_handle(&self) {
        let handle = self.session.lock().take();
        if let Some(handle) = handle {
            handle.close();
        }
    }

    fn join_event_loop(&self) {
        let handle = self.event_loop.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("session event loop panicked");
            }
        }
    }
}

impl Drop for ConversationEngine {
    fn drop(&mut self) {
        self.end();
    }
}

impl std::fmt::Debug for ConversationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationEngine")
            .field("state", &self.status.get())
            .field("capturing", &self.is_capturing())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SyntheticMicrophone;
    use crate::codec::{encode_outbound, EncodedChunk};
    use crate::playback::TimelineSink;
    use crate::session::{emit, ServerContent, SessionEvent, SessionEventSender};
    use std::time::{Duration, Instant};

    /// Transport whose event sender the test keeps, to play the service.
    #[derive(Clone, Default)]
    struct ScriptedTransport {
        events: Arc<Mutex<Option<SessionEventSender>>>,
        fail_with: Option<String>,
        open_on_connect: bool,
        /// Open, then close again before `connect` returns the link.
        close_during_connect: bool,
        closes: Arc<AtomicU64>,
    }

    struct ScriptedLink {
        closes: Arc<AtomicU64>,
    }

    impl SessionLink for ScriptedLink {
        fn send_realtime_input(&mut self, _chunk: &EncodedChunk) -> Result<()> {
            Ok(())
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl VoiceTransport for ScriptedTransport {
        fn connect(
            &mut self,
            _request: &ConnectRequest,
            events: SessionEventSender,
        ) -> Result<Box<dyn SessionLink>> {
            if let Some(message) = &self.fail_with {
                return Err(VoxError::Connect(message.clone()));
            }
            if self.open_on_connect {
                emit(&events, SessionEvent::Opened);
            }
            if self.close_during_connect {
                emit(&events, SessionEvent::Opened);
                emit(&events, SessionEvent::Closed(Some("setup rejected".into())));
                std::thread::sleep(Duration::from_millis(50));
            }
            *self.events.lock() = Some(events);
            Ok(Box::new(ScriptedLink {
                closes: Arc::clone(&self.closes),
            }))
        }
    }

    impl ScriptedTransport {
        fn opening() -> Self {
            Self {
                open_on_connect: true,
                ..Self::default()
            }
        }

        fn push(&self, event: SessionEvent) {
            let events = self.events.lock();
            let tx = events.as_ref().expect("connected");
            assert!(emit(tx, event));
        }
    }

    fn engine(transport: ScriptedTransport) -> (ConversationEngine, TimelineSink) {
        let sink = TimelineSink::new(24_000, 1, 1.0);
        let engine = ConversationEngine::new(
            VoiceConfig::default(),
            transport,
            SyntheticMicrophone::default(),
            sink.clone(),
        );
        (engine, sink)
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let start = Instant::now();
        while !cond() {
            assert!(start.elapsed() < Duration::from_secs(2), "condition not met");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn start_requires_idle_and_a_credential() {
        let (engine, _sink) = engine(ScriptedTransport::opening());
        assert!(matches!(engine.start("  "), Err(VoxError::MissingCredential)));
        assert_eq!(engine.state(), ConversationState::Idle);

        engine.start("key").expect("start");
        wait_for(|| engine.state() == ConversationState::Open);

        let err = engine.start("key").unwrap_err();
        assert!(matches!(
            err,
            VoxError::InvalidState {
                expected: ConversationState::Idle,
                actual: ConversationState::Open
            }
        ));
    }

    #[test]
    fn connect_failure_moves_to_error_with_message() {
        let transport = ScriptedTransport {
            fail_with: Some("quota exceeded".into()),
            ..ScriptedTransport::default()
        };
        let (engine, _sink) = engine(transport);
        let mut status = engine.subscribe_status();

        assert!(matches!(engine.start("key"), Err(VoxError::Connect(_))));
        assert_eq!(engine.state(), ConversationState::Error);

        assert_eq!(status.try_recv().unwrap().state, ConversationState::Connecting);
        let failed = status.try_recv().unwrap();
        assert_eq!(failed.state, ConversationState::Error);
        assert!(failed.detail.unwrap().contains("quota exceeded"));
    }

    #[test]
    fn capture_without_open_session_is_a_no_op() {
        let (engine, _sink) = engine(ScriptedTransport::default());
        assert!(!engine.start_capture().expect("no error"));
        assert!(!engine.is_capturing());

        // Connected but the service has not confirmed the session yet.
        engine.start("key").expect("start");
        assert_eq!(engine.state(), ConversationState::Connecting);
        assert!(!engine.start_capture().expect("no error"));
    }

    #[test]
    fn server_events_drive_state_and_playback() {
        let transport = ScriptedTransport::opening();
        let (engine, _sink) = engine(transport.clone());
        let mut text = engine.subscribe_text();
        engine.start("key").expect("start");
        wait_for(|| engine.state() == ConversationState::Open);

        let audio = encode_outbound(&vec![0.2; 480], 24_000);
        transport.push(SessionEvent::Message(ServerContent::audio(audio.clone())));
        transport.push(SessionEvent::Message(ServerContent::audio(audio)));
        wait_for(|| engine.playback_snapshot().scheduled.len() == 2);

        let snapshot = engine.playback_snapshot();
        assert!((snapshot.scheduled[1].start_time - snapshot.scheduled[0].end_time()).abs() < 1e-9);

        transport.push(SessionEvent::Message(ServerContent::interruption()));
        wait_for(|| engine.playback_snapshot().scheduled.is_empty());
        assert_eq!(engine.playback_snapshot().next_start_time, 0.0);
        assert_eq!(engine.diagnostics_snapshot().interruptions, 1);

        let mut spoken = ServerContent::default();
        spoken.model_turn = Some(crate::session::wire::Content {
            parts: vec![crate::session::wire::Part {
                text: Some("It has a pool.".into()),
                inline_data: None,
            }],
        });
        transport.push(SessionEvent::Message(spoken));
        let start = Instant::now();
        let event = loop {
            match text.try_recv() {
                Ok(event) => break event,
                Err(_) if start.elapsed() < Duration::from_secs(2) => {
                    std::thread::sleep(Duration::from_millis(5))
                }
                Err(e) => panic!("no text event: {e}"),
            }
        };
        assert_eq!(event.text, "It has a pool.");

        transport.push(SessionEvent::Error("socket reset".into()));
        wait_for(|| engine.state() == ConversationState::Error);
        transport.push(SessionEvent::Closed(Some("going away".into())));
        wait_for(|| engine.state() == ConversationState::Closed);
        wait_for(|| transport.closes.load(Ordering::SeqCst) == 1);
    }

    #[test]
    fn interruption_and_new_audio_in_one_message() {
        let transport = ScriptedTransport::opening();
        let (engine, sink) = engine(transport.clone());
        engine.start("key").expect("start");
        wait_for(|| engine.state() == ConversationState::Open);

        let audio = encode_outbound(&vec![0.2; 480], 24_000);
        transport.push(SessionEvent::Message(ServerContent::audio(audio.clone())));
        wait_for(|| engine.playback_snapshot().scheduled.len() == 1);
        let stale = engine.playback_snapshot().scheduled[0].id;

        // The cut applies first, then both parts are queued back to back.
        let mut barge_in = ServerContent::audio(audio.clone());
        barge_in.interrupted = true;
        if let Some(turn) = barge_in.model_turn.as_mut() {
            turn.parts.push(crate::session::wire::Part {
                text: None,
                inline_data: Some(audio),
            });
        }
        transport.push(SessionEvent::Message(barge_in));
        wait_for(|| engine.diagnostics_snapshot().chunks_scheduled == 3);

        assert_eq!(engine.diagnostics_snapshot().interruptions, 1);
        let snapshot = engine.playback_snapshot();
        assert_eq!(snapshot.scheduled.len(), 2);
        assert!(snapshot.scheduled.iter().all(|s| s.id != stale));
        let now = sink.shared().lock().current_time();
        assert!((snapshot.scheduled[0].start_time - now).abs() < 1e-9);
        assert!((snapshot.scheduled[1].start_time - snapshot.scheduled[0].end_time()).abs() < 1e-9);
        assert_eq!(sink.shared().lock().active_sources(), 2);
    }

    #[test]
    fn session_closed_while_connecting_releases_the_link() {
        let transport = ScriptedTransport {
            close_during_connect: true,
            ..ScriptedTransport::default()
        };
        let (engine, _sink) = engine(transport.clone());

        assert!(matches!(engine.start("key"), Err(VoxError::Session(_))));
        assert_eq!(engine.state(), ConversationState::Closed);
        assert!(engine.session.lock().is_none());
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
        assert!(!engine.start_capture().expect("no-op"));
    }

    #[test]
    fn reset_closes_old_handle_and_ignores_its_events() {
        let transport = ScriptedTransport::opening();
        let (engine, _sink) = engine(transport.clone());
        engine.start("key").expect("start");
        wait_for(|| engine.state() == ConversationState::Open);
        let stale = transport.events.lock().clone().expect("first sender");

        engine.reset().expect("reset");
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
        wait_for(|| engine.state() == ConversationState::Open);

        // The first session's events no longer reach the engine.
        let _ = stale.try_send(SessionEvent::Closed(Some("late".into())));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(engine.state(), ConversationState::Open);
    }

    #[test]
    fn reset_before_start_needs_a_credential() {
        let (engine, _sink) = engine(ScriptedTransport::opening());
        assert!(matches!(engine.reset(), Err(VoxError::MissingCredential)));
    }

    #[test]
    fn reset_recovers_from_error() {
        let transport = ScriptedTransport::opening();
        let (engine, _sink) = engine(transport.clone());
        engine.start("key").expect("start");
        wait_for(|| engine.state() == ConversationState::Open);
        transport.push(SessionEvent::Error("stream broke".into()));
        wait_for(|| engine.state() == ConversationState::Error);

        engine.reset().expect("reset");
        wait_for(|| engine.state() == ConversationState::Open);
    }

    #[test]
    fn end_is_idempotent_and_silences_playback() {
        let transport = ScriptedTransport::opening();
        let (engine, sink) = engine(transport.clone());
        engine.start("key").expect("start");
        wait_for(|| engine.state() == ConversationState::Open);
        transport.push(SessionEvent::Message(ServerContent::audio(encode_outbound(
            &vec![0.2; 480],
            24_000,
        ))));
        wait_for(|| engine.playback_snapshot().scheduled.len() == 1);

        engine.end();
        engine.end();
        assert_eq!(engine.state(), ConversationState::Closed);
        assert!(engine.playback_snapshot().scheduled.is_empty());
        assert_eq!(sink.shared().lock().active_sources(), 0);
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
    }
}
