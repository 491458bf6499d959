//! Duplex voice session abstraction.
//!
//! A `VoiceTransport` opens one `SessionLink` per conversation. Whatever the
//! transport receives (open, model content, errors, close) is pushed as a
//! `SessionEvent` into a bounded channel that exactly one event loop drains.
//!
//! The live link is owned by the engine inside a `SessionHandle`. Capture only
//! ever sees a `RealtimeSender`, which can send a chunk or report whether a
//! session is open, and never outlives a reset in a way that reaches a stale
//! link.

pub mod loopback;
pub mod wire;

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::codec::EncodedChunk;
use crate::config::VoiceConfig;
use crate::error::Result;
use crate::ipc::events::ConversationState;

pub use loopback::LoopbackTransport;
pub use wire::{Modality, ServerContent};

/// Something the remote service told us.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Opened,
    Message(ServerContent),
    Error(String),
    /// Connection closed, with the close reason if one was given.
    Closed(Option<String>),
}

pub type SessionEventSender = Sender<SessionEvent>;
pub type SessionEventReceiver = Receiver<SessionEvent>;

/// Bounded channel between a transport and the session event loop.
pub fn session_event_channel(capacity: usize) -> (SessionEventSender, SessionEventReceiver) {
    crossbeam_channel::bounded(capacity.max(1))
}

/// Push an event without ever blocking the transport's I/O thread.
pub fn emit(events: &SessionEventSender, event: SessionEvent) -> bool {
    match events.try_send(event) {
        Ok(()) => true,
        Err(crossbeam_channel::TrySendError::Full(event)) => {
            warn!(?event, "session event channel full, dropping event");
            false
        }
        Err(crossbeam_channel::TrySendError::Disconnected(_)) => {
            debug!("session event loop gone, dropping event");
            false
        }
    }
}

/// Session parameters sent in the setup message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSetup {
    pub model: String,
    pub voice: String,
    pub system_instruction: Option<String>,
    pub response_modalities: Vec<Modality>,
}

impl SessionSetup {
    /// Audio-only responses with the configured model and voice.
    pub fn from_config(config: &VoiceConfig) -> Self {
        Self {
            model: config.model.clone(),
            voice: config.voice.clone(),
            system_instruction: config.system_instruction.clone(),
            response_modalities: vec![Modality::Audio],
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// API key for the voice service. Held in memory only.
    pub credential: String,
    pub setup: SessionSetup,
}

/// One open duplex connection.
pub trait SessionLink: Send + 'static {
    fn send_realtime_input(&mut self, chunk: &EncodedChunk) -> Result<()>;

    /// Close the connection. Safe to call more than once.
    fn close(&mut self);
}

/// Opens duplex connections to the voice service.
pub trait VoiceTransport: Send + 'static {
    /// Open a session. Blocks until the connection is established or fails;
    /// the caller bounds the wait.
    ///
    /// `events` receives `Opened` once the service accepts the setup, then
    /// model content, errors and the final close.
    fn connect(
        &mut self,
        request: &ConnectRequest,
        events: SessionEventSender,
    ) -> Result<Box<dyn SessionLink>>;
}

/// Engine-owned wrapper around the live link.
pub struct SessionHandle {
    generation: u64,
    link: Box<dyn SessionLink>,
}

impl SessionHandle {
    pub fn new(generation: u64, link: Box<dyn SessionLink>) -> Self {
        Self { generation, link }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn close(mut self) {
        debug!(generation = self.generation, "closing session handle");
        self.link.close();
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// The single slot holding the engine's session handle.
pub(crate) type SessionSlot = Arc<Mutex<Option<SessionHandle>>>;

/// Capability handed to capture: send a chunk to whatever session is open.
#[derive(Clone)]
pub struct RealtimeSender {
    slot: SessionSlot,
    state: Arc<Mutex<ConversationState>>,
}

impl RealtimeSender {
    pub(crate) fn new(slot: SessionSlot, state: Arc<Mutex<ConversationState>>) -> Self {
        Self { slot, state }
    }

    pub fn is_open(&self) -> bool {
        // State guard is released before the slot is locked.
        let state = *self.state.lock();
        state == ConversationState::Open && self.slot.lock().is_some()
    }

    /// Send one chunk. Returns `false` when no session is open or the send
    /// failed; the chunk is dropped in both cases.
    pub fn send(&self, chunk: &EncodedChunk) -> bool {
        if *self.state.lock() != ConversationState::Open {
            return false;
        }
        let mut slot = self.slot.lock();
        let Some(handle) = slot.as_mut() else {
            return false;
        };
        match handle.link.send_realtime_input(chunk) {
            Ok(()) => true,
            Err(e) => {
                warn!(generation = handle.generation, "realtime input send failed: {e}");
                false
            }
        }
    }
}
