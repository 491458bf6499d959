//! # voxrelay-core
//!
//! Real-time voice relay: microphone → live voice session → speaker.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → SPSC RingBuffer → capture thread ─ resample ─ frame ─ PCM16/base64
//!                                                                     │
//!                                                           RealtimeSender::send
//!                                                                     │
//!                                                            SessionLink (transport)
//!                                                                     │
//!                                      SessionEvent channel ◄─────────┘
//!                                               │
//!                                      session event loop ─► broadcast::Sender<…Event>
//!                                               │
//!                                      PlaybackScheduler ─► AudioSink (Timeline → OutputRenderer → Speaker)
//! ```
//!
//! The audio callbacks never allocate or block on the engine's locks. All
//! codec and scheduling work happens on the capture thread and the session
//! event loop.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod capture;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod playback;
pub mod session;

// Convenience re-exports for downstream crates
pub use audio::{CpalMicrophone, Microphone, SyntheticMicrophone};
pub use codec::{EncodedChunk, PlaybackBuffer};
pub use config::VoiceConfig;
pub use engine::{diagnostics::DiagnosticsSnapshot, ConversationEngine};
pub use error::VoxError;
pub use ipc::events::{ConversationState, ModelTextEvent, SessionStatusEvent, TurnCompleteEvent};
pub use playback::{speaker::Speaker, AudioSink, OutputRenderer, PlaybackScheduler, TimelineSink};
pub use session::{LoopbackTransport, SessionEvent, VoiceTransport};
