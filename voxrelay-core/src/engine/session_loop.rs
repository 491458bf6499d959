//! Session event loop: the single consumer of one session's event channel.
//!
//! One loop runs per session generation. It stops acting as soon as the
//! engine moves to a newer generation (reset / end), so events from a closed
//! session can never touch the state, the scheduler or the handle slot of its
//! successor.
//!
//! ## Per event
//!
//! ```text
//! Opened          → state = open
//! Message         → interrupted? scheduler.interrupt()
//!                   inline audio parts → scheduler.enqueue (arrival order)
//!                   text parts → ModelTextEvent, turnComplete → TurnCompleteEvent
//! Error(msg)      → state = error(msg)
//! Closed(reason)  → state = closed(reason), handle released, loop exits
//! ```
//!
//! Between events the loop reaps finished playback sources.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, info_span, warn};

use super::{diagnostics::RelayDiagnostics, StatusCell};
use crate::{
    ipc::events::{ConversationState, ModelTextEvent, TurnCompleteEvent},
    playback::PlaybackScheduler,
    session::{ServerContent, SessionEvent, SessionEventReceiver, SessionSlot},
};

/// How often finished playback sources are reaped when no events arrive.
const REAP_INTERVAL: Duration = Duration::from_millis(10);

pub(crate) struct SessionLoopContext {
    pub generation: u64,
    pub events: SessionEventReceiver,
    pub status: StatusCell,
    pub scheduler: Arc<Mutex<PlaybackScheduler>>,
    pub session: SessionSlot,
    pub text_tx: broadcast::Sender<ModelTextEvent>,
    pub turn_tx: broadcast::Sender<TurnCompleteEvent>,
    pub seq: Arc<AtomicU64>,
    pub diagnostics: Arc<RelayDiagnostics>,
}

/// Run until the session closes, its transport goes away, or the engine
/// moves to another generation.
pub(crate) fn run(ctx: SessionLoopContext) {
    let span = info_span!("session", generation = ctx.generation);
    let _enter = span.enter();
    debug!("session event loop started");

    loop {
        if !ctx.status.is_current(ctx.generation) {
            debug!("session superseded");
            break;
        }

        match ctx.events.recv_timeout(REAP_INTERVAL) {
            Ok(event) => {
                if !handle_event(&ctx, event) {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                debug!("session transport dropped its event sender");
                break;
            }
        }

        reap(&ctx);
    }

    debug!("session event loop stopped");
}

/// Returns `false` once the loop should stop.
fn handle_event(ctx: &SessionLoopContext, event: SessionEvent) -> bool {
    match event {
        SessionEvent::Opened => {
            if ctx
                .status
                .set_if_current(ctx.generation, ConversationState::Open, None)
            {
                ctx.diagnostics.sessions_opened.fetch_add(1, Ordering::Relaxed);
                info!("voice session open");
            }
            true
        }
        SessionEvent::Message(content) => {
            handle_content(ctx, &content);
            true
        }
        SessionEvent::Error(message) => {
            warn!(%message, "voice session error");
            ctx.status
                .set_if_current(ctx.generation, ConversationState::Error, Some(message));
            true
        }
        SessionEvent::Closed(reason) => {
            info!(reason = reason.as_deref().unwrap_or(""), "voice session closed");
            if ctx
                .status
                .set_if_current(ctx.generation, ConversationState::Closed, reason)
            {
                release_handle(ctx);
            }
            false
        }
    }
}

fn handle_content(ctx: &SessionLoopContext, content: &ServerContent) {
    {
        let mut scheduler = ctx.scheduler.lock();
        // Checked under the scheduler lock: end() retires the generation
        // before it clears the scheduler.
        if !ctx.status.is_current(ctx.generation) {
            return;
        }

        if content.interrupted {
            let stopped = scheduler.interrupt();
            ctx.diagnostics.interruptions.fetch_add(1, Ordering::Relaxed);
            info!(stopped, "model interrupted, playback cut");
        }

        for chunk in content.inline_audio() {
            ctx.diagnostics
                .chunks_received
                .fetch_add(1, Ordering::Relaxed);
            match scheduler.enqueue(chunk) {
                Ok(Some(_)) => {
                    ctx.diagnostics
                        .chunks_scheduled
                        .fetch_add(1, Ordering::Relaxed);
                }
                Ok(None) => {
                    ctx.diagnostics.chunks_ignored.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    ctx.diagnostics.chunks_ignored.fetch_add(1, Ordering::Relaxed);
                    debug!("ignoring malformed audio chunk: {e}");
                }
            }
        }
    }

    for text in content.texts() {
        let seq = ctx.seq.fetch_add(1, Ordering::Relaxed);
        let _ = ctx.text_tx.send(ModelTextEvent {
            seq,
            text: text.to_string(),
        });
    }

    if content.turn_complete {
        let seq = ctx.seq.fetch_add(1, Ordering::Relaxed);
        let _ = ctx.turn_tx.send(TurnCompleteEvent { seq });
    }
}

fn reap(ctx: &SessionLoopContext) {
    let mut scheduler = ctx.scheduler.lock();
    if ctx.status.is_current(ctx.generation) {
        scheduler.reap_finished();
    }
}

fn release_handle(ctx: &SessionLoopContext) {
    let handle = {
        let mut slot = ctx.session.lock();
        match slot.as_ref() {
            Some(h) if h.generation() == ctx.generation => slot.take(),
            _ => None,
        }
    };
    if let Some(handle) = handle {
        handle.close();
    }
}
