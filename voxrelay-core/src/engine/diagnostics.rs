use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

/// Relay counters, shared by the capture thread and the session event loop.
#[derive(Debug, Default)]
pub struct RelayDiagnostics {
    pub samples_captured: AtomicUsize,
    pub frames_sent: AtomicUsize,
    /// Frames cut while no session was open (or the send failed).
    pub frames_dropped: AtomicUsize,
    pub chunks_received: AtomicUsize,
    pub chunks_scheduled: AtomicUsize,
    /// Empty or malformed inbound chunks.
    pub chunks_ignored: AtomicUsize,
    pub interruptions: AtomicUsize,
    pub sessions_opened: AtomicUsize,
}

impl RelayDiagnostics {
    pub fn reset(&self) {
        for counter in [
            &self.samples_captured,
            &self.frames_sent,
            &self.frames_dropped,
            &self.chunks_received,
            &self.chunks_scheduled,
            &self.chunks_ignored,
            &self.interruptions,
            &self.sessions_opened,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            samples_captured: self.samples_captured.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            chunks_scheduled: self.chunks_scheduled.load(Ordering::Relaxed),
            chunks_ignored: self.chunks_ignored.load(Ordering::Relaxed),
            interruptions: self.interruptions.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub samples_captured: usize,
    pub frames_sent: usize,
    pub frames_dropped: usize,
    pub chunks_received: usize,
    pub chunks_scheduled: usize,
    pub chunks_ignored: usize,
    pub interruptions: usize,
    pub sessions_opened: usize,
}
