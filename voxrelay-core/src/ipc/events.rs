//! Event payloads.
//!
//! | Event | Meaning |
//! |-------|---------|
//! | `SessionStatusEvent` | conversation state changed (with error / close detail) |
//! | `ModelTextEvent` | text part of a model turn |
//! | `TurnCompleteEvent` | the model finished speaking |

use serde::{Deserialize, Serialize};

/// Lifecycle of one voice conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationState {
    /// Nothing started yet.
    Idle,
    /// Session open requested, waiting for the service.
    Connecting,
    /// Session open; capture may run.
    Open,
    /// Ended by the user or closed by the service.
    Closed,
    /// Connect failed or the session errored; needs a manual reset.
    Error,
}

/// Emitted whenever `ConversationState` changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusEvent {
    pub state: ConversationState,
    /// Error message or close reason, shown to the user as-is.
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelTextEvent {
    pub seq: u64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnCompleteEvent {
    pub seq: u64,
}
