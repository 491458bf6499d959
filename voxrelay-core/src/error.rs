use thiserror::Error;

use crate::ipc::events::ConversationState;

/// All errors produced by voxrelay-core.
#[derive(Debug, Error)]
pub enum VoxError {
    #[error("microphone unavailable: {0}")]
    Microphone(String),

    #[error("no input device found")]
    NoInputDevice,

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("playback error: {0}")]
    Playback(String),

    #[error("an API key is required to open a voice session")]
    MissingCredential,

    #[error("invalid conversation state: expected {expected:?}, found {actual:?}")]
    InvalidState {
        expected: ConversationState,
        actual: ConversationState,
    },

    #[error("failed to open voice session: {0}")]
    Connect(String),

    #[error("voice session error: {0}")]
    Session(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("malformed audio payload: {0}")]
    Payload(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, VoxError>;
