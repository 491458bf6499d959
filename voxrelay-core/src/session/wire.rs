//! JSON messages of the live voice protocol.
//!
//! ```text
//! client → {"setup": {...}}                         once, right after connect
//! client → {"realtimeInput": {"mediaChunks": [..]}} one per captured frame
//! server → {"setupComplete": {}}                    session is open
//! server → {"serverContent": {...}}                 model audio / text / interrupted
//! ```

use serde::{Deserialize, Serialize};

use super::{SessionEvent, SessionSetup};
use crate::codec::EncodedChunk;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    Audio,
    Text,
}

/// One part of a model turn: text or inline media.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<EncodedChunk>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

/// Payload of a `serverContent` message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_turn: Option<Content>,
    /// The user started speaking over the model; playback must stop.
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

impl ServerContent {
    /// A model turn carrying one inline audio chunk.
    pub fn audio(chunk: EncodedChunk) -> Self {
        Self {
            model_turn: Some(Content {
                parts: vec![Part {
                    text: None,
                    inline_data: Some(chunk),
                }],
            }),
            ..Self::default()
        }
    }

    pub fn interruption() -> Self {
        Self {
            interrupted: true,
            ..Self::default()
        }
    }

    fn parts(&self) -> impl Iterator<Item = &Part> {
        self.model_turn.iter().flat_map(|turn| turn.parts.iter())
    }

    /// Inline audio chunks in part order.
    pub fn inline_audio(&self) -> impl Iterator<Item = &EncodedChunk> {
        self.parts()
            .filter_map(|p| p.inline_data.as_ref())
            .filter(|chunk| chunk.is_audio())
    }

    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.parts().filter_map(|p| p.text.as_deref())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceSelection {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceSelection,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<Modality>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<EncodedChunk>,
}

/// Messages a client sends over the duplex connection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    pub fn setup(setup: &SessionSetup) -> Self {
        Self::Setup(Setup {
            model: setup.model.clone(),
            generation_config: GenerationConfig {
                response_modalities: setup.response_modalities.clone(),
                speech_config: SpeechConfig {
                    voice_config: VoiceSelection {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: setup.voice.clone(),
                        },
                    },
                },
            },
            system_instruction: setup.system_instruction.as_ref().map(|text| Content {
                parts: vec![Part {
                    text: Some(text.clone()),
                    inline_data: None,
                }],
            }),
        })
    }

    pub fn realtime_input(chunk: &EncodedChunk) -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: vec![chunk.clone()],
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    #[serde(default)]
    setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    server_content: Option<ServerContent>,
}

/// Map one server text frame onto session events.
///
/// Messages this relay does not act on (tool calls, usage metadata) map to
/// no events.
pub fn parse_server_message(text: &str) -> Result<Vec<SessionEvent>> {
    let message: ServerMessage = serde_json::from_str(text)?;
    let mut events = Vec::new();
    if message.setup_complete.is_some() {
        events.push(SessionEvent::Opened);
    }
    if let Some(content) = message.server_content {
        events.push(SessionEvent::Message(content));
    }
    Ok(events)
}
