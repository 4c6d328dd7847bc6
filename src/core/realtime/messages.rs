//! Realtime API WebSocket message types.
//!
//! Client and server events are JSON with a `type` discriminator. Only the
//! subset the bridge consumes is modelled; unrecognized server events fall
//! into [`ServerEvent::Other`] and are ignored.
//!
//! Client events sent:
//! - session.update - audio formats, voice, instructions, turn detection
//! - input_audio_buffer.append - caller ulaw, base64
//! - conversation.item.create - the initial user message
//! - response.create - request a spoken response
//!
//! Server events consumed:
//! - session.created / session.updated
//! - conversation.item.created (barge-in detection)
//! - conversation.item.input_audio_transcription.completed (caller side)
//! - response.audio.delta / response.audio.done (assistant audio)
//! - response.audio_transcript.done (assistant side, trigger matching)
//! - error

use base64::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::VadSettings;

// =============================================================================
// Session configuration
// =============================================================================

/// Session configuration carried by `session.update`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionConfig {
    pub modalities: Vec<String>,
    pub voice: String,
    pub instructions: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<InputAudioTranscription>,
    pub turn_detection: TurnDetection,
}

/// Input transcription model selection.
#[derive(Debug, Clone, Serialize)]
pub struct InputAudioTranscription {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Turn detection as sent on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum TurnDetection {
    #[serde(rename = "server_vad")]
    ServerVad {
        threshold: f32,
        prefix_padding_ms: u32,
        silence_duration_ms: u32,
    },
    #[serde(rename = "semantic_vad")]
    SemanticVad,
}

impl From<&VadSettings> for TurnDetection {
    fn from(settings: &VadSettings) -> Self {
        match *settings {
            VadSettings::ServerVad {
                threshold,
                prefix_padding_ms,
                silence_duration_ms,
            } => TurnDetection::ServerVad {
                threshold,
                prefix_padding_ms,
                silence_duration_ms,
            },
            VadSettings::SemanticVad => TurnDetection::SemanticVad,
        }
    }
}

// =============================================================================
// Conversation items
// =============================================================================

/// Conversation item as created by the client (initial message only).
#[derive(Debug, Clone, Serialize)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub item_type: String,
    pub role: String,
    pub content: Vec<ContentPart>,
}

impl ConversationItem {
    /// A plain user text message.
    pub fn user_text(text: &str) -> Self {
        Self {
            item_type: "message".to_string(),
            role: "user".to_string(),
            content: vec![ContentPart {
                content_type: "input_text".to_string(),
                text: text.to_string(),
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: String,
}

// =============================================================================
// Client events
// =============================================================================

/// Events sent to the realtime endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },

    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },

    #[serde(rename = "response.create")]
    ResponseCreate,
}

impl ClientEvent {
    /// Wrap raw ulaw bytes as a base64 audio append.
    pub fn audio_append(data: &[u8]) -> Self {
        ClientEvent::InputAudioBufferAppend {
            audio: BASE64_STANDARD.encode(data),
        }
    }
}

// =============================================================================
// Server events
// =============================================================================

/// Events received from the realtime endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "error")]
    Error { error: ApiError },

    #[serde(rename = "session.created")]
    SessionCreated { session: SessionMeta },

    #[serde(rename = "session.updated")]
    SessionUpdated { session: SessionMeta },

    #[serde(rename = "conversation.item.created")]
    ConversationItemCreated { item: CreatedItem },

    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted {
        #[serde(default)]
        transcript: String,
    },

    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },

    #[serde(rename = "response.audio.done")]
    AudioDone,

    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone {
        #[serde(default)]
        transcript: String,
    },

    /// Anything else (response.created, transcript deltas, rate limits, ...)
    #[serde(other)]
    Other,
}

impl ServerEvent {
    /// Decode the base64 payload of an audio delta.
    pub fn decode_audio_delta(delta: &str) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64_STANDARD.decode(delta)
    }
}

/// Error payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiError {
    #[serde(rename = "type", default)]
    pub error_type: String,
    #[serde(default)]
    pub message: String,
}

/// Session identity; only logged.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionMeta {
    #[serde(default)]
    pub id: String,
}

/// Conversation item as announced by the server.
#[derive(Debug, Clone, Deserialize)]
pub struct CreatedItem {
    #[serde(default)]
    pub role: Option<String>,
}
