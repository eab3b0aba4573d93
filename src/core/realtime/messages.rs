//! Realtime voice protocol message types.
//!
//! This module defines the typed client and server events exchanged with the
//! voice backend. The `type` discriminator is not part of these types: it is
//! supplied by the [`EventVocabulary`](super::vocabulary::EventVocabulary) in
//! use, so the same payloads serve every wire dialect.
//!
//! # Protocol Overview
//!
//! Client events (sent to server):
//! - session update - Apply session configuration
//! - input audio append - Append a base64 audio chunk
//! - input audio commit - Mark end of the user's turn
//! - conversation item create - Add a user text message
//! - response create - Ask the assistant to respond
//!
//! Server events (received from server):
//! - session created / updated
//! - speech started / stopped (server VAD)
//! - conversation item created
//! - response created, output item added
//! - audio delta, audio transcript delta / done
//! - response done
//! - error

use base64::prelude::*;
use serde::{Deserialize, Serialize};

use super::base::{SessionConfig, TurnDetectionConfig};

// =============================================================================
// Session Configuration
// =============================================================================

/// Session payload of a session update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionPayload {
    /// Response modalities (text, audio)
    pub modalities: Vec<String>,

    /// System instructions for the assistant
    pub instructions: String,

    /// Voice for audio output
    pub voice: String,

    /// Input audio format
    pub input_audio_format: String,

    /// Output audio format
    pub output_audio_format: String,

    /// Input audio transcription configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<InputAudioTranscription>,

    /// Turn detection configuration, `null` disables server VAD
    pub turn_detection: Option<TurnDetectionConfig>,

    /// Temperature for response generation
    pub temperature: f32,

    /// Maximum response output tokens
    pub max_response_output_tokens: MaxTokens,
}

impl SessionPayload {
    /// Build the session payload for a session configuration.
    pub fn from_config(config: &SessionConfig) -> Self {
        let format = audio_format_name(config.bit_depth);
        Self {
            modalities: default_modalities(),
            instructions: config.instructions.clone(),
            voice: config.voice.clone(),
            input_audio_format: format.clone(),
            output_audio_format: format,
            input_audio_transcription: Some(InputAudioTranscription {
                model: "whisper-1".to_string(),
                language: Some(config.language.clone()),
            }),
            turn_detection: match &config.turn_detection {
                TurnDetectionConfig::None => None,
                other => Some(other.clone()),
            },
            temperature: config.temperature,
            max_response_output_tokens: MaxTokens::from_limit(config.max_tokens),
        }
    }
}

fn default_modalities() -> Vec<String> {
    vec!["text".to_string(), "audio".to_string()]
}

fn audio_format_name(bit_depth: u16) -> String {
    format!("pcm{bit_depth}")
}

/// Maximum tokens configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MaxTokens {
    /// Specific number of tokens
    Number(u32),
    /// Infinite tokens
    Infinite(String), // "inf"
}

impl MaxTokens {
    pub fn from_limit(limit: Option<u32>) -> Self {
        match limit {
            Some(n) => MaxTokens::Number(n),
            None => MaxTokens::Infinite("inf".to_string()),
        }
    }
}

/// Input audio transcription configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputAudioTranscription {
    /// Transcription model (e.g., "whisper-1")
    pub model: String,
    /// Spoken language hint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

// =============================================================================
// Conversation Items
// =============================================================================

/// Conversation item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationItem {
    /// Item ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Item type
    #[serde(rename = "type")]
    pub item_type: String,
    /// Item status
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Item role (user, assistant, system)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Content parts
    pub content: Vec<ContentPart>,
}

impl ConversationItem {
    /// A user text message with a client-chosen item id.
    pub fn user_text(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            item_type: "message".to_string(),
            status: None,
            role: Some("user".to_string()),
            content: vec![ContentPart {
                content_type: "input_text".to_string(),
                text: Some(text.into()),
                audio: None,
                transcript: None,
            }],
        }
    }

    /// Concatenated text and transcripts of all content parts.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| part.text.as_deref().or(part.transcript.as_deref()))
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Content part within a conversation item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentPart {
    /// Content type (input_text, input_audio, text, audio)
    #[serde(rename = "type")]
    pub content_type: String,
    /// Text content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Audio content (base64 encoded)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    /// Transcript of audio content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
}

// =============================================================================
// Response Configuration
// =============================================================================

/// Response configuration for creating responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    /// Response modalities
    pub modalities: Vec<String>,
    /// Voice for audio
    pub voice: String,
    /// Output audio format
    pub output_audio_format: String,
    /// Temperature
    pub temperature: f32,
    /// Max output tokens
    pub max_output_tokens: MaxTokens,
}

impl ResponsePayload {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            modalities: default_modalities(),
            voice: config.voice.clone(),
            output_audio_format: audio_format_name(config.bit_depth),
            temperature: config.temperature,
            max_output_tokens: MaxTokens::from_limit(config.max_tokens),
        }
    }
}

// =============================================================================
// Client Events (sent to server)
// =============================================================================

/// Client events sent to the voice backend.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Update session configuration
    SessionUpdate {
        /// Session configuration
        session: SessionPayload,
    },

    /// Append audio to input buffer
    InputAudioAppend {
        /// Base64-encoded audio data
        audio: String,
    },

    /// Commit the input audio buffer
    InputAudioCommit,

    /// Create a conversation item
    ConversationItemCreate {
        /// Item to create
        item: ConversationItem,
    },

    /// Create a response
    ResponseCreate {
        /// Response configuration
        response: ResponsePayload,
    },
}

impl ClientEvent {
    /// Create an audio append event from raw bytes.
    pub fn audio_append(data: &[u8]) -> Self {
        ClientEvent::InputAudioAppend {
            audio: BASE64_STANDARD.encode(data),
        }
    }

    /// Short label used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            ClientEvent::SessionUpdate { .. } => "session-update",
            ClientEvent::InputAudioAppend { .. } => "input-audio-append",
            ClientEvent::InputAudioCommit => "input-audio-commit",
            ClientEvent::ConversationItemCreate { .. } => "conversation-item-create",
            ClientEvent::ResponseCreate { .. } => "response-create",
        }
    }
}

// =============================================================================
// Server Events (received from server)
// =============================================================================

/// Server events received from the voice backend.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Error reported by the server
    Error { error: ApiError },

    /// Session created
    SessionCreated { session: SessionInfo },

    /// Session updated
    SessionUpdated { session: SessionInfo },

    /// Speech started (VAD detected speech)
    SpeechStarted {
        audio_start_ms: Option<u64>,
        item_id: Option<String>,
    },

    /// Speech stopped (VAD detected silence)
    SpeechStopped {
        audio_end_ms: Option<u64>,
        item_id: Option<String>,
    },

    /// Conversation item created
    ConversationItemCreated { item: ConversationItem },

    /// Incremental transcript of the user's audio
    InputTranscriptDelta {
        item_id: Option<String>,
        delta: String,
    },

    /// Final transcript of the user's audio
    InputTranscriptCompleted {
        item_id: Option<String>,
        transcript: String,
    },

    /// Response generation started
    ResponseCreated { response_id: Option<String> },

    /// Output item added to response
    OutputItemAdded {
        response_id: Option<String>,
        item: ConversationItem,
    },

    /// Audio data chunk (base64)
    AudioDelta {
        response_id: Option<String>,
        item_id: Option<String>,
        delta: String,
    },

    /// Audio for an item finished
    AudioDone {
        response_id: Option<String>,
        item_id: Option<String>,
    },

    /// Assistant transcript chunk
    TranscriptDelta {
        response_id: Option<String>,
        item_id: Option<String>,
        delta: String,
    },

    /// Assistant transcript complete
    TranscriptDone {
        response_id: Option<String>,
        item_id: Option<String>,
        transcript: Option<String>,
    },

    /// Response complete, end of turn
    ResponseDone { response_id: Option<String> },
}

// =============================================================================
// Supporting Types
// =============================================================================

/// API error information.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiError {
    /// Error type
    #[serde(rename = "type")]
    pub error_type: String,
    /// Error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Error message
    pub message: String,
    /// Event ID that caused the error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

/// Session information echoed by the server.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SessionInfo {
    /// Server-side session ID
    pub id: Option<String>,
    /// Model used
    pub model: Option<String>,
    /// Voice
    pub voice: Option<String>,
    /// System instructions
    pub instructions: Option<String>,
    /// Temperature
    pub temperature: Option<f32>,
}

/// Response information.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ResponseInfo {
    /// Response ID
    pub id: Option<String>,
    /// Response status
    pub status: Option<String>,
}
