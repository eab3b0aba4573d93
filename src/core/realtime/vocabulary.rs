//! Wire-event vocabulary.
//!
//! Realtime voice backends speak the same state machine over slightly
//! different JSON dialects. A vocabulary maps each logical event the engine
//! understands to the `type` string a given backend puts on the wire, so one
//! codec and one session controller serve every dialect.

use serde::{Deserialize, Serialize};

/// Logical inbound event kinds, independent of the wire dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InboundKind {
    SessionCreated,
    SessionUpdated,
    SpeechStarted,
    SpeechStopped,
    ConversationItemCreated,
    InputTranscriptDelta,
    InputTranscriptCompleted,
    ResponseCreated,
    OutputItemAdded,
    AudioDelta,
    AudioDone,
    TranscriptDelta,
    TranscriptDone,
    ResponseDone,
    Error,
}

/// Event-name table for one backend dialect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventVocabulary {
    /// Dialect name, informational
    pub name: String,

    // Outbound
    pub session_update: String,
    pub input_audio_append: String,
    pub input_audio_commit: String,
    pub conversation_item_create: String,
    pub response_create: String,

    // Inbound
    pub session_created: String,
    pub session_updated: String,
    pub speech_started: String,
    pub speech_stopped: String,
    pub conversation_item_created: String,
    pub input_transcript_delta: Option<String>,
    pub input_transcript_completed: Option<String>,
    pub response_created: String,
    pub output_item_added: String,
    pub audio_delta: String,
    pub audio_done: Option<String>,
    pub transcript_delta: String,
    pub transcript_done: Option<String>,
    pub response_done: String,
    pub error: String,
}

impl Default for EventVocabulary {
    fn default() -> Self {
        Self::openai()
    }
}

impl EventVocabulary {
    /// OpenAI Realtime event names.
    pub fn openai() -> Self {
        Self {
            name: "openai".to_string(),
            session_update: "session.update".to_string(),
            input_audio_append: "input_audio_buffer.append".to_string(),
            input_audio_commit: "input_audio_buffer.commit".to_string(),
            conversation_item_create: "conversation.item.create".to_string(),
            response_create: "response.create".to_string(),
            session_created: "session.created".to_string(),
            session_updated: "session.updated".to_string(),
            speech_started: "input_audio_buffer.speech_started".to_string(),
            speech_stopped: "input_audio_buffer.speech_stopped".to_string(),
            conversation_item_created: "conversation.item.created".to_string(),
            input_transcript_delta: None,
            input_transcript_completed: Some(
                "conversation.item.input_audio_transcription.completed".to_string(),
            ),
            response_created: "response.created".to_string(),
            output_item_added: "response.output_item.added".to_string(),
            audio_delta: "response.audio.delta".to_string(),
            audio_done: Some("response.audio.done".to_string()),
            transcript_delta: "response.audio_transcript.delta".to_string(),
            transcript_done: Some("response.audio_transcript.done".to_string()),
            response_done: "response.done".to_string(),
            error: "error".to_string(),
        }
    }

    /// OpenAI-compatible dialect that streams assistant text as plain text
    /// deltas and the user transcript incrementally.
    pub fn unmute() -> Self {
        Self {
            name: "unmute".to_string(),
            input_transcript_delta: Some(
                "conversation.item.input_audio_transcription.delta".to_string(),
            ),
            input_transcript_completed: None,
            transcript_delta: "response.text.delta".to_string(),
            transcript_done: Some("response.text.done".to_string()),
            ..Self::openai()
        }
    }

    /// Look up a preset by name (case-insensitive).
    pub fn preset(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "openai" | "openai-realtime" => Some(Self::openai()),
            "unmute" => Some(Self::unmute()),
            _ => None,
        }
    }

    /// Names of the built-in presets.
    pub fn presets() -> &'static [&'static str] {
        &["openai", "unmute"]
    }

    /// Classify an inbound `type` string.
    pub fn classify(&self, event_type: &str) -> Option<InboundKind> {
        let optional = |name: &Option<String>| name.as_deref() == Some(event_type);

        let kind = if event_type == self.session_created {
            InboundKind::SessionCreated
        } else if event_type == self.session_updated {
            InboundKind::SessionUpdated
        } else if event_type == self.speech_started {
            InboundKind::SpeechStarted
        } else if event_type == self.speech_stopped {
            InboundKind::SpeechStopped
        } else if event_type == self.conversation_item_created {
            InboundKind::ConversationItemCreated
        } else if optional(&self.input_transcript_delta) {
            InboundKind::InputTranscriptDelta
        } else if optional(&self.input_transcript_completed) {
            InboundKind::InputTranscriptCompleted
        } else if event_type == self.response_created {
            InboundKind::ResponseCreated
        } else if event_type == self.output_item_added {
            InboundKind::OutputItemAdded
        } else if event_type == self.audio_delta {
            InboundKind::AudioDelta
        } else if optional(&self.audio_done) {
            InboundKind::AudioDone
        } else if event_type == self.transcript_delta {
            InboundKind::TranscriptDelta
        } else if optional(&self.transcript_done) {
            InboundKind::TranscriptDone
        } else if event_type == self.response_done {
            InboundKind::ResponseDone
        } else if event_type == self.error {
            InboundKind::Error
        } else {
            return None;
        };
        Some(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openai_classification() {
        let vocab = EventVocabulary::openai();
        assert_eq!(
            vocab.classify("response.audio.delta"),
            Some(InboundKind::AudioDelta)
        );
        assert_eq!(
            vocab.classify("input_audio_buffer.speech_started"),
            Some(InboundKind::SpeechStarted)
        );
        assert_eq!(vocab.classify("error"), Some(InboundKind::Error));
        assert_eq!(vocab.classify("rate_limits.updated"), None);
        assert_eq!(vocab.classify("response.text.delta"), None);
    }

    #[test]
    fn test_unmute_overrides_transcript_names() {
        let vocab = EventVocabulary::unmute();
        assert_eq!(
            vocab.classify("response.text.delta"),
            Some(InboundKind::TranscriptDelta)
        );
        assert_eq!(
            vocab.classify("conversation.item.input_audio_transcription.delta"),
            Some(InboundKind::InputTranscriptDelta)
        );
        assert_eq!(vocab.classify("response.audio_transcript.delta"), None);
        // Shared names are inherited
        assert_eq!(vocab.session_update, "session.update");
        assert_eq!(
            vocab.classify("response.audio.delta"),
            Some(InboundKind::AudioDelta)
        );
    }

    #[test]
    fn test_preset_lookup() {
        assert_eq!(EventVocabulary::preset("OpenAI"), Some(EventVocabulary::openai()));
        assert_eq!(EventVocabulary::preset("unmute"), Some(EventVocabulary::unmute()));
        assert!(EventVocabulary::preset("moshi-binary").is_none());
        assert_eq!(EventVocabulary::presets().len(), 2);
    }

    #[test]
    fn test_partial_yaml_falls_back_to_openai_names() {
        let yaml = "name: custom\naudio_delta: \"audio.chunk\"\n";
        let vocab: EventVocabulary = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(vocab.name, "custom");
        assert_eq!(vocab.classify("audio.chunk"), Some(InboundKind::AudioDelta));
        assert_eq!(
            vocab.classify("response.done"),
            Some(InboundKind::ResponseDone)
        );
    }
}
