//! Event codec: typed protocol events to and from wire JSON.
//!
//! Outbound events are tagged with the dialect's `type` name and a unique
//! `event_id`. Inbound frames are parsed defensively: malformed JSON, a
//! missing discriminator, an unknown event type or an unusable payload each
//! produce a [`DecodeError`] and never panic.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;

use super::base::{RealtimeError, RealtimeResult};
use super::messages::{
    ApiError, ClientEvent, ConversationItem, ResponseInfo, ServerEvent, SessionInfo,
};
use super::vocabulary::{EventVocabulary, InboundKind};

/// Why an inbound frame could not be turned into a [`ServerEvent`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Not valid JSON, or not a JSON object
    #[error("malformed event: {0}")]
    Malformed(String),

    /// Object without a string `type` field
    #[error("event has no type field")]
    MissingType,

    /// Type not present in the vocabulary
    #[error("unknown event type: {0}")]
    Unknown(String),

    /// Known type whose payload does not have the expected shape
    #[error("invalid payload for {event_type}: {reason}")]
    InvalidPayload { event_type: String, reason: String },
}

impl DecodeError {
    /// Unknown events are expected protocol drift; everything else is corruption.
    pub fn is_unknown(&self) -> bool {
        matches!(self, DecodeError::Unknown(_))
    }
}

impl From<DecodeError> for RealtimeError {
    fn from(err: DecodeError) -> Self {
        RealtimeError::Protocol(err.to_string())
    }
}

/// Stateless translator between [`ClientEvent`]/[`ServerEvent`] and JSON text.
#[derive(Debug, Clone, Default)]
pub struct EventCodec {
    vocabulary: EventVocabulary,
}

impl EventCodec {
    pub fn new(vocabulary: EventVocabulary) -> Self {
        Self { vocabulary }
    }

    pub fn vocabulary(&self) -> &EventVocabulary {
        &self.vocabulary
    }

    /// Mint an event id for outbound traceability.
    pub fn new_event_id() -> String {
        format!("evt_{}", uuid::Uuid::new_v4().simple())
    }

    /// Serialize an outbound event with a fresh event id.
    pub fn encode(&self, event: &ClientEvent) -> RealtimeResult<String> {
        self.encode_with_id(event, &Self::new_event_id())
    }

    /// Serialize an outbound event with the given event id.
    pub fn encode_with_id(&self, event: &ClientEvent, event_id: &str) -> RealtimeResult<String> {
        let vocab = &self.vocabulary;
        let mut object = Map::new();

        let event_type = match event {
            ClientEvent::SessionUpdate { session } => {
                object.insert("session".to_string(), to_value(session)?);
                &vocab.session_update
            }
            ClientEvent::InputAudioAppend { audio } => {
                object.insert("audio".to_string(), Value::String(audio.clone()));
                &vocab.input_audio_append
            }
            ClientEvent::InputAudioCommit => &vocab.input_audio_commit,
            ClientEvent::ConversationItemCreate { item } => {
                object.insert("item".to_string(), to_value(item)?);
                &vocab.conversation_item_create
            }
            ClientEvent::ResponseCreate { response } => {
                object.insert("response".to_string(), to_value(response)?);
                &vocab.response_create
            }
        };

        object.insert("type".to_string(), Value::String(event_type.clone()));
        object.insert("event_id".to_string(), Value::String(event_id.to_string()));

        serde_json::to_string(&Value::Object(object))
            .map_err(|e| RealtimeError::SerializationError(e.to_string()))
    }

    /// Parse and classify an inbound frame.
    pub fn decode(&self, text: &str) -> Result<ServerEvent, DecodeError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        let Value::Object(object) = value else {
            return Err(DecodeError::Malformed("expected a JSON object".to_string()));
        };

        let event_type = object
            .get("type")
            .and_then(Value::as_str)
            .ok_or(DecodeError::MissingType)?
            .to_string();

        let kind = self
            .vocabulary
            .classify(&event_type)
            .ok_or_else(|| DecodeError::Unknown(event_type.clone()))?;

        let body = Value::Object(object);
        let event = match kind {
            InboundKind::Error => {
                let b: ErrorBody = parse(&event_type, body)?;
                ServerEvent::Error { error: b.error }
            }
            InboundKind::SessionCreated => {
                let b: SessionBody = parse(&event_type, body)?;
                ServerEvent::SessionCreated { session: b.session }
            }
            InboundKind::SessionUpdated => {
                let b: SessionBody = parse(&event_type, body)?;
                ServerEvent::SessionUpdated { session: b.session }
            }
            InboundKind::SpeechStarted => {
                let b: SpeechBody = parse(&event_type, body)?;
                ServerEvent::SpeechStarted {
                    audio_start_ms: b.audio_start_ms,
                    item_id: b.item_id,
                }
            }
            InboundKind::SpeechStopped => {
                let b: SpeechBody = parse(&event_type, body)?;
                ServerEvent::SpeechStopped {
                    audio_end_ms: b.audio_end_ms,
                    item_id: b.item_id,
                }
            }
            InboundKind::ConversationItemCreated => {
                let b: ItemBody = parse(&event_type, body)?;
                ServerEvent::ConversationItemCreated { item: b.item }
            }
            InboundKind::InputTranscriptDelta => {
                let b: DeltaBody = parse(&event_type, body)?;
                ServerEvent::InputTranscriptDelta {
                    item_id: b.item_id,
                    delta: b.delta,
                }
            }
            InboundKind::InputTranscriptCompleted => {
                let b: TranscriptBody = parse(&event_type, body)?;
                ServerEvent::InputTranscriptCompleted {
                    item_id: b.item_id,
                    transcript: b.transcript.unwrap_or_default(),
                }
            }
            InboundKind::ResponseCreated => {
                let b: ResponseBody = parse(&event_type, body)?;
                ServerEvent::ResponseCreated {
                    response_id: b.response_id(),
                }
            }
            InboundKind::OutputItemAdded => {
                let b: OutputItemBody = parse(&event_type, body)?;
                ServerEvent::OutputItemAdded {
                    response_id: b.response_id,
                    item: b.item,
                }
            }
            InboundKind::AudioDelta => {
                let b: DeltaBody = parse(&event_type, body)?;
                ServerEvent::AudioDelta {
                    response_id: b.response_id,
                    item_id: b.item_id,
                    delta: b.delta,
                }
            }
            InboundKind::AudioDone => {
                let b: DeltaBody = parse(&event_type, body)?;
                ServerEvent::AudioDone {
                    response_id: b.response_id,
                    item_id: b.item_id,
                }
            }
            InboundKind::TranscriptDelta => {
                let b: DeltaBody = parse(&event_type, body)?;
                ServerEvent::TranscriptDelta {
                    response_id: b.response_id,
                    item_id: b.item_id,
                    delta: b.delta,
                }
            }
            InboundKind::TranscriptDone => {
                let b: TranscriptBody = parse(&event_type, body)?;
                ServerEvent::TranscriptDone {
                    response_id: b.response_id,
                    item_id: b.item_id,
                    transcript: b.transcript,
                }
            }
            InboundKind::ResponseDone => {
                let b: ResponseBody = parse(&event_type, body)?;
                ServerEvent::ResponseDone {
                    response_id: b.response_id(),
                }
            }
        };
        Ok(event)
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> RealtimeResult<Value> {
    serde_json::to_value(value).map_err(|e| RealtimeError::SerializationError(e.to_string()))
}

fn parse<T: DeserializeOwned>(event_type: &str, body: Value) -> Result<T, DecodeError> {
    serde_json::from_value(body).map_err(|e| DecodeError::InvalidPayload {
        event_type: event_type.to_string(),
        reason: e.to_string(),
    })
}

// Inbound payload shapes. Unknown fields are ignored.

#[derive(Deserialize)]
struct ErrorBody {
    error: ApiError,
}

#[derive(Deserialize)]
struct SessionBody {
    #[serde(default)]
    session: SessionInfo,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SpeechBody {
    audio_start_ms: Option<u64>,
    audio_end_ms: Option<u64>,
    item_id: Option<String>,
}

#[derive(Deserialize)]
struct ItemBody {
    item: ConversationItem,
}

#[derive(Deserialize)]
struct OutputItemBody {
    #[serde(default)]
    response_id: Option<String>,
    item: ConversationItem,
}

#[derive(Deserialize)]
struct DeltaBody {
    #[serde(default)]
    response_id: Option<String>,
    #[serde(default)]
    item_id: Option<String>,
    #[serde(default)]
    delta: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct TranscriptBody {
    response_id: Option<String>,
    item_id: Option<String>,
    #[serde(alias = "text")]
    transcript: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ResponseBody {
    response: Option<ResponseInfo>,
    response_id: Option<String>,
}

impl ResponseBody {
    fn response_id(self) -> Option<String> {
        self.response.and_then(|r| r.id).or(self.response_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::realtime::base::SessionConfig;
    use crate::core::realtime::messages::{ResponsePayload, SessionPayload};

    fn codec() -> EventCodec {
        EventCodec::default()
    }

    fn encoded(event: ClientEvent) -> Value {
        serde_json::from_str(&codec().encode(&event).unwrap()).unwrap()
    }

    #[test]
    fn test_encode_commit_has_type_and_event_id() {
        let json = encoded(ClientEvent::InputAudioCommit);
        assert_eq!(json["type"], "input_audio_buffer.commit");
        assert!(json["event_id"].as_str().unwrap().starts_with("evt_"));
    }

    #[test]
    fn test_event_ids_are_unique() {
        let a = encoded(ClientEvent::InputAudioCommit);
        let b = encoded(ClientEvent::InputAudioCommit);
        assert_ne!(a["event_id"], b["event_id"]);
    }

    #[test]
    fn test_encode_session_update() {
        let config = SessionConfig {
            voice: "coral".to_string(),
            temperature: 0.7,
            ..Default::default()
        };
        let json = encoded(ClientEvent::SessionUpdate {
            session: SessionPayload::from_config(&config),
        });
        assert_eq!(json["type"], "session.update");
        assert_eq!(json["session"]["voice"], "coral");
        assert_eq!(json["session"]["input_audio_format"], "pcm16");
        assert!((json["session"]["temperature"].as_f64().unwrap() - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_encode_response_create_and_item_create() {
        let config = SessionConfig::default();
        let json = encoded(ClientEvent::ResponseCreate {
            response: ResponsePayload::from_config(&config),
        });
        assert_eq!(json["type"], "response.create");
        assert_eq!(json["response"]["voice"], "alloy");

        let json = encoded(ClientEvent::ConversationItemCreate {
            item: ConversationItem::user_text("msg_1", "how long do I boil eggs?"),
        });
        assert_eq!(json["type"], "conversation.item.create");
        assert_eq!(json["item"]["content"][0]["text"], "how long do I boil eggs?");
    }

    #[test]
    fn test_encode_audio_append() {
        let json = encoded(ClientEvent::audio_append(&[1, 2, 3]));
        assert_eq!(json["type"], "input_audio_buffer.append");
        assert_eq!(json["audio"], "AQID");
    }

    #[test]
    fn test_decode_audio_delta() {
        let event = codec()
            .decode(r#"{"type":"response.audio.delta","response_id":"resp_1","item_id":"item_1","output_index":0,"content_index":0,"delta":"AAEC"}"#)
            .unwrap();
        assert_eq!(
            event,
            ServerEvent::AudioDelta {
                response_id: Some("resp_1".to_string()),
                item_id: Some("item_1".to_string()),
                delta: "AAEC".to_string(),
            }
        );
    }

    #[test]
    fn test_decode_response_done_reads_nested_id() {
        let event = codec()
            .decode(r#"{"type":"response.done","response":{"id":"resp_9","status":"completed","output":[]}}"#)
            .unwrap();
        assert_eq!(
            event,
            ServerEvent::ResponseDone {
                response_id: Some("resp_9".to_string())
            }
        );
    }

    #[test]
    fn test_decode_error_event() {
        let event = codec()
            .decode(r#"{"type":"error","error":{"type":"invalid_request_error","message":"bad audio"}}"#)
            .unwrap();
        match event {
            ServerEvent::Error { error } => {
                assert_eq!(error.error_type, "invalid_request_error");
                assert_eq!(error.message, "bad audio");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_decode_session_created() {
        let event = codec()
            .decode(r#"{"type":"session.created","session":{"id":"sess_42","object":"realtime.session","voice":"alloy"}}"#)
            .unwrap();
        match event {
            ServerEvent::SessionCreated { session } => {
                assert_eq!(session.id.as_deref(), Some("sess_42"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_decode_truncated_json_is_malformed() {
        let err = codec().decode(r#"{"type":"response.audio.del"#).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
        assert!(!err.is_unknown());
    }

    #[test]
    fn test_decode_non_object_is_malformed() {
        assert!(matches!(
            codec().decode("[1,2,3]"),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_missing_type() {
        assert_eq!(
            codec().decode(r#"{"delta":"AAEC"}"#),
            Err(DecodeError::MissingType)
        );
    }

    #[test]
    fn test_decode_unknown_type() {
        let err = codec()
            .decode(r#"{"type":"rate_limits.updated","rate_limits":[]}"#)
            .unwrap_err();
        assert_eq!(err, DecodeError::Unknown("rate_limits.updated".to_string()));
        assert!(err.is_unknown());
    }

    #[test]
    fn test_decode_invalid_payload() {
        let err = codec()
            .decode(r#"{"type":"conversation.item.created","item":42}"#)
            .unwrap_err();
        assert!(matches!(err, DecodeError::InvalidPayload { .. }));
    }

    #[test]
    fn test_unmute_dialect_text_done_alias() {
        let codec = EventCodec::new(EventVocabulary::unmute());
        let event = codec
            .decode(r#"{"type":"response.text.done","text":"Whisk the eggs."}"#)
            .unwrap();
        assert_eq!(
            event,
            ServerEvent::TranscriptDone {
                response_id: None,
                item_id: None,
                transcript: Some("Whisk the eggs.".to_string()),
            }
        );
    }

    #[test]
    fn test_decode_error_converts_to_protocol_error() {
        let err: RealtimeError = DecodeError::MissingType.into();
        assert!(matches!(err, RealtimeError::Protocol(_)));
    }
}
