//! Realtime voice session engine.
//!
//! This module streams microphone audio to a realtime voice backend over a
//! single WebSocket, plays the assistant's audio back as it arrives, and keeps
//! an ordered conversation log for the embedding UI.
//!
//! # Architecture
//!
//! - [`ConnectionManager`] owns the socket, the connection state and the
//!   exponential-backoff reconnect policy
//! - [`EventCodec`] translates typed events to and from wire JSON through an
//!   [`EventVocabulary`], so one engine serves several backend dialects
//! - [`CapturePipeline`] chunks microphone frames into append events
//! - [`PlaybackPipeline`] decodes audio deltas and schedules them in order
//! - [`VoiceSession`] is the turn-taking controller and public API
//!
//! # Audio Format
//!
//! PCM 16-bit signed little-endian, base64 on the wire, 24kHz mono by default.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sous_voice::core::realtime::{ChannelAudioInput, NullAudioOutput, VoiceSession};
//! use sous_voice::config::EngineConfig;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = EngineConfig::load(None).unwrap();
//!     let mic = ChannelAudioInput::new();
//!     let session = VoiceSession::new(config, Arc::new(mic.clone()), Arc::new(NullAudioOutput));
//!
//!     session.on_status_change(Arc::new(|state| println!("state: {state}")));
//!     session.connect().await.unwrap();
//!     session.start_recording().await.unwrap();
//!     mic.push(vec![0u8; 4800]);
//!     session.stop_recording().await;
//! }
//! ```

mod base;
pub mod capture;
pub mod codec;
pub mod connection;
#[cfg(feature = "cpal")]
pub mod device;
pub mod messages;
pub mod playback;
pub mod session;
pub mod vocabulary;

pub use base::{
    CaptureConfig, ConnectionState, MediaError, MessageCallback, RealtimeError,
    RealtimeErrorCallback, RealtimeResult, ReconnectionConfig, Role, SessionConfig,
    SessionConfigUpdate, SpeechEvent, SpeechEventCallback, StatusCallback, TranscriptDelta,
    TranscriptDeltaCallback, TurnDetectionConfig, VoiceMessage, new_message_id, now_millis,
};
pub use capture::{
    AudioInput, CaptureConstraints, CapturePipeline, CaptureStats, ChannelAudioInput,
};
pub use codec::{DecodeError, EventCodec};
pub use connection::{ConnectionManager, EventSink, Outbox, TransportHandler};
#[cfg(feature = "cpal")]
pub use device::{CpalAudioInput, CpalAudioOutput};
pub use messages::{ClientEvent, ServerEvent};
pub use playback::{
    AudioBuffer, AudioOutput, CollectingAudioOutput, NullAudioOutput, PlaybackPipeline,
    PlaybackStats, decode_pcm16,
};
pub use session::VoiceSession;
pub use vocabulary::{EventVocabulary, InboundKind};
