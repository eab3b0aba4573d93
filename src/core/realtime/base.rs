//! Base types for the realtime voice session engine.
//!
//! This module defines the error taxonomy, the session configuration, the
//! connection state observed by every component, the conversation message
//! model and the callback types used to report into the embedding UI.
//!
//! # Audio Format
//!
//! Audio travels as PCM 16-bit signed little-endian, base64 encoded on the wire.
//! The default sample rate is 24kHz mono.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

/// Errors raised by audio capabilities (microphone and speaker).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    /// The user or platform denied access to the microphone
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    /// No usable device was found
    #[error("No audio device available: {0}")]
    DeviceUnavailable(String),

    /// The capture stream failed to start or broke while running
    #[error("Audio capture failed: {0}")]
    CaptureFailed(String),

    /// An inbound chunk could not be decoded into a playable buffer
    #[error("Audio decode failed: {0}")]
    DecodeFailed(String),

    /// The output device rejected a buffer
    #[error("Audio playback failed: {0}")]
    PlaybackFailed(String),
}

/// Errors that can occur during realtime voice operations.
#[derive(Debug, Clone, Error)]
pub enum RealtimeError {
    /// Opening the transport failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The transport failed while open
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Malformed or unrecognized inbound event
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Microphone or speaker failure
    #[error(transparent)]
    Media(#[from] MediaError),

    /// Automatic reconnection gave up
    #[error("Reconnection failed after {attempts} attempts")]
    ReconnectExhausted {
        /// Number of attempts that were made
        attempts: u32,
    },

    /// Operation requires a connected session
    #[error("Not connected")]
    NotConnected,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Caller-supplied value rejected
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Result type for realtime operations.
pub type RealtimeResult<T> = Result<T, RealtimeError>;

// =============================================================================
// Configuration Types
// =============================================================================

/// Configuration for automatic reconnection behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectionConfig {
    /// Enable automatic reconnection on connection loss.
    /// Default: true
    pub enabled: bool,

    /// Maximum number of reconnection attempts before giving up.
    /// Set to 0 for unlimited attempts.
    /// Default: 3
    pub max_attempts: u32,

    /// Delay before the first reconnection attempt (milliseconds).
    /// Default: 1000ms
    pub initial_delay_ms: u64,

    /// Maximum delay between reconnection attempts (milliseconds).
    /// Default: 30000ms (30 seconds)
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff.
    /// Default: 2.0
    pub backoff_multiplier: f32,

    /// Whether to add up to 25% jitter to the delay.
    /// Default: false
    pub jitter: bool,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }
}

impl ReconnectionConfig {
    /// Create a config with reconnection disabled.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Calculate the delay for a given attempt number using exponential backoff.
    ///
    /// Attempts are numbered from 1. Returns the delay in milliseconds.
    pub fn calculate_delay(&self, attempt: u32) -> u64 {
        let base_delay = self.initial_delay_ms as f64;
        let multiplier = self.backoff_multiplier as f64;

        // Exponential backoff: base_delay * multiplier^(attempt-1)
        let delay = base_delay * multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = delay.min(self.max_delay_ms as f64);

        if self.jitter {
            let jitter_range = delay * 0.25;
            (delay + rand_jitter(jitter_range)).max(0.0) as u64
        } else {
            delay as u64
        }
    }

    /// Check if another reconnection attempt is allowed after `attempts` tries.
    pub fn should_retry(&self, attempts: u32) -> bool {
        self.enabled && (self.max_attempts == 0 || attempts < self.max_attempts)
    }
}

/// Pseudo-random value in `[-range, range]` derived from the clock.
fn rand_jitter(range: f64) -> f64 {
    let seed = (time::OffsetDateTime::now_utc().unix_timestamp_nanos() as u64)
        ^ u64::from(uuid::Uuid::new_v4().as_fields().0);
    let random = ((seed.wrapping_mul(1103515245).wrapping_add(12345)) % (1 << 31)) as f64;
    let normalized = random / (1u64 << 31) as f64;
    (normalized - 0.5) * 2.0 * range
}

/// Configuration for server-side turn detection (VAD).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TurnDetectionConfig {
    /// Server-side VAD
    #[serde(rename = "server_vad")]
    ServerVad {
        /// Activation threshold (0.0 to 1.0)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        threshold: Option<f32>,
        /// Amount of audio to include before voice detection (ms)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix_padding_ms: Option<u32>,
        /// Silence duration before end of turn (ms)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        silence_duration_ms: Option<u32>,
    },
    /// Turns are bounded only by explicit commits
    #[serde(rename = "none")]
    None,
}

impl Default for TurnDetectionConfig {
    fn default() -> Self {
        TurnDetectionConfig::ServerVad {
            threshold: Some(0.5),
            prefix_padding_ms: Some(300),
            silence_duration_ms: Some(500),
        }
    }
}

/// Per-session configuration sent to the voice backend.
///
/// Immutable for the lifetime of a session except through
/// [`SessionConfig::merge`], which the session applies on `update_config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Backend address; `http(s)` schemes are rewritten to `ws(s)`
    pub server_url: String,
    /// Path appended to the server URL when missing
    pub path_suffix: String,
    /// Audio sample rate in Hz
    pub sample_rate: u32,
    /// Audio channel count
    pub channels: u16,
    /// Bits per sample
    pub bit_depth: u16,
    /// Voice for synthesized output
    pub voice: String,
    /// Conversation language (BCP-47 tag)
    pub language: String,
    /// System instructions for the assistant
    pub instructions: String,
    /// Sampling temperature (0.0 to 2.0)
    pub temperature: f32,
    /// Maximum response tokens, `None` for unlimited
    pub max_tokens: Option<u32>,
    /// Turn detection mode
    pub turn_detection: TurnDetectionConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8000".to_string(),
            path_suffix: "/v1/realtime".to_string(),
            sample_rate: 24000,
            channels: 1,
            bit_depth: 16,
            voice: "alloy".to_string(),
            language: "en".to_string(),
            instructions: String::new(),
            temperature: 0.8,
            max_tokens: None,
            turn_detection: TurnDetectionConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Apply the fields present in `update`, leaving the rest untouched.
    pub fn merge(&mut self, update: SessionConfigUpdate) {
        if let Some(url) = update.server_url {
            self.server_url = url;
        }
        if let Some(rate) = update.sample_rate {
            self.sample_rate = rate;
        }
        if let Some(channels) = update.channels {
            self.channels = channels;
        }
        if let Some(depth) = update.bit_depth {
            self.bit_depth = depth;
        }
        if let Some(voice) = update.voice {
            self.voice = voice;
        }
        if let Some(language) = update.language {
            self.language = language;
        }
        if let Some(instructions) = update.instructions {
            self.instructions = instructions;
        }
        if let Some(temperature) = update.temperature {
            self.temperature = temperature;
        }
        if let Some(max_tokens) = update.max_tokens {
            self.max_tokens = max_tokens;
        }
        if let Some(turn_detection) = update.turn_detection {
            self.turn_detection = turn_detection;
        }
    }

    /// Check value ranges.
    pub fn validate(&self) -> RealtimeResult<()> {
        if self.server_url.trim().is_empty() {
            return Err(RealtimeError::InvalidConfiguration(
                "server_url must not be empty".to_string(),
            ));
        }
        if self.sample_rate == 0 {
            return Err(RealtimeError::InvalidConfiguration(
                "sample_rate must be greater than zero".to_string(),
            ));
        }
        if !(1..=2).contains(&self.channels) {
            return Err(RealtimeError::InvalidConfiguration(format!(
                "channels must be 1 or 2, got {}",
                self.channels
            )));
        }
        if self.bit_depth != 16 {
            return Err(RealtimeError::InvalidConfiguration(format!(
                "only 16-bit PCM is supported, got {}",
                self.bit_depth
            )));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(RealtimeError::InvalidConfiguration(format!(
                "temperature must be within 0.0..=2.0, got {}",
                self.temperature
            )));
        }
        Ok(())
    }
}

/// Partial session configuration for `update_config`.
///
/// `max_tokens` is doubly optional: `Some(None)` switches to unlimited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfigUpdate {
    pub server_url: Option<String>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub bit_depth: Option<u16>,
    pub voice: Option<String>,
    pub language: Option<String>,
    pub instructions: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<Option<u32>>,
    pub turn_detection: Option<TurnDetectionConfig>,
}

/// Microphone capture settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Cadence at which captured audio is flushed as one chunk (ms)
    pub chunk_interval_ms: u64,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            chunk_interval_ms: 100,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

impl CaptureConfig {
    /// Smallest accepted chunk cadence.
    pub const MIN_CHUNK_INTERVAL_MS: u64 = 20;
    /// Largest accepted chunk cadence.
    pub const MAX_CHUNK_INTERVAL_MS: u64 = 1000;

    /// Chunk cadence clamped to the accepted range.
    pub fn effective_chunk_interval_ms(&self) -> u64 {
        self.chunk_interval_ms
            .clamp(Self::MIN_CHUNK_INTERVAL_MS, Self::MAX_CHUNK_INTERVAL_MS)
    }
}

// =============================================================================
// Connection State
// =============================================================================

/// Transport connection state.
///
/// Owned by the connection manager; every other component only observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No session has been started
    #[default]
    Idle,
    /// Socket open in progress
    Connecting,
    /// Connected and ready
    Connected,
    /// Closed, either by the caller or while waiting to reconnect
    Disconnected,
    /// Transport failure; terminal once reconnect attempts are exhausted
    Error,
}

impl ConnectionState {
    /// Whether `connect()` should be treated as a no-op in this state.
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "Idle"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Error => write!(f, "Error"),
        }
    }
}

// =============================================================================
// Conversation Messages
// =============================================================================

/// Speaker of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Parse a wire role; system and tool roles have no chat representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// One entry of the ordered conversation log. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceMessage {
    /// Unique id, also used as the client-side item id for outbound text
    pub id: String,
    pub role: Role,
    pub text: String,
    /// Server item the audio for this message belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_ref: Option<String>,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

impl VoiceMessage {
    /// Create a message with a freshly minted id.
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            id: new_message_id(),
            role,
            text: text.into(),
            audio_ref: None,
            timestamp: now_millis(),
        }
    }

    /// Attach the server item reference for the audio of this message.
    pub fn with_audio_ref(mut self, audio_ref: impl Into<String>) -> Self {
        self.audio_ref = Some(audio_ref.into());
        self
    }
}

/// Mint a message id that also fits the 32-character limit of item ids.
pub fn new_message_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("msg_{}", &uuid[..24])
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as u64
}

/// Speech events reported by server-side VAD.
#[derive(Debug, Clone, PartialEq)]
pub enum SpeechEvent {
    Started {
        audio_start_ms: Option<u64>,
        item_id: Option<String>,
    },
    Stopped {
        audio_end_ms: Option<u64>,
        item_id: Option<String>,
    },
}

/// Incremental assistant or user transcript text.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptDelta {
    pub role: Role,
    /// The new fragment
    pub delta: String,
    /// Everything received for this item so far
    pub accumulated: String,
    pub item_id: Option<String>,
}

// =============================================================================
// Callback Types
// =============================================================================

/// Callback for messages appended to the conversation log.
pub type MessageCallback = Arc<dyn Fn(VoiceMessage) + Send + Sync>;

/// Callback for connection state transitions.
pub type StatusCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Callback for partial transcripts.
pub type TranscriptDeltaCallback = Arc<dyn Fn(TranscriptDelta) + Send + Sync>;

/// Callback for VAD speech events.
pub type SpeechEventCallback = Arc<dyn Fn(SpeechEvent) + Send + Sync>;

/// Callback for errors surfaced to the caller.
pub type RealtimeErrorCallback = Arc<dyn Fn(RealtimeError) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "Connected");
        assert_eq!(ConnectionState::Idle.to_string(), "Idle");
        assert_eq!(ConnectionState::Error.to_string(), "Error");
    }

    #[test]
    fn test_connection_state_is_active() {
        assert!(ConnectionState::Connecting.is_active());
        assert!(ConnectionState::Connected.is_active());
        assert!(!ConnectionState::Idle.is_active());
        assert!(!ConnectionState::Disconnected.is_active());
        assert!(!ConnectionState::Error.is_active());
    }

    #[test]
    fn test_error_display() {
        let err = RealtimeError::ConnectionFailed("refused".to_string());
        assert!(err.to_string().contains("Connection failed"));

        let err = RealtimeError::ReconnectExhausted { attempts: 3 };
        assert_eq!(err.to_string(), "Reconnection failed after 3 attempts");

        let err: RealtimeError = MediaError::PermissionDenied("blocked".to_string()).into();
        assert!(err.to_string().contains("permission denied"));
    }

    #[test]
    fn test_reconnection_config_default() {
        let config = ReconnectionConfig::default();
        assert!(config.enabled);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.initial_delay_ms, 1000);
        assert_eq!(config.max_delay_ms, 30000);
        assert!(!config.jitter);
    }

    #[test]
    fn test_reconnection_should_retry() {
        let config = ReconnectionConfig::default();
        assert!(config.should_retry(0));
        assert!(config.should_retry(2));
        assert!(!config.should_retry(3));

        let disabled = ReconnectionConfig::disabled();
        assert!(!disabled.should_retry(0));

        let unlimited = ReconnectionConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(unlimited.should_retry(u32::MAX));
    }

    #[test]
    fn test_backoff_delays_strictly_increase_until_cap() {
        let config = ReconnectionConfig::default();
        assert_eq!(config.calculate_delay(1), 1000);
        assert_eq!(config.calculate_delay(2), 2000);
        assert_eq!(config.calculate_delay(3), 4000);
        assert_eq!(config.calculate_delay(6), 30000);
        assert_eq!(config.calculate_delay(12), 30000);
    }

    #[test]
    fn test_backoff_with_jitter_stays_in_band() {
        let config = ReconnectionConfig {
            jitter: true,
            ..Default::default()
        };
        for _ in 0..20 {
            let delay = config.calculate_delay(1);
            assert!((750..=1250).contains(&delay), "delay {delay} out of band");
        }
    }

    #[test]
    fn test_session_config_merge_only_present_fields() {
        let mut config = SessionConfig::default();
        config.merge(SessionConfigUpdate {
            voice: Some("verse".to_string()),
            temperature: Some(0.6),
            max_tokens: Some(Some(512)),
            ..Default::default()
        });

        assert_eq!(config.voice, "verse");
        assert_eq!(config.temperature, 0.6);
        assert_eq!(config.max_tokens, Some(512));
        assert_eq!(config.sample_rate, 24000);
        assert_eq!(config.language, "en");
    }

    #[test]
    fn test_session_config_validation() {
        assert!(SessionConfig::default().validate().is_ok());

        let bad = SessionConfig {
            temperature: 3.5,
            ..Default::default()
        };
        assert!(matches!(
            bad.validate(),
            Err(RealtimeError::InvalidConfiguration(_))
        ));

        let bad = SessionConfig {
            channels: 6,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_capture_interval_clamped() {
        let config = CaptureConfig {
            chunk_interval_ms: 5,
            ..Default::default()
        };
        assert_eq!(config.effective_chunk_interval_ms(), 20);

        let config = CaptureConfig {
            chunk_interval_ms: 250,
            ..Default::default()
        };
        assert_eq!(config.effective_chunk_interval_ms(), 250);
    }

    #[test]
    fn test_message_id_fits_item_limit() {
        let id = new_message_id();
        assert!(id.starts_with("msg_"));
        assert!(id.len() <= 32);
        assert_ne!(id, new_message_id());
    }

    #[test]
    fn test_role_parse() {
        assert_eq!(Role::parse("user"), Some(Role::User));
        assert_eq!(Role::parse("assistant"), Some(Role::Assistant));
        assert_eq!(Role::parse("system"), None);
    }
}
