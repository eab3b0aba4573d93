pub mod debug_log;
pub mod realtime;

// Re-export commonly used types for convenience
pub use debug_log::{DEFAULT_DEBUG_LOG_CAPACITY, DebugLog, DebugLogCallback, DebugLogEntry, LogLevel};

pub use realtime::{
    AudioInput, AudioOutput, ChannelAudioInput, CollectingAudioOutput, ConnectionState,
    EventVocabulary, MediaError, NullAudioOutput, RealtimeError, RealtimeResult,
    ReconnectionConfig, Role, SessionConfig, SessionConfigUpdate, VoiceMessage, VoiceSession,
};

#[cfg(feature = "cpal")]
pub use realtime::{CpalAudioInput, CpalAudioOutput};
