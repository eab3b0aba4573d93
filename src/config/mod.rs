//! Configuration module for the voice session engine
//!
//! This module builds an [`EngineConfig`] from defaults, environment variables
//! and an optional YAML file. Priority: YAML > ENV vars > .env values > defaults.
//!
//! # Example
//! ```rust,no_run
//! use sous_voice::config::EngineConfig;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = EngineConfig::from_env()?;
//!
//! // Load from YAML file with environment variable underneath
//! let config = EngineConfig::from_file(Path::new("voice.yaml"))?;
//!
//! println!("Connecting to {}", config.session.server_url);
//! # Ok(())
//! # }
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::debug_log::DEFAULT_DEBUG_LOG_CAPACITY;
use crate::core::realtime::{CaptureConfig, EventVocabulary, ReconnectionConfig, SessionConfig};
use crate::utils::url::normalize_server_url;

pub mod yaml;

pub use yaml::YamlConfig;
use yaml::{MaxTokensYaml, VocabularyYaml};

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Everything needed to construct a [`VoiceSession`](crate::core::realtime::VoiceSession).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub session: SessionConfig,
    pub reconnection: ReconnectionConfig,
    pub capture: CaptureConfig,
    pub vocabulary: EventVocabulary,
    /// Entries retained by the debug log ring buffer
    pub debug_log_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            reconnection: ReconnectionConfig::default(),
            capture: CaptureConfig::default(),
            vocabulary: EventVocabulary::default(),
            debug_log_capacity: DEFAULT_DEBUG_LOG_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables over defaults.
    ///
    /// Recognized variables: `VOICE_SERVER_URL`, `VOICE_SAMPLE_RATE`,
    /// `VOICE_VOICE`, `VOICE_LANGUAGE`, `VOICE_INSTRUCTIONS`,
    /// `VOICE_TEMPERATURE`, `VOICE_MAX_TOKENS`, `VOICE_MAX_RECONNECT_ATTEMPTS`,
    /// `VOICE_RECONNECT_BASE_MS`, `VOICE_CHUNK_INTERVAL_MS`, `VOICE_VOCABULARY`.
    ///
    /// # Errors
    /// Returns an error if a variable cannot be parsed or validation fails.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file layered over the environment.
    ///
    /// # Errors
    /// Returns an error if:
    /// - The YAML file cannot be read or is malformed
    /// - Environment variables have invalid formats
    /// - Configuration validation fails
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        // .env values are already in the environment if the caller used `load`
        let yaml_config = YamlConfig::from_file(path)?;

        let mut config = Self::default();
        config.apply_env()?;
        config.apply_yaml(yaml_config)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `.env` (if present), then the YAML file when given, else the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Ok(env_path) = dotenvy::dotenv() {
            tracing::debug!("Loaded environment from {}", env_path.display());
        }
        match path {
            Some(path) => Self::from_file(path),
            None => Self::from_env(),
        }
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.session
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        normalize_server_url(&self.session.server_url, &self.session.path_suffix).map_err(|e| {
            ConfigError::InvalidValue {
                key: "session.server_url".to_string(),
                reason: e.to_string(),
            }
        })?;

        let reconnection = &self.reconnection;
        if reconnection.backoff_multiplier < 1.0 {
            return Err(ConfigError::Validation(format!(
                "reconnection.backoff_multiplier must be at least 1.0, got {}",
                reconnection.backoff_multiplier
            )));
        }
        if reconnection.initial_delay_ms > reconnection.max_delay_ms {
            return Err(ConfigError::Validation(format!(
                "reconnection.initial_delay_ms ({}) exceeds max_delay_ms ({})",
                reconnection.initial_delay_ms, reconnection.max_delay_ms
            )));
        }
        if self.debug_log_capacity == 0 {
            return Err(ConfigError::Validation(
                "debug_log_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        let session = &mut self.session;
        if let Some(url) = env_string("VOICE_SERVER_URL") {
            session.server_url = url;
        }
        if let Some(rate) = env_parse("VOICE_SAMPLE_RATE")? {
            session.sample_rate = rate;
        }
        if let Some(voice) = env_string("VOICE_VOICE") {
            session.voice = voice;
        }
        if let Some(language) = env_string("VOICE_LANGUAGE") {
            session.language = language;
        }
        if let Some(instructions) = env_string("VOICE_INSTRUCTIONS") {
            session.instructions = instructions;
        }
        if let Some(temperature) = env_parse("VOICE_TEMPERATURE")? {
            session.temperature = temperature;
        }
        if let Some(raw) = env_string("VOICE_MAX_TOKENS") {
            session.max_tokens = parse_max_tokens("VOICE_MAX_TOKENS", &raw)?;
        }

        if let Some(attempts) = env_parse("VOICE_MAX_RECONNECT_ATTEMPTS")? {
            self.reconnection.max_attempts = attempts;
        }
        if let Some(base) = env_parse("VOICE_RECONNECT_BASE_MS")? {
            self.reconnection.initial_delay_ms = base;
        }
        if let Some(interval) = env_parse("VOICE_CHUNK_INTERVAL_MS")? {
            self.capture.chunk_interval_ms = interval;
        }
        if let Some(name) = env_string("VOICE_VOCABULARY") {
            self.vocabulary = vocabulary_preset("VOICE_VOCABULARY", &name)?;
        }
        Ok(())
    }

    fn apply_yaml(&mut self, yaml: YamlConfig) -> Result<(), ConfigError> {
        if let Some(s) = yaml.session {
            let session = &mut self.session;
            if let Some(v) = s.server_url {
                session.server_url = v;
            }
            if let Some(v) = s.path_suffix {
                session.path_suffix = v;
            }
            if let Some(v) = s.sample_rate {
                session.sample_rate = v;
            }
            if let Some(v) = s.channels {
                session.channels = v;
            }
            if let Some(v) = s.bit_depth {
                session.bit_depth = v;
            }
            if let Some(v) = s.voice {
                session.voice = v;
            }
            if let Some(v) = s.language {
                session.language = v;
            }
            if let Some(v) = s.instructions {
                session.instructions = v;
            }
            if let Some(v) = s.temperature {
                session.temperature = v;
            }
            match s.max_tokens {
                Some(MaxTokensYaml::Limit(n)) => session.max_tokens = Some(n),
                Some(MaxTokensYaml::Keyword(raw)) => {
                    session.max_tokens = parse_max_tokens("session.max_tokens", &raw)?;
                }
                None => {}
            }
            if let Some(v) = s.turn_detection {
                session.turn_detection = v;
            }
        }

        if let Some(r) = yaml.reconnection {
            let reconnection = &mut self.reconnection;
            if let Some(v) = r.enabled {
                reconnection.enabled = v;
            }
            if let Some(v) = r.max_attempts {
                reconnection.max_attempts = v;
            }
            if let Some(v) = r.initial_delay_ms {
                reconnection.initial_delay_ms = v;
            }
            if let Some(v) = r.max_delay_ms {
                reconnection.max_delay_ms = v;
            }
            if let Some(v) = r.backoff_multiplier {
                reconnection.backoff_multiplier = v;
            }
            if let Some(v) = r.jitter {
                reconnection.jitter = v;
            }
        }

        if let Some(c) = yaml.capture {
            let capture = &mut self.capture;
            if let Some(v) = c.chunk_interval_ms {
                capture.chunk_interval_ms = v;
            }
            if let Some(v) = c.echo_cancellation {
                capture.echo_cancellation = v;
            }
            if let Some(v) = c.noise_suppression {
                capture.noise_suppression = v;
            }
            if let Some(v) = c.auto_gain_control {
                capture.auto_gain_control = v;
            }
        }

        match yaml.vocabulary {
            Some(VocabularyYaml::Preset(name)) => {
                self.vocabulary = vocabulary_preset("vocabulary", &name)?;
            }
            Some(VocabularyYaml::Custom(vocabulary)) => self.vocabulary = *vocabulary,
            None => {}
        }

        if let Some(capacity) = yaml.debug.and_then(|d| d.log_capacity) {
            self.debug_log_capacity = capacity;
        }
        Ok(())
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_string(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                reason: format!("{raw:?}: {e}"),
            }),
        None => Ok(None),
    }
}

/// A token count, or `inf` for unlimited.
fn parse_max_tokens(key: &str, raw: &str) -> Result<Option<u32>, ConfigError> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("inf") || raw.eq_ignore_ascii_case("infinite") {
        return Ok(None);
    }
    raw.parse().map(Some).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: format!("{raw:?}: {e}"),
    })
}

fn vocabulary_preset(key: &str, name: &str) -> Result<EventVocabulary, ConfigError> {
    EventVocabulary::preset(name.trim()).ok_or_else(|| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: format!(
            "unknown vocabulary {name:?}, expected one of {}",
            EventVocabulary::presets().join(", ")
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::realtime::TurnDetectionConfig;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    const ENV_KEYS: &[&str] = &[
        "VOICE_SERVER_URL",
        "VOICE_SAMPLE_RATE",
        "VOICE_VOICE",
        "VOICE_LANGUAGE",
        "VOICE_INSTRUCTIONS",
        "VOICE_TEMPERATURE",
        "VOICE_MAX_TOKENS",
        "VOICE_MAX_RECONNECT_ATTEMPTS",
        "VOICE_RECONNECT_BASE_MS",
        "VOICE_CHUNK_INTERVAL_MS",
        "VOICE_VOCABULARY",
    ];

    // Helper to clean up environment variables
    fn cleanup_env_vars() {
        for key in ENV_KEYS {
            unsafe {
                env::remove_var(key);
            }
        }
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.session.server_url, "ws://localhost:8000");
        assert_eq!(config.session.sample_rate, 24000);
        assert_eq!(config.session.voice, "alloy");
        assert_eq!(config.session.max_tokens, None);
        assert_eq!(config.reconnection.max_attempts, 3);
        assert_eq!(config.capture.chunk_interval_ms, 100);
        assert_eq!(config.vocabulary.name, "openai");
        assert_eq!(config.debug_log_capacity, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_from_env() {
        cleanup_env_vars();
        unsafe {
            env::set_var("VOICE_SERVER_URL", "https://voice.example.com");
            env::set_var("VOICE_SAMPLE_RATE", "16000");
            env::set_var("VOICE_TEMPERATURE", "0.5");
            env::set_var("VOICE_MAX_TOKENS", "inf");
            env::set_var("VOICE_MAX_RECONNECT_ATTEMPTS", "6");
            env::set_var("VOICE_VOCABULARY", "unmute");
        }

        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.session.server_url, "https://voice.example.com");
        assert_eq!(config.session.sample_rate, 16000);
        assert_eq!(config.session.temperature, 0.5);
        assert_eq!(config.session.max_tokens, None);
        assert_eq!(config.reconnection.max_attempts, 6);
        assert_eq!(config.vocabulary, EventVocabulary::unmute());

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_env_invalid_number() {
        cleanup_env_vars();
        unsafe {
            env::set_var("VOICE_SAMPLE_RATE", "fast");
        }

        let err = EngineConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "VOICE_SAMPLE_RATE"));

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_env_unknown_vocabulary() {
        cleanup_env_vars();
        unsafe {
            env::set_var("VOICE_VOCABULARY", "carrier-pigeon");
        }

        let err = EngineConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("unknown vocabulary"));

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_yaml_overrides_env() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("voice.yaml");
        let yaml_content = r#"
session:
  voice: "verse"
  max_tokens: 256
  turn_detection:
    type: none
reconnection:
  initial_delay_ms: 250
"#;
        fs::write(&config_path, yaml_content).unwrap();

        unsafe {
            env::set_var("VOICE_VOICE", "alloy");
            env::set_var("VOICE_LANGUAGE", "fr");
        }

        let config = EngineConfig::from_file(&config_path).unwrap();

        // YAML overrides ENV
        assert_eq!(config.session.voice, "verse");
        // ENV value
        assert_eq!(config.session.language, "fr");
        assert_eq!(config.session.max_tokens, Some(256));
        assert_eq!(config.session.turn_detection, TurnDetectionConfig::None);
        assert_eq!(config.reconnection.initial_delay_ms, 250);

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_validation_failure() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("voice.yaml");
        fs::write(&config_path, "session:\n  temperature: 4.0\n").unwrap();

        let err = EngineConfig::from_file(&config_path).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_missing_file() {
        cleanup_env_vars();

        let result = EngineConfig::from_file(Path::new("/nonexistent/voice.yaml"));
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to read config file")
        );
    }

    #[test]
    fn test_validate_rejects_bad_reconnection() {
        let mut config = EngineConfig::default();
        config.reconnection.initial_delay_ms = 60_000;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.reconnection.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unusable_url() {
        let mut config = EngineConfig::default();
        config.session.server_url = "mailto://chef@example.com".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_parse_max_tokens() {
        assert_eq!(parse_max_tokens("k", "inf").unwrap(), None);
        assert_eq!(parse_max_tokens("k", " 512 ").unwrap(), Some(512));
        assert!(parse_max_tokens("k", "lots").is_err());
    }
}
