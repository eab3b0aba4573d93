use serde::Deserialize;
use std::path::Path;

use super::ConfigError;
use crate::core::realtime::{EventVocabulary, TurnDetectionConfig};

/// Complete YAML configuration structure
///
/// All fields are optional to allow partial configuration. Values present
/// here override environment variables.
///
/// # Example YAML structure
/// ```yaml
/// session:
///   server_url: "https://voice.example.com"
///   sample_rate: 24000
///   voice: "alloy"
///   language: "en"
///   instructions: "You are a calm sous chef."
///   temperature: 0.8
///   max_tokens: 800
///   turn_detection:
///     type: server_vad
///     silence_duration_ms: 600
///
/// reconnection:
///   max_attempts: 5
///   initial_delay_ms: 500
///
/// capture:
///   chunk_interval_ms: 100
///
/// # Either a preset name or a full event-name table
/// vocabulary: "unmute"
///
/// debug:
///   log_capacity: 200
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub session: Option<SessionYaml>,
    pub reconnection: Option<ReconnectionYaml>,
    pub capture: Option<CaptureYaml>,
    pub vocabulary: Option<VocabularyYaml>,
    pub debug: Option<DebugYaml>,
}

/// Session configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SessionYaml {
    pub server_url: Option<String>,
    pub path_suffix: Option<String>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub bit_depth: Option<u16>,
    pub voice: Option<String>,
    pub language: Option<String>,
    pub instructions: Option<String>,
    pub temperature: Option<f32>,
    /// A token count, or `"inf"` for unlimited
    pub max_tokens: Option<MaxTokensYaml>,
    pub turn_detection: Option<TurnDetectionConfig>,
}

/// `max_tokens` accepts a number or the string `"inf"`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum MaxTokensYaml {
    Limit(u32),
    Keyword(String),
}

/// Reconnection policy from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ReconnectionYaml {
    pub enabled: Option<bool>,
    pub max_attempts: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_multiplier: Option<f32>,
    pub jitter: Option<bool>,
}

/// Microphone capture settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CaptureYaml {
    pub chunk_interval_ms: Option<u64>,
    pub echo_cancellation: Option<bool>,
    pub noise_suppression: Option<bool>,
    pub auto_gain_control: Option<bool>,
}

/// Event vocabulary: a preset name or a full table
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum VocabularyYaml {
    Preset(String),
    Custom(Box<EventVocabulary>),
}

/// Diagnostics settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DebugYaml {
    pub log_capacity: Option<usize>,
}

impl YamlConfig {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or the YAML is malformed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents)
    }

    /// Parse configuration from YAML text
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(contents)?)
    }
}
