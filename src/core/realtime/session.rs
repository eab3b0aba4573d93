//! Voice session: the turn-taking controller and public engine API.
//!
//! A [`VoiceSession`] ties the connection manager, the codec and both audio
//! pipelines together. It owns the ordered conversation log and reports
//! messages, state changes, partial transcripts, speech events and errors to
//! the registered callbacks.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sous_voice::{ChannelAudioInput, NullAudioOutput, SessionConfig, VoiceSession};
//!
//! let session = VoiceSession::with_session_config(
//!     SessionConfig::default(),
//!     Arc::new(ChannelAudioInput::new()),
//!     Arc::new(NullAudioOutput),
//! );
//! session.on_message(Arc::new(|msg| println!("{}: {}", msg.role, msg.text)));
//! session.connect().await?;
//! session.send_text_message("How long should I rest the dough?").await?;
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::base::{
    CaptureConfig, ConnectionState, MessageCallback, RealtimeError, RealtimeErrorCallback,
    RealtimeResult, Role, SessionConfig, SessionConfigUpdate, SpeechEvent, SpeechEventCallback,
    StatusCallback, TranscriptDelta, TranscriptDeltaCallback, VoiceMessage, now_millis,
};
use super::capture::{AudioInput, CaptureConstraints, CapturePipeline};
use super::codec::EventCodec;
use super::connection::{ConnectionManager, EventSink, Outbox, TransportHandler};
use super::messages::{ClientEvent, ConversationItem, ResponsePayload, ServerEvent, SessionPayload};
use super::playback::{AudioOutput, PlaybackPipeline};
use crate::config::EngineConfig;
use crate::core::debug_log::{DebugLog, DebugLogCallback, LogLevel};
use crate::utils::url::normalize_server_url;

/// Inbound frames longer than this are truncated in debug log previews.
const FRAME_PREVIEW_CHARS: usize = 200;

// =============================================================================
// Callbacks
// =============================================================================

#[derive(Default)]
struct Callbacks {
    message: RwLock<Option<MessageCallback>>,
    status: RwLock<Option<StatusCallback>>,
    transcript_delta: RwLock<Option<TranscriptDeltaCallback>>,
    speech: RwLock<Option<SpeechEventCallback>>,
    error: RwLock<Option<RealtimeErrorCallback>>,
}

impl Callbacks {
    fn status(&self, state: ConnectionState) {
        let callback = self.status.read().clone();
        if let Some(cb) = callback {
            cb(state);
        }
    }

    fn message(&self, message: VoiceMessage) {
        let callback = self.message.read().clone();
        if let Some(cb) = callback {
            cb(message);
        }
    }

    fn transcript_delta(&self, delta: TranscriptDelta) {
        let callback = self.transcript_delta.read().clone();
        if let Some(cb) = callback {
            cb(delta);
        }
    }

    fn speech(&self, event: SpeechEvent) {
        let callback = self.speech.read().clone();
        if let Some(cb) = callback {
            cb(event);
        }
    }

    fn error(&self, error: RealtimeError) {
        let callback = self.error.read().clone();
        if let Some(cb) = callback {
            cb(error);
        }
    }
}

// =============================================================================
// Conversation log
// =============================================================================

#[derive(Default)]
struct Conversation {
    messages: Vec<VoiceMessage>,
    ids: HashSet<String>,
    /// Partial assistant transcripts keyed by item id
    assistant_partial: HashMap<String, String>,
    /// Partial user transcripts keyed by item id
    user_partial: HashMap<String, String>,
}

impl Conversation {
    /// Append unless a message with the same id exists.
    fn append(&mut self, message: VoiceMessage) -> bool {
        if !self.ids.insert(message.id.clone()) {
            return false;
        }
        self.messages.push(message);
        true
    }

    fn accumulate(&mut self, role: Role, key: &str, delta: &str) -> String {
        let partials = match role {
            Role::User => &mut self.user_partial,
            Role::Assistant => &mut self.assistant_partial,
        };
        let entry = partials.entry(key.to_string()).or_default();
        entry.push_str(delta);
        entry.clone()
    }

    fn take_partial(&mut self, role: Role, key: &str) -> Option<String> {
        match role {
            Role::User => self.user_partial.remove(key),
            Role::Assistant => self.assistant_partial.remove(key),
        }
    }
}

// =============================================================================
// Session
// =============================================================================

struct SessionInner {
    config: RwLock<SessionConfig>,
    capture_config: CaptureConfig,
    codec: EventCodec,
    connection: ConnectionManager,
    outbox: Arc<Outbox>,
    capture: CapturePipeline,
    playback: PlaybackPipeline,
    debug_log: DebugLog,
    conversation: RwLock<Conversation>,
    session_id: RwLock<Option<String>>,
    server_session_id: RwLock<Option<String>>,
    listening: AtomicBool,
    callbacks: Arc<Callbacks>,
}

/// A realtime voice conversation with one backend.
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct VoiceSession {
    inner: Arc<SessionInner>,
}

impl VoiceSession {
    /// Create a session from a full engine configuration.
    pub fn new(config: EngineConfig, input: Arc<dyn AudioInput>, output: Arc<dyn AudioOutput>) -> Self {
        let debug_log = DebugLog::new(config.debug_log_capacity);
        let connection = ConnectionManager::new(config.reconnection, debug_log.clone());
        let codec = EventCodec::new(config.vocabulary);
        let outbox = Arc::new(Outbox::new(connection.clone(), codec.clone()));
        let capture = CapturePipeline::new(input, outbox.clone(), debug_log.clone());
        let playback = PlaybackPipeline::new(
            output,
            debug_log.clone(),
            config.session.sample_rate,
            config.session.channels,
        );

        let callbacks = Arc::new(Callbacks::default());
        let status_callbacks = callbacks.clone();
        connection.set_status_callback(Arc::new(move |state| status_callbacks.status(state)));

        Self {
            inner: Arc::new(SessionInner {
                config: RwLock::new(config.session),
                capture_config: config.capture,
                codec,
                connection,
                outbox,
                capture,
                playback,
                debug_log,
                conversation: RwLock::new(Conversation::default()),
                session_id: RwLock::new(None),
                server_session_id: RwLock::new(None),
                listening: AtomicBool::new(false),
                callbacks,
            }),
        }
    }

    /// Create a session with default reconnection, capture and vocabulary settings.
    pub fn with_session_config(
        session: SessionConfig,
        input: Arc<dyn AudioInput>,
        output: Arc<dyn AudioOutput>,
    ) -> Self {
        Self::new(
            EngineConfig {
                session,
                ..Default::default()
            },
            input,
            output,
        )
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Open the connection and configure the server-side session.
    ///
    /// A no-op while connecting or connected.
    pub async fn connect(&self) -> RealtimeResult<()> {
        let inner = &self.inner;
        let config = inner.config.read().clone();

        let url = config
            .validate()
            .and_then(|()| {
                normalize_server_url(&config.server_url, &config.path_suffix)
                    .map_err(|e| RealtimeError::InvalidConfiguration(e.to_string()))
            })
            .inspect_err(|e| {
                inner.debug_log.error(format!("Cannot connect: {e}"));
            })?;

        if !inner.connection.state().is_active() {
            inner.server_session_id.write().take();
            inner.session_id.write().take();
        }
        inner.playback.set_format(config.sample_rate, config.channels);
        let handler = Arc::new(SessionTransport {
            inner: Arc::downgrade(inner),
        });

        inner
            .connection
            .connect(url, handler)
            .await
            .inspect_err(|e| inner.callbacks.error(e.clone()))
    }

    /// Stop recording, close the connection and end the session. Idempotent.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        if inner.capture.stop(false).await.is_some() {
            inner.debug_log.info("Recording stopped for disconnect");
        }
        inner.listening.store(false, Ordering::SeqCst);
        inner.connection.disconnect().await;
        inner.playback.interrupt();

        {
            let mut conversation = inner.conversation.write();
            conversation.assistant_partial.clear();
            conversation.user_partial.clear();
        }
        inner.server_session_id.write().take();
        if let Some(id) = inner.session_id.write().take() {
            inner
                .debug_log
                .info(format!("Session {id} ended"));
        }
    }

    // -------------------------------------------------------------------------
    // Audio
    // -------------------------------------------------------------------------

    /// Start streaming microphone audio. Requires a live connection.
    pub async fn start_recording(&self) -> RealtimeResult<()> {
        let inner = &self.inner;
        if !inner.connection.is_connected() {
            inner.debug_log.warn(format!(
                "Cannot start recording while {}",
                inner.connection.state()
            ));
            return Err(RealtimeError::NotConnected);
        }

        let constraints = CaptureConstraints::new(&inner.config.read(), &inner.capture_config);
        let interval = Duration::from_millis(inner.capture_config.effective_chunk_interval_ms());

        if let Err(e) = inner.capture.start(constraints, interval).await {
            let err = RealtimeError::from(e);
            inner.callbacks.error(err.clone());
            return Err(err);
        }
        inner.listening.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stop streaming and commit the user's turn. Safe to call when not recording.
    pub async fn stop_recording(&self) {
        let inner = &self.inner;
        match inner.capture.stop(true).await {
            Some(_) => inner.listening.store(false, Ordering::SeqCst),
            None => inner.debug_log.info("Not recording"),
        }
    }

    // -------------------------------------------------------------------------
    // Text and configuration
    // -------------------------------------------------------------------------

    /// Send a typed user message and ask the assistant to respond.
    ///
    /// The message is appended to the log before anything goes on the wire.
    pub async fn send_text_message(&self, text: &str) -> RealtimeResult<VoiceMessage> {
        let inner = &self.inner;
        if !inner.connection.is_connected() {
            inner.debug_log.warn("Cannot send message: not connected");
            return Err(RealtimeError::NotConnected);
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(RealtimeError::InvalidInput("message text is empty".to_string()));
        }

        let message = VoiceMessage::new(Role::User, text);
        inner.append_message(message.clone());

        let response = ResponsePayload::from_config(&inner.config.read());
        inner
            .outbox
            .send_event(ClientEvent::ConversationItemCreate {
                item: ConversationItem::user_text(&message.id, text),
            })
            .await?;
        inner
            .outbox
            .send_event(ClientEvent::ResponseCreate { response })
            .await?;
        Ok(message)
    }

    /// Merge `update` into the session configuration.
    ///
    /// When connected the server-side session is updated in place.
    pub async fn update_config(&self, update: SessionConfigUpdate) -> RealtimeResult<()> {
        let inner = &self.inner;
        let url_changed = update.server_url.is_some();

        let merged = {
            let mut candidate = inner.config.read().clone();
            candidate.merge(update);
            candidate.validate()?;
            candidate
        };
        inner.playback.set_format(merged.sample_rate, merged.channels);
        *inner.config.write() = merged;
        inner.debug_log.info("Session configuration updated");

        if inner.connection.is_connected() {
            if url_changed {
                inner
                    .debug_log
                    .info("Server URL change applies on next connect");
            }
            inner.send_session_update().await?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    pub fn is_recording(&self) -> bool {
        self.inner.capture.is_recording()
    }

    /// Whether the user's turn is open: recording, or speech detected by server VAD.
    pub fn is_listening(&self) -> bool {
        self.inner.listening.load(Ordering::SeqCst)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.connection.reconnect_attempts()
    }

    /// Snapshot of the conversation log in arrival order.
    pub fn messages(&self) -> Vec<VoiceMessage> {
        self.inner.conversation.read().messages.clone()
    }

    /// Local `session_<timestamp>` id, set while a session is open.
    pub fn session_id(&self) -> Option<String> {
        self.inner.session_id.read().clone()
    }

    /// Id the server assigned in its session-created event.
    pub fn server_session_id(&self) -> Option<String> {
        self.inner.server_session_id.read().clone()
    }

    pub fn config(&self) -> SessionConfig {
        self.inner.config.read().clone()
    }

    pub fn debug_log(&self) -> &DebugLog {
        &self.inner.debug_log
    }

    /// The underlying connection manager, for diagnostics.
    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    // -------------------------------------------------------------------------
    // Callback registration
    // -------------------------------------------------------------------------

    pub fn on_message(&self, callback: MessageCallback) {
        *self.inner.callbacks.message.write() = Some(callback);
    }

    pub fn on_status_change(&self, callback: StatusCallback) {
        *self.inner.callbacks.status.write() = Some(callback);
    }

    pub fn on_debug_log(&self, callback: DebugLogCallback) {
        self.inner.debug_log.set_observer(callback);
    }

    pub fn on_transcript_delta(&self, callback: TranscriptDeltaCallback) {
        *self.inner.callbacks.transcript_delta.write() = Some(callback);
    }

    pub fn on_speech_event(&self, callback: SpeechEventCallback) {
        *self.inner.callbacks.speech.write() = Some(callback);
    }

    pub fn on_error(&self, callback: RealtimeErrorCallback) {
        *self.inner.callbacks.error.write() = Some(callback);
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.connection.abort();
    }
}

impl SessionInner {
    async fn send_session_update(&self) -> RealtimeResult<()> {
        let session = SessionPayload::from_config(&self.config.read());
        self.outbox
            .send_event(ClientEvent::SessionUpdate { session })
            .await
            .inspect_err(|e| {
                self.debug_log
                    .error(format!("Failed to send session update: {e}"));
            })
    }

    fn append_message(&self, message: VoiceMessage) {
        let appended = self.conversation.write().append(message.clone());
        if !appended {
            tracing::debug!(id = %message.id, "Duplicate message skipped");
            return;
        }
        self.debug_log.push(
            LogLevel::Info,
            format!("Message from {}", message.role),
            Some(serde_json::json!({ "id": message.id, "chars": message.text.chars().count() })),
        );
        self.callbacks.message(message);
    }

    fn append_transcript(&self, role: Role, item_id: Option<String>, final_text: Option<String>) {
        let key = item_id.clone().unwrap_or_default();
        let partial = self.conversation.write().take_partial(role, &key);
        let text = final_text
            .filter(|t| !t.trim().is_empty())
            .or(partial)
            .unwrap_or_default();
        let text = text.trim();
        if text.is_empty() {
            return;
        }

        let message = match item_id {
            Some(id) => VoiceMessage {
                id: id.clone(),
                role,
                text: text.to_string(),
                audio_ref: None,
                timestamp: now_millis(),
            }
            .with_audio_ref(id),
            None => VoiceMessage::new(role, text),
        };
        self.append_message(message);
    }

    /// Turn every pending partial transcript of `role` into a message.
    fn finalize_partials(&self, role: Role) -> usize {
        let mut keys: Vec<String> = {
            let conversation = self.conversation.read();
            let partials = match role {
                Role::User => &conversation.user_partial,
                Role::Assistant => &conversation.assistant_partial,
            };
            partials.keys().cloned().collect()
        };
        keys.sort();
        for key in &keys {
            let item_id = (!key.is_empty()).then(|| key.clone());
            self.append_transcript(role, item_id, None);
        }
        keys.len()
    }

    fn stream_delta(&self, role: Role, item_id: Option<String>, delta: String) {
        let key = item_id.clone().unwrap_or_default();
        let accumulated = self.conversation.write().accumulate(role, &key, &delta);
        self.callbacks.transcript_delta(TranscriptDelta {
            role,
            delta,
            accumulated,
            item_id,
        });
    }

    async fn handle_frame(&self, text: &str) {
        let event = match self.codec.decode(text) {
            Ok(event) => event,
            Err(err) if err.is_unknown() => {
                self.debug_log.warn(format!("Ignoring {err}"));
                return;
            }
            Err(err) => {
                let preview: String = text.chars().take(FRAME_PREVIEW_CHARS).collect();
                self.debug_log.push(
                    LogLevel::Error,
                    format!("Dropping inbound frame: {err}"),
                    Some(serde_json::json!({ "frame": preview })),
                );
                self.callbacks.error(err.into());
                return;
            }
        };
        self.handle_event(event);
    }

    fn handle_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::Error { error } => {
                self.debug_log.push(
                    LogLevel::Error,
                    format!("Server error: {}", error.message),
                    serde_json::to_value(&error).ok(),
                );
                self.callbacks.error(RealtimeError::Protocol(format!(
                    "{}: {}",
                    error.error_type, error.message
                )));
            }

            ServerEvent::SessionCreated { session } => {
                self.debug_log.push(
                    LogLevel::Success,
                    "Server session created",
                    Some(serde_json::json!({ "id": session.id, "model": session.model })),
                );
                *self.server_session_id.write() = session.id;
            }

            ServerEvent::SessionUpdated { .. } => {
                self.debug_log.info("Server session updated");
            }

            ServerEvent::SpeechStarted {
                audio_start_ms,
                item_id,
            } => {
                self.listening.store(true, Ordering::SeqCst);
                self.debug_log.info("Speech started");
                self.callbacks.speech(SpeechEvent::Started {
                    audio_start_ms,
                    item_id,
                });
            }

            ServerEvent::SpeechStopped {
                audio_end_ms,
                item_id,
            } => {
                self.listening.store(false, Ordering::SeqCst);
                self.debug_log.info("Speech stopped");
                self.callbacks.speech(SpeechEvent::Stopped {
                    audio_end_ms,
                    item_id,
                });
            }

            ServerEvent::ConversationItemCreated { item } => {
                let Some(id) = item.id.clone() else {
                    tracing::debug!("Conversation item without id ignored");
                    return;
                };
                if self.conversation.read().ids.contains(&id) {
                    tracing::debug!(id = %id, "Server echo of local item");
                    return;
                }
                let Some(role) = item.role.as_deref().and_then(Role::parse) else {
                    return;
                };
                let text = item.text();
                let text = text.trim();
                if text.is_empty() {
                    // Voice items get their text from transcript events.
                    return;
                }
                self.append_message(VoiceMessage {
                    id,
                    role,
                    text: text.to_string(),
                    audio_ref: None,
                    timestamp: now_millis(),
                });
            }

            ServerEvent::InputTranscriptDelta { item_id, delta } => {
                self.stream_delta(Role::User, item_id, delta);
            }

            ServerEvent::InputTranscriptCompleted {
                item_id,
                transcript,
            } => {
                self.append_transcript(Role::User, item_id, Some(transcript));
            }

            ServerEvent::ResponseCreated { response_id } => {
                // The user's turn is over once the assistant starts answering.
                self.finalize_partials(Role::User);
                self.debug_log.push(
                    LogLevel::Info,
                    "Assistant responding",
                    Some(serde_json::json!({ "response_id": response_id })),
                );
            }

            ServerEvent::OutputItemAdded { item, .. } => {
                tracing::debug!(item_id = ?item.id, "Output item added");
            }

            ServerEvent::AudioDelta { delta, .. } => {
                if let Err(e) = self.playback.handle_delta(&delta) {
                    self.callbacks.error(e.into());
                }
            }

            ServerEvent::AudioDone { item_id, .. } => {
                tracing::debug!(item_id = ?item_id, "Audio done");
            }

            ServerEvent::TranscriptDelta { item_id, delta, .. } => {
                self.stream_delta(Role::Assistant, item_id, delta);
            }

            ServerEvent::TranscriptDone {
                item_id,
                transcript,
                ..
            } => {
                self.append_transcript(Role::Assistant, item_id, transcript);
            }

            ServerEvent::ResponseDone { response_id } => {
                // Dialects without final transcript events only ever stream deltas.
                self.finalize_partials(Role::User);
                let streamed = self.finalize_partials(Role::Assistant);
                if streamed > 0 {
                    tracing::debug!(streamed, "Assistant text kept from transcript deltas");
                }
                self.debug_log.push(
                    LogLevel::Success,
                    "Turn complete",
                    Some(serde_json::json!({ "response_id": response_id })),
                );
            }
        }
    }
}

// =============================================================================
// Transport handler
// =============================================================================

/// Bridges connection events into the session without keeping it alive.
struct SessionTransport {
    inner: Weak<SessionInner>,
}

#[async_trait]
impl TransportHandler for SessionTransport {
    async fn on_open(&self, reconnect_attempt: Option<u32>) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };

        if let Some(attempt) = reconnect_attempt {
            inner
                .debug_log
                .info(format!("Restoring session after reconnect attempt {attempt}"));
        }

        // A background retry can be the first successful open after a failed connect.
        let minted = {
            let mut session_id = inner.session_id.write();
            match *session_id {
                Some(_) => None,
                None => {
                    let id = format!("session_{}", now_millis());
                    *session_id = Some(id.clone());
                    Some(id)
                }
            }
        };
        if let Some(id) = minted {
            inner.debug_log.push(
                LogLevel::Success,
                "Session started",
                Some(serde_json::json!({ "session_id": id })),
            );
        }

        // Errors are already logged; the socket stays usable.
        let _ = inner.send_session_update().await;
    }

    async fn on_text(&self, text: String) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_frame(&text).await;
        }
    }

    async fn on_connection_lost(&self, reason: &str) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if inner.capture.stop(false).await.is_some() {
            inner
                .debug_log
                .warn(format!("Recording stopped, connection lost: {reason}"));
        }
        inner.listening.store(false, Ordering::SeqCst);
    }

    async fn on_reconnect_exhausted(&self, attempts: u32) {
        if let Some(inner) = self.inner.upgrade() {
            inner
                .callbacks
                .error(RealtimeError::ReconnectExhausted { attempts });
        }
    }
}
