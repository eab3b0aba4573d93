//! Microphone capture pipeline.
//!
//! An [`AudioInput`] yields raw PCM16 LE frames. The chunker task buffers them
//! and flushes one `input audio append` event per chunk interval. Stopping
//! flushes the remainder, releases the input, and then commits the turn, so
//! the commit always follows the final append.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::base::{CaptureConfig, MediaError, SessionConfig};
use super::connection::EventSink;
use super::messages::ClientEvent;
use crate::core::debug_log::{DebugLog, LogLevel};

/// Frame buffer between an input and the chunker.
const FRAME_CHANNEL_CAPACITY: usize = 64;

/// What the engine asks of a microphone.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConstraints {
    pub sample_rate: u32,
    pub channels: u16,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl CaptureConstraints {
    pub fn new(session: &SessionConfig, capture: &CaptureConfig) -> Self {
        Self {
            sample_rate: session.sample_rate,
            channels: session.channels,
            echo_cancellation: capture.echo_cancellation,
            noise_suppression: capture.noise_suppression,
            auto_gain_control: capture.auto_gain_control,
        }
    }
}

/// Source of PCM16 LE microphone frames.
#[async_trait]
pub trait AudioInput: Send + Sync {
    /// Acquire the device and start delivering frames.
    async fn open(&self, constraints: &CaptureConstraints) -> Result<mpsc::Receiver<Bytes>, MediaError>;

    /// Release the device. Must be safe to call when not open.
    async fn close(&self);
}

// =============================================================================
// Channel-fed input
// =============================================================================

#[derive(Default)]
struct ChannelInputState {
    sender: Option<mpsc::Sender<Bytes>>,
    denial: Option<MediaError>,
    constraints: Option<CaptureConstraints>,
}

/// Input fed by the embedding application, for platforms that own their own
/// audio stack and for tests.
#[derive(Clone, Default)]
pub struct ChannelAudioInput {
    state: Arc<Mutex<ChannelInputState>>,
    opens: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl ChannelAudioInput {
    pub fn new() -> Self {
        Self::default()
    }

    /// An input whose every `open` fails with `error`.
    pub fn denied(error: MediaError) -> Self {
        let input = Self::default();
        input.state.lock().denial = Some(error);
        input
    }

    /// Deliver a frame. Returns false when the input is closed or full.
    pub fn push(&self, frame: impl Into<Bytes>) -> bool {
        let sender = self.state.lock().sender.clone();
        match sender {
            Some(tx) => tx.try_send(frame.into()).is_ok(),
            None => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().sender.is_some()
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Constraints passed to the most recent `open`.
    pub fn last_constraints(&self) -> Option<CaptureConstraints> {
        self.state.lock().constraints.clone()
    }
}

#[async_trait]
impl AudioInput for ChannelAudioInput {
    async fn open(&self, constraints: &CaptureConstraints) -> Result<mpsc::Receiver<Bytes>, MediaError> {
        let mut state = self.state.lock();
        if let Some(denial) = &state.denial {
            return Err(denial.clone());
        }
        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        state.sender = Some(tx);
        state.constraints = Some(constraints.clone());
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(rx)
    }

    async fn close(&self) {
        if self.state.lock().sender.take().is_some() {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Totals for one recording.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub chunks: usize,
    pub bytes: usize,
}

struct ActiveCapture {
    stop: CancellationToken,
    task: JoinHandle<CaptureStats>,
}

/// Owns the microphone while recording and streams chunks to the sink.
pub struct CapturePipeline {
    input: Arc<dyn AudioInput>,
    sink: Arc<dyn EventSink>,
    debug_log: DebugLog,
    active: tokio::sync::Mutex<Option<ActiveCapture>>,
    /// Set only once the input is open and the chunker runs
    recording: AtomicBool,
}

impl CapturePipeline {
    pub fn new(input: Arc<dyn AudioInput>, sink: Arc<dyn EventSink>, debug_log: DebugLog) -> Self {
        Self {
            input,
            sink,
            debug_log,
            active: tokio::sync::Mutex::new(None),
            recording: AtomicBool::new(false),
        }
    }

    /// Whether a recording is in progress.
    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    /// Acquire the input and start chunking. Idempotent while recording.
    ///
    /// On failure nothing is held and the error is returned.
    pub async fn start(
        &self,
        constraints: CaptureConstraints,
        chunk_interval: Duration,
    ) -> Result<(), MediaError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            self.debug_log.info("Recording already in progress");
            return Ok(());
        }

        let frames = match self.input.open(&constraints).await {
            Ok(frames) => frames,
            Err(err) => {
                self.debug_log
                    .error(format!("Failed to open microphone: {err}"));
                return Err(err);
            }
        };

        let stop = CancellationToken::new();
        let task = tokio::spawn(run_chunker(
            frames,
            self.sink.clone(),
            self.debug_log.clone(),
            chunk_interval,
            stop.clone(),
        ));
        *active = Some(ActiveCapture { stop, task });
        self.recording.store(true, Ordering::SeqCst);

        self.debug_log.push(
            LogLevel::Success,
            "Recording started",
            Some(serde_json::json!({
                "sample_rate": constraints.sample_rate,
                "channels": constraints.channels,
                "chunk_interval_ms": chunk_interval.as_millis() as u64,
            })),
        );
        Ok(())
    }

    /// Flush, release the input, and optionally commit the turn.
    ///
    /// Returns `None` when nothing was recording.
    pub async fn stop(&self, commit: bool) -> Option<CaptureStats> {
        let mut active = self.active.lock().await;
        let ActiveCapture { stop, task } = active.take()?;
        self.recording.store(false, Ordering::SeqCst);

        stop.cancel();
        let stats = match task.await {
            Ok(stats) => stats,
            Err(e) => {
                self.debug_log
                    .error(format!("Capture task ended abnormally: {e}"));
                CaptureStats::default()
            }
        };
        self.input.close().await;

        if commit {
            if let Err(e) = self.sink.send_event(ClientEvent::InputAudioCommit).await {
                self.debug_log
                    .warn(format!("Failed to commit audio buffer: {e}"));
            }
        }

        self.debug_log.push(
            LogLevel::Info,
            "Recording stopped",
            Some(serde_json::json!({
                "chunks": stats.chunks,
                "bytes": stats.bytes,
                "committed": commit,
            })),
        );
        Some(stats)
    }
}

async fn run_chunker(
    mut frames: mpsc::Receiver<Bytes>,
    sink: Arc<dyn EventSink>,
    debug_log: DebugLog,
    chunk_interval: Duration,
    stop: CancellationToken,
) -> CaptureStats {
    let mut pending = BytesMut::new();
    let mut stats = CaptureStats::default();
    let mut ticker = tokio::time::interval(chunk_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;

            _ = stop.cancelled() => break,

            frame = frames.recv() => match frame {
                Some(frame) => pending.extend_from_slice(&frame),
                None => {
                    debug_log.warn("Microphone stream ended");
                    break;
                }
            },

            _ = ticker.tick() => flush(&mut pending, sink.as_ref(), &debug_log, &mut stats).await,
        }
    }

    while let Ok(frame) = frames.try_recv() {
        pending.extend_from_slice(&frame);
    }
    flush(&mut pending, sink.as_ref(), &debug_log, &mut stats).await;
    stats
}

async fn flush(
    pending: &mut BytesMut,
    sink: &dyn EventSink,
    debug_log: &DebugLog,
    stats: &mut CaptureStats,
) {
    if pending.is_empty() {
        return;
    }
    let chunk = pending.split().freeze();
    match sink.send_event(ClientEvent::audio_append(&chunk)).await {
        Ok(()) => {
            stats.chunks += 1;
            stats.bytes += chunk.len();
        }
        Err(e) => debug_log.warn(format!("Dropped audio chunk of {} bytes: {e}", chunk.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::realtime::base::RealtimeResult;
    use base64::prelude::*;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<ClientEvent>>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn send_event(&self, event: ClientEvent) -> RealtimeResult<()> {
            self.events.lock().push(event);
            Ok(())
        }
    }

    fn constraints() -> CaptureConstraints {
        CaptureConstraints::new(&SessionConfig::default(), &CaptureConfig::default())
    }

    fn pipeline(input: &ChannelAudioInput) -> (CapturePipeline, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let pipeline = CapturePipeline::new(Arc::new(input.clone()), sink.clone(), DebugLog::default());
        (pipeline, sink)
    }

    fn appended_bytes(events: &[ClientEvent]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|event| match event {
                ClientEvent::InputAudioAppend { audio } => BASE64_STANDARD.decode(audio).ok(),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[tokio::test]
    async fn test_stop_flushes_then_commits() {
        let input = ChannelAudioInput::new();
        let (pipeline, sink) = pipeline(&input);

        pipeline
            .start(constraints(), Duration::from_millis(1000))
            .await
            .unwrap();
        assert!(pipeline.is_recording());
        assert!(input.push(vec![1u8, 0, 2, 0]));
        assert!(input.push(vec![3u8, 0]));

        let stats = pipeline.stop(true).await.unwrap();
        assert_eq!(stats.bytes, 6);
        assert!(!pipeline.is_recording());
        assert!(!input.is_open());

        let events = sink.events.lock().clone();
        assert_eq!(appended_bytes(&events), vec![1, 0, 2, 0, 3, 0]);
        assert_eq!(events.last(), Some(&ClientEvent::InputAudioCommit));
    }

    #[tokio::test]
    async fn test_chunks_flush_on_interval() {
        let input = ChannelAudioInput::new();
        let (pipeline, sink) = pipeline(&input);

        pipeline
            .start(constraints(), Duration::from_millis(20))
            .await
            .unwrap();
        input.push(vec![0u8; 480]);
        tokio::time::sleep(Duration::from_millis(80)).await;
        input.push(vec![0u8; 480]);
        tokio::time::sleep(Duration::from_millis(80)).await;
        pipeline.stop(false).await;

        let events = sink.events.lock().clone();
        let appends = events
            .iter()
            .filter(|e| matches!(e, ClientEvent::InputAudioAppend { .. }))
            .count();
        assert_eq!(appends, 2);
        assert!(!events.contains(&ClientEvent::InputAudioCommit));
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let input = ChannelAudioInput::new();
        let (pipeline, _sink) = pipeline(&input);

        pipeline.start(constraints(), Duration::from_millis(100)).await.unwrap();
        pipeline.start(constraints(), Duration::from_millis(100)).await.unwrap();
        assert_eq!(input.open_count(), 1);
        pipeline.stop(true).await;
        assert_eq!(input.close_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let input = ChannelAudioInput::new();
        let (pipeline, sink) = pipeline(&input);

        assert!(pipeline.stop(true).await.is_none());
        assert!(sink.events.lock().is_empty());
        assert_eq!(input.close_count(), 0);
    }

    #[tokio::test]
    async fn test_denied_input_holds_nothing() {
        let input = ChannelAudioInput::denied(MediaError::PermissionDenied("blocked".to_string()));
        let (pipeline, sink) = pipeline(&input);

        let err = pipeline
            .start(constraints(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err, MediaError::PermissionDenied("blocked".to_string()));
        assert!(!pipeline.is_recording());
        assert!(sink.events.lock().is_empty());
    }

    /// Input whose `open` waits for a release signal, then fails.
    struct SlowDeniedInput {
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl AudioInput for SlowDeniedInput {
        async fn open(&self, _constraints: &CaptureConstraints) -> Result<mpsc::Receiver<Bytes>, MediaError> {
            self.release.notified().await;
            Err(MediaError::DeviceUnavailable("no microphone".to_string()))
        }

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn test_not_recording_while_open_is_pending() {
        let input = Arc::new(SlowDeniedInput {
            release: tokio::sync::Notify::new(),
        });
        let sink = Arc::new(RecordingSink::default());
        let pipeline = Arc::new(CapturePipeline::new(input.clone(), sink, DebugLog::default()));

        let starting = pipeline.clone();
        let start = tokio::spawn(async move {
            starting.start(constraints(), Duration::from_millis(100)).await
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!pipeline.is_recording());

        input.release.notify_one();
        let result = start.await.unwrap();
        assert!(matches!(result, Err(MediaError::DeviceUnavailable(_))));
        assert!(!pipeline.is_recording());
    }

    #[test]
    fn test_constraints_from_config() {
        let session = SessionConfig {
            sample_rate: 16000,
            ..Default::default()
        };
        let capture = CaptureConfig {
            echo_cancellation: false,
            ..Default::default()
        };
        let c = CaptureConstraints::new(&session, &capture);
        assert_eq!(c.sample_rate, 16000);
        assert_eq!(c.channels, 1);
        assert!(!c.echo_cancellation);
        assert!(c.noise_suppression);
    }
}
