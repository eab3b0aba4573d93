//! Assistant audio playback.
//!
//! Each inbound audio delta is base64-decoded, converted from PCM16 LE to f32
//! samples and handed to an [`AudioOutput`] in arrival order. A chunk that
//! fails to decode is logged and skipped; later chunks keep playing.

use std::sync::Arc;
use std::time::Duration;

use base64::prelude::*;
use parking_lot::Mutex;

use super::base::MediaError;
use crate::core::debug_log::DebugLog;

/// Decoded audio ready for an output device.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    /// Interleaved samples in `[-1.0, 1.0)`
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioBuffer {
    /// Samples per channel.
    pub fn frames(&self) -> usize {
        self.samples.len() / usize::from(self.channels.max(1))
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / f64::from(self.sample_rate))
    }
}

/// Convert PCM 16-bit signed little-endian bytes into an [`AudioBuffer`].
pub fn decode_pcm16(bytes: &[u8], sample_rate: u32, channels: u16) -> Result<AudioBuffer, MediaError> {
    if bytes.len() % 2 != 0 {
        return Err(MediaError::DecodeFailed(format!(
            "PCM16 payload has odd length {}",
            bytes.len()
        )));
    }
    if channels == 0 {
        return Err(MediaError::DecodeFailed("channel count is zero".to_string()));
    }

    let samples = bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect();

    Ok(AudioBuffer {
        samples,
        sample_rate,
        channels,
    })
}

/// Sink for decoded assistant audio.
///
/// `play` must queue and return without waiting for the audio to finish, so
/// buffers submitted back to back play gap-free in submission order.
pub trait AudioOutput: Send + Sync {
    fn play(&self, buffer: AudioBuffer) -> Result<(), MediaError>;

    /// Drop anything queued but not yet heard.
    fn clear(&self) {}
}

/// Discards all audio. Used when the embedding app renders audio itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAudioOutput;

impl AudioOutput for NullAudioOutput {
    fn play(&self, _buffer: AudioBuffer) -> Result<(), MediaError> {
        Ok(())
    }
}

/// Keeps every buffer it receives, in order.
#[derive(Debug, Default, Clone)]
pub struct CollectingAudioOutput {
    buffers: Arc<Mutex<Vec<AudioBuffer>>>,
}

impl CollectingAudioOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffers(&self) -> Vec<AudioBuffer> {
        self.buffers.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.buffers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.lock().is_empty()
    }
}

impl AudioOutput for CollectingAudioOutput {
    fn play(&self, buffer: AudioBuffer) -> Result<(), MediaError> {
        self.buffers.lock().push(buffer);
        Ok(())
    }

    fn clear(&self) {
        self.buffers.lock().clear();
    }
}

/// Turns audio deltas into scheduled playback.
pub struct PlaybackPipeline {
    output: Arc<dyn AudioOutput>,
    debug_log: DebugLog,
    /// Sample rate and channel count of inbound audio
    format: Mutex<(u32, u16)>,
    played: Mutex<PlaybackStats>,
}

/// Counters for the current session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    pub chunks: usize,
    pub failed: usize,
}

impl PlaybackPipeline {
    pub fn new(output: Arc<dyn AudioOutput>, debug_log: DebugLog, sample_rate: u32, channels: u16) -> Self {
        Self {
            output,
            debug_log,
            format: Mutex::new((sample_rate, channels)),
            played: Mutex::new(PlaybackStats::default()),
        }
    }

    /// Change the format applied to subsequent chunks.
    pub fn set_format(&self, sample_rate: u32, channels: u16) {
        *self.format.lock() = (sample_rate, channels);
    }

    pub fn stats(&self) -> PlaybackStats {
        *self.played.lock()
    }

    /// Decode one base64 delta and schedule it.
    pub fn handle_delta(&self, delta: &str) -> Result<(), MediaError> {
        let result = self.decode(delta).and_then(|buffer| self.output.play(buffer));

        let mut played = self.played.lock();
        match &result {
            Ok(()) => played.chunks += 1,
            Err(e) => {
                played.failed += 1;
                drop(played);
                self.debug_log.error(format!("Audio chunk skipped: {e}"));
            }
        }
        result
    }

    /// Interrupt playback, e.g. when the user starts talking over the assistant.
    pub fn interrupt(&self) {
        self.output.clear();
    }

    fn decode(&self, delta: &str) -> Result<AudioBuffer, MediaError> {
        let bytes = BASE64_STANDARD
            .decode(delta)
            .map_err(|e| MediaError::DecodeFailed(format!("invalid base64: {e}")))?;
        let (sample_rate, channels) = *self.format.lock();
        decode_pcm16(&bytes, sample_rate, channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline() -> (PlaybackPipeline, CollectingAudioOutput) {
        let output = CollectingAudioOutput::new();
        let pipeline = PlaybackPipeline::new(Arc::new(output.clone()), DebugLog::default(), 24000, 1);
        (pipeline, output)
    }

    #[test]
    fn test_decode_pcm16_values() {
        let bytes = [0x00, 0x00, 0xff, 0x7f, 0x00, 0x80];
        let buffer = decode_pcm16(&bytes, 24000, 1).unwrap();
        assert_eq!(buffer.samples.len(), 3);
        assert_eq!(buffer.samples[0], 0.0);
        assert!((buffer.samples[1] - 32767.0 / 32768.0).abs() < f32::EPSILON);
        assert_eq!(buffer.samples[2], -1.0);
    }

    #[test]
    fn test_decode_pcm16_rejects_odd_length() {
        assert!(matches!(
            decode_pcm16(&[1, 2, 3], 24000, 1),
            Err(MediaError::DecodeFailed(_))
        ));
    }

    #[test]
    fn test_buffer_duration() {
        let buffer = decode_pcm16(&vec![0u8; 4800], 24000, 1).unwrap();
        assert_eq!(buffer.frames(), 2400);
        assert_eq!(buffer.duration().as_millis(), 100);
    }

    #[test]
    fn test_each_delta_yields_one_buffer_in_order() {
        let (pipeline, output) = pipeline();
        let first = BASE64_STANDARD.encode([1u8, 0]);
        let second = BASE64_STANDARD.encode([2u8, 0, 3, 0]);

        pipeline.handle_delta(&first).unwrap();
        pipeline.handle_delta(&second).unwrap();

        let buffers = output.buffers();
        assert_eq!(buffers.len(), 2);
        assert_eq!(buffers[0].samples.len(), 1);
        assert_eq!(buffers[1].samples.len(), 2);
        assert_eq!(pipeline.stats().chunks, 2);
    }

    #[test]
    fn test_bad_chunk_is_skipped() {
        let (pipeline, output) = pipeline();

        assert!(pipeline.handle_delta("not base64!!").is_err());
        assert!(pipeline.handle_delta(&BASE64_STANDARD.encode([1u8, 2, 3])).is_err());
        pipeline.handle_delta(&BASE64_STANDARD.encode([1u8, 0])).unwrap();

        assert_eq!(output.len(), 1);
        assert_eq!(pipeline.stats(), PlaybackStats { chunks: 1, failed: 2 });
    }

    #[test]
    fn test_interrupt_clears_output() {
        let (pipeline, output) = pipeline();
        pipeline.handle_delta(&BASE64_STANDARD.encode([1u8, 0])).unwrap();
        pipeline.interrupt();
        assert!(output.is_empty());
    }
}
