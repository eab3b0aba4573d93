//! Host audio devices via cpal.
//!
//! cpal streams are not `Send`, so each stream lives on its own thread and
//! talks to the async side through channels.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::mpsc as std_mpsc;

use async_trait::async_trait;
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use super::base::MediaError;
use super::capture::{AudioInput, CaptureConstraints};
use super::playback::{AudioBuffer, AudioOutput};

const FRAME_CHANNEL_CAPACITY: usize = 64;

fn classify_stream_error(err: cpal::BuildStreamError) -> MediaError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => {
            MediaError::DeviceUnavailable("device disappeared".to_string())
        }
        other => {
            let text = other.to_string();
            let lower = text.to_lowercase();
            if lower.contains("permission") || lower.contains("denied") {
                MediaError::PermissionDenied(text)
            } else {
                MediaError::CaptureFailed(text)
            }
        }
    }
}

fn f32_to_pcm16(samples: &[f32]) -> Bytes {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let value = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
    Bytes::from(out)
}

// =============================================================================
// Microphone
// =============================================================================

/// Default system microphone.
#[derive(Default)]
pub struct CpalAudioInput {
    stop: Mutex<Option<std_mpsc::Sender<()>>>,
}

impl CpalAudioInput {
    pub fn new() -> Self {
        Self::default()
    }
}

fn build_input_stream(
    constraints: &CaptureConstraints,
    frames: mpsc::Sender<Bytes>,
) -> Result<cpal::Stream, MediaError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| MediaError::DeviceUnavailable("no input device available".to_string()))?;

    let rate = SampleRate(constraints.sample_rate);
    let supported = device
        .supported_input_configs()
        .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))?
        .find(|c| {
            c.channels() == constraints.channels
                && c.min_sample_rate() <= rate
                && c.max_sample_rate() >= rate
        })
        .ok_or_else(|| {
            MediaError::DeviceUnavailable(format!(
                "no input config for {} Hz x {}",
                constraints.sample_rate, constraints.channels
            ))
        })?;
    let config: StreamConfig = supported.with_sample_rate(rate).config();

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = constraints.sample_rate,
        channels = config.channels,
        echo_cancellation = constraints.echo_cancellation,
        "Opening microphone"
    );

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if frames.try_send(f32_to_pcm16(data)).is_err() {
                    tracing::trace!("Microphone frame dropped");
                }
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(classify_stream_error)?;

    stream
        .play()
        .map_err(|e| MediaError::CaptureFailed(e.to_string()))?;
    Ok(stream)
}

#[async_trait]
impl AudioInput for CpalAudioInput {
    async fn open(&self, constraints: &CaptureConstraints) -> Result<mpsc::Receiver<Bytes>, MediaError> {
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let constraints = constraints.clone();

        std::thread::Builder::new()
            .name("voice-capture".to_string())
            .spawn(move || match build_input_stream(&constraints, frame_tx) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    // Blocks until close() or the pipeline is dropped.
                    let _ = stop_rx.recv();
                    drop(stream);
                    tracing::debug!("Microphone released");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| MediaError::CaptureFailed(e.to_string()))?;

        ready_rx
            .await
            .map_err(|_| MediaError::CaptureFailed("capture thread exited".to_string()))??;

        *self.stop.lock() = Some(stop_tx);
        Ok(frame_rx)
    }

    async fn close(&self) {
        if let Some(stop) = self.stop.lock().take() {
            let _ = stop.send(());
        }
    }
}

// =============================================================================
// Speaker
// =============================================================================

/// Default system speaker fed from a sample queue.
pub struct CpalAudioOutput {
    queue: Arc<Mutex<VecDeque<f32>>>,
    device_channels: u16,
    stop: Mutex<Option<std_mpsc::Sender<()>>>,
}

impl CpalAudioOutput {
    /// Open the default output device at `sample_rate`.
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self, MediaError> {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let stream_queue = queue.clone();

        std::thread::Builder::new()
            .name("voice-playback".to_string())
            .spawn(move || match build_output_stream(sample_rate, channels, stream_queue) {
                Ok((stream, device_channels)) => {
                    let _ = ready_tx.send(Ok(device_channels));
                    let _ = stop_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| MediaError::PlaybackFailed(e.to_string()))?;

        let device_channels = ready_rx
            .recv()
            .map_err(|_| MediaError::PlaybackFailed("playback thread exited".to_string()))??;

        Ok(Self {
            queue,
            device_channels,
            stop: Mutex::new(Some(stop_tx)),
        })
    }
}

fn build_output_stream(
    sample_rate: u32,
    channels: u16,
    queue: Arc<Mutex<VecDeque<f32>>>,
) -> Result<(cpal::Stream, u16), MediaError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| MediaError::DeviceUnavailable("no output device available".to_string()))?;

    let rate = SampleRate(sample_rate);
    let fits = |c: &cpal::SupportedStreamConfigRange, ch: u16| {
        c.channels() == ch && c.min_sample_rate() <= rate && c.max_sample_rate() >= rate
    };
    let supported = device
        .supported_output_configs()
        .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))?
        .find(|c| fits(c, channels))
        .or_else(|| {
            // Fallback: try stereo
            device.supported_output_configs().ok()?.find(|c| fits(c, 2))
        })
        .ok_or_else(|| MediaError::DeviceUnavailable("no suitable output config found".to_string()))?;
    let config: StreamConfig = supported.with_sample_rate(rate).config();
    let device_channels = config.channels;

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut queue = queue.lock();
                for out in data.iter_mut() {
                    *out = queue.pop_front().unwrap_or(0.0);
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| MediaError::PlaybackFailed(e.to_string()))?;

    stream
        .play()
        .map_err(|e| MediaError::PlaybackFailed(e.to_string()))?;
    Ok((stream, device_channels))
}

impl AudioOutput for CpalAudioOutput {
    fn play(&self, buffer: AudioBuffer) -> Result<(), MediaError> {
        let mut queue = self.queue.lock();
        match (buffer.channels, self.device_channels) {
            (src, dst) if src == dst => queue.extend(buffer.samples),
            (1, dst) => {
                for sample in buffer.samples {
                    queue.extend(std::iter::repeat_n(sample, usize::from(dst)));
                }
            }
            (src, 1) => {
                for frame in buffer.samples.chunks(usize::from(src)) {
                    queue.push_back(frame.iter().sum::<f32>() / frame.len() as f32);
                }
            }
            (src, dst) => {
                return Err(MediaError::PlaybackFailed(format!(
                    "cannot map {src} channels onto {dst}"
                )));
            }
        }
        Ok(())
    }

    fn clear(&self) {
        self.queue.lock().clear();
    }
}

impl Drop for CpalAudioOutput {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.lock().take() {
            let _ = stop.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f32_to_pcm16() {
        let bytes = f32_to_pcm16(&[0.0, 1.0, -1.0]);
        assert_eq!(&bytes[..], &[0x00, 0x00, 0xff, 0x7f, 0x01, 0x80]);
    }
}
