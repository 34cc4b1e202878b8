//! Audio playback to speakers
//!
//! `PlaybackSession` keeps at most one sound alive: a new `play` stops and
//! releases the previous one before starting. Completion is reported
//! asynchronously through `finished`.

use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use tokio::sync::oneshot;

use super::audio::{Clip, decode_audio, resample};
use crate::{Error, Result};

/// An output device that plays one clip at a time
pub trait AudioOutput {
    /// Start playing `clip`, signalling `done` once the last sample is out
    ///
    /// # Errors
    ///
    /// Returns `Error::Playback` if the device cannot play the clip
    fn start(&mut self, clip: Clip, done: oneshot::Sender<()>) -> Result<()>;

    /// Stop and release the current sound, if any
    fn stop(&mut self);

    /// Whether a sound is currently alive
    fn is_playing(&self) -> bool;
}

/// Playback position shared with the device callback
struct Cursor {
    samples: Vec<f32>,
    position: usize,
    done: Option<oneshot::Sender<()>>,
}

/// Plays audio to the default output device
pub struct Speaker {
    stream: Option<Stream>,
}

impl Speaker {
    /// Create a speaker; the device is opened per clip
    #[must_use]
    pub const fn new() -> Self {
        Self { stream: None }
    }

    /// Prefer an f32 config at the clip's own rate so no resampling is needed
    fn select_config(device: &cpal::Device, sample_rate: u32) -> Result<StreamConfig> {
        let native = device
            .supported_output_configs()
            .map_err(|e| Error::Playback(e.to_string()))?
            .filter(|c| c.sample_format() == cpal::SampleFormat::F32)
            .filter(|c| {
                c.min_sample_rate() <= SampleRate(sample_rate)
                    && c.max_sample_rate() >= SampleRate(sample_rate)
            })
            .min_by_key(cpal::SupportedStreamConfigRange::channels);

        if let Some(range) = native {
            return Ok(range.with_sample_rate(SampleRate(sample_rate)).config());
        }

        device
            .default_output_config()
            .map(|c| c.config())
            .map_err(|e| Error::Playback(e.to_string()))
    }
}

impl Default for Speaker {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioOutput for Speaker {
    fn start(&mut self, clip: Clip, done: oneshot::Sender<()>) -> Result<()> {
        self.stop();

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Playback("no output device available".to_string()))?;

        let config = Self::select_config(&device, clip.sample_rate)?;
        let channels = usize::from(config.channels);
        let samples = resample(&clip.samples, clip.sample_rate, config.sample_rate.0)?;
        let sample_count = samples.len();

        let cursor = Arc::new(Mutex::new(Cursor {
            samples,
            position: 0,
            done: Some(done),
        }));
        let cursor_clone = Arc::clone(&cursor);

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let Ok(mut cursor) = cursor_clone.lock() else {
                        data.fill(0.0);
                        return;
                    };

                    for frame in data.chunks_mut(channels) {
                        let sample = cursor.samples.get(cursor.position).copied();
                        frame.fill(sample.unwrap_or(0.0));
                        if sample.is_some() {
                            cursor.position += 1;
                        }
                    }

                    if cursor.position >= cursor.samples.len() {
                        if let Some(done) = cursor.done.take() {
                            let _ = done.send(());
                        }
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio playback error");
                },
                None,
            )
            .map_err(|e| Error::Playback(e.to_string()))?;

        stream.play().map_err(|e| Error::Playback(e.to_string()))?;
        self.stream = Some(stream);

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            samples = sample_count,
            sample_rate = config.sample_rate.0,
            "playback started"
        );
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!("playback stopped");
        }
    }

    fn is_playing(&self) -> bool {
        self.stream.is_some()
    }
}

/// Identifies one `play` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlaybackId(u64);

/// How a playback ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackEnd {
    pub id: PlaybackId,
    /// False when the device dropped the sound before its last sample
    pub completed: bool,
}

struct ActivePlayback {
    id: PlaybackId,
    done: oneshot::Receiver<()>,
}

/// Plays one payload at a time, replacing any sound in progress
pub struct PlaybackSession {
    output: Box<dyn AudioOutput>,
    active: Option<ActivePlayback>,
    next_id: u64,
}

impl PlaybackSession {
    /// Create a session over an output device
    #[must_use]
    pub fn new(output: Box<dyn AudioOutput>) -> Self {
        Self {
            output,
            active: None,
            next_id: 0,
        }
    }

    /// Decode and play an encoded payload (WAV or MP3)
    ///
    /// # Errors
    ///
    /// Returns `Error::Playback` if decoding or playback fails. A failed
    /// decode leaves the current sound untouched.
    pub fn play(&mut self, bytes: &[u8]) -> Result<PlaybackId> {
        let clip = decode_audio(bytes)?;
        self.play_clip(clip)
    }

    /// Play already-decoded samples
    ///
    /// # Errors
    ///
    /// Returns `Error::Playback` if the output device fails
    pub fn play_clip(&mut self, clip: Clip) -> Result<PlaybackId> {
        // Release the previous sound before acquiring a new one
        self.stop();

        self.next_id += 1;
        let id = PlaybackId(self.next_id);
        let (done_tx, done_rx) = oneshot::channel();

        let duration_ms = u64::try_from(clip.duration().as_millis()).unwrap_or(u64::MAX);
        self.output.start(clip, done_tx)?;
        self.active = Some(ActivePlayback { id, done: done_rx });

        tracing::debug!(id = id.0, duration_ms, "playing response");
        Ok(id)
    }

    /// Stop the current sound, if any
    pub fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            tracing::debug!(id = active.id.0, "playback interrupted");
        }
        self.output.stop();
    }

    /// Whether a sound is in progress
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Wait for the current sound to end; pends forever when idle
    ///
    /// Cancel-safe: dropping the future leaves the playback untouched.
    pub async fn finished(&mut self) -> PlaybackEnd {
        let Some(active) = self.active.as_mut() else {
            return std::future::pending().await;
        };

        let completed = (&mut active.done).await.is_ok();
        let id = active.id;

        self.active = None;
        self.output.stop();

        PlaybackEnd { id, completed }
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.output.stop();
    }
}
