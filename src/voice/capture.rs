//! Audio capture from microphone
//!
//! `CaptureSession` owns one bounded recording at a time. The input device is
//! acquired on `start` and released on every exit path of `stop`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};

use super::audio::{downmix, resample, samples_duration, samples_to_wav};
use crate::{Error, Result};

/// A microphone-like source that can be opened and closed repeatedly
///
/// Implementations hold the physical input device only between `open` and `close`.
pub trait AudioInput {
    /// Acquire the device and start buffering samples, discarding older ones
    ///
    /// # Errors
    ///
    /// Returns `Error::Device` if the device cannot be acquired
    fn open(&mut self) -> Result<()>;

    /// Release the device; buffered samples remain available
    fn close(&mut self);

    /// Whether the device is currently held
    fn is_open(&self) -> bool;

    /// Drain buffered samples as mono f32 at `sample_rate()`
    ///
    /// # Errors
    ///
    /// Returns error if the buffered audio cannot be converted
    fn take_samples(&mut self) -> Result<Vec<f32>>;

    /// Rate of the samples returned by `take_samples`
    fn sample_rate(&self) -> u32;
}

/// Captures audio from the default input device
pub struct Microphone {
    target_rate: u32,
    buffer: Arc<Mutex<Vec<f32>>>,
    stream: Option<Stream>,
    stream_rate: u32,
    stream_channels: u16,
}

impl Microphone {
    /// Create a microphone that delivers samples at `sample_rate`
    ///
    /// The device itself is not touched until `open`.
    #[must_use]
    pub fn new(sample_rate: u32) -> Self {
        Self {
            target_rate: sample_rate,
            buffer: Arc::new(Mutex::new(Vec::new())),
            stream: None,
            stream_rate: sample_rate,
            stream_channels: 1,
        }
    }

    fn clear_buffer(&self) {
        if let Ok(mut buf) = self.buffer.lock() {
            buf.clear();
        }
    }

    /// Pick mono at the target rate if the device offers it, else the device default
    fn select_config(&self, device: &cpal::Device) -> Result<StreamConfig> {
        let preferred = device
            .supported_input_configs()
            .map_err(|e| Error::Device(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.sample_format() == cpal::SampleFormat::F32
                    && c.min_sample_rate() <= SampleRate(self.target_rate)
                    && c.max_sample_rate() >= SampleRate(self.target_rate)
            });

        if let Some(range) = preferred {
            return Ok(range.with_sample_rate(SampleRate(self.target_rate)).config());
        }

        let fallback = device
            .default_input_config()
            .map_err(|e| Error::Device(e.to_string()))?;
        tracing::debug!(
            sample_rate = fallback.sample_rate().0,
            channels = fallback.channels(),
            "no mono input at target rate, using device default"
        );
        Ok(fallback.config())
    }
}

impl AudioInput for Microphone {
    fn open(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Device("no input device available".to_string()))?;
        let config = self.select_config(&device)?;

        self.clear_buffer();
        let buffer = Arc::clone(&self.buffer);

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if let Ok(mut buf) = buffer.lock() {
                        buf.extend_from_slice(data);
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio capture error");
                },
                None,
            )
            .map_err(|e| Error::Device(e.to_string()))?;

        stream.play().map_err(|e| Error::Device(e.to_string()))?;

        self.stream_rate = config.sample_rate.0;
        self.stream_channels = config.channels;
        self.stream = Some(stream);

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = self.stream_rate,
            channels = self.stream_channels,
            "audio capture started"
        );
        Ok(())
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!("audio capture stopped");
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn take_samples(&mut self) -> Result<Vec<f32>> {
        let raw = self
            .buffer
            .lock()
            .map(|mut buf| std::mem::take(&mut *buf))
            .unwrap_or_default();

        let mono = downmix(&raw, usize::from(self.stream_channels));
        resample(&mono, self.stream_rate, self.target_rate)
    }

    fn sample_rate(&self) -> u32 {
        self.target_rate
    }
}

/// Container of an encoded utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    /// RIFF/WAVE
    Wav,
}

/// Describes how utterance bytes are encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioEncoding {
    pub container: Container,
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl AudioEncoding {
    /// 16-bit PCM mono WAV at `sample_rate`
    #[must_use]
    pub const fn wav_pcm16(sample_rate: u32) -> Self {
        Self {
            container: Container::Wav,
            sample_rate,
            channels: 1,
            bits_per_sample: 16,
        }
    }
}

/// One finished recording, consumed exactly once by the transport
#[derive(Debug)]
pub struct Utterance {
    bytes: Vec<u8>,
    encoding: AudioEncoding,
    duration: Duration,
}

impl Utterance {
    /// Wrap already-encoded bytes
    #[must_use]
    pub const fn new(bytes: Vec<u8>, encoding: AudioEncoding, duration: Duration) -> Self {
        Self {
            bytes,
            encoding,
            duration,
        }
    }

    /// Encoded payload
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Give up the payload for sending
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    #[must_use]
    pub const fn encoding(&self) -> AudioEncoding {
        self.encoding
    }

    /// Approximate spoken length
    #[must_use]
    pub const fn duration(&self) -> Duration {
        self.duration
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Why a capture could not start
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureRejection {
    /// A recording is already active
    AlreadyRecording,
    /// The remote link is not open
    NotConnected,
    /// The input device could not be acquired
    Device(String),
}

impl std::fmt::Display for CaptureRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyRecording => write!(f, "already recording"),
            Self::NotConnected => write!(f, "not connected"),
            Self::Device(cause) => write!(f, "microphone unavailable: {cause}"),
        }
    }
}

/// Outcome of `CaptureSession::start`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureStart {
    /// The device is held and recording
    Recording,
    /// Nothing was acquired
    Rejected(CaptureRejection),
}

/// Outcome of `CaptureSession::stop`
#[derive(Debug)]
pub enum CaptureStop {
    /// A non-empty recording
    Utterance(Utterance),
    /// No recording was active, or it captured no audio
    Empty,
}

/// Manages one bounded recording at a time
pub struct CaptureSession {
    input: Box<dyn AudioInput>,
    recording: bool,
}

impl CaptureSession {
    /// Create a session over an input source
    #[must_use]
    pub fn new(input: Box<dyn AudioInput>) -> Self {
        Self {
            input,
            recording: false,
        }
    }

    /// Begin recording
    ///
    /// Rejected if a recording is active, the link is not open, or the device
    /// cannot be acquired. Never panics on device failure.
    pub fn start(&mut self, link_open: bool) -> CaptureStart {
        if self.recording {
            return CaptureStart::Rejected(CaptureRejection::AlreadyRecording);
        }
        if !link_open {
            return CaptureStart::Rejected(CaptureRejection::NotConnected);
        }

        match self.input.open() {
            Ok(()) => {
                self.recording = true;
                tracing::debug!(sample_rate = self.input.sample_rate(), "recording started");
                CaptureStart::Recording
            }
            Err(e) => {
                // Partial acquisition must not leak the device
                self.input.close();
                tracing::warn!(error = %e, "failed to start recording");
                CaptureStart::Rejected(CaptureRejection::Device(e.to_string()))
            }
        }
    }

    /// Finish recording and return the encoded utterance
    ///
    /// Returns `Empty` with no side effects when no recording is active. The
    /// device is released before encoding, so it is never left held.
    ///
    /// # Errors
    ///
    /// Returns error if the recorded audio cannot be encoded
    pub fn stop(&mut self) -> Result<CaptureStop> {
        if !self.recording {
            return Ok(CaptureStop::Empty);
        }

        self.recording = false;
        self.input.close();

        let samples = self.input.take_samples()?;
        if samples.is_empty() {
            tracing::debug!("recording captured no audio");
            return Ok(CaptureStop::Empty);
        }

        let sample_rate = self.input.sample_rate();
        let bytes = samples_to_wav(&samples, sample_rate)?;
        let duration = samples_duration(samples.len(), sample_rate);

        tracing::debug!(
            bytes = bytes.len(),
            duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            "recording finished"
        );

        Ok(CaptureStop::Utterance(Utterance::new(
            bytes,
            AudioEncoding::wav_pcm16(sample_rate),
            duration,
        )))
    }

    /// Whether a recording is active
    #[must_use]
    pub const fn is_recording(&self) -> bool {
        self.recording
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if self.recording || self.input.is_open() {
            self.input.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Input that yields a fixed buffer and counts acquisitions
    struct StubInput {
        open: bool,
        opens: Arc<Mutex<u32>>,
        samples: Vec<f32>,
        fail_open: bool,
    }

    impl AudioInput for StubInput {
        fn open(&mut self) -> Result<()> {
            if self.fail_open {
                return Err(Error::Device("busy".to_string()));
            }
            self.open = true;
            *self.opens.lock().unwrap() += 1;
            Ok(())
        }

        fn close(&mut self) {
            self.open = false;
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn take_samples(&mut self) -> Result<Vec<f32>> {
            if self.open {
                Ok(Vec::new())
            } else {
                Ok(self.samples.clone())
            }
        }

        fn sample_rate(&self) -> u32 {
            16000
        }
    }

    fn stub(samples: Vec<f32>, fail_open: bool) -> (CaptureSession, Arc<Mutex<u32>>) {
        let opens = Arc::new(Mutex::new(0));
        let input = StubInput {
            open: false,
            opens: Arc::clone(&opens),
            samples,
            fail_open,
        };
        (CaptureSession::new(Box::new(input)), opens)
    }

    #[test]
    fn test_start_requires_link() {
        let (mut session, opens) = stub(vec![0.1; 160], false);

        assert_eq!(
            session.start(false),
            CaptureStart::Rejected(CaptureRejection::NotConnected)
        );
        assert_eq!(*opens.lock().unwrap(), 0);
    }

    #[test]
    fn test_double_start_rejected() {
        let (mut session, opens) = stub(vec![0.1; 160], false);

        assert_eq!(session.start(true), CaptureStart::Recording);
        assert_eq!(
            session.start(true),
            CaptureStart::Rejected(CaptureRejection::AlreadyRecording)
        );
        assert_eq!(*opens.lock().unwrap(), 1);
    }

    #[test]
    fn test_device_failure_is_rejection() {
        let (mut session, _) = stub(Vec::new(), true);

        let outcome = session.start(true);
        assert!(matches!(
            outcome,
            CaptureStart::Rejected(CaptureRejection::Device(_))
        ));
        assert!(!session.is_recording());
    }

    #[test]
    fn test_stop_encodes_wav() {
        let (mut session, _) = stub(vec![0.25; 8000], false);
        session.start(true);

        let CaptureStop::Utterance(utterance) = session.stop().unwrap() else {
            panic!("expected an utterance");
        };
        assert_eq!(&utterance.bytes()[0..4], b"RIFF");
        assert_eq!(utterance.duration(), Duration::from_millis(500));
        assert_eq!(utterance.encoding(), AudioEncoding::wav_pcm16(16000));
        assert!(!session.is_recording());
    }

    #[test]
    fn test_stop_without_recording_is_empty() {
        let (mut session, opens) = stub(vec![0.25; 8000], false);

        assert!(matches!(session.stop().unwrap(), CaptureStop::Empty));
        assert!(matches!(session.stop().unwrap(), CaptureStop::Empty));
        assert_eq!(*opens.lock().unwrap(), 0);
    }
}
