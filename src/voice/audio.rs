//! PCM helpers shared by capture and playback
//!
//! WAV encoding for outbound utterances, WAV/MP3 decoding for inbound
//! responses, and sample-rate conversion between devices and payloads.

use std::io::Cursor;
use std::time::Duration;

use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Resampler chunk size in frames
const RESAMPLE_CHUNK: usize = 1024;

/// Decoded mono audio ready for an output device
#[derive(Debug, Clone, PartialEq)]
pub struct Clip {
    /// Mono samples in `[-1.0, 1.0]`
    pub samples: Vec<f32>,
    /// Samples per second
    pub sample_rate: u32,
}

impl Clip {
    /// Create a clip from mono samples
    #[must_use]
    pub const fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Playback length
    #[must_use]
    pub fn duration(&self) -> Duration {
        samples_duration(self.samples.len(), self.sample_rate)
    }

    /// Whether there is nothing to play
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Duration covered by `count` mono samples at `sample_rate`
#[must_use]
pub fn samples_duration(count: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    let millis = (count as u64).saturating_mul(1000) / u64::from(sample_rate);
    Duration::from_millis(millis)
}

/// Convert f32 samples to 16-bit mono WAV bytes
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            // Convert f32 [-1.0, 1.0] to i16
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

/// Decode a response payload into a mono clip
///
/// WAV is detected by its RIFF/WAVE header; anything else is tried as MP3.
///
/// # Errors
///
/// Returns `Error::Playback` if the payload is not decodable audio
pub fn decode_audio(bytes: &[u8]) -> Result<Clip> {
    if bytes.is_empty() {
        return Err(Error::Playback("empty audio payload".to_string()));
    }

    if is_wav(bytes) {
        decode_wav(bytes)
    } else {
        decode_mp3(bytes)
    }
}

fn is_wav(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE"
}

/// Decode WAV bytes (any integer width or float) to mono f32
#[allow(clippy::cast_precision_loss)]
fn decode_wav(bytes: &[u8]) -> Result<Clip> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| Error::Playback(format!("WAV decode error: {e}")))?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Playback(format!("WAV decode error: {e}")))?,
        hound::SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Playback(format!("WAV decode error: {e}")))?
        }
    };

    Ok(Clip::new(
        downmix(&interleaved, usize::from(spec.channels)),
        spec.sample_rate,
    ))
}

/// Decode MP3 bytes to mono f32 samples
fn decode_mp3(mp3_data: &[u8]) -> Result<Clip> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = 0_u32;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate = u32::try_from(frame.sample_rate).unwrap_or(0);
                let frame_samples: Vec<f32> =
                    frame.data.iter().map(|&s| f32::from(s) / 32768.0).collect();
                samples.extend(downmix(&frame_samples, frame.channels));
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Playback(format!("MP3 decode error: {e}"))),
        }
    }

    if samples.is_empty() || sample_rate == 0 {
        return Err(Error::Playback(
            "payload is neither WAV nor MP3 audio".to_string(),
        ));
    }

    Ok(Clip::new(samples, sample_rate))
}

/// Average interleaved frames down to one channel
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }

    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Resample mono audio using rubato
///
/// # Errors
///
/// Returns error if the resampler cannot be built or fails
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    use rubato::{FftFixedIn, Resampler};

    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let mut resampler = FftFixedIn::<f64>::new(
        from_rate as usize,
        to_rate as usize,
        RESAMPLE_CHUNK,
        2,
        1,
    )
    .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;

    let input: Vec<f64> = samples.iter().map(|&s| f64::from(s)).collect();
    let mut output = Vec::with_capacity(input.len() * to_rate as usize / from_rate as usize + 1);

    for chunk in input.chunks(RESAMPLE_CHUNK) {
        // The last chunk is zero-padded; the excess is trimmed below
        let mut block = chunk.to_vec();
        block.resize(RESAMPLE_CHUNK, 0.0);

        let result = resampler
            .process(&[block], None)
            .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
        output.extend_from_slice(&result[0]);
    }

    let expected = (samples.len() as f64 * f64::from(to_rate) / f64::from(from_rate)).round() as usize;
    output.truncate(expected);

    Ok(output.iter().map(|&s| s as f32).collect())
}

/// Calculate RMS energy of audio samples
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Loudness of one block of input
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Level {
    pub rms: f32,
    pub peak: f32,
}

impl Level {
    #[must_use]
    pub fn measure(samples: &[f32]) -> Self {
        Self {
            rms: rms(samples),
            peak: samples.iter().map(|s| s.abs()).fold(0.0, f32::max),
        }
    }

    /// Fixed-width bar; full scale is an RMS of `0.5`
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn meter(&self, width: usize) -> String {
        let filled = ((self.rms * 2.0).clamp(0.0, 1.0) * width as f32).round() as usize;
        format!("{}{}", "#".repeat(filled), " ".repeat(width - filled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_energy_calculation() {
        let silence = vec![0.0f32; 100];
        assert!(rms(&silence) < 0.001);

        let loud = vec![0.5f32; 100];
        assert!(rms(&loud) > 0.4);
    }

    #[test]
    fn test_level_meter() {
        let level = Level::measure(&[0.25, -0.25, 0.25, -0.25]);
        assert!((level.peak - 0.25).abs() < f32::EPSILON);
        assert_eq!(level.meter(10), "#####     ");

        assert_eq!(Level::measure(&[]).meter(4), "    ");
        assert_eq!(Level::measure(&[-1.0, 1.0]).meter(4), "####");
    }

    #[test]
    fn test_downmix_stereo() {
        let stereo = [0.5, -0.5, 1.0, 0.0];
        assert_eq!(downmix(&stereo, 2), vec![0.0, 0.5]);
        assert_eq!(downmix(&stereo, 1), stereo.to_vec());
    }

    #[test]
    fn test_decode_wav_header_sniffing() {
        let wav = samples_to_wav(&[0.0, 0.5, -0.5], 22050).unwrap();
        let clip = decode_audio(&wav).unwrap();

        assert_eq!(clip.sample_rate, 22050);
        assert_eq!(clip.samples.len(), 3);
        assert!((clip.samples[1] - 0.5).abs() < 0.001);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = decode_audio(b"definitely not audio").unwrap_err();
        assert!(matches!(err, Error::Playback(_)));

        let err = decode_audio(&[]).unwrap_err();
        assert!(matches!(err, Error::Playback(_)));
    }

    #[test]
    fn test_resample_length() {
        let input = vec![0.1f32; 16000];
        let output = resample(&input, 16000, 24000).unwrap();
        assert!(output.len() <= 24000);
        assert!(output.len() > 23000);

        let same = resample(&input, 16000, 16000).unwrap();
        assert_eq!(same.len(), input.len());
    }

    #[test]
    fn test_samples_duration() {
        assert_eq!(samples_duration(8000, 16000), Duration::from_millis(500));
        assert_eq!(samples_duration(10, 0), Duration::ZERO);
    }
}
