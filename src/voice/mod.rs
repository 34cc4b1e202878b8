//! Voice processing module
//!
//! Handles audio capture, wake word detection, and playback. Each device or
//! engine sits behind a trait so the session coordinator can be driven
//! without hardware.

mod audio;
mod capture;
pub mod feedback;
mod playback;
mod transcriber;
mod wake_word;

pub use audio::{
    Clip, Level, SAMPLE_RATE, decode_audio, downmix, resample, rms, samples_duration,
    samples_to_wav,
};
pub use capture::{
    AudioEncoding, AudioInput, CaptureRejection, CaptureSession, CaptureStart, CaptureStop,
    Container, Microphone, Utterance,
};
pub use feedback::{Acknowledge, Silent, TerminalBell};
pub use playback::{AudioOutput, PlaybackEnd, PlaybackId, PlaybackSession, Speaker};
pub use transcriber::{
    CommandTranscriber, Grammar, StreamingTranscriber, TranscriptEvent, TranscriptKind,
    UNKNOWN_TOKEN, parse_recognizer_line,
};
pub use wake_word::{
    DetectorPhase, DetectorState, PartialPolicy, WakeTrigger, WakeWordDetector, normalize,
};
