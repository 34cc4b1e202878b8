//! Voice pipeline integration tests
//!
//! Tests voice components without requiring audio hardware

use std::io::Cursor;
use std::time::Duration;

use tokio::time::Instant;
use wakelink::voice::{
    CaptureRejection, CaptureSession, CaptureStart, CaptureStop, Clip, DetectorPhase,
    PlaybackSession, SAMPLE_RATE, Silent, TranscriptEvent, WakeWordDetector, decode_audio,
    samples_to_wav,
};

mod common;

use common::{FakeInput, FakeOutput, FakeTranscriber, MicTracker, RecognizerProbe, SpeakerProbe};

/// Generate sine wave audio samples
fn generate_sine_samples(frequency: f32, duration_secs: f32, amplitude: f32) -> Vec<f32> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}

async fn armed_detector(cooldown_ms: u64) -> (WakeWordDetector, RecognizerProbe, MicTracker) {
    let mic = MicTracker::default();
    let probe = RecognizerProbe::default();
    let mut detector = WakeWordDetector::new(
        "radha",
        Box::new(FakeTranscriber::new(mic.clone(), probe.clone())),
        Box::new(Silent),
        Duration::from_millis(cooldown_ms),
    );
    detector.load("model-en").await.unwrap();
    detector.start().await.unwrap();
    (detector, probe, mic)
}

#[tokio::test]
async fn test_wake_word_detector_creation() {
    let mic = MicTracker::default();
    let detector = WakeWordDetector::new(
        "  Hey RADHA ",
        Box::new(FakeTranscriber::new(mic, RecognizerProbe::default())),
        Box::new(Silent),
        Duration::from_secs(3),
    );

    assert_eq!(detector.phrase(), "hey radha");
    assert!(!detector.is_armed());
    assert!(!detector.is_ready());
    assert_eq!(detector.phase(Instant::now()), DetectorPhase::Disarmed);
}

#[tokio::test]
async fn test_arming_holds_recognizer() {
    let (detector, probe, mic) = armed_detector(3000).await;

    assert!(detector.is_armed());
    assert!(probe.is_armed());
    assert_eq!(mic.arms(), 1);
    assert_eq!(probe.grammars()[0].phrases(), ["radha", "[unk]"]);
}

#[tokio::test]
async fn test_next_trigger_skips_other_speech() {
    let (mut detector, probe, _mic) = armed_detector(3000).await;

    assert!(probe.say(TranscriptEvent::partial("rad")).await);
    assert!(probe.say(TranscriptEvent::partial("[unk]")).await);
    assert!(probe.say(TranscriptEvent::final_result("Radha")).await);

    let trigger = detector.next_trigger().await.unwrap();
    assert_eq!(trigger.text, "Radha");
    assert!(!detector.is_armed());
    assert!(!probe.is_armed());
}

#[tokio::test(start_paused = true)]
async fn test_cooldown_suppresses_until_expiry() {
    let (mut detector, _probe, _mic) = armed_detector(3000).await;
    let start = Instant::now();

    assert!(detector
        .observe(&TranscriptEvent::partial("radha"), start)
        .is_some());

    // Re-armed inside the cooldown window: matches are still suppressed
    detector.start().await.unwrap();
    assert_eq!(detector.phase(start), DetectorPhase::Cooldown);
    for offset in [0, 500, 1000, 2999] {
        let now = start + Duration::from_millis(offset);
        assert!(detector
            .observe(&TranscriptEvent::final_result("radha"), now)
            .is_none());
    }
    assert!(detector.is_armed());

    let after = start + Duration::from_millis(3000);
    assert_eq!(detector.phase(after), DetectorPhase::Armed);
    assert!(detector
        .observe(&TranscriptEvent::final_result("radha"), after)
        .is_some());
}

#[tokio::test]
async fn test_events_after_stop_are_discarded() {
    let (mut detector, _probe, mic) = armed_detector(3000).await;

    detector.stop();
    assert_eq!(mic.holder(), None);
    assert!(detector
        .observe(&TranscriptEvent::final_result("radha"), Instant::now())
        .is_none());

    detector.stop();
    assert!(!detector.is_armed());
}

#[test]
fn test_capture_stop_without_recording_is_noop() {
    let mic = MicTracker::default();
    let mut capture = CaptureSession::new(Box::new(FakeInput::new(mic.clone())));

    assert!(matches!(capture.stop().unwrap(), CaptureStop::Empty));
    assert!(matches!(capture.stop().unwrap(), CaptureStop::Empty));
    assert_eq!(mic.captures(), 0);
    assert!(!capture.is_recording());
}

#[test]
fn test_capture_rejections() {
    let mic = MicTracker::default();
    let mut capture = CaptureSession::new(Box::new(FakeInput::new(mic.clone())));

    assert_eq!(
        capture.start(false),
        CaptureStart::Rejected(CaptureRejection::NotConnected)
    );
    assert_eq!(capture.start(true), CaptureStart::Recording);
    assert_eq!(
        capture.start(true),
        CaptureStart::Rejected(CaptureRejection::AlreadyRecording)
    );
    assert_eq!(mic.captures(), 1);

    let mut broken = CaptureSession::new(Box::new(FakeInput::failing(mic)));
    assert!(matches!(
        broken.start(true),
        CaptureStart::Rejected(CaptureRejection::Device(_))
    ));
    assert!(!broken.is_recording());
}

#[test]
fn test_capture_produces_wav_utterance() {
    let mic = MicTracker::default();
    let mut capture = CaptureSession::new(Box::new(FakeInput::new(mic.clone())));

    assert_eq!(capture.start(true), CaptureStart::Recording);
    let CaptureStop::Utterance(utterance) = capture.stop().unwrap() else {
        panic!("expected an utterance");
    };

    assert_eq!(mic.holder(), None);
    assert_eq!(utterance.encoding().sample_rate, 16000);
    assert_eq!(utterance.duration(), Duration::from_millis(100));

    let reader = hound::WavReader::new(Cursor::new(utterance.bytes())).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.channels, 1);
    assert_eq!(spec.bits_per_sample, 16);
    assert_eq!(reader.len(), 1600);
}

#[test]
fn test_wav_encoding() {
    let samples = generate_sine_samples(440.0, 0.5, 0.5);
    let wav = samples_to_wav(&samples, SAMPLE_RATE).unwrap();

    let clip = decode_audio(&wav).unwrap();
    assert_eq!(clip.sample_rate, SAMPLE_RATE);
    assert_eq!(clip.samples.len(), samples.len());
    assert_eq!(clip.duration(), Duration::from_millis(500));
}

#[tokio::test]
async fn test_playback_replaces_previous_sound() {
    let speaker = SpeakerProbe::default();
    let mut playback = PlaybackSession::new(Box::new(FakeOutput::new(speaker.clone())));
    let wav = samples_to_wav(&generate_sine_samples(440.0, 0.1, 0.3), SAMPLE_RATE).unwrap();

    let first = playback.play(&wav).unwrap();
    let second = playback.play(&wav).unwrap();

    assert_ne!(first, second);
    assert_eq!(speaker.starts(), 2);
    assert_eq!(speaker.stops(), 1);
    assert_eq!(speaker.max_playing(), 1);

    speaker.finish();
    let end = playback.finished().await;
    assert_eq!(end.id, second);
    assert!(end.completed);
    assert!(!playback.is_active());
    assert!(!speaker.is_playing());
}

#[test]
fn test_playback_rejects_garbage_without_interrupting() {
    let speaker = SpeakerProbe::default();
    let mut playback = PlaybackSession::new(Box::new(FakeOutput::new(speaker.clone())));

    playback.play_clip(Clip::new(vec![0.0; 160], 16000)).unwrap();
    assert!(playback.play(b"garbage").is_err());

    assert!(playback.is_active());
    assert_eq!(speaker.stops(), 0);
}
