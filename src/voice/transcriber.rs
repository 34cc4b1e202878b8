//! Streaming speech recognition
//!
//! The recognizer is an external collaborator. While armed it emits partial
//! and final transcripts into a bounded channel consumed by the wake word
//! detector. `CommandTranscriber` drives a recognizer process that prints one
//! Vosk-style JSON object per line.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::{Error, Result};

/// Longest `disarm` waits for a killed recognizer to exit
const RELEASE_GRACE: Duration = Duration::from_millis(250);

/// Poll interval while reaping a killed recognizer
const REAP_POLL: Duration = Duration::from_millis(2);

/// Catch-all bucket for out-of-grammar speech
pub const UNKNOWN_TOKEN: &str = "[unk]";

/// Whether a transcript may still change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptKind {
    Partial,
    Final,
}

/// One transcript notification from the recognizer
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEvent {
    pub kind: TranscriptKind,
    pub text: String,
    /// Engine confidence in `[0, 1]`, when reported
    pub confidence: Option<f32>,
    pub at: Instant,
}

impl TranscriptEvent {
    /// A partial transcript observed now
    #[must_use]
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            kind: TranscriptKind::Partial,
            text: text.into(),
            confidence: None,
            at: Instant::now(),
        }
    }

    /// A final transcript observed now
    #[must_use]
    pub fn final_result(text: impl Into<String>) -> Self {
        Self {
            kind: TranscriptKind::Final,
            text: text.into(),
            confidence: None,
            at: Instant::now(),
        }
    }

    /// Attach an engine confidence
    #[must_use]
    pub const fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

/// Vocabulary restriction handed to the recognizer on arm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grammar {
    phrases: Vec<String>,
}

impl Grammar {
    /// The trigger phrase plus the unknown bucket
    #[must_use]
    pub fn wake(phrase: &str) -> Self {
        Self {
            phrases: vec![phrase.to_string(), UNKNOWN_TOKEN.to_string()],
        }
    }

    #[must_use]
    pub fn phrases(&self) -> &[String] {
        &self.phrases
    }

    /// JSON array form accepted by Vosk-compatible recognizers
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.phrases)?)
    }
}

/// A continuous speech recognizer
///
/// `arm` starts listening (and holds the input device) until `disarm`.
#[async_trait]
pub trait StreamingTranscriber: Send {
    /// Load a recognition model
    ///
    /// # Errors
    ///
    /// Returns `Error::ModelLoad` if the engine cannot be initialized
    async fn load(&mut self, model: &str) -> Result<()>;

    /// Whether a model is loaded
    fn is_loaded(&self) -> bool;

    /// Start continuous recognition constrained to `grammar`
    ///
    /// # Errors
    ///
    /// Returns `Error::ModelLoad` if no model is loaded, or `Error::Device`
    /// if listening cannot start
    async fn arm(&mut self, grammar: &Grammar) -> Result<mpsc::Receiver<TranscriptEvent>>;

    /// Stop emitting events and release the input device; never blocks
    fn disarm(&mut self);

    /// Release the model
    fn unload(&mut self);
}

/// Vosk result line
#[derive(Debug, Deserialize)]
struct RecognizerLine {
    partial: Option<String>,
    text: Option<String>,
    #[serde(default)]
    result: Vec<WordResult>,
    #[serde(default)]
    partial_result: Vec<WordResult>,
}

#[derive(Debug, Deserialize)]
struct WordResult {
    conf: f32,
}

#[allow(clippy::cast_precision_loss)]
fn mean_confidence(words: &[WordResult]) -> Option<f32> {
    if words.is_empty() {
        return None;
    }
    Some(words.iter().map(|w| w.conf).sum::<f32>() / words.len() as f32)
}

/// Parse one recognizer output line
///
/// Returns `None` for lines that are expected noise: non-JSON output, or
/// objects carrying neither a partial nor a final text.
#[must_use]
pub fn parse_recognizer_line(line: &str) -> Option<TranscriptEvent> {
    let parsed: RecognizerLine = match serde_json::from_str(line.trim()) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::trace!(error = %e, "ignoring recognizer output");
            return None;
        }
    };

    let (kind, text, confidence) = if let Some(text) = parsed.text {
        (TranscriptKind::Final, text, mean_confidence(&parsed.result))
    } else if let Some(text) = parsed.partial {
        (
            TranscriptKind::Partial,
            text,
            mean_confidence(&parsed.partial_result),
        )
    } else {
        return None;
    };

    Some(TranscriptEvent {
        kind,
        text,
        confidence,
        at: Instant::now(),
    })
}

/// Runs an external streaming recognizer process
///
/// The process owns the microphone while it runs. `disarm` kills it and
/// reaps it (bounded by a short grace period) before returning, so the
/// device is free by the time a capture opens it.
pub struct CommandTranscriber {
    program: String,
    args: Vec<String>,
    sample_rate: u32,
    buffer: usize,
    resolved: Option<PathBuf>,
    model: Option<String>,
    child: Option<Child>,
    reader: Option<JoinHandle<()>>,
}

impl CommandTranscriber {
    /// Create a transcriber for `program`; nothing is spawned until `arm`
    #[must_use]
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        sample_rate: u32,
        buffer: usize,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            sample_rate,
            buffer: buffer.max(1),
            resolved: None,
            model: None,
            child: None,
            reader: None,
        }
    }

    /// Process id of the running recognizer, if armed
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Models given as paths must exist; bare identifiers are left to the recognizer
    fn check_model(model: &str) -> Result<()> {
        let path = Path::new(model);
        let looks_like_path = path.is_absolute() || model.contains(std::path::MAIN_SEPARATOR);
        if looks_like_path && !path.exists() {
            return Err(Error::ModelLoad(format!("model not found: {model}")));
        }
        Ok(())
    }
}

#[async_trait]
impl StreamingTranscriber for CommandTranscriber {
    async fn load(&mut self, model: &str) -> Result<()> {
        let resolved = which::which(&self.program).map_err(|e| {
            Error::ModelLoad(format!("recognizer {} not found: {e}", self.program))
        })?;
        Self::check_model(model)?;

        tracing::info!(
            recognizer = %resolved.display(),
            model,
            "recognition model ready"
        );

        self.resolved = Some(resolved);
        self.model = Some(model.to_string());
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.resolved.is_some() && self.model.is_some()
    }

    async fn arm(&mut self, grammar: &Grammar) -> Result<mpsc::Receiver<TranscriptEvent>> {
        let (Some(program), Some(model)) = (self.resolved.clone(), self.model.clone()) else {
            return Err(Error::ModelLoad("no model loaded".to_string()));
        };

        self.disarm();

        let mut child = Command::new(&program)
            .arg("--model")
            .arg(&model)
            .arg("--grammar")
            .arg(grammar.to_json()?)
            .arg("--sample-rate")
            .arg(self.sample_rate.to_string())
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Device(format!("failed to start recognizer: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Device("recognizer stdout unavailable".to_string()))?;

        let (tx, rx) = mpsc::channel(self.buffer);
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let Some(event) = parse_recognizer_line(&line) else {
                            continue;
                        };
                        tracing::trace!(kind = ?event.kind, text = %event.text, "transcript");
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        tracing::debug!("recognizer output closed");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "recognizer read failed");
                        break;
                    }
                }
            }
        });

        tracing::debug!(pid = child.id(), "recognizer armed");
        self.child = Some(child);
        self.reader = Some(reader);
        Ok(rx)
    }

    fn disarm(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                tracing::debug!(error = %e, "recognizer already exited");
            }
            reap(&mut child);
            tracing::debug!("recognizer disarmed");
        }
    }

    fn unload(&mut self) {
        self.disarm();
        self.resolved = None;
        self.model = None;
    }
}

/// Wait for a killed recognizer to exit so it no longer holds the device
///
/// Gives up after `RELEASE_GRACE`; `kill_on_drop` and the runtime's orphan
/// reaper take over from there.
fn reap(child: &mut Child) {
    let deadline = std::time::Instant::now() + RELEASE_GRACE;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::trace!(%status, "recognizer exited");
                return;
            }
            Ok(None) if std::time::Instant::now() < deadline => std::thread::sleep(REAP_POLL),
            Ok(None) => {
                tracing::warn!("recognizer still running after kill");
                return;
            }
            Err(e) => {
                tracing::debug!(error = %e, "could not reap recognizer");
                return;
            }
        }
    }
}

impl Drop for CommandTranscriber {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_partial() {
        let event = parse_recognizer_line(r#"{"partial" : "radha"}"#).unwrap();
        assert_eq!(event.kind, TranscriptKind::Partial);
        assert_eq!(event.text, "radha");
        assert!(event.confidence.is_none());
    }

    #[test]
    fn test_parse_final_with_confidence() {
        let line = r#"{"result":[{"conf":1.0,"word":"radha"},{"conf":0.5,"word":"[unk]"}],"text":"radha [unk]"}"#;
        let event = parse_recognizer_line(line).unwrap();
        assert_eq!(event.kind, TranscriptKind::Final);
        assert_eq!(event.text, "radha [unk]");
        assert!((event.confidence.unwrap() - 0.75).abs() < f32::EPSILON);
    }

    #[test]
    fn test_noise_is_ignored() {
        assert!(parse_recognizer_line("LOG (VoskAPI:ReadDataFiles())").is_none());
        assert!(parse_recognizer_line(r#"{"other": 1}"#).is_none());
        assert!(parse_recognizer_line("").is_none());
    }

    #[test]
    fn test_wake_grammar() {
        let grammar = Grammar::wake("radha");
        assert_eq!(grammar.phrases(), ["radha", "[unk]"]);
        assert_eq!(grammar.to_json().unwrap(), r#"["radha","[unk]"]"#);
    }

    #[tokio::test]
    async fn test_arm_requires_model() {
        let mut transcriber = CommandTranscriber::new("vosk-stream", Vec::new(), 16000, 8);
        let err = transcriber.arm(&Grammar::wake("radha")).await.unwrap_err();
        assert!(matches!(err, Error::ModelLoad(_)));
    }

    #[tokio::test]
    async fn test_missing_program_is_model_load_error() {
        let mut transcriber =
            CommandTranscriber::new("wakelink-no-such-recognizer", Vec::new(), 16000, 8);
        let err = transcriber.load("model-en").await.unwrap_err();
        assert!(matches!(err, Error::ModelLoad(_)));
        assert!(!transcriber.is_loaded());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_disarm_waits_for_process_exit() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("recognizer");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let program = script.to_string_lossy().into_owned();
        let mut transcriber = CommandTranscriber::new(program, Vec::new(), 16000, 8);
        transcriber.load("model-en").await.unwrap();
        let _events = transcriber.arm(&Grammar::wake("radha")).await.unwrap();

        let pid = transcriber.pid().unwrap();
        let proc_entry = std::path::PathBuf::from(format!("/proc/{pid}"));
        assert!(proc_entry.exists());

        transcriber.disarm();
        assert!(transcriber.pid().is_none());
        assert!(!proc_entry.exists());
    }
}
