//! Wake word detection
//!
//! Consumes transcript events from a streaming recognizer and fires a single
//! trigger when the configured phrase is heard. After a trigger the detector
//! disarms the recognizer (freeing the microphone) and suppresses further
//! triggers for a cooldown window. Re-arming is the caller's job.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use super::feedback::Acknowledge;
use super::transcriber::{Grammar, StreamingTranscriber, TranscriptEvent, TranscriptKind};
use crate::config::WakeConfig;
use crate::{Error, Result};

/// Arming and refractory state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DetectorState {
    /// The recognizer is running and events are being matched
    pub armed: bool,
    /// Triggers are suppressed until this instant
    pub cooldown_until: Option<Instant>,
}

/// Externally visible detector phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorPhase {
    Disarmed,
    Armed,
    Cooldown,
}

/// Emitted once per detected trigger phrase
#[derive(Debug, Clone, PartialEq)]
pub struct WakeTrigger {
    /// Transcript text that matched
    pub text: String,
    pub kind: TranscriptKind,
    pub at: Instant,
}

/// When partial transcripts are allowed to trigger
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PartialPolicy {
    pub enabled: bool,
    /// Ignore partials reporting a lower confidence
    pub min_confidence: Option<f32>,
}

impl Default for PartialPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            min_confidence: None,
        }
    }
}

impl PartialPolicy {
    fn admits(&self, event: &TranscriptEvent) -> bool {
        if event.kind == TranscriptKind::Final {
            return true;
        }
        if !self.enabled {
            return false;
        }
        match (self.min_confidence, event.confidence) {
            (Some(min), Some(confidence)) => confidence >= min,
            _ => true,
        }
    }
}

/// Lowercase and trim a transcript for comparison
#[must_use]
pub fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Detects the trigger phrase in a transcript stream
pub struct WakeWordDetector {
    phrase: String,
    transcriber: Box<dyn StreamingTranscriber>,
    feedback: Box<dyn Acknowledge>,
    state: DetectorState,
    events: Option<mpsc::Receiver<TranscriptEvent>>,
    cooldown: Duration,
    partials: PartialPolicy,
}

impl WakeWordDetector {
    /// Create a disarmed detector
    #[must_use]
    pub fn new(
        phrase: &str,
        transcriber: Box<dyn StreamingTranscriber>,
        feedback: Box<dyn Acknowledge>,
        cooldown: Duration,
    ) -> Self {
        let phrase = normalize(phrase);
        tracing::debug!(phrase, "wake word detector initialized");

        Self {
            phrase,
            transcriber,
            feedback,
            state: DetectorState::default(),
            events: None,
            cooldown,
            partials: PartialPolicy::default(),
        }
    }

    /// Create a detector from the wake section of the config
    #[must_use]
    pub fn from_config(
        config: &WakeConfig,
        transcriber: Box<dyn StreamingTranscriber>,
        feedback: Box<dyn Acknowledge>,
    ) -> Self {
        Self::new(&config.phrase, transcriber, feedback, config.cooldown).with_partial_policy(
            PartialPolicy {
                enabled: config.trigger_on_partial,
                min_confidence: config.partial_min_confidence,
            },
        )
    }

    #[must_use]
    pub const fn with_partial_policy(mut self, partials: PartialPolicy) -> Self {
        self.partials = partials;
        self
    }

    /// Load the recognition model
    ///
    /// # Errors
    ///
    /// Returns `Error::ModelLoad` if the recognizer cannot be initialized
    pub async fn load(&mut self, model: &str) -> Result<()> {
        self.transcriber.load(model).await
    }

    /// Whether `start` can succeed
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.transcriber.is_loaded()
    }

    /// Arm the recognizer and start matching; no-op when already armed
    ///
    /// # Errors
    ///
    /// Returns `Error::ModelLoad` without a loaded model, or the recognizer's
    /// error if listening cannot start. The detector stays disarmed on error.
    pub async fn start(&mut self) -> Result<()> {
        if self.state.armed {
            return Ok(());
        }
        if !self.transcriber.is_loaded() {
            return Err(Error::ModelLoad("recognition model not loaded".to_string()));
        }

        let events = self.transcriber.arm(&Grammar::wake(&self.phrase)).await?;
        self.events = Some(events);
        self.state.armed = true;

        tracing::debug!(phrase = %self.phrase, "wake word armed");
        Ok(())
    }

    /// Disarm and clear any cooldown; safe to call repeatedly
    pub fn stop(&mut self) {
        let was_armed = self.state.armed;
        self.disarm();
        self.state.cooldown_until = None;

        if was_armed {
            tracing::debug!("wake word disarmed");
        }
    }

    /// Stop and release the model
    pub fn unload(&mut self) {
        self.stop();
        self.transcriber.unload();
    }

    fn disarm(&mut self) {
        self.state.armed = false;
        self.events = None;
        self.transcriber.disarm();
    }

    /// Match one transcript event
    ///
    /// Fires at most once per cooldown window. A firing disarms the
    /// recognizer and acknowledges before returning.
    pub fn observe(&mut self, event: &TranscriptEvent, now: Instant) -> Option<WakeTrigger> {
        if !self.state.armed {
            tracing::trace!(text = %event.text, "discarding transcript while disarmed");
            return None;
        }
        if !self.partials.admits(event) {
            return None;
        }
        if normalize(&event.text) != self.phrase {
            return None;
        }
        if self.state.cooldown_until.is_some_and(|until| now < until) {
            tracing::debug!("trigger suppressed by cooldown");
            return None;
        }

        self.state.cooldown_until = Some(now + self.cooldown);
        self.disarm();
        self.feedback.acknowledge();

        tracing::info!(kind = ?event.kind, text = %event.text, "wake word detected");

        Some(WakeTrigger {
            text: event.text.clone(),
            kind: event.kind,
            at: now,
        })
    }

    /// Wait for the next trigger; pends forever while disarmed
    ///
    /// Returns `None` when the recognizer stream ends unexpectedly, leaving
    /// the detector disarmed. Cancel-safe.
    pub async fn next_trigger(&mut self) -> Option<WakeTrigger> {
        loop {
            let Some(events) = self.events.as_mut() else {
                return std::future::pending().await;
            };

            if let Some(event) = events.recv().await {
                if let Some(trigger) = self.observe(&event, Instant::now()) {
                    return Some(trigger);
                }
            } else {
                tracing::warn!("recognizer stream ended");
                self.disarm();
                return None;
            }
        }
    }

    #[must_use]
    pub const fn is_armed(&self) -> bool {
        self.state.armed
    }

    #[must_use]
    pub const fn state(&self) -> DetectorState {
        self.state
    }

    /// Phase at `now`
    #[must_use]
    pub fn phase(&self, now: Instant) -> DetectorPhase {
        if self.state.cooldown_until.is_some_and(|until| now < until) {
            DetectorPhase::Cooldown
        } else if self.state.armed {
            DetectorPhase::Armed
        } else {
            DetectorPhase::Disarmed
        }
    }

    /// Normalized trigger phrase
    #[must_use]
    pub fn phrase(&self) -> &str {
        &self.phrase
    }
}

impl Drop for WakeWordDetector {
    fn drop(&mut self) {
        self.transcriber.disarm();
    }
}
