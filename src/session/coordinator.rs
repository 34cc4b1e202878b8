//! Voice session coordinator
//!
//! Single owner of `SessionStatus` and of every subsystem: the wake word
//! detector, the capture session, the playback session and the transport.
//! All subsystem notifications, commands and timers funnel through one
//! `select!` loop, so no two of them ever mutate state concurrently.
//!
//! The microphone goes to either the detector or the capture session, never
//! both: the detector is always released before a capture starts, and is only
//! re-armed once the capture cycle has finished.

use std::ops::ControlFlow;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, sleep_until};

use super::status::{SessionStatus, StatusUpdate};
use crate::config::{Config, SessionTimings};
use crate::permission::{HostMicrophoneAccess, PermissionGate, PermissionProvider};
use crate::transport::{InboundPayload, Transport, TransportEvent, WebSocketTransport};
use crate::voice::{
    Acknowledge, AudioInput, AudioOutput, CaptureRejection, CaptureSession, CaptureStart,
    CaptureStop, CommandTranscriber, Microphone, PlaybackEnd, PlaybackSession, Speaker,
    StreamingTranscriber, WakeTrigger, WakeWordDetector, feedback,
};
use crate::{Error, ErrorKind, Result};

/// Capacity of the command channel
const COMMAND_BUFFER: usize = 32;

/// Capacity of the status broadcast
const UPDATE_BUFFER: usize = 64;

/// Requests from the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Disconnect,
    /// Hold-to-speak pressed
    PressStart,
    /// Hold-to-speak released
    PressEnd,
    /// Switch to wake word mode
    ArmWakeWord,
    /// Switch back to hold-to-speak only
    DisarmWakeWord,
    Shutdown,
}

/// Where the client returns after a capture cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenMode {
    /// Hold-to-speak only
    Manual,
    /// Re-arm the wake word detector
    WakeWord,
}

/// Cheap handle for sending commands and watching status
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<Command>,
    updates: broadcast::Sender<StatusUpdate>,
}

impl CoordinatorHandle {
    /// Queue a command
    ///
    /// # Errors
    ///
    /// Returns `Error::CoordinatorStopped` once the coordinator has exited
    pub async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::CoordinatorStopped)
    }

    /// Receive every status update from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.updates.subscribe()
    }
}

/// Everything the coordinator drives
pub struct Subsystems {
    pub permission: Box<dyn PermissionProvider>,
    pub transcriber: Box<dyn StreamingTranscriber>,
    pub feedback: Box<dyn Acknowledge>,
    pub input: Box<dyn AudioInput>,
    pub output: Box<dyn AudioOutput>,
    pub transport: Box<dyn Transport>,
}

impl Subsystems {
    /// Real devices, the recognizer process and a WebSocket link
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the endpoint URL is invalid
    pub fn host(config: &Config) -> Result<Self> {
        let url = config.server.url()?;
        Ok(Self {
            permission: Box::new(HostMicrophoneAccess),
            transcriber: Box::new(CommandTranscriber::new(
                config.wake.recognizer.clone(),
                config.wake.recognizer_args.clone(),
                config.audio.sample_rate,
                config.wake.event_buffer,
            )),
            feedback: feedback::from_style(config.audio.feedback),
            input: Box::new(Microphone::new(config.audio.sample_rate)),
            output: Box::new(Speaker::new()),
            transport: Box::new(WebSocketTransport::new(url, config.server.connect_timeout)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    /// Hard bound on a wake-triggered capture
    AutoStop,
    /// Hard bound on a hold-to-speak capture
    CaptureLimit,
    /// Give up waiting for a response
    ResponseTimeout,
    /// Quiet interval before the detector is re-armed
    Rearm,
}

#[derive(Debug, Clone, Copy)]
struct Timer {
    kind: TimerKind,
    deadline: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureOrigin {
    Manual,
    Wake,
}

/// Something the loop woke up for
enum Wakeup {
    Command(Option<Command>),
    Link(TransportEvent),
    Trigger(Option<WakeTrigger>),
    PlaybackDone(PlaybackEnd),
    Timer(TimerKind),
}

/// Owns the session state machine
pub struct Coordinator {
    status: SessionStatus,
    mode: ListenMode,
    wake_available: bool,
    model: String,
    auto_connect: bool,
    timings: SessionTimings,
    gate: PermissionGate,
    detector: WakeWordDetector,
    capture: CaptureSession,
    playback: PlaybackSession,
    transport: Box<dyn Transport>,
    /// At most one pending timer; replaced or cancelled on every transition
    timer: Option<Timer>,
    commands: mpsc::Receiver<Command>,
    updates: broadcast::Sender<StatusUpdate>,
}

impl Coordinator {
    /// Build a coordinator over `parts`; nothing runs until `run`
    #[must_use]
    pub fn new(config: &Config, parts: Subsystems) -> (Self, CoordinatorHandle) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);

        let detector = WakeWordDetector::from_config(&config.wake, parts.transcriber, parts.feedback);
        let mode = if config.wake.listen_on_start {
            ListenMode::WakeWord
        } else {
            ListenMode::Manual
        };

        let coordinator = Self {
            status: SessionStatus::Disconnected,
            mode,
            wake_available: false,
            model: config.wake.model.clone(),
            auto_connect: config.server.auto_connect,
            timings: config.session,
            gate: PermissionGate::new(parts.permission),
            detector,
            capture: CaptureSession::new(parts.input),
            playback: PlaybackSession::new(parts.output),
            transport: parts.transport,
            timer: None,
            commands: commands_rx,
            updates: updates.clone(),
        };
        let handle = CoordinatorHandle {
            commands: commands_tx,
            updates,
        };

        (coordinator, handle)
    }

    /// Current status
    #[must_use]
    pub const fn status(&self) -> SessionStatus {
        self.status
    }

    /// Mode the client returns to after each cycle
    #[must_use]
    pub const fn mode(&self) -> ListenMode {
        self.mode
    }

    /// Run until `Command::Shutdown` or until every handle is dropped
    pub async fn run(&mut self) {
        let _ = self.updates.send(StatusUpdate::new(self.status));
        self.startup().await;

        loop {
            let wakeup = self.next_wakeup().await;
            if self.dispatch(wakeup).await.is_break() {
                break;
            }
        }

        tracing::info!("session coordinator stopped");
    }

    async fn startup(&mut self) {
        if let Err(e) = self.gate.ensure().await.into_result() {
            self.fail(&e);
            return;
        }

        match self.detector.load(&self.model).await {
            Ok(()) => self.wake_available = true,
            Err(e) => {
                tracing::warn!(error = %e, "wake word disabled");
                self.disable_wake_word();
            }
        }

        if self.auto_connect {
            self.connect();
        }
    }

    async fn next_wakeup(&mut self) -> Wakeup {
        let listening = self.detector.is_armed();
        let playing = self.playback.is_active();
        let timer = self.timer;

        tokio::select! {
            biased;
            command = self.commands.recv() => Wakeup::Command(command),
            event = self.transport.next_event() => Wakeup::Link(event),
            trigger = self.detector.next_trigger(), if listening => Wakeup::Trigger(trigger),
            end = self.playback.finished(), if playing => Wakeup::PlaybackDone(end),
            kind = expire(timer) => Wakeup::Timer(kind),
        }
    }

    async fn dispatch(&mut self, wakeup: Wakeup) -> ControlFlow<()> {
        match wakeup {
            Wakeup::Command(None) => {
                tracing::debug!("all handles dropped");
                self.shutdown();
                return ControlFlow::Break(());
            }
            Wakeup::Command(Some(Command::Shutdown)) => {
                self.shutdown();
                return ControlFlow::Break(());
            }
            Wakeup::Command(Some(command)) => self.handle_command(command).await,
            Wakeup::Link(event) => self.handle_link_event(event).await,
            Wakeup::Trigger(trigger) => self.handle_trigger(trigger),
            Wakeup::PlaybackDone(end) => self.handle_playback_end(end),
            Wakeup::Timer(kind) => {
                self.timer = None;
                self.handle_timer(kind).await;
            }
        }
        ControlFlow::Continue(())
    }

    async fn handle_command(&mut self, command: Command) {
        tracing::debug!(?command, status = %self.status, "command");

        match command {
            Command::Connect => self.connect(),
            Command::Disconnect => {
                if self.status.is_linked() || self.status == SessionStatus::Connecting {
                    self.teardown_link();
                    self.set_status(SessionStatus::Disconnected);
                }
            }
            Command::PressStart => self.press_start(),
            Command::PressEnd => {
                if self.status == SessionStatus::CapturingUtterance {
                    self.finish_capture();
                }
            }
            Command::ArmWakeWord => self.arm_wake_word().await,
            Command::DisarmWakeWord => {
                self.mode = ListenMode::Manual;
                if self.status == SessionStatus::ListeningArmed {
                    self.timer = None;
                    self.release_detector();
                    self.set_status(SessionStatus::Connected);
                }
            }
            Command::Shutdown => {}
        }
    }

    fn connect(&mut self) {
        match self.status {
            SessionStatus::Disconnected | SessionStatus::Errored => {}
            SessionStatus::PermissionDenied => {
                tracing::warn!("microphone permission denied, not connecting");
                return;
            }
            status => {
                tracing::debug!(%status, "already connected");
                return;
            }
        }

        match self.transport.connect() {
            Ok(()) => self.set_status(SessionStatus::Connecting),
            Err(e) => self.publish(
                StatusUpdate::new(SessionStatus::Disconnected).with_detail(e.to_string()),
            ),
        }
    }

    fn press_start(&mut self) {
        match self.status {
            SessionStatus::Connected => {}
            SessionStatus::ListeningArmed => self.release_detector(),
            SessionStatus::PlayingResponse => {
                tracing::info!("barge-in, stopping playback");
                self.playback.stop();
            }
            status => {
                tracing::debug!(%status, "press ignored");
                return;
            }
        }
        self.start_capture(CaptureOrigin::Manual);
    }

    async fn arm_wake_word(&mut self) {
        if !self.wake_available {
            tracing::warn!("wake word unavailable, recognition model not loaded");
            return;
        }

        self.mode = ListenMode::WakeWord;
        if self.status == SessionStatus::Connected {
            self.enter_listening().await;
        } else {
            tracing::debug!(status = %self.status, "wake word mode applies after this cycle");
        }
    }

    async fn handle_link_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => {
                if self.status != SessionStatus::Connecting {
                    tracing::debug!(status = %self.status, "ignoring unexpected open");
                    return;
                }
                self.set_status(SessionStatus::Connected);
                if self.wants_wake_word() {
                    self.enter_listening().await;
                }
            }
            TransportEvent::Closed => self.link_lost("connection closed".to_string()),
            TransportEvent::Failed(reason) => self.link_lost(reason),
            TransportEvent::Inbound(InboundPayload::Audio(bytes)) => self.handle_response(&bytes),
            TransportEvent::Inbound(InboundPayload::Text(text)) => {
                tracing::info!(text = %text, "server notice");
            }
        }
    }

    fn handle_response(&mut self, bytes: &[u8]) {
        match self.status {
            SessionStatus::Processing
            | SessionStatus::Connected
            | SessionStatus::ListeningArmed
            | SessionStatus::PlayingResponse => {}
            SessionStatus::CapturingUtterance => {
                tracing::warn!(bytes = bytes.len(), "discarding response received while capturing");
                return;
            }
            status => {
                tracing::debug!(%status, "ignoring audio while not linked");
                return;
            }
        }

        self.timer = None;
        // The speaker must not feed the detector
        self.release_detector();

        match self.playback.play(bytes) {
            Ok(_) => self.set_status(SessionStatus::PlayingResponse),
            Err(e) => self.fail(&e),
        }
    }

    fn handle_trigger(&mut self, trigger: Option<WakeTrigger>) {
        let Some(trigger) = trigger else {
            if self.status == SessionStatus::ListeningArmed {
                self.fail(&Error::ModelLoad("wake word listener stopped".to_string()));
            }
            return;
        };

        if self.status != SessionStatus::ListeningArmed {
            tracing::debug!(status = %self.status, "ignoring late trigger");
            return;
        }

        tracing::debug!(text = %trigger.text, kind = ?trigger.kind, "trigger accepted");
        self.start_capture(CaptureOrigin::Wake);
    }

    fn handle_playback_end(&mut self, end: PlaybackEnd) {
        if self.status != SessionStatus::PlayingResponse {
            return;
        }
        if !end.completed {
            tracing::warn!("playback ended early");
        }
        self.return_to_idle();
    }

    async fn handle_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::AutoStop | TimerKind::CaptureLimit => {
                if self.status == SessionStatus::CapturingUtterance {
                    tracing::info!(?kind, "capture bound reached, stopping");
                    self.finish_capture();
                }
            }
            TimerKind::ResponseTimeout => {
                if self.status == SessionStatus::Processing {
                    tracing::info!("no response received");
                    self.return_to_idle();
                }
            }
            TimerKind::Rearm => {
                if self.status == SessionStatus::ListeningArmed && !self.detector.is_armed() {
                    self.arm_detector().await;
                }
            }
        }
    }

    fn start_capture(&mut self, origin: CaptureOrigin) {
        self.timer = None;
        self.release_detector();

        match self.capture.start(self.transport.is_open()) {
            CaptureStart::Recording => {
                let (kind, bound) = match origin {
                    CaptureOrigin::Wake => (TimerKind::AutoStop, self.timings.auto_capture),
                    CaptureOrigin::Manual => {
                        (TimerKind::CaptureLimit, self.timings.max_manual_capture)
                    }
                };
                self.set_status(SessionStatus::CapturingUtterance);
                self.schedule(kind, bound);
            }
            CaptureStart::Rejected(CaptureRejection::AlreadyRecording) => {
                tracing::debug!("capture already running");
            }
            CaptureStart::Rejected(CaptureRejection::NotConnected) => {
                self.fail(&Error::Connection("link is not open".to_string()));
            }
            CaptureStart::Rejected(CaptureRejection::Device(cause)) => {
                self.fail(&Error::Device(cause));
            }
        }
    }

    fn finish_capture(&mut self) {
        self.timer = None;

        match self.capture.stop() {
            Ok(CaptureStop::Utterance(utterance)) => {
                let bytes = utterance.len();
                match self.transport.send_utterance(utterance) {
                    Ok(()) => {
                        tracing::debug!(bytes, "utterance handed to transport");
                        self.set_status(SessionStatus::Processing);
                        self.schedule(TimerKind::ResponseTimeout, self.timings.response_timeout);
                    }
                    Err(e) => self.fail(&e),
                }
            }
            Ok(CaptureStop::Empty) => {
                tracing::debug!("nothing captured");
                self.return_to_idle();
            }
            Err(e) => self.fail(&e),
        }
    }

    /// Immediately arm the detector (no trailing audio to wait out)
    async fn enter_listening(&mut self) {
        self.timer = None;
        self.set_status(SessionStatus::ListeningArmed);
        self.arm_detector().await;
    }

    async fn arm_detector(&mut self) {
        if let Err(e) = self.detector.start().await {
            tracing::warn!(error = %e, "could not arm wake word");
            // Whatever stopped the recognizer, hold-to-speak keeps working
            self.mode = ListenMode::Manual;
            self.fail(&e);
        }
    }

    /// Back to the pre-capture mode
    fn return_to_idle(&mut self) {
        self.timer = None;

        if !self.transport.is_open() {
            self.set_status(SessionStatus::Disconnected);
            return;
        }

        if self.wants_wake_word() {
            self.set_status(SessionStatus::ListeningArmed);
            self.schedule(TimerKind::Rearm, self.timings.rearm_quiet);
        } else {
            self.set_status(SessionStatus::Connected);
        }
    }

    /// Route a subsystem failure by kind, then carry on degraded
    ///
    /// Permission refusals stop everything, a lost link becomes
    /// `Disconnected`, and anything else is reported as `Errored` before the
    /// session returns to its pre-capture mode.
    fn fail(&mut self, error: &Error) {
        tracing::warn!(error = %error, kind = ?error.kind(), "session error");

        match error.kind() {
            ErrorKind::Permission => {
                self.teardown_link();
                let mut update =
                    StatusUpdate::new(SessionStatus::PermissionDenied).with_detail(error.to_string());
                if self.gate.is_blocked() {
                    update = update.with_open_settings();
                }
                self.publish(update);
                return;
            }
            ErrorKind::Connection if !self.transport.is_open() => {
                self.link_lost(error.to_string());
                return;
            }
            ErrorKind::ModelLoad => self.disable_wake_word(),
            ErrorKind::Connection
            | ErrorKind::Device
            | ErrorKind::Playback
            | ErrorKind::Internal => {}
        }

        self.publish(StatusUpdate::new(SessionStatus::Errored).with_detail(error.to_string()));

        if self.playback.is_active() {
            // A response is still audible; its end returns the session to idle
            self.set_status(SessionStatus::PlayingResponse);
        } else {
            self.return_to_idle();
        }
    }

    /// Fall back to hold-to-speak for the rest of the run
    fn disable_wake_word(&mut self) {
        self.release_detector();
        self.wake_available = false;
        self.mode = ListenMode::Manual;
    }

    fn link_lost(&mut self, reason: String) {
        self.teardown_link();
        self.publish(StatusUpdate::new(SessionStatus::Disconnected).with_detail(reason));
    }

    /// Release everything tied to the current connection
    fn teardown_link(&mut self) {
        self.timer = None;
        self.release_detector();

        match self.capture.stop() {
            Ok(CaptureStop::Utterance(utterance)) => {
                tracing::debug!(bytes = utterance.len(), "discarding unsent utterance");
            }
            Ok(CaptureStop::Empty) => {}
            Err(e) => tracing::debug!(error = %e, "capture teardown failed"),
        }

        self.playback.stop();
        self.transport.close();
    }

    fn shutdown(&mut self) {
        tracing::info!("shutting down");
        self.teardown_link();
        self.detector.unload();
        if self.status != SessionStatus::PermissionDenied {
            self.set_status(SessionStatus::Disconnected);
        }
    }

    /// Stop the detector if it holds the microphone
    ///
    /// A detector that disarmed itself on a trigger keeps its cooldown.
    fn release_detector(&mut self) {
        if self.detector.is_armed() {
            self.detector.stop();
        }
    }

    const fn wants_wake_word(&self) -> bool {
        matches!(self.mode, ListenMode::WakeWord) && self.wake_available
    }

    fn schedule(&mut self, kind: TimerKind, after: Duration) {
        self.timer = Some(Timer {
            kind,
            deadline: Instant::now() + after,
        });
    }

    fn set_status(&mut self, status: SessionStatus) {
        if status != self.status {
            self.publish(StatusUpdate::new(status));
        }
    }

    fn publish(&mut self, update: StatusUpdate) {
        tracing::info!(
            from = %self.status,
            to = %update.status,
            detail = update.detail.as_deref().unwrap_or_default(),
            "status"
        );
        self.status = update.status;
        let _ = self.updates.send(update);
    }
}

async fn expire(timer: Option<Timer>) -> TimerKind {
    match timer {
        Some(timer) => {
            sleep_until(timer.deadline).await;
            timer.kind
        }
        None => std::future::pending().await,
    }
}
