//! Shared test utilities
//!
//! Hardware-free fakes for every subsystem the coordinator drives, plus a
//! probe for each so tests can script the outside world.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

use wakelink::config::Config;
use wakelink::permission::{PermissionProvider, PermissionStatus};
use wakelink::session::{Coordinator, CoordinatorHandle, SessionStatus, StatusUpdate, Subsystems};
use wakelink::transport::{ConnectionState, Transport, TransportEvent, ensure_open};
use wakelink::voice::{
    AudioInput, AudioOutput, Clip, Grammar, Silent, StreamingTranscriber, TranscriptEvent,
    Utterance, samples_to_wav,
};
use wakelink::{Error, Result};

/// Who currently holds the microphone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Holder {
    Detector,
    Capture,
}

#[derive(Debug, Default)]
struct MicLog {
    holder: Option<Holder>,
    violations: usize,
    captures: usize,
    arms: usize,
}

/// Records every acquisition of the shared input device
#[derive(Debug, Clone, Default)]
pub struct MicTracker(Arc<Mutex<MicLog>>);

impl MicTracker {
    fn acquire(&self, who: Holder) {
        let mut log = self.0.lock().unwrap();
        if log.holder.is_some_and(|current| current != who) {
            log.violations += 1;
        }
        log.holder = Some(who);
        match who {
            Holder::Detector => log.arms += 1,
            Holder::Capture => log.captures += 1,
        }
    }

    fn release(&self, who: Holder) {
        let mut log = self.0.lock().unwrap();
        if log.holder == Some(who) {
            log.holder = None;
        }
    }

    /// Times both subsystems held the device at once
    pub fn violations(&self) -> usize {
        self.0.lock().unwrap().violations
    }

    pub fn captures(&self) -> usize {
        self.0.lock().unwrap().captures
    }

    pub fn arms(&self) -> usize {
        self.0.lock().unwrap().arms
    }

    pub fn holder(&self) -> Option<Holder> {
        self.0.lock().unwrap().holder
    }
}

/// Microphone that yields a fixed tone on every recording
pub struct FakeInput {
    mic: MicTracker,
    open: bool,
    fail_open: bool,
    samples: Vec<f32>,
}

impl FakeInput {
    pub fn new(mic: MicTracker) -> Self {
        Self {
            mic,
            open: false,
            fail_open: false,
            samples: vec![0.1; 1600],
        }
    }

    pub fn failing(mic: MicTracker) -> Self {
        Self {
            fail_open: true,
            ..Self::new(mic)
        }
    }
}

impl AudioInput for FakeInput {
    fn open(&mut self) -> Result<()> {
        if self.fail_open {
            return Err(Error::Device("microphone busy".to_string()));
        }
        self.mic.acquire(Holder::Capture);
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        if self.open {
            self.mic.release(Holder::Capture);
        }
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn take_samples(&mut self) -> Result<Vec<f32>> {
        Ok(self.samples.clone())
    }

    fn sample_rate(&self) -> u32 {
        16000
    }
}

/// Handle for feeding transcripts into an armed `FakeTranscriber`
#[derive(Debug, Clone, Default)]
pub struct RecognizerProbe {
    sender: Arc<Mutex<Option<mpsc::Sender<TranscriptEvent>>>>,
    grammars: Arc<Mutex<Vec<Grammar>>>,
}

impl RecognizerProbe {
    pub fn is_armed(&self) -> bool {
        self.sender.lock().unwrap().is_some()
    }

    /// Deliver a transcript; false when the recognizer is not armed
    pub async fn say(&self, event: TranscriptEvent) -> bool {
        let sender = self.sender.lock().unwrap().clone();
        match sender {
            Some(sender) => sender.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Wait (in virtual time) until the recognizer is armed
    pub async fn wait_armed(&self) {
        for _ in 0..1000 {
            if self.is_armed() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("recognizer never armed");
    }

    /// End the transcript stream as if the engine crashed
    pub fn crash(&self) {
        self.sender.lock().unwrap().take();
    }

    pub fn grammars(&self) -> Vec<Grammar> {
        self.grammars.lock().unwrap().clone()
    }
}

/// Recognizer that emits whatever the probe says
pub struct FakeTranscriber {
    mic: MicTracker,
    probe: RecognizerProbe,
    loaded: bool,
    fail_load: bool,
}

impl FakeTranscriber {
    pub fn new(mic: MicTracker, probe: RecognizerProbe) -> Self {
        Self {
            mic,
            probe,
            loaded: false,
            fail_load: false,
        }
    }

    pub fn broken(mic: MicTracker, probe: RecognizerProbe) -> Self {
        Self {
            fail_load: true,
            ..Self::new(mic, probe)
        }
    }
}

#[async_trait]
impl StreamingTranscriber for FakeTranscriber {
    async fn load(&mut self, model: &str) -> Result<()> {
        if self.fail_load {
            return Err(Error::ModelLoad(format!("cannot open {model}")));
        }
        self.loaded = true;
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.loaded
    }

    async fn arm(&mut self, grammar: &Grammar) -> Result<mpsc::Receiver<TranscriptEvent>> {
        if !self.loaded {
            return Err(Error::ModelLoad("no model loaded".to_string()));
        }
        let (tx, rx) = mpsc::channel(8);
        self.mic.acquire(Holder::Detector);
        *self.probe.sender.lock().unwrap() = Some(tx);
        self.probe.grammars.lock().unwrap().push(grammar.clone());
        Ok(rx)
    }

    fn disarm(&mut self) {
        if self.probe.sender.lock().unwrap().take().is_some() {
            self.mic.release(Holder::Detector);
        }
    }

    fn unload(&mut self) {
        self.disarm();
        self.loaded = false;
    }
}

#[derive(Debug, Default)]
struct SpeakerLog {
    done: Option<oneshot::Sender<()>>,
    playing: usize,
    max_playing: usize,
    starts: usize,
    stops: usize,
}

/// Handle for completing playback on a `FakeOutput`
#[derive(Debug, Clone, Default)]
pub struct SpeakerProbe(Arc<Mutex<SpeakerLog>>);

impl SpeakerProbe {
    /// Play the last sample of the current sound
    pub fn finish(&self) {
        let mut log = self.0.lock().unwrap();
        if let Some(done) = log.done.take() {
            let _ = done.send(());
        }
    }

    pub fn starts(&self) -> usize {
        self.0.lock().unwrap().starts
    }

    pub fn stops(&self) -> usize {
        self.0.lock().unwrap().stops
    }

    /// Most sounds ever alive at once
    pub fn max_playing(&self) -> usize {
        self.0.lock().unwrap().max_playing
    }

    pub fn is_playing(&self) -> bool {
        self.0.lock().unwrap().playing > 0
    }
}

/// Speaker that plays until the probe says it finished
#[derive(Default)]
pub struct FakeOutput {
    probe: SpeakerProbe,
    active: bool,
}

impl FakeOutput {
    pub fn new(probe: SpeakerProbe) -> Self {
        Self {
            probe,
            active: false,
        }
    }
}

impl AudioOutput for FakeOutput {
    fn start(&mut self, _clip: Clip, done: oneshot::Sender<()>) -> Result<()> {
        let mut log = self.probe.0.lock().unwrap();
        log.playing += 1;
        log.max_playing = log.max_playing.max(log.playing);
        log.starts += 1;
        log.done = Some(done);
        self.active = true;
        Ok(())
    }

    fn stop(&mut self) {
        if !self.active {
            return;
        }
        let mut log = self.probe.0.lock().unwrap();
        log.playing -= 1;
        log.stops += 1;
        log.done = None;
        self.active = false;
    }

    fn is_playing(&self) -> bool {
        self.active
    }
}

/// Handle for scripting a `FakeTransport`
#[derive(Debug, Clone)]
pub struct LinkProbe {
    events: mpsc::UnboundedSender<TransportEvent>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    connects: Arc<AtomicUsize>,
    severed: Arc<AtomicBool>,
}

impl LinkProbe {
    /// Break the link without telling anyone; the next send finds out
    pub fn sever(&self) {
        self.severed.store(true, Ordering::SeqCst);
    }

    pub fn push(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

/// In-memory link; opens immediately unless told otherwise
pub struct FakeTransport {
    state: ConnectionState,
    auto_open: bool,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    connects: Arc<AtomicUsize>,
    severed: Arc<AtomicBool>,
}

impl FakeTransport {
    pub fn new(auto_open: bool) -> (Self, LinkProbe) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let connects = Arc::new(AtomicUsize::new(0));
        let severed = Arc::new(AtomicBool::new(false));
        let probe = LinkProbe {
            events: events_tx.clone(),
            sent: Arc::clone(&sent),
            connects: Arc::clone(&connects),
            severed: Arc::clone(&severed),
        };
        let transport = Self {
            state: ConnectionState::Closed,
            auto_open,
            events_tx,
            events_rx,
            sent,
            connects,
            severed,
        };
        (transport, probe)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn state(&self) -> ConnectionState {
        self.state
    }

    fn connect(&mut self) -> Result<()> {
        if self.state != ConnectionState::Closed {
            return Ok(());
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.state = ConnectionState::Opening;
        if self.auto_open {
            let _ = self.events_tx.send(TransportEvent::Opened);
        }
        Ok(())
    }

    fn send_utterance(&mut self, utterance: Utterance) -> Result<()> {
        if self.severed.swap(false, Ordering::SeqCst) {
            self.state = ConnectionState::Closed;
            return Err(Error::Connection("broken pipe".to_string()));
        }
        ensure_open(self.state, &utterance)?;
        self.sent.lock().unwrap().push(utterance.into_bytes());
        Ok(())
    }

    async fn next_event(&mut self) -> TransportEvent {
        let Some(event) = self.events_rx.recv().await else {
            return std::future::pending().await;
        };
        match &event {
            TransportEvent::Opened => self.state = ConnectionState::Open,
            TransportEvent::Closed | TransportEvent::Failed(_) => {
                self.state = ConnectionState::Closed;
            }
            TransportEvent::Inbound(_) => {}
        }
        event
    }

    fn close(&mut self) {
        self.state = ConnectionState::Closed;
    }
}

/// Permission provider with a fixed answer
pub struct FixedPermission(pub PermissionStatus);

#[async_trait]
impl PermissionProvider for FixedPermission {
    async fn check(&self) -> PermissionStatus {
        self.0
    }

    async fn request(&self) -> PermissionStatus {
        self.0
    }
}

/// Options for building a coordinator over fakes
pub struct Harness {
    pub config: Config,
    pub permission: PermissionStatus,
    pub model_loads: bool,
    pub mic_fails: bool,
    pub auto_open: bool,
}

impl Default for Harness {
    fn default() -> Self {
        let mut config = Config::default();
        config.audio.feedback = wakelink::config::FeedbackStyle::None;
        Self {
            config,
            permission: PermissionStatus::Granted,
            model_loads: true,
            mic_fails: false,
            auto_open: true,
        }
    }
}

/// Probes into a running harness
pub struct Rig {
    pub mic: MicTracker,
    pub recognizer: RecognizerProbe,
    pub speaker: SpeakerProbe,
    pub link: LinkProbe,
}

impl Harness {
    /// Start in wake word mode
    pub fn listening(mut self) -> Self {
        self.config.wake.listen_on_start = true;
        self
    }

    pub fn build(self) -> (Coordinator, CoordinatorHandle, Rig) {
        let mic = MicTracker::default();
        let recognizer = RecognizerProbe::default();
        let speaker = SpeakerProbe::default();
        let (transport, link) = FakeTransport::new(self.auto_open);

        let transcriber = if self.model_loads {
            FakeTranscriber::new(mic.clone(), recognizer.clone())
        } else {
            FakeTranscriber::broken(mic.clone(), recognizer.clone())
        };
        let input = if self.mic_fails {
            FakeInput::failing(mic.clone())
        } else {
            FakeInput::new(mic.clone())
        };

        let parts = Subsystems {
            permission: Box::new(FixedPermission(self.permission)),
            transcriber: Box::new(transcriber),
            feedback: Box::new(Silent),
            input: Box::new(input),
            output: Box::new(FakeOutput::new(speaker.clone())),
            transport: Box::new(transport),
        };

        let (coordinator, handle) = Coordinator::new(&self.config, parts);
        let rig = Rig {
            mic,
            recognizer,
            speaker,
            link,
        };
        (coordinator, handle, rig)
    }
}

/// Collects status updates in order
pub struct Recorder {
    updates: broadcast::Receiver<StatusUpdate>,
    pub seen: Vec<StatusUpdate>,
}

impl Recorder {
    pub fn new(handle: &CoordinatorHandle) -> Self {
        Self {
            updates: handle.subscribe(),
            seen: Vec::new(),
        }
    }

    /// Wait for `status`, returning the virtual instant it was observed
    pub async fn until(&mut self, status: SessionStatus) -> Instant {
        let wait = async {
            loop {
                let update = self.updates.recv().await.expect("status channel closed");
                let matched = update.status == status;
                self.seen.push(update);
                if matched {
                    return Instant::now();
                }
            }
        };
        let outcome = tokio::time::timeout(Duration::from_secs(600), wait).await;
        match outcome {
            Ok(at) => at,
            Err(_) => panic!("never reached {status:?}; saw {:?}", self.statuses()),
        }
    }

    /// Drain whatever is already queued
    pub fn drain(&mut self) {
        while let Ok(update) = self.updates.try_recv() {
            self.seen.push(update);
        }
    }

    pub fn statuses(&self) -> Vec<SessionStatus> {
        self.seen.iter().map(|u| u.status).collect()
    }

    pub fn count(&self, status: SessionStatus) -> usize {
        self.seen.iter().filter(|u| u.status == status).count()
    }
}

/// A short playable WAV response
pub fn response_wav() -> Vec<u8> {
    samples_to_wav(&[0.0, 0.25, 0.5, 0.25, 0.0], 16000).unwrap()
}
