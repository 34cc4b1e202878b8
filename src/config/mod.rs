//! Configuration management for the wakelink client

pub mod file;

use std::time::Duration;

use crate::{Error, Result};

use file::WakelinkConfigFile;

/// Default trigger phrase
pub const DEFAULT_PHRASE: &str = "radha";

/// Wakelink client configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Remote endpoint
    pub server: ServerConfig,

    /// Wake word detection
    pub wake: WakeConfig,

    /// Session timers
    pub session: SessionTimings,

    /// Audio devices
    pub audio: AudioConfig,
}

/// Remote endpoint configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    /// `wss://` when true
    pub secure: bool,
    pub connect_timeout: Duration,
    /// Connect during startup once permission is granted
    pub auto_connect: bool,
}

/// Wake word configuration
#[derive(Debug, Clone)]
pub struct WakeConfig {
    /// Trigger phrase
    pub phrase: String,

    /// Model reference handed to the recognizer on load
    pub model: String,

    /// Streaming recognizer program
    pub recognizer: String,

    /// Extra recognizer arguments
    pub recognizer_args: Vec<String>,

    /// Refractory period after a trigger
    pub cooldown: Duration,

    /// Whether partial transcripts may trigger
    pub trigger_on_partial: bool,

    /// Partials below this confidence are ignored (when the engine reports one)
    pub partial_min_confidence: Option<f32>,

    /// Arm the detector as soon as the link opens
    pub listen_on_start: bool,

    /// Capacity of the transcript event channel
    pub event_buffer: usize,
}

/// Timers owned by the session coordinator
#[derive(Debug, Clone, Copy)]
pub struct SessionTimings {
    /// Hard bound on wake-triggered captures
    pub auto_capture: Duration,

    /// Quiet interval before the detector is re-armed
    pub rearm_quiet: Duration,

    /// Hard bound on hold-to-speak captures
    pub max_manual_capture: Duration,

    /// How long `Processing` waits for a response
    pub response_timeout: Duration,
}

/// Acknowledgement feedback style
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedbackStyle {
    /// Terminal bell on stderr
    #[default]
    Bell,
    /// No feedback
    None,
}

/// Audio device configuration
#[derive(Debug, Clone, Copy)]
pub struct AudioConfig {
    /// Capture sample rate
    pub sample_rate: u32,

    /// Trigger acknowledgement
    pub feedback: FeedbackStyle,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8000,
            path: "/ws".to_string(),
            secure: false,
            connect_timeout: Duration::from_secs(10),
            auto_connect: true,
        }
    }
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            phrase: DEFAULT_PHRASE.to_string(),
            model: "model-en".to_string(),
            recognizer: "vosk-stream".to_string(),
            recognizer_args: Vec::new(),
            cooldown: Duration::from_millis(3000),
            trigger_on_partial: true,
            partial_min_confidence: None,
            listen_on_start: false,
            event_buffer: 32,
        }
    }
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            auto_capture: Duration::from_millis(5000),
            rearm_quiet: Duration::from_millis(2000),
            max_manual_capture: Duration::from_secs(60),
            response_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: crate::voice::SAMPLE_RATE,
            feedback: FeedbackStyle::Bell,
        }
    }
}

impl ServerConfig {
    /// Endpoint URL built from host, port and path
    ///
    /// # Errors
    ///
    /// Returns error if the pieces do not form a valid `ws`/`wss` URL
    pub fn url(&self) -> Result<url::Url> {
        let scheme = if self.secure { "wss" } else { "ws" };
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        let raw = format!("{scheme}://{}:{}{path}", self.host, self.port);

        url::Url::parse(&raw).map_err(|e| Error::Config(format!("invalid endpoint {raw}: {e}")))
    }
}

impl FeedbackStyle {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "bell" => Some(Self::Bell),
            "none" | "off" => Some(Self::None),
            _ => None,
        }
    }
}

impl Config {
    /// Load configuration (env > toml > default)
    ///
    /// # Errors
    ///
    /// Returns error if the resulting configuration is invalid
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Merge a parsed config file with an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if the resulting configuration is invalid
    pub fn from_sources<F>(fc: WakelinkConfigFile, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let flag = |key: &str| env(key).map(|v| v == "1" || v.eq_ignore_ascii_case("true"));

        let port = env("WAKELINK_PORT")
            .map(|raw| {
                raw.trim()
                    .parse::<u16>()
                    .map_err(|_| Error::Config(format!("invalid WAKELINK_PORT: {raw}")))
            })
            .transpose()?;

        let server = ServerConfig {
            host: env("WAKELINK_HOST")
                .or(fc.server.host)
                .unwrap_or(defaults.server.host),
            port: port
                .or(fc.server.port)
                .unwrap_or(defaults.server.port),
            path: env("WAKELINK_PATH")
                .or(fc.server.path)
                .unwrap_or(defaults.server.path),
            secure: flag("WAKELINK_SECURE")
                .or(fc.server.secure)
                .unwrap_or(defaults.server.secure),
            connect_timeout: fc
                .server
                .connect_timeout_ms
                .map_or(defaults.server.connect_timeout, Duration::from_millis),
            auto_connect: fc.server.auto_connect.unwrap_or(defaults.server.auto_connect),
        };

        let wake = WakeConfig {
            phrase: env("WAKELINK_WAKE_PHRASE")
                .or(fc.wake.phrase)
                .unwrap_or(defaults.wake.phrase),
            model: env("WAKELINK_WAKE_MODEL")
                .or(fc.wake.model)
                .unwrap_or(defaults.wake.model),
            recognizer: env("WAKELINK_RECOGNIZER")
                .or(fc.wake.recognizer)
                .unwrap_or(defaults.wake.recognizer),
            recognizer_args: fc.wake.recognizer_args.unwrap_or_default(),
            cooldown: fc
                .wake
                .cooldown_ms
                .map_or(defaults.wake.cooldown, Duration::from_millis),
            trigger_on_partial: fc
                .wake
                .trigger_on_partial
                .unwrap_or(defaults.wake.trigger_on_partial),
            partial_min_confidence: fc.wake.partial_min_confidence,
            listen_on_start: flag("WAKELINK_LISTEN_ON_START")
                .or(fc.wake.listen_on_start)
                .unwrap_or(defaults.wake.listen_on_start),
            event_buffer: fc.wake.event_buffer.unwrap_or(defaults.wake.event_buffer),
        };

        let ms = |value: Option<u64>, fallback: Duration| value.map_or(fallback, Duration::from_millis);
        let session = SessionTimings {
            auto_capture: ms(fc.session.auto_capture_ms, defaults.session.auto_capture),
            rearm_quiet: ms(fc.session.rearm_quiet_ms, defaults.session.rearm_quiet),
            max_manual_capture: ms(
                fc.session.max_manual_capture_ms,
                defaults.session.max_manual_capture,
            ),
            response_timeout: ms(
                fc.session.response_timeout_ms,
                defaults.session.response_timeout,
            ),
        };

        let feedback = match env("WAKELINK_FEEDBACK").or(fc.audio.feedback) {
            Some(raw) => FeedbackStyle::parse(&raw)
                .ok_or_else(|| Error::Config(format!("unknown feedback style: {raw}")))?,
            None => defaults.audio.feedback,
        };
        let audio = AudioConfig {
            sample_rate: fc.audio.sample_rate.unwrap_or(defaults.audio.sample_rate),
            feedback,
        };

        let config = Self {
            server,
            wake,
            session,
            audio,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check invariants the rest of the client relies on
    ///
    /// # Errors
    ///
    /// Returns error describing the first invalid field
    pub fn validate(&self) -> Result<()> {
        if self.wake.phrase.trim().is_empty() {
            return Err(Error::Config("wake.phrase must not be empty".to_string()));
        }
        if self.wake.event_buffer == 0 {
            return Err(Error::Config("wake.event_buffer must be positive".to_string()));
        }
        if self.audio.sample_rate == 0 {
            return Err(Error::Config("audio.sample_rate must be positive".to_string()));
        }

        let timers = [
            ("session.auto_capture_ms", self.session.auto_capture),
            ("session.max_manual_capture_ms", self.session.max_manual_capture),
            ("session.response_timeout_ms", self.session.response_timeout),
            ("server.connect_timeout_ms", self.server.connect_timeout),
            ("wake.cooldown_ms", self.wake.cooldown),
            ("session.rearm_quiet_ms", self.session.rearm_quiet),
        ];
        if let Some((name, _)) = timers.iter().find(|(_, d)| d.is_zero()) {
            return Err(Error::Config(format!("{name} must be positive")));
        }

        self.server.url()?;
        Ok(())
    }
}
