//! Session status and the updates broadcast to front-ends

use chrono::{DateTime, Utc};
use serde::Serialize;

/// What the client is doing right now; owned by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Wake word mode; the detector holds the microphone
    ListeningArmed,
    /// Recording an utterance; the capture session holds the microphone
    CapturingUtterance,
    /// Utterance sent, waiting for the response
    Processing,
    PlayingResponse,
    PermissionDenied,
    Errored,
}

impl SessionStatus {
    /// Human-readable label for front-ends
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting...",
            Self::Connected => "Connected",
            Self::ListeningArmed => "Always Listening...",
            Self::CapturingUtterance => "Listening...",
            Self::Processing => "Processing...",
            Self::PlayingResponse => "Playing response...",
            Self::PermissionDenied => "Permission Denied",
            Self::Errored => "Error",
        }
    }

    /// Whether the remote link is up in this status
    #[must_use]
    pub const fn is_linked(self) -> bool {
        matches!(
            self,
            Self::Connected
                | Self::ListeningArmed
                | Self::CapturingUtterance
                | Self::Processing
                | Self::PlayingResponse
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One status change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusUpdate {
    pub status: SessionStatus,
    /// Cause or context, e.g. the reason a connection failed
    pub detail: Option<String>,
    /// The user has to change system settings before this can recover
    pub open_settings: bool,
    pub at: DateTime<Utc>,
}

impl StatusUpdate {
    #[must_use]
    pub fn new(status: SessionStatus) -> Self {
        Self {
            status,
            detail: None,
            open_settings: false,
            at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    #[must_use]
    pub const fn with_open_settings(mut self) -> Self {
        self.open_settings = true;
        self
    }
}

impl std::fmt::Display for StatusUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{} ({detail})", self.status),
            None => write!(f, "{}", self.status),
        }
    }
}
