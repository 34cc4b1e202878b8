//! Microphone authorization
//!
//! Desktop hosts have no prompt flow, so the host provider infers the
//! outcome from what the audio backend lets us query.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait};

use crate::{Error, Result};

/// Outcome of a permission query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    /// Refused; the user may still change it
    Denied,
    /// The system will not prompt again; the user must change settings
    Blocked,
}

impl PermissionStatus {
    #[must_use]
    pub const fn is_granted(self) -> bool {
        matches!(self, Self::Granted)
    }

    /// `Ok` when granted, otherwise a `Permission` error carrying the
    /// user-facing explanation
    ///
    /// # Errors
    ///
    /// Returns `Error::Permission` for `Denied` and `Blocked`
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Granted => Ok(()),
            Self::Denied => Err(Error::Permission("microphone access denied".to_string())),
            Self::Blocked => Err(Error::Permission(PermissionGate::settings_hint().to_string())),
        }
    }
}

/// Queries and requests microphone authorization
#[async_trait]
pub trait PermissionProvider: Send + Sync {
    /// Current status; side-effect free
    async fn check(&self) -> PermissionStatus;

    /// Ask for access
    async fn request(&self) -> PermissionStatus;
}

/// Infers access from the default input device
#[derive(Debug, Default, Clone, Copy)]
pub struct HostMicrophoneAccess;

impl HostMicrophoneAccess {
    fn probe() -> PermissionStatus {
        let host = cpal::default_host();
        let Some(device) = host.default_input_device() else {
            tracing::debug!("no default input device");
            return PermissionStatus::Denied;
        };

        match device.default_input_config() {
            Ok(_) => PermissionStatus::Granted,
            Err(e) => {
                tracing::debug!(error = %e, "input device refused configuration query");
                PermissionStatus::Blocked
            }
        }
    }
}

#[async_trait]
impl PermissionProvider for HostMicrophoneAccess {
    async fn check(&self) -> PermissionStatus {
        tokio::task::spawn_blocking(Self::probe)
            .await
            .unwrap_or(PermissionStatus::Denied)
    }

    async fn request(&self) -> PermissionStatus {
        self.check().await
    }
}

/// Runs the check-then-request flow once per process
///
/// A denial is terminal: later calls return it without asking again.
pub struct PermissionGate {
    provider: Box<dyn PermissionProvider>,
    denied: Option<PermissionStatus>,
}

impl PermissionGate {
    #[must_use]
    pub fn new(provider: Box<dyn PermissionProvider>) -> Self {
        Self {
            provider,
            denied: None,
        }
    }

    /// Check, then request if needed
    pub async fn ensure(&mut self) -> PermissionStatus {
        if let Some(status) = self.denied {
            return status;
        }

        let status = match self.provider.check().await {
            PermissionStatus::Granted => PermissionStatus::Granted,
            _ => self.provider.request().await,
        };

        if status.is_granted() {
            tracing::debug!("microphone access granted");
        } else {
            tracing::warn!(?status, "microphone access not granted");
            self.denied = Some(status);
        }
        status
    }

    /// Side-effect free status query
    pub async fn check(&self) -> PermissionStatus {
        match self.denied {
            Some(status) => status,
            None => self.provider.check().await,
        }
    }

    /// Whether the system will no longer prompt for access
    #[must_use]
    pub const fn is_blocked(&self) -> bool {
        matches!(self.denied, Some(PermissionStatus::Blocked))
    }

    /// Guidance shown when access is blocked
    #[must_use]
    pub const fn settings_hint() -> &'static str {
        "Microphone access is blocked. Enable it for this terminal in your system privacy settings, then restart wakelink."
    }
}
