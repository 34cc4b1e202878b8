//! Wakelink - wake word voice client for a remote assistant
//!
//! Listens for a trigger phrase, records one bounded utterance, ships it to a
//! remote assistant over a persistent WebSocket and plays the audio reply.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              Front-end (console, UI)                │
//! │        Commands ──▶            ◀── StatusUpdate     │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │               Session Coordinator                   │
//! │  Permission │ Wake Word │ Capture │ Link │ Playback │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │   cpal devices │ recognizer process │ WebSocket     │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod peer;
pub mod permission;
pub mod session;
pub mod transport;
pub mod voice;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use session::{Command, Coordinator, CoordinatorHandle, SessionStatus, StatusUpdate, Subsystems};
