//! Session orchestration
//!
//! The coordinator arbitrates between wake word detection, capture, the
//! remote link and playback, and publishes status for front-ends.

mod coordinator;
mod status;

pub use coordinator::{Command, Coordinator, CoordinatorHandle, ListenMode, Subsystems};
pub use status::{SessionStatus, StatusUpdate};
