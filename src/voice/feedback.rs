//! Trigger acknowledgement
//!
//! Fire-and-forget signal that the trigger phrase was heard.

use std::io::Write;

use crate::config::FeedbackStyle;

/// Best-effort acknowledgement; must return quickly
pub trait Acknowledge: Send {
    fn acknowledge(&self);
}

/// Rings the terminal bell on stderr
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalBell;

impl Acknowledge for TerminalBell {
    fn acknowledge(&self) {
        let mut stderr = std::io::stderr();
        if stderr.write_all(b"\x07").and_then(|()| stderr.flush()).is_err() {
            tracing::trace!("bell not delivered");
        }
    }
}

/// No feedback
#[derive(Debug, Default, Clone, Copy)]
pub struct Silent;

impl Acknowledge for Silent {
    fn acknowledge(&self) {}
}

/// Build the acknowledgement for a configured style
#[must_use]
pub fn from_style(style: FeedbackStyle) -> Box<dyn Acknowledge> {
    match style {
        FeedbackStyle::Bell => Box::new(TerminalBell),
        FeedbackStyle::None => Box::new(Silent),
    }
}
