//! Duplex link to the remote assistant
//!
//! A transport owns exactly one connection at a time. The coordinator only
//! sees lifecycle events and inbound payloads; it never touches the socket.

mod websocket;

pub use websocket::WebSocketTransport;

use async_trait::async_trait;

use crate::Result;
use crate::voice::Utterance;

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Opening,
    Open,
}

/// Payload delivered by the remote peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundPayload {
    /// Playable audio (WAV or MP3)
    Audio(Vec<u8>),
    /// Informational notice, not interpreted
    Text(String),
}

/// Something the transport wants the coordinator to know
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Closed,
    Failed(String),
    Inbound(InboundPayload),
}

/// Connection to the remote assistant
#[async_trait]
pub trait Transport: Send {
    /// Current lifecycle state
    fn state(&self) -> ConnectionState;

    /// Begin opening a connection; the outcome arrives as `Opened` or `Failed`
    ///
    /// No-op while a connection is opening or open.
    ///
    /// # Errors
    ///
    /// Returns `Error::Connection` if the attempt cannot be started
    fn connect(&mut self) -> Result<()>;

    /// Send one utterance as a single message
    ///
    /// Fails fast when the connection is not open or another send is still
    /// in flight. Nothing is queued or retried.
    ///
    /// # Errors
    ///
    /// Returns `Error::Connection` if the utterance was not accepted
    fn send_utterance(&mut self, utterance: Utterance) -> Result<()>;

    /// Next lifecycle event or inbound payload; pends while there is none
    ///
    /// Must be cancel-safe.
    async fn next_event(&mut self) -> TransportEvent;

    /// Close the current connection; events from it are no longer delivered
    fn close(&mut self);

    fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }
}

/// Helper for implementations: reject sends on a link that is not open
///
/// # Errors
///
/// Returns `Error::Connection` unless `state` is `Open`
pub fn ensure_open(state: ConnectionState, utterance: &Utterance) -> Result<()> {
    if state == ConnectionState::Open {
        return Ok(());
    }
    tracing::warn!(bytes = utterance.len(), ?state, "dropping utterance, link not open");
    Err(crate::Error::Connection("not connected".to_string()))
}
