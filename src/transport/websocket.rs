//! WebSocket transport
//!
//! Each `connect` spawns one connection task tagged with a generation
//! number. `close` bumps the generation, so anything a superseded task still
//! reports is dropped in `next_event`.
//!
//! Only one utterance is ever accepted at a time: the in-flight flag is set
//! when `send_utterance` hands bytes to the task and cleared once the socket
//! write has finished, so nothing queues behind a slow send.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::Instrument;
use url::Url;
use uuid::Uuid;

use super::{ConnectionState, InboundPayload, Transport, TransportEvent, ensure_open};
use crate::voice::Utterance;
use crate::{Error, Result};

/// Capacity of the event channel shared by all connection tasks
const EVENT_BUFFER: usize = 32;

type Tagged = (u64, TransportEvent);

/// Persistent duplex link over `ws://` or `wss://`
pub struct WebSocketTransport {
    url: Url,
    connect_timeout: Duration,
    state: ConnectionState,
    generation: u64,
    session_id: Option<Uuid>,
    events_tx: mpsc::Sender<Tagged>,
    events_rx: mpsc::Receiver<Tagged>,
    outbound: Option<mpsc::Sender<Vec<u8>>>,
    /// Set while an utterance is queued or being written; cleared by the task
    in_flight: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl WebSocketTransport {
    /// Create a closed transport for `url`
    #[must_use]
    pub fn new(url: Url, connect_timeout: Duration) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        Self {
            url,
            connect_timeout,
            state: ConnectionState::Closed,
            generation: 0,
            session_id: None,
            events_tx,
            events_rx,
            outbound: None,
            in_flight: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }

    /// Endpoint this transport connects to
    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }

    /// Identifier of the current connection, if any
    #[must_use]
    pub const fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    /// Whether an utterance has been accepted but not yet written
    #[must_use]
    pub fn is_sending(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    fn teardown(&mut self) {
        self.generation += 1;
        self.outbound = None;
        self.session_id = None;
        if self.state == ConnectionState::Opening {
            if let Some(task) = self.task.take() {
                task.abort();
            }
        }
        self.state = ConnectionState::Closed;
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn state(&self) -> ConnectionState {
        self.state
    }

    fn connect(&mut self) -> Result<()> {
        if self.state != ConnectionState::Closed {
            return Ok(());
        }

        if let Some(task) = self.task.take() {
            task.abort();
        }

        self.generation += 1;
        let session_id = Uuid::new_v4();
        let (outbound_tx, outbound_rx) = mpsc::channel(1);
        self.in_flight = Arc::new(AtomicBool::new(false));

        let span = tracing::info_span!("link", session = %session_id);
        let task = tokio::spawn(
            run_connection(
                self.url.clone(),
                self.connect_timeout,
                self.generation,
                outbound_rx,
                Arc::clone(&self.in_flight),
                self.events_tx.clone(),
            )
            .instrument(span),
        );

        tracing::info!(url = %self.url, session = %session_id, "connecting");

        self.session_id = Some(session_id);
        self.outbound = Some(outbound_tx);
        self.task = Some(task);
        self.state = ConnectionState::Opening;
        Ok(())
    }

    fn send_utterance(&mut self, utterance: Utterance) -> Result<()> {
        ensure_open(self.state, &utterance)?;
        let outbound = self
            .outbound
            .as_ref()
            .ok_or_else(|| Error::Connection("not connected".to_string()))?;

        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::Connection(
                "previous utterance still sending".to_string(),
            ));
        }

        let bytes = utterance.len();
        match outbound.try_send(utterance.into_bytes()) {
            Ok(()) => {
                tracing::debug!(bytes, "utterance handed to connection");
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.in_flight.store(false, Ordering::Release);
                Err(Error::Connection(
                    "previous utterance still sending".to_string(),
                ))
            }
            Err(TrySendError::Closed(_)) => {
                self.in_flight.store(false, Ordering::Release);
                Err(Error::Connection("connection closed".to_string()))
            }
        }
    }

    async fn next_event(&mut self) -> TransportEvent {
        loop {
            let Some((generation, event)) = self.events_rx.recv().await else {
                // We hold a sender, so the channel never closes
                return std::future::pending().await;
            };

            if generation != self.generation {
                tracing::trace!(generation, ?event, "dropping event from old connection");
                continue;
            }

            match &event {
                TransportEvent::Opened => self.state = ConnectionState::Open,
                TransportEvent::Closed | TransportEvent::Failed(_) => {
                    self.state = ConnectionState::Closed;
                    self.outbound = None;
                    self.session_id = None;
                }
                TransportEvent::Inbound(_) => {}
            }
            return event;
        }
    }

    fn close(&mut self) {
        if self.state == ConnectionState::Closed && self.outbound.is_none() {
            return;
        }
        tracing::info!(session = ?self.session_id, "closing connection");
        self.teardown();
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Drive one connection until it closes, fails, or the owner lets go
async fn run_connection(
    url: Url,
    connect_timeout: Duration,
    generation: u64,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    in_flight: Arc<AtomicBool>,
    events: mpsc::Sender<Tagged>,
) {
    let emit = move |event: TransportEvent| {
        let events = events.clone();
        async move {
            let _ = events.send((generation, event)).await;
        }
    };

    let stream = match tokio::time::timeout(connect_timeout, connect_async(url.as_str())).await {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "connect failed");
            emit(TransportEvent::Failed(e.to_string())).await;
            return;
        }
        Err(_) => {
            tracing::warn!(timeout = ?connect_timeout, "connect timed out");
            emit(TransportEvent::Failed("connect timed out".to_string())).await;
            return;
        }
    };

    tracing::info!("connected");
    emit(TransportEvent::Opened).await;

    let (mut sink, mut stream) = stream.split();

    loop {
        tokio::select! {
            outgoing = outbound.recv() => {
                let Some(bytes) = outgoing else {
                    // Owner closed the link
                    let _ = sink.send(Message::Close(None)).await;
                    tracing::debug!("connection closed locally");
                    return;
                };

                let len = bytes.len();
                let sent = sink.send(Message::Binary(bytes.into())).await;
                in_flight.store(false, Ordering::Release);
                if let Err(e) = sent {
                    tracing::warn!(error = %e, "send failed");
                    emit(TransportEvent::Failed(e.to_string())).await;
                    return;
                }
                tracing::info!(bytes = len, "sent utterance");
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Binary(bytes))) => {
                        tracing::debug!(bytes = bytes.len(), "received audio");
                        emit(TransportEvent::Inbound(InboundPayload::Audio(bytes.to_vec()))).await;
                    }
                    Some(Ok(Message::Text(text))) => {
                        tracing::debug!(text = text.as_str(), "received notice");
                        emit(TransportEvent::Inbound(InboundPayload::Text(text.as_str().to_string()))).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(?frame, "peer closed connection");
                        emit(TransportEvent::Closed).await;
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "connection error");
                        emit(TransportEvent::Failed(e.to_string())).await;
                        return;
                    }
                    None => {
                        tracing::info!("connection ended");
                        emit(TransportEvent::Closed).await;
                        return;
                    }
                }
            }
        }
    }
}
