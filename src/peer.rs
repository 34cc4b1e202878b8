//! Loopback remote peer
//!
//! A minimal stand-in for the remote assistant: accepts utterances on
//! `GET /ws`, acknowledges each with a text notice, and in echo mode sends
//! the same audio back as the response.

use std::net::SocketAddr;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::Result;

/// How the peer answers an utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum PeerMode {
    /// Send the utterance back as the response
    #[default]
    Echo,
    /// Acknowledge only; never respond with audio
    Silent,
}

/// Text notice sent for every utterance
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerNotice {
    Received { bytes: usize },
}

/// Build the peer router
pub fn router(mode: PeerMode) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(mode)
        .layer(TraceLayer::new_for_http())
}

async fn ws_upgrade(State(mode): State<PeerMode>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, mode))
}

async fn handle_socket(socket: WebSocket, mode: PeerMode) {
    let (mut sender, mut receiver) = socket.split();
    tracing::info!(?mode, "client connected");

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Binary(data) => {
                tracing::info!(bytes = data.len(), "utterance received");

                let notice = PeerNotice::Received { bytes: data.len() };
                if let Ok(text) = serde_json::to_string(&notice) {
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }

                if mode == PeerMode::Echo && sender.send(Message::Binary(data)).await.is_err() {
                    break;
                }
            }
            Message::Text(text) => {
                tracing::info!(text = text.as_str(), "client notice");
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    tracing::info!("client disconnected");
}

/// A bound loopback peer
pub struct LoopbackPeer {
    listener: TcpListener,
    mode: PeerMode,
}

impl LoopbackPeer {
    /// Bind to `127.0.0.1:port`; port 0 picks a free one
    ///
    /// # Errors
    ///
    /// Returns error if the port cannot be bound
    pub async fn bind(port: u16, mode: PeerMode) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        Ok(Self { listener, mode })
    }

    /// Address the peer listens on
    ///
    /// # Errors
    ///
    /// Returns error if the socket address is unavailable
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the process exits
    ///
    /// # Errors
    ///
    /// Returns error if the server fails
    pub async fn run(self) -> Result<()> {
        let addr = self.local_addr()?;
        tracing::info!(%addr, mode = ?self.mode, "loopback peer listening");

        axum::serve(self.listener, router(self.mode)).await?;
        Ok(())
    }

    /// Serve in a background task
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run().await })
    }
}
