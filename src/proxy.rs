//! Transparent man-in-the-middle proxy: accepts a downstream WebSocket
//! connection, dials the real upstream, and forwards frames in both
//! directions while tee-ing each one into a [`Recorder`] (spec.md §4.3).
//!
//! Each direction runs in its own task so a slow or stalled consumer on one
//! side never blocks the other; the two tasks share one cancellation signal
//! so either side closing tears the whole connection down.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest};
use tokio_tungstenite::{accept_async, connect_async};

use crate::client::wire;
use crate::codec::{self, OpcodeClass};
use crate::session::{Direction, Recorder};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyError {
    ListenFailed(String),
    AcceptFailed(String),
    UpstreamDialFailed(String),
    HandshakeFailed(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::ListenFailed(reason) => write!(f, "failed to bind listener: {reason}"),
            ProxyError::AcceptFailed(reason) => write!(f, "failed to accept connection: {reason}"),
            ProxyError::UpstreamDialFailed(reason) => {
                write!(f, "failed to dial upstream: {reason}")
            }
            ProxyError::HandshakeFailed(reason) => {
                write!(f, "websocket handshake failed: {reason}")
            }
        }
    }
}

impl std::error::Error for ProxyError {}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub upstream_url: String,
}

/// The shape an HTTP status collaborator's `GET /status` response would
/// serialize (spec.md §6). This crate never binds an HTTP listener — that
/// surface is an explicit Non-goal — but callers building one need a
/// stable struct to report through, so it lives here next to the data it
/// describes rather than being reinvented per host.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProxyStatus {
    pub session_id: String,
    pub event_count: u64,
    pub frame_count: u64,
    pub upstream_url: String,
    pub listen_addr: SocketAddr,
}

impl RecordingProxy {
    /// Build the current [`ProxyStatus`] snapshot from this proxy's config
    /// and a recorder's live session. Cheap: reads the recorder's current
    /// (possibly still-active) session rather than requiring `Stop()` first.
    pub fn status(&self, recorder: &Recorder) -> ProxyStatus {
        let session = recorder.get_session();
        ProxyStatus {
            session_id: session.id,
            event_count: session.events.len() as u64,
            frame_count: session.frames.len() as u64,
            upstream_url: self.config.upstream_url.clone(),
            listen_addr: self.config.listen_addr,
        }
    }
}

/// Owns the listening socket. `serve` runs until [`RecordingProxy::stop`]
/// is called or the listener itself errors; each accepted connection is
/// handled on its own task and survives the others failing.
pub struct RecordingProxy {
    config: ProxyConfig,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl RecordingProxy {
    pub fn new(config: ProxyConfig) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            config,
            stop_tx,
            stop_rx,
        }
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Accept connections until stopped. Every accepted connection shares
    /// `recorder`, so a single [`RecordingProxy`] can multiplex many client
    /// sessions into one timeline if the caller wants that; callers wanting
    /// per-connection recorders should construct a fresh `RecordingProxy`
    /// (or pass a fresh `Recorder`) per accept instead.
    pub async fn serve(&self, recorder: Arc<Recorder>) -> Result<(), ProxyError> {
        let listener = TcpListener::bind(self.config.listen_addr)
            .await
            .map_err(|e| ProxyError::ListenFailed(e.to_string()))?;
        let mut stop_rx = self.stop_rx.clone();

        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        return Ok(());
                    }
                }
                accepted = listener.accept() => {
                    let (stream, _peer) = accepted.map_err(|e| ProxyError::AcceptFailed(e.to_string()))?;
                    let upstream_url = self.config.upstream_url.clone();
                    let recorder = Arc::clone(&recorder);
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, upstream_url, recorder).await {
                            log::error!("proxy connection terminated: {err}");
                        }
                    });
                }
            }
        }
    }
}

async fn handle_connection(
    downstream_tcp: tokio::net::TcpStream,
    upstream_url: String,
    recorder: Arc<Recorder>,
) -> Result<(), ProxyError> {
    let downstream = accept_async(downstream_tcp)
        .await
        .map_err(|e| ProxyError::HandshakeFailed(e.to_string()))?;
    let request = upstream_url
        .into_client_request()
        .map_err(|e| ProxyError::UpstreamDialFailed(e.to_string()))?;
    let (upstream, _) = connect_async(request)
        .await
        .map_err(|e| ProxyError::UpstreamDialFailed(e.to_string()))?;

    let (down_write, down_read) = downstream.split();
    let (up_write, up_read) = upstream.split();

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let cancel_tx = Arc::new(cancel_tx);

    let client_to_upstream = tokio::spawn(copy_direction(
        down_read,
        up_write,
        Direction::Send,
        Arc::clone(&recorder),
        cancel_rx.clone(),
        Arc::clone(&cancel_tx),
    ));
    let upstream_to_client = tokio::spawn(copy_direction(
        up_read,
        down_write,
        Direction::Receive,
        recorder,
        cancel_rx,
        cancel_tx,
    ));

    let _ = tokio::join!(client_to_upstream, upstream_to_client);
    recorder.record_close(None);
    Ok(())
}

/// Forward every message from `read` to `write`, tee-ing a copy into
/// `recorder` first. Stops on read/write failure, a close frame, or the
/// shared cancellation signal — in any case it fires `cancel_tx` so its
/// sibling task in the other direction also stops.
async fn copy_direction<R, W>(
    mut read: R,
    mut write: W,
    direction: Direction,
    recorder: Arc<Recorder>,
    mut cancel_rx: watch::Receiver<bool>,
    cancel_tx: Arc<watch::Sender<bool>>,
) where
    R: Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
    W: Sink<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel_rx.changed() => {
                if *cancel_rx.borrow() {
                    break;
                }
            }
            next = read.next() => {
                let message = match next {
                    Some(Ok(message)) => message,
                    _ => {
                        let _ = cancel_tx.send(true);
                        break;
                    }
                };
                if matches!(message, tungstenite::Message::Close(_)) {
                    let _ = cancel_tx.send(true);
                    break;
                }

                tee_into_recorder(&recorder, direction, &message);

                if write.send(message).await.is_err() {
                    let _ = cancel_tx.send(true);
                    break;
                }
            }
        }
    }
}

fn tee_into_recorder(recorder: &Recorder, direction: Direction, message: &tungstenite::Message) {
    let raw = match message {
        tungstenite::Message::Binary(b) => b.to_vec(),
        tungstenite::Message::Text(t) => t.as_bytes().to_vec(),
        _ => return,
    };
    let Ok((opcode, body)) = codec::decode(&raw) else {
        return;
    };
    let (sequence_num, payload) = match codec::classify(opcode) {
        OpcodeClass::Push => wire::split_push_seq(body).unwrap_or((0, body)),
        _ => (0, body),
    };
    recorder.record_message(direction, raw.clone(), opcode, payload.to_vec(), sequence_num);
}
