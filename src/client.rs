//! The duplex client: `Connect` → login handshake → heartbeat + read loop,
//! with automatic reconnect on top of a single outbound write channel
//! (spec.md §4.2).
//!
//! Three background tasks run per live connection lifetime: a read loop
//! (owns the socket's read half, dies with the socket), a heartbeat loop
//! (persists across reconnects, drives ping/pong and RTT), and a reconnect
//! loop (persists across the client's lifetime, coalesces concurrent
//! trigger calls onto a single in-flight retry). All outbound frames funnel
//! through one channel into a writer task that is the socket's sole owner —
//! the same single-writer-via-actor shape the teacher's
//! `client/protocol/ws.rs` uses for its `action_tx`/`InboundAction` channel.

pub mod error;
pub(crate) mod wire;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest};

use crate::codec::{self, OpcodeClass};
use crate::session::{Direction, Recorder};

pub use error::ClientError;
use wire::{HeartbeatPing, HeartbeatPong, LoginReq, LoginResp};

type StateHandler = Box<dyn Fn(ClientState, ClientState) + Send + Sync>;
type PushHandler = Box<dyn Fn(u16, Vec<u8>) + Send + Sync>;
type MessageHandler = Box<dyn Fn(u16, Vec<u8>) + Send + Sync>;
type RttHandler = Box<dyn Fn(Duration) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

const ST_DISCONNECTED: u8 = 0;
const ST_CONNECTING: u8 = 1;
const ST_CONNECTED: u8 = 2;
const ST_RECONNECTING: u8 = 3;
const ST_CLOSED: u8 = 4;

impl From<u8> for ClientState {
    fn from(v: u8) -> Self {
        match v {
            ST_DISCONNECTED => ClientState::Disconnected,
            ST_CONNECTING => ClientState::Connecting,
            ST_CONNECTED => ClientState::Connected,
            ST_RECONNECTING => ClientState::Reconnecting,
            _ => ClientState::Closed,
        }
    }
}

impl From<ClientState> for u8 {
    fn from(s: ClientState) -> u8 {
        match s {
            ClientState::Disconnected => ST_DISCONNECTED,
            ClientState::Connecting => ST_CONNECTING,
            ClientState::Connected => ST_CONNECTED,
            ClientState::Reconnecting => ST_RECONNECTING,
            ClientState::Closed => ST_CLOSED,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: String,
    pub token: String,
    pub client_version: String,
    pub device_id: String,
    pub user_agent: String,
    pub enable_compression: bool,
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub ping_timeout: Duration,
    pub reconnect_interval: Duration,
    pub max_reconnect_tries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: String::new(),
            client_version: "0.1.0".into(),
            device_id: uuid::Uuid::new_v4().to_string(),
            user_agent: concat!("protean-link/", env!("CARGO_PKG_VERSION")).into(),
            enable_compression: false,
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(2),
            max_reconnect_tries: 5,
        }
    }
}

enum WriteCommand {
    Frame(Vec<u8>),
    Stop,
}

struct Inner {
    config: ClientConfig,
    recorder: Option<Arc<Recorder>>,

    state: AtomicU8,
    last_push_seq: AtomicU64,
    ping_seq: AtomicU64,
    reconnect_attempts: AtomicU32,
    avg_rtt_nanos: AtomicU64,

    write_tx: AsyncMutex<Option<mpsc::UnboundedSender<WriteCommand>>>,
    reconnect_tx: AsyncMutex<Option<mpsc::Sender<()>>>,
    tasks: AsyncMutex<Vec<JoinHandle<()>>>,
    pending_pings: StdMutex<HashMap<u64, Instant>>,
    last_error: StdMutex<Option<ClientError>>,

    state_handler: StdMutex<Option<StateHandler>>,
    push_handler: StdMutex<Option<PushHandler>>,
    message_handler: StdMutex<Option<MessageHandler>>,
    rtt_handler: StdMutex<Option<RttHandler>>,
}

impl Inner {
    fn state(&self) -> ClientState {
        self.state.load(Ordering::Acquire).into()
    }

    fn set_state(&self, new: ClientState) {
        let old: ClientState = self.state.swap(new.into(), Ordering::AcqRel).into();
        if old != new
            && let Some(handler) = self
                .state_handler
                .lock()
                .expect("state handler lock never poisoned by a panicking holder")
                .as_ref()
        {
            handler(old, new);
        }
    }

    /// CAS `from` -> `to`. Returns whether the swap happened.
    fn try_transition(&self, from: ClientState, to: ClientState) -> bool {
        let ok = self
            .state
            .compare_exchange(from.into(), to.into(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if ok
            && let Some(handler) = self
                .state_handler
                .lock()
                .expect("state handler lock never poisoned by a panicking holder")
                .as_ref()
        {
            handler(from, to);
        }
        ok
    }
}

/// A reconnecting, heartbeating, sequence-deduplicating WebSocket client
/// (spec.md §4.2). Cheaply cloneable — all state lives behind the shared
/// `Arc<Inner>`, the same shape [`crate::replay::Replayer`] uses.
#[derive(Clone)]
pub struct DuplexClient {
    inner: Arc<Inner>,
}

impl DuplexClient {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_recorder(config, None)
    }

    /// Every recorded frame and reconnect is tee'd into `recorder`, the same
    /// collaborator [`crate::proxy::RecordingProxy`] writes through.
    pub fn with_recorder(config: ClientConfig, recorder: Option<Arc<Recorder>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                recorder,
                state: AtomicU8::new(ST_DISCONNECTED),
                last_push_seq: AtomicU64::new(0),
                ping_seq: AtomicU64::new(0),
                reconnect_attempts: AtomicU32::new(0),
                avg_rtt_nanos: AtomicU64::new(0),
                write_tx: AsyncMutex::new(None),
                reconnect_tx: AsyncMutex::new(None),
                tasks: AsyncMutex::new(Vec::new()),
                pending_pings: StdMutex::new(HashMap::new()),
                last_error: StdMutex::new(None),
                state_handler: StdMutex::new(None),
                push_handler: StdMutex::new(None),
                message_handler: StdMutex::new(None),
                rtt_handler: StdMutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ClientState {
        self.inner.state()
    }

    /// Register state-transition, push, message and RTT callbacks. Must be
    /// called before [`DuplexClient::connect`] — there is no lock protecting
    /// these slots against a concurrently running reader.
    pub fn on_state_change(&self, f: impl Fn(ClientState, ClientState) + Send + Sync + 'static) {
        *self
            .inner
            .state_handler
            .lock()
            .expect("state handler lock never poisoned by a panicking holder") = Some(Box::new(f));
    }

    pub fn on_push(&self, f: impl Fn(u16, Vec<u8>) + Send + Sync + 'static) {
        *self
            .inner
            .push_handler
            .lock()
            .expect("push handler lock never poisoned by a panicking holder") = Some(Box::new(f));
    }

    pub fn on_message(&self, f: impl Fn(u16, Vec<u8>) + Send + Sync + 'static) {
        *self
            .inner
            .message_handler
            .lock()
            .expect("message handler lock never poisoned by a panicking holder") = Some(Box::new(f));
    }

    pub fn on_rtt_update(&self, f: impl Fn(Duration) + Send + Sync + 'static) {
        *self
            .inner
            .rtt_handler
            .lock()
            .expect("rtt handler lock never poisoned by a panicking holder") = Some(Box::new(f));
    }

    pub fn average_rtt(&self) -> Duration {
        Duration::from_nanos(self.inner.avg_rtt_nanos.load(Ordering::Relaxed))
    }

    /// The most recent terminal error the background loops observed, if any
    /// — in particular [`ClientError::BackoffExhausted`] once
    /// `reconnect_loop` gives up, since that path has no `Result` to return
    /// to a caller. Cleared on the next successful [`DuplexClient::connect`].
    pub fn last_error(&self) -> Option<ClientError> {
        self.inner
            .last_error
            .lock()
            .expect("last error lock never poisoned by a panicking holder")
            .clone()
    }

    /// Dial, perform the login handshake, and bring up the heartbeat, read
    /// and reconnect loops. Fails fast if not currently `DISCONNECTED`.
    pub async fn connect(&self) -> Result<(), ClientError> {
        if !self.inner.try_transition(ClientState::Disconnected, ClientState::Connecting) {
            return Err(ClientError::NotDisconnected);
        }

        if let Err(err) = do_connect(&self.inner).await {
            self.inner.set_state(ClientState::Disconnected);
            return Err(err);
        }
        self.inner.set_state(ClientState::Connected);

        let (reconnect_tx, reconnect_rx) = mpsc::channel::<()>(1);
        *self.inner.reconnect_tx.lock().await = Some(reconnect_tx);

        let heartbeat_inner = Arc::clone(&self.inner);
        let reconnect_inner = Arc::clone(&self.inner);
        let mut tasks = self.inner.tasks.lock().await;
        tasks.push(tokio::spawn(heartbeat_loop(heartbeat_inner)));
        tasks.push(tokio::spawn(reconnect_loop(reconnect_inner, reconnect_rx)));
        Ok(())
    }

    /// Encode and enqueue a frame. Fails with `NotConnected` unless the
    /// client is currently `CONNECTED` — callers should retry after the
    /// state handler reports `CONNECTED` again.
    pub async fn send_action(&self, opcode: u16, body: Vec<u8>) -> Result<(), ClientError> {
        if self.inner.state() != ClientState::Connected {
            return Err(ClientError::NotConnected);
        }
        let frame = codec::encode(opcode, &body);
        let tx = self
            .inner
            .write_tx
            .lock()
            .await
            .clone()
            .ok_or(ClientError::NotConnected)?;
        tx.send(WriteCommand::Frame(frame.clone()))
            .map_err(|_| ClientError::WriteFailed("writer task no longer running".into()))?;
        if let Some(recorder) = &self.inner.recorder {
            recorder.record_message(Direction::Send, frame, opcode, body, 0);
        }
        Ok(())
    }

    /// Tear the client down for good. Idempotent; permitted from any state
    /// but `CLOSED` itself.
    pub async fn close(&self) -> Result<(), ClientError> {
        let old: ClientState = self.inner.state.swap(ST_CLOSED, Ordering::AcqRel).into();
        if old == ClientState::Closed {
            return Ok(());
        }
        if let Some(tx) = self.inner.write_tx.lock().await.take() {
            let _ = tx.send(WriteCommand::Stop);
        }
        self.inner.reconnect_tx.lock().await.take();
        let handles: Vec<_> = self.inner.tasks.lock().await.drain(..).collect();
        for handle in handles {
            handle.abort();
        }
        if let Some(recorder) = &self.inner.recorder {
            recorder.record_close(None);
        }
        Ok(())
    }
}

/// Dial the configured URL, run the login handshake, and spawn the writer
/// and read-loop tasks for the resulting socket. Installs the new
/// `write_tx` into `inner` on success; leaves it untouched on failure so a
/// caller mid-reconnect can simply retry.
async fn do_connect(inner: &Arc<Inner>) -> Result<(), ClientError> {
    let mut request = inner
        .config
        .url
        .clone()
        .into_client_request()
        .map_err(|e| ClientError::DialFailed(e.to_string()))?;
    let headers = request.headers_mut();
    headers.insert(
        "User-Agent",
        inner
            .config
            .user_agent
            .parse()
            .map_err(|_| ClientError::DialFailed("invalid user_agent header value".into()))?,
    );
    if inner.config.enable_compression {
        headers.insert("Sec-WebSocket-Extensions", "permessage-deflate".parse().unwrap());
    }
    let (stream, _) = tokio::time::timeout(
        inner.config.handshake_timeout,
        tokio_tungstenite::connect_async(request),
    )
    .await
    .map_err(|_| ClientError::HandshakeTimeout)?
    .map_err(|e| ClientError::DialFailed(e.to_string()))?;

    let (mut ws_writer, mut ws_reader) = stream.split();

    let login = LoginReq {
        token: inner.config.token.clone(),
        client_version: inner.config.client_version.clone(),
        device_id: inner.config.device_id.clone(),
    };
    let body = serde_json::to_vec(&login)
        .map_err(|e| ClientError::DialFailed(format!("login request encode failed: {e}")))?;
    let frame = codec::encode(wire::OPCODE_LOGIN_REQ, &body);
    ws_writer
        .send(tungstenite::Message::Binary(frame.into()))
        .await
        .map_err(|e| ClientError::WriteFailed(e.to_string()))?;

    let resp = tokio::time::timeout(inner.config.handshake_timeout, ws_reader.next())
        .await
        .map_err(|_| ClientError::HandshakeTimeout)?
        .ok_or(ClientError::HandshakeTimeout)?
        .map_err(|e| ClientError::ReadFailed(e.to_string()))?;
    let raw = message_into_bytes(resp);
    let (opcode, resp_body) =
        codec::decode(&raw).map_err(|e| ClientError::DecodeFailed(e.to_string()))?;
    if opcode != wire::OPCODE_LOGIN_RESP {
        return Err(ClientError::LoginRejected(format!(
            "expected login response, got opcode {opcode}"
        )));
    }
    let login_resp: LoginResp = serde_json::from_slice(resp_body)
        .map_err(|e| ClientError::LoginRejected(format!("malformed login response: {e}")))?;
    if !login_resp.success {
        return Err(ClientError::LoginRejected(
            login_resp.reason.unwrap_or_else(|| "denied".into()),
        ));
    }

    let (write_tx, write_rx) = mpsc::unbounded_channel::<WriteCommand>();
    *inner.write_tx.lock().await = Some(write_tx);

    let read_inner = Arc::clone(inner);
    let write_inner = Arc::clone(inner);
    let mut tasks = inner.tasks.lock().await;
    tasks.push(tokio::spawn(writer_loop(write_inner, ws_writer, write_rx)));
    tasks.push(tokio::spawn(read_loop(read_inner, ws_reader)));

    if let Some(recorder) = &inner.recorder {
        recorder.record_event(crate::session::EventType::Login, Default::default());
    }
    Ok(())
}

fn message_into_bytes(message: tungstenite::Message) -> Vec<u8> {
    match message {
        tungstenite::Message::Binary(b) => b.into(),
        tungstenite::Message::Text(t) => t.as_bytes().to_vec(),
        _ => Vec::new(),
    }
}

type WsSink = futures::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    tungstenite::Message,
>;
type WsStream = futures::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

/// Sole owner of the socket's write half: every outbound frame — user
/// actions, heartbeat pings — funnels through `write_rx` so the socket is
/// never written to from two tasks at once.
async fn writer_loop(inner: Arc<Inner>, mut sink: WsSink, mut write_rx: mpsc::UnboundedReceiver<WriteCommand>) {
    while let Some(cmd) = write_rx.recv().await {
        match cmd {
            WriteCommand::Frame(frame) => {
                if sink.send(tungstenite::Message::Binary(frame.into())).await.is_err() {
                    trigger_reconnect(&inner).await;
                    break;
                }
            }
            WriteCommand::Stop => break,
        }
    }
    let _ = sink.close().await;
}

/// Sole owner of the socket's read half for this connection's lifetime.
/// Ends (and triggers a reconnect) the moment the socket errors, closes, or
/// hands back a frame this crate can't decode.
async fn read_loop(inner: Arc<Inner>, mut stream: WsStream) {
    loop {
        let message = match stream.next().await {
            Some(Ok(message)) => message,
            Some(Err(_)) | None => {
                trigger_reconnect(&inner).await;
                return;
            }
        };
        if matches!(message, tungstenite::Message::Close(_)) {
            trigger_reconnect(&inner).await;
            return;
        }
        let raw = message_into_bytes(message);
        if raw.is_empty() {
            continue;
        }
        let Ok((opcode, body)) = codec::decode(&raw) else {
            log::warn!("dropped undecodable frame ({} byte(s))", raw.len());
            continue;
        };
        dispatch_inbound(&inner, opcode, body, &raw);
    }
}

fn dispatch_inbound(inner: &Arc<Inner>, opcode: u16, body: &[u8], raw: &[u8]) {
    if opcode == wire::OPCODE_HEARTBEAT_PONG {
        handle_pong(inner, body);
        return;
    }
    if opcode == wire::OPCODE_LOGIN_RESP {
        return;
    }

    match codec::classify(opcode) {
        OpcodeClass::Push => {
            let Some((seq, payload)) = wire::split_push_seq(body) else {
                log::warn!("push frame missing sequence header (opcode {opcode})");
                return;
            };
            let accepted = inner
                .last_push_seq
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| {
                    (seq > prev).then_some(seq)
                })
                .is_ok();
            if !accepted {
                return;
            }
            if let Some(recorder) = &inner.recorder {
                recorder.record_message(Direction::Receive, raw.to_vec(), opcode, payload.to_vec(), seq);
            }
            if let Some(handler) = inner
                .push_handler
                .lock()
                .expect("push handler lock never poisoned by a panicking holder")
                .as_ref()
            {
                handler(opcode, payload.to_vec());
            }
        }
        _ => {
            if let Some(recorder) = &inner.recorder {
                recorder.record_message(Direction::Receive, raw.to_vec(), opcode, body.to_vec(), 0);
            }
            if let Some(handler) = inner
                .message_handler
                .lock()
                .expect("message handler lock never poisoned by a panicking holder")
                .as_ref()
            {
                handler(opcode, body.to_vec());
            }
        }
    }
}

fn handle_pong(inner: &Arc<Inner>, body: &[u8]) {
    let Ok(pong) = serde_json::from_slice::<HeartbeatPong>(body) else {
        return;
    };
    let sent_at = inner
        .pending_pings
        .lock()
        .expect("pending ping lock never poisoned by a panicking holder")
        .remove(&pong.ping_seq);
    let Some(sent_at) = sent_at else {
        return;
    };
    let rtt = sent_at.elapsed();

    // Exponential moving average, same smoothing constant TCP uses for its
    // SRTT estimator (RFC 6298's alpha = 1/8).
    let prev = inner.avg_rtt_nanos.load(Ordering::Relaxed);
    let rtt_nanos = rtt.as_nanos().min(u64::MAX as u128) as u64;
    let updated = if prev == 0 {
        rtt_nanos
    } else {
        prev - prev / 8 + rtt_nanos / 8
    };
    inner.avg_rtt_nanos.store(updated, Ordering::Relaxed);

    if let Some(recorder) = &inner.recorder {
        recorder.record_latency(rtt);
    }
    if let Some(handler) = inner
        .rtt_handler
        .lock()
        .expect("rtt handler lock never poisoned by a panicking holder")
        .as_ref()
    {
        handler(rtt);
    }
}

/// Persists for the client's whole lifetime (unlike the read/write tasks,
/// which are per-connection). Skips its tick silently whenever the client
/// isn't `CONNECTED`; a stale outstanding ping past `ping_timeout`
/// triggers a reconnect.
async fn heartbeat_loop(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(inner.config.heartbeat_interval);
    loop {
        ticker.tick().await;
        if inner.state() == ClientState::Closed {
            return;
        }
        if inner.state() != ClientState::Connected {
            continue;
        }

        {
            let mut pending = inner
                .pending_pings
                .lock()
                .expect("pending ping lock never poisoned by a panicking holder");
            let now = Instant::now();
            let stale = pending
                .values()
                .any(|sent_at| now.duration_since(*sent_at) > inner.config.ping_timeout);
            if stale {
                pending.clear();
                drop(pending);
                trigger_reconnect(&inner).await;
                continue;
            }
        }

        let ping_seq = inner.ping_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let ping = HeartbeatPing {
            ping_seq,
            client_millis: chrono::Utc::now().timestamp_millis(),
        };
        let Ok(body) = serde_json::to_vec(&ping) else {
            continue;
        };
        let frame = codec::encode(wire::OPCODE_HEARTBEAT_PING, &body);

        let tx = inner.write_tx.lock().await.clone();
        if let Some(tx) = tx {
            inner
                .pending_pings
                .lock()
                .expect("pending ping lock never poisoned by a panicking holder")
                .insert(ping_seq, Instant::now());
            if tx.send(WriteCommand::Frame(frame)).is_err() {
                trigger_reconnect(&inner).await;
            }
        }
    }
}

/// Single-slot trigger: concurrent callers to `trigger_reconnect` coalesce
/// onto whichever retry is already in flight, since the channel silently
/// drops the trigger when it's already full.
async fn trigger_reconnect(inner: &Arc<Inner>) {
    if inner.state() == ClientState::Closed {
        return;
    }
    let tx = inner.reconnect_tx.lock().await.clone();
    if let Some(tx) = tx {
        let _ = tx.try_send(());
    }
}

/// Persists for the client's whole lifetime. Backs off `max_reconnect_tries`
/// times at `reconnect_interval` before giving up and settling into
/// `DISCONNECTED` (spec.md §4.2).
async fn reconnect_loop(inner: Arc<Inner>, mut reconnect_rx: mpsc::Receiver<()>) {
    while reconnect_rx.recv().await.is_some() {
        if inner.state() == ClientState::Closed {
            return;
        }
        if !inner.try_transition(ClientState::Connected, ClientState::Reconnecting) {
            continue;
        }
        if let Some(recorder) = &inner.recorder {
            recorder.record_reconnect();
        }

        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            inner.reconnect_attempts.store(attempt, Ordering::Relaxed);
            match do_connect(&inner).await {
                Ok(()) => break Ok(()),
                Err(err) => {
                    if attempt >= inner.config.max_reconnect_tries {
                        break Err(err);
                    }
                    tokio::time::sleep(inner.config.reconnect_interval).await;
                }
            }
        };

        match outcome {
            Ok(()) => {
                inner.reconnect_attempts.store(0, Ordering::Relaxed);
                *inner
                    .last_error
                    .lock()
                    .expect("last error lock never poisoned by a panicking holder") = None;
                inner.set_state(ClientState::Connected);
            }
            Err(err) => {
                log::error!("reconnect exhausted after {attempt} attempt(s): {err}");
                *inner
                    .last_error
                    .lock()
                    .expect("last error lock never poisoned by a panicking holder") =
                    Some(ClientError::BackoffExhausted);
                inner.set_state(ClientState::Disconnected);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_u8() {
        for state in [
            ClientState::Disconnected,
            ClientState::Connecting,
            ClientState::Connected,
            ClientState::Reconnecting,
            ClientState::Closed,
        ] {
            let byte: u8 = state.into();
            assert_eq!(ClientState::from(byte), state);
        }
    }

    #[tokio::test]
    async fn connect_requires_disconnected_state() {
        let client = DuplexClient::new(ClientConfig {
            url: "ws://127.0.0.1:1".into(),
            ..Default::default()
        });
        client.inner.state.store(ST_CONNECTED, Ordering::SeqCst);
        let err = client.connect().await.unwrap_err();
        assert_eq!(err, ClientError::NotDisconnected);
    }

    /// Concrete scenario 3 (spec.md §8): a reconnect loop that exhausts
    /// `max_reconnect_tries` against an address nothing listens on settles
    /// into `DISCONNECTED` and leaves `BackoffExhausted` observable via
    /// `last_error()`, since the loop has no caller to return a `Result` to.
    #[tokio::test]
    async fn reconnect_exhaustion_surfaces_backoff_exhausted() {
        let client = DuplexClient::new(ClientConfig {
            url: "ws://127.0.0.1:1".into(),
            reconnect_interval: Duration::from_millis(1),
            max_reconnect_tries: 3,
            ..Default::default()
        });

        // Bypass `connect()` (which would fail immediately against a dead
        // address) to drive `reconnect_loop` directly from `CONNECTED`, the
        // state it actually starts a reconnect attempt from.
        client.inner.state.store(ST_CONNECTED, Ordering::SeqCst);
        let (reconnect_tx, reconnect_rx) = mpsc::channel::<()>(1);
        *client.inner.reconnect_tx.lock().await = Some(reconnect_tx.clone());
        let loop_inner = Arc::clone(&client.inner);
        tokio::spawn(reconnect_loop(loop_inner, reconnect_rx));

        reconnect_tx.try_send(()).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(client.state(), ClientState::Disconnected);
        assert_eq!(client.last_error(), Some(ClientError::BackoffExhausted));
    }

    #[tokio::test]
    async fn send_action_requires_connected_state() {
        let client = DuplexClient::new(ClientConfig::default());
        let err = client.send_action(1, vec![]).await.unwrap_err();
        assert_eq!(err, ClientError::NotConnected);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let client = DuplexClient::new(ClientConfig::default());
        client.close().await.unwrap();
        client.close().await.unwrap();
        assert_eq!(client.state(), ClientState::Closed);
    }

    #[test]
    fn dial_failure_reports_dial_failed() {
        let req: Result<tungstenite::client::Request, _> = "not a url".into_client_request();
        assert!(req.is_err());
    }

    /// Fuzzes the push-sequence dedup with a random permutation of a
    /// strictly increasing sequence to make sure delivery order, not just
    /// arrival order, drives the accept/drop decision.
    #[test]
    fn push_dedup_accepts_each_sequence_exactly_once_regardless_of_arrival_order() {
        use rand::seq::SliceRandom;

        let last_seq = AtomicU64::new(0);
        let mut seqs: Vec<u64> = (1..=50).collect();
        seqs.shuffle(&mut rand::rng());

        let mut accepted = Vec::new();
        for seq in seqs {
            let was_accepted = last_seq
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| {
                    (seq > prev).then_some(seq)
                })
                .is_ok();
            if was_accepted {
                accepted.push(seq);
            }
        }

        // Every value gets one honest accept/reject decision against the
        // *current* max, so the exact accepted subset depends on arrival
        // order, but the running max only ever climbs.
        let mut maxima = Vec::new();
        let mut running_max = 0;
        for seq in &accepted {
            running_max = running_max.max(*seq);
            maxima.push(running_max);
        }
        assert!(maxima.windows(2).all(|w| w[1] >= w[0]));
        assert_eq!(last_seq.load(Ordering::Acquire), 50);
    }
}
