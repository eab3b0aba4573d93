//! Connection manager: owns the single live WebSocket and its retry policy.
//!
//! One driver task per engine owns the socket. It pumps outbound frames from a
//! bounded channel, hands inbound frames to a [`TransportHandler`], and on
//! unexpected loss runs the exponential-backoff reconnect loop. The pending
//! reconnect delay lives inside that task, so cancelling the task cancels the
//! timer and no second socket can ever be dialed concurrently.
//!
//! # State transitions
//!
//! ```text
//! Idle/Disconnected/Error --connect--> Connecting --open--> Connected
//! Connected --normal close--> Disconnected
//! Connected --abnormal close--> Disconnected --backoff--> Connecting
//! Connected --transport error--> Error --backoff--> Connecting
//! any --attempts exhausted--> Error (terminal until the next connect)
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{FutureExt, SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message, Utf8Bytes};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::base::{ConnectionState, RealtimeError, RealtimeResult, ReconnectionConfig, StatusCallback};
use super::codec::EventCodec;
use super::messages::ClientEvent;
use crate::core::debug_log::{DebugLog, LogLevel};

/// Channel capacity for WebSocket message sending.
const WS_CHANNEL_CAPACITY: usize = 256;

/// Upper bound for a single socket open.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `disconnect` waits for the close handshake before aborting.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Receives transport events from the driver task.
///
/// Implementations must not call back into [`ConnectionManager::connect`] or
/// [`ConnectionManager::disconnect`] from these hooks.
#[async_trait]
pub trait TransportHandler: Send + Sync {
    /// A socket opened. `reconnect_attempt` is `None` for an explicit connect.
    async fn on_open(&self, reconnect_attempt: Option<u32>);

    /// A text frame arrived.
    async fn on_text(&self, text: String);

    /// The live socket went away without the caller asking for it.
    async fn on_connection_lost(&self, reason: &str);

    /// Automatic reconnection gave up after `attempts` tries.
    async fn on_reconnect_exhausted(&self, attempts: u32);
}

/// Destination for typed outbound events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send_event(&self, event: ClientEvent) -> RealtimeResult<()>;
}

/// [`EventSink`] that encodes through a codec and writes to the live socket.
#[derive(Clone)]
pub struct Outbox {
    connection: ConnectionManager,
    codec: EventCodec,
}

impl Outbox {
    pub fn new(connection: ConnectionManager, codec: EventCodec) -> Self {
        Self { connection, codec }
    }
}

#[async_trait]
impl EventSink for Outbox {
    async fn send_event(&self, event: ClientEvent) -> RealtimeResult<()> {
        let json = self.codec.encode(&event)?;
        tracing::trace!(event = event.label(), "Sending realtime event");
        self.connection.send_text(json).await
    }
}

/// How a socket's pump loop ended.
#[derive(Debug)]
enum PumpOutcome {
    /// Cancelled by the caller
    Shutdown,
    /// Server closed with status 1000
    NormalClose,
    /// Closed with any other status, or the stream just ended
    Abnormal(String),
    /// Transport error while reading or writing
    Failed(String),
}

struct Driver {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Counts a socket as live for as long as it is held.
struct LiveSocket {
    counter: Arc<AtomicUsize>,
}

impl LiveSocket {
    fn acquire(counter: &Arc<AtomicUsize>, peak: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self {
            counter: counter.clone(),
        }
    }
}

impl Drop for LiveSocket {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ConnectionShared {
    state: RwLock<ConnectionState>,
    attempts: AtomicU32,
    policy: ReconnectionConfig,
    debug_log: DebugLog,
    status_callback: RwLock<Option<StatusCallback>>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    driver: Mutex<Option<Driver>>,
    live_sockets: Arc<AtomicUsize>,
    peak_sockets: AtomicUsize,
    /// Serializes explicit connect and disconnect calls
    lifecycle: tokio::sync::Mutex<()>,
}

/// Owner of the transport connection and the reconnect counter.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<ConnectionShared>,
}

impl ConnectionManager {
    pub fn new(policy: ReconnectionConfig, debug_log: DebugLog) -> Self {
        Self {
            shared: Arc::new(ConnectionShared {
                state: RwLock::new(ConnectionState::Idle),
                attempts: AtomicU32::new(0),
                policy,
                debug_log,
                status_callback: RwLock::new(None),
                outbound: Mutex::new(None),
                driver: Mutex::new(None),
                live_sockets: Arc::new(AtomicUsize::new(0)),
                peak_sockets: AtomicUsize::new(0),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Register the observer for state transitions.
    pub fn set_status_callback(&self, callback: StatusCallback) {
        *self.shared.status_callback.write() = Some(callback);
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Reconnect attempts made since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    pub fn policy(&self) -> &ReconnectionConfig {
        &self.shared.policy
    }

    /// Sockets currently open.
    pub fn live_sockets(&self) -> usize {
        self.shared.live_sockets.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open sockets ever observed.
    pub fn peak_live_sockets(&self) -> usize {
        self.shared.peak_sockets.load(Ordering::SeqCst)
    }

    /// Open the transport to `url`.
    ///
    /// A no-op while `Connecting` or `Connected`. Any pending reconnect is
    /// cancelled first. On failure the state becomes `Error`, the error is
    /// returned, and the backoff loop keeps trying in the background while
    /// attempts remain.
    pub async fn connect(&self, url: Url, handler: Arc<dyn TransportHandler>) -> RealtimeResult<()> {
        let _lifecycle = self.shared.lifecycle.lock().await;

        let current = self.state();
        if current.is_active() {
            self.shared
                .debug_log
                .info(format!("Connect ignored, connection is already {current}"));
            return Ok(());
        }

        self.cancel_driver().await;
        self.shared.attempts.store(0, Ordering::SeqCst);
        self.shared.set_state(ConnectionState::Connecting);
        self.shared.debug_log.push(
            LogLevel::Info,
            "Opening realtime connection",
            Some(serde_json::json!({ "url": url.as_str() })),
        );

        let cancel = CancellationToken::new();
        match open_socket(&url).await {
            Ok(ws) => {
                let socket = LiveSocket::acquire(&self.shared.live_sockets, &self.shared.peak_sockets);
                let rx = self.shared.on_socket_open();
                let handle = tokio::spawn(run_driver(
                    self.shared.clone(),
                    url,
                    handler.clone(),
                    Some((ws, rx, socket)),
                    cancel.clone(),
                ));
                *self.shared.driver.lock() = Some(Driver { handle, cancel });

                handler.on_open(None).await;
                Ok(())
            }
            Err(err) => {
                self.shared.set_state(ConnectionState::Error);
                self.shared
                    .debug_log
                    .error(format!("Failed to open realtime connection: {err}"));

                if self.shared.policy.should_retry(0) {
                    let handle = tokio::spawn(run_driver(
                        self.shared.clone(),
                        url,
                        handler,
                        None,
                        cancel.clone(),
                    ));
                    *self.shared.driver.lock() = Some(Driver { handle, cancel });
                }
                Err(err)
            }
        }
    }

    /// Close the transport with a normal status code and cancel any pending
    /// reconnect. Always succeeds.
    pub async fn disconnect(&self) {
        let _lifecycle = self.shared.lifecycle.lock().await;

        let had_driver = self.cancel_driver().await;
        self.shared.outbound.lock().take();
        self.shared.attempts.store(0, Ordering::SeqCst);

        let current = self.state();
        if had_driver || !matches!(current, ConnectionState::Idle | ConnectionState::Disconnected) {
            self.shared.set_state(ConnectionState::Disconnected);
            self.shared.debug_log.info("Realtime connection closed by caller");
        }
    }

    /// Queue a text frame. Frames are written in call order.
    pub async fn send_text(&self, text: String) -> RealtimeResult<()> {
        if !self.is_connected() {
            return Err(RealtimeError::NotConnected);
        }
        let sender = self
            .shared
            .outbound
            .lock()
            .clone()
            .ok_or(RealtimeError::NotConnected)?;
        sender
            .send(text)
            .await
            .map_err(|e| RealtimeError::WebSocketError(e.to_string()))
    }

    /// Cancel the driver without waiting. Used when the owner is dropped.
    pub(crate) fn abort(&self) {
        if let Some(Driver { handle, cancel }) = self.shared.driver.lock().take() {
            cancel.cancel();
            handle.abort();
        }
        self.shared.outbound.lock().take();
    }

    /// Stop the driver task, waiting briefly for a clean close handshake.
    async fn cancel_driver(&self) -> bool {
        let driver = self.shared.driver.lock().take();
        let Some(Driver { mut handle, cancel }) = driver else {
            return false;
        };

        cancel.cancel();
        if tokio::time::timeout(CLOSE_TIMEOUT, &mut handle).await.is_err() {
            tracing::warn!("Realtime driver did not stop in time, aborting");
            handle.abort();
        }
        true
    }
}

impl ConnectionShared {
    fn set_state(&self, new_state: ConnectionState) {
        let old_state = {
            let mut state = self.state.write();
            let old = *state;
            if old == new_state {
                return;
            }
            *state = new_state;
            old
        };

        let level = match new_state {
            ConnectionState::Connected => LogLevel::Success,
            ConnectionState::Error => LogLevel::Error,
            _ => LogLevel::Info,
        };
        self.debug_log.push(
            level,
            format!("Connection state: {old_state} -> {new_state}"),
            None,
        );

        let callback = self.status_callback.read().clone();
        if let Some(cb) = callback {
            cb(new_state);
        }
    }

    /// Install a fresh outbound channel, reset the counter, and go `Connected`.
    fn on_socket_open(&self) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(WS_CHANNEL_CAPACITY);
        *self.outbound.lock() = Some(tx);
        self.attempts.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);
        rx
    }
}

/// Install the ring crypto provider for `wss://` once per process.
fn install_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        // Another provider may already be installed by the embedding app.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

async fn open_socket(url: &Url) -> RealtimeResult<WsStream> {
    install_crypto_provider();
    match tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(url.as_str())).await
    {
        Ok(Ok((ws, _response))) => Ok(ws),
        Ok(Err(e)) => Err(RealtimeError::ConnectionFailed(e.to_string())),
        Err(_) => Err(RealtimeError::ConnectionFailed(format!(
            "timed out after {}s",
            CONNECT_TIMEOUT.as_secs()
        ))),
    }
}

/// Driver task: pump the live socket, then reconnect with backoff until the
/// socket closes normally, the caller cancels, or attempts run out.
async fn run_driver(
    shared: Arc<ConnectionShared>,
    url: Url,
    handler: Arc<dyn TransportHandler>,
    initial: Option<(WsStream, mpsc::Receiver<String>, LiveSocket)>,
    cancel: CancellationToken,
) {
    let mut current = initial;

    loop {
        if let Some((ws, rx, socket)) = current.take() {
            let outcome = pump(ws, rx, handler.as_ref(), &shared.debug_log, &cancel).await;
            drop(socket);
            shared.outbound.lock().take();

            let reason = match outcome {
                PumpOutcome::Shutdown => return,
                PumpOutcome::NormalClose => {
                    shared.debug_log.info("Server closed the connection normally");
                    shared.set_state(ConnectionState::Disconnected);
                    handler.on_connection_lost("closed by server").await;
                    return;
                }
                PumpOutcome::Abnormal(reason) => {
                    shared
                        .debug_log
                        .warn(format!("Connection closed unexpectedly: {reason}"));
                    shared.set_state(ConnectionState::Disconnected);
                    reason
                }
                PumpOutcome::Failed(reason) => {
                    shared.debug_log.error(format!("Transport error: {reason}"));
                    shared.set_state(ConnectionState::Error);
                    reason
                }
            };
            handler.on_connection_lost(&reason).await;
        }

        if !shared.policy.enabled {
            shared.debug_log.warn("Automatic reconnection is disabled");
            return;
        }

        let attempts = shared.attempts.load(Ordering::SeqCst);
        if !shared.policy.should_retry(attempts) {
            shared.debug_log.push(
                LogLevel::Error,
                format!("Reconnection attempts exhausted after {attempts} tries"),
                Some(serde_json::json!({ "attempts": attempts })),
            );
            shared.set_state(ConnectionState::Error);
            handler.on_reconnect_exhausted(attempts).await;
            return;
        }

        let attempt = attempts + 1;
        shared.attempts.store(attempt, Ordering::SeqCst);
        let delay_ms = shared.policy.calculate_delay(attempt);
        shared.debug_log.push(
            LogLevel::Info,
            format!(
                "Reconnect attempt {attempt}/{} scheduled in {delay_ms}ms",
                shared.policy.max_attempts
            ),
            Some(serde_json::json!({
                "attempt": attempt,
                "max_attempts": shared.policy.max_attempts,
                "delay_ms": delay_ms,
            })),
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Pending reconnect cancelled");
                return;
            }
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
        }

        shared.set_state(ConnectionState::Connecting);
        let opened = tokio::select! {
            _ = cancel.cancelled() => return,
            result = open_socket(&url) => result,
        };

        match opened {
            Ok(ws) => {
                let socket = LiveSocket::acquire(&shared.live_sockets, &shared.peak_sockets);
                let rx = shared.on_socket_open();
                shared
                    .debug_log
                    .success(format!("Reconnected on attempt {attempt}"));
                handler.on_open(Some(attempt)).await;
                current = Some((ws, rx, socket));
            }
            Err(err) => {
                shared
                    .debug_log
                    .error(format!("Reconnect attempt {attempt} failed: {err}"));
                shared.set_state(ConnectionState::Error);
            }
        }
    }
}

async fn pump(
    ws: WsStream,
    mut rx: mpsc::Receiver<String>,
    handler: &dyn TransportHandler,
    debug_log: &DebugLog,
    cancel: &CancellationToken,
) -> PumpOutcome {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: Utf8Bytes::from_static("client disconnect"),
                };
                if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                    tracing::debug!("Close frame not delivered: {}", e);
                }
                return PumpOutcome::Shutdown;
            }

            outgoing = rx.recv() => match outgoing {
                Some(json) => {
                    if let Err(e) = sink.send(Message::Text(json.into())).await {
                        return PumpOutcome::Failed(format!("send failed: {e}"));
                    }
                }
                None => return PumpOutcome::Shutdown,
            },

            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    dispatch(handler, debug_log, text.to_string()).await;
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => dispatch(handler, debug_log, text).await,
                    Err(_) => debug_log.warn(format!(
                        "Ignoring non-UTF-8 binary frame of {} bytes",
                        data.len()
                    )),
                },
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(e) = sink.send(Message::Pong(payload)).await {
                        return PumpOutcome::Failed(format!("pong failed: {e}"));
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    return match frame {
                        Some(frame) if frame.code == CloseCode::Normal => PumpOutcome::NormalClose,
                        Some(frame) => PumpOutcome::Abnormal(format!(
                            "close code {} ({})",
                            u16::from(frame.code),
                            frame.reason
                        )),
                        None => PumpOutcome::Abnormal("close frame without status".to_string()),
                    };
                }
                Some(Ok(_)) => {}
                // Peer vanished without a close handshake: treat as close 1006.
                Some(Err(WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake)))
                | Some(Err(WsError::ConnectionClosed)) => {
                    return PumpOutcome::Abnormal("connection reset without close frame (1006)".to_string());
                }
                Some(Err(e)) => return PumpOutcome::Failed(e.to_string()),
                None => return PumpOutcome::Abnormal("stream ended without close frame (1006)".to_string()),
            },
        }
    }
}

/// Run the inbound handler inside its own panic boundary.
async fn dispatch(handler: &dyn TransportHandler, debug_log: &DebugLog, text: String) {
    if AssertUnwindSafe(handler.on_text(text))
        .catch_unwind()
        .await
        .is_err()
    {
        debug_log.error("Inbound message handler panicked; message dropped");
    }
}
