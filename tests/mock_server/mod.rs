//! In-process mock of a realtime voice backend.
//!
//! Speaks the OpenAI-style realtime dialect over a real WebSocket on
//! 127.0.0.1 and lets tests script server events, drop the TCP connection
//! without a close frame, close normally, or refuse handshakes outright.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};

enum Command {
    Send(String),
    /// Drop the TCP stream without a close frame
    Drop,
    Close(u16),
}

#[derive(Default)]
pub struct MockState {
    /// Every client frame, parsed, across all connections
    received: Mutex<Vec<Value>>,
    /// TCP connections accepted, including refused handshakes
    tcp_accepts: AtomicUsize,
    /// Completed WebSocket handshakes
    handshakes: AtomicUsize,
    live: AtomicUsize,
    peak_live: AtomicUsize,
    refuse: AtomicBool,
    /// Handshakes still to refuse before accepting again
    refuse_remaining: AtomicUsize,
    control: Mutex<Option<mpsc::UnboundedSender<Command>>>,
}

pub struct MockRealtimeServer {
    addr: SocketAddr,
    state: Arc<MockState>,
    task: JoinHandle<()>,
}

impl MockRealtimeServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let addr = listener.local_addr().expect("mock server address");
        let state = Arc::new(MockState::default());

        let accept_state = state.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(handle_connection(stream, accept_state.clone()));
            }
        });

        Self { addr, state, task }
    }

    /// Base URL without the realtime path; the client appends it.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Send a server event to the live connection.
    pub fn send(&self, event: Value) {
        self.send_raw(event.to_string());
    }

    pub fn send_raw(&self, text: impl Into<String>) {
        self.command(Command::Send(text.into()));
    }

    /// Kill the live connection without a close handshake.
    pub fn drop_connection(&self) {
        self.command(Command::Drop);
    }

    /// Close the live connection with status 1000.
    pub fn close_normally(&self) {
        self.command(Command::Close(1000));
    }

    /// Refuse (or accept again) WebSocket handshakes.
    pub fn set_refuse(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Refuse only the next `count` handshakes.
    pub fn refuse_next(&self, count: usize) {
        self.state.refuse_remaining.store(count, Ordering::SeqCst);
    }

    pub fn received(&self) -> Vec<Value> {
        self.state.received.lock().clone()
    }

    pub fn received_types(&self) -> Vec<String> {
        self.state
            .received
            .lock()
            .iter()
            .filter_map(|v| v["type"].as_str().map(str::to_string))
            .collect()
    }

    pub fn count_of(&self, event_type: &str) -> usize {
        self.received_types()
            .iter()
            .filter(|t| t.as_str() == event_type)
            .count()
    }

    pub fn handshakes(&self) -> usize {
        self.state.handshakes.load(Ordering::SeqCst)
    }

    pub fn tcp_accepts(&self) -> usize {
        self.state.tcp_accepts.load(Ordering::SeqCst)
    }

    pub fn peak_live(&self) -> usize {
        self.state.peak_live.load(Ordering::SeqCst)
    }

    fn command(&self, command: Command) {
        if let Some(tx) = self.state.control.lock().as_ref() {
            let _ = tx.send(command);
        }
    }
}

impl Drop for MockRealtimeServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<MockState>) {
    state.tcp_accepts.fetch_add(1, Ordering::SeqCst);
    let refuse_once = state
        .refuse_remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if refuse_once || state.refuse.load(Ordering::SeqCst) {
        drop(stream);
        return;
    }

    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let connection = state.handshakes.fetch_add(1, Ordering::SeqCst) + 1;
    let live = state.live.fetch_add(1, Ordering::SeqCst) + 1;
    state.peak_live.fetch_max(live, Ordering::SeqCst);

    let (tx, mut rx) = mpsc::unbounded_channel();
    *state.control.lock() = Some(tx);

    let (mut write, mut read) = ws.split();
    let created = json!({
        "type": "session.created",
        "event_id": format!("event_created_{connection}"),
        "session": { "id": format!("sess_mock_{connection}"), "model": "mock-realtime" }
    });
    let _ = write.send(Message::Text(created.to_string().into())).await;

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Send(text)) => {
                    if write.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(Command::Close(code)) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: Utf8Bytes::from_static("bye"),
                    };
                    let _ = write.send(Message::Close(Some(frame))).await;
                }
                Some(Command::Drop) | None => break,
            },
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(value) = serde_json::from_str::<Value>(text.as_str()) {
                        state.received.lock().push(value);
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    state.live.fetch_sub(1, Ordering::SeqCst);
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
