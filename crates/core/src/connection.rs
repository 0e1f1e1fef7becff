use futures_util::StreamExt;
use parking_lot::ReentrantMutex;
use std::cell::Cell;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::diagnostics::DiagnosticSink;
use crate::error::SyncError;
use crate::types::*;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub type MessageCallback = Arc<dyn Fn(PushMessage) + Send + Sync>;
pub type StatusCallback = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

/// Gate held around every callback. `close()` takes the same lock, so once it
/// returns no callback is running or will run. Reentrant so a callback may
/// close its own connection.
type Gate = Arc<ReentrantMutex<Cell<bool>>>;

/// Opens reconnecting push connections to the backend event stream.
pub struct ConnectionManager {
    url: String,
    reconnect_delay: Duration,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl ConnectionManager {
    pub fn new(
        url: impl Into<String>,
        reconnect_delay: Duration,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> Self {
        Self {
            url: url.into(),
            reconnect_delay,
            diagnostics,
        }
    }

    pub fn from_config(config: &SyncConfig, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        Self::new(config.stream_endpoint(), config.reconnect_delay, diagnostics)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Start connecting. Reconnects after every unexpected close until the
    /// returned handle is closed or dropped. Must be called inside a tokio
    /// runtime.
    pub fn open(
        &self,
        on_message: impl Fn(PushMessage) + Send + Sync + 'static,
        on_status: impl Fn(ConnectionStatus) + Send + Sync + 'static,
    ) -> ConnectionHandle {
        let gate: Gate = Arc::new(ReentrantMutex::new(Cell::new(true)));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = Worker {
            url: self.url.clone(),
            reconnect_delay: self.reconnect_delay,
            diagnostics: self.diagnostics.clone(),
            gate: gate.clone(),
            on_message: Arc::new(on_message),
            on_status: Arc::new(on_status),
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(worker.run());

        ConnectionHandle {
            gate,
            shutdown: shutdown_tx,
            task: Some(task),
        }
    }
}

/// Owner of one live connection. Dropping it closes the connection.
pub struct ConnectionHandle {
    gate: Gate,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ConnectionHandle {
    /// Stop the connection and cancel any pending reconnect. Idempotent; no
    /// callback is invoked after this returns.
    pub fn close(&mut self) {
        {
            let open = self.gate.lock();
            open.set(false);
        }
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Push connection closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        !self.gate.lock().get()
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reconnect state machine. Only one timer (the `Waiting` sleep) ever exists.
enum Phase {
    Connecting,
    Open(Box<WsStream>),
    Closed,
    Waiting,
}

/// How an open connection ended.
enum Ending {
    Shutdown,
    Closed(Option<CloseFrame>),
    Failed(SyncError),
}

struct Worker {
    url: String,
    reconnect_delay: Duration,
    diagnostics: Arc<dyn DiagnosticSink>,
    gate: Gate,
    on_message: MessageCallback,
    on_status: StatusCallback,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        info!(url = %self.url, "Starting push connection");
        let mut phase = Phase::Connecting;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            phase = match phase {
                Phase::Connecting => {
                    let attempt = tokio::select! {
                        res = tokio_tungstenite::connect_async(self.url.as_str()) => res,
                        _ = self.shutdown.changed() => break,
                    };
                    match attempt {
                        Ok((stream, _)) => {
                            info!(url = %self.url, "Push connection open");
                            self.emit_status(ConnectionStatus::Connected);
                            Phase::Open(Box::new(stream))
                        }
                        Err(e) => {
                            self.fail(SyncError::Transport(e.to_string()));
                            Phase::Closed
                        }
                    }
                }
                Phase::Open(mut stream) => match self.pump(&mut stream).await {
                    Ending::Shutdown => break,
                    Ending::Closed(frame) => {
                        let normal = frame.as_ref().is_some_and(|f| f.code == CloseCode::Normal);
                        if !normal {
                            let context = frame.map(|f| {
                                serde_json::json!({
                                    "code": u16::from(f.code),
                                    "reason": f.reason.as_str(),
                                })
                            });
                            self.diagnostics.report(
                                "ws:onclose",
                                "Push connection closed unexpectedly",
                                context,
                            );
                        }
                        Phase::Closed
                    }
                    Ending::Failed(err) => {
                        self.fail(err);
                        Phase::Closed
                    }
                },
                Phase::Closed => {
                    self.emit_status(ConnectionStatus::Disconnected);
                    Phase::Waiting
                }
                Phase::Waiting => {
                    debug!(delay_ms = self.reconnect_delay.as_millis() as u64, "Reconnecting after delay");
                    tokio::select! {
                        _ = tokio::time::sleep(self.reconnect_delay) => Phase::Connecting,
                        _ = self.shutdown.changed() => break,
                    }
                }
            };
        }

        debug!(url = %self.url, "Push connection task exiting");
    }

    /// Read frames until the connection ends or shutdown is signalled.
    async fn pump(&mut self, stream: &mut WsStream) -> Ending {
        loop {
            let next = tokio::select! {
                frame = stream.next() => frame,
                _ = self.shutdown.changed() => return Ending::Shutdown,
            };
            match next {
                Some(Ok(Message::Text(text))) => self.deliver(text.as_str()),
                Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => self.deliver(text),
                    Err(e) => self.diagnostics.report(
                        "ws:onmessage",
                        &format!("Binary frame is not UTF-8: {}", e),
                        None,
                    ),
                },
                Some(Ok(Message::Close(frame))) => return Ending::Closed(frame),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Ending::Failed(SyncError::Transport(e.to_string())),
                None => return Ending::Closed(None),
            }
        }
    }

    fn deliver(&self, text: &str) {
        match PushMessage::parse(text) {
            Ok(message) => {
                if let PushMessage::Unknown { kind } = &message {
                    debug!(kind = %kind, "Unknown push message type");
                }
                let open = self.gate.lock();
                if open.get() {
                    (self.on_message)(message);
                }
            }
            Err(e) => {
                let preview: String = text.chars().take(200).collect();
                self.diagnostics.report(
                    "ws:onmessage",
                    &e.to_string(),
                    Some(serde_json::json!({ "raw": preview })),
                );
            }
        }
    }

    fn fail(&self, err: SyncError) {
        warn!(url = %self.url, error = %err, "Push connection error");
        self.diagnostics.report(
            "ws:onerror",
            &err.to_string(),
            Some(serde_json::json!({ "url": self.url })),
        );
        self.emit_status(ConnectionStatus::Error);
    }

    fn emit_status(&self, status: ConnectionStatus) {
        let open = self.gate.lock();
        if open.get() {
            (self.on_status)(status);
        }
    }
}
