//! Per-connection protocol handler
//!
//! One handler runs per accepted WebSocket. It owns the ids it admitted
//! through its own socket, answers the client's messages strictly in arrival
//! order, and runs a heartbeat task next to the receive loop.
//!
//! Lifecycle: `ESTABLISHED -> CLOSED`. A connection closes on read error,
//! client close, or heartbeat timeout. Whatever the exit path (including a
//! panic while handling a message) every request still open on the
//! connection is released from the [`CounterRegistry`] exactly once.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use super::registry::CounterRegistry;
use crate::protocol::{Command, RpcMessage, ERROR_PROTOCOL, ERROR_REQUEST_ID_DUPLICATED};
use crate::types::{Result, TurnstileError};

/// Default period between HEARTBEAT messages
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Write half shared by the receive loop and the heartbeat task
type SharedSink<S> = Arc<AsyncMutex<SplitSink<WebSocketStream<S>, Message>>>;

/// Settings for connection handlers
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Period between HEARTBEAT messages sent to the client
    pub heartbeat_interval: Duration,
    /// Dump every inbound and outbound frame at debug level
    pub log_messages: bool,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            log_messages: false,
        }
    }
}

impl HandlerConfig {
    /// Silence from the client longer than this closes the connection
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval * 2
    }
}

/// Requests admitted through one connection (id -> type).
///
/// Dropping the set releases every slot it still holds.
struct OpenRequests {
    connection_id: u64,
    registry: Arc<CounterRegistry>,
    requests: HashMap<String, String>,
}

impl OpenRequests {
    fn new(connection_id: u64, registry: Arc<CounterRegistry>) -> Self {
        Self {
            connection_id,
            registry,
            requests: HashMap::new(),
        }
    }

    fn contains(&self, request_id: &str) -> bool {
        self.requests.contains_key(request_id)
    }

    fn insert(&mut self, request_id: String, request_type: String) {
        self.requests.insert(request_id, request_type);
    }

    /// Forget an id and release its slot. Unknown ids are ignored.
    fn end(&mut self, request_id: &str) {
        if let Some(request_type) = self.requests.remove(request_id) {
            self.registry.release(&request_type);
        }
    }

    fn len(&self) -> usize {
        self.requests.len()
    }
}

impl Drop for OpenRequests {
    fn drop(&mut self) {
        if self.requests.is_empty() {
            return;
        }

        info!(
            connection = self.connection_id,
            released = self.requests.len(),
            "Releasing requests left open by closed connection"
        );

        for (_, request_type) in self.requests.drain() {
            self.registry.release(&request_type);
        }
    }
}

/// Small state shared between the receive loop and the heartbeat task
#[derive(Debug)]
struct Liveness {
    closed: bool,
    last_heartbeat: Instant,
}

/// Aborts the heartbeat task when the receive loop exits
struct HeartbeatTask(JoinHandle<()>);

impl Drop for HeartbeatTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Protocol state machine for one client connection
pub struct ConnectionHandler {
    id: u64,
    config: HandlerConfig,
    open_requests: OpenRequests,
    liveness: Arc<Mutex<Liveness>>,
}

impl ConnectionHandler {
    /// Create a handler for connection `id`
    pub fn new(id: u64, registry: Arc<CounterRegistry>, config: HandlerConfig) -> Self {
        Self {
            id,
            config,
            open_requests: OpenRequests::new(id, registry),
            liveness: Arc::new(Mutex::new(Liveness {
                closed: false,
                last_heartbeat: Instant::now(),
            })),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of requests this connection currently holds
    pub fn open_request_count(&self) -> usize {
        self.open_requests.len()
    }

    /// Parse one text frame and apply it, returning the reply to send (if any)
    pub fn handle_text(&mut self, text: &str) -> Option<Command> {
        let msg = RpcMessage::parse(text);

        match Command::decode(&msg) {
            Ok(Some(command)) => self.handle_command(command),
            Ok(None) => None,
            Err(TurnstileError::Protocol(message)) => Some(Command::error(ERROR_PROTOCOL, message)),
            Err(e) => Some(Command::error(ERROR_PROTOCOL, e.to_string())),
        }
    }

    fn handle_command(&mut self, command: Command) -> Option<Command> {
        match command {
            Command::Heartbeat => {
                lock(&self.liveness).last_heartbeat = Instant::now();
                None
            }
            Command::StartRequest {
                request_id,
                request_type,
                limit,
            } => {
                if self.open_requests.contains(&request_id) {
                    return Some(Command::error(
                        ERROR_REQUEST_ID_DUPLICATED,
                        "You sent multiple 'START-REQUEST' messages with the same request id. \
                         Only the first one applies. The rest are dropped.",
                    ));
                }

                let admitted = self.open_requests.registry.try_admit(&request_type, limit);
                if admitted {
                    self.open_requests.insert(request_id.clone(), request_type);
                }

                Some(Command::StartRequestAck {
                    request_id,
                    limit_reached: !admitted,
                })
            }
            Command::EndRequest { request_id } => {
                self.open_requests.end(&request_id);
                None
            }
            Command::GetRequestCount { request_type } => {
                let count = self.open_requests.registry.count(&request_type);
                Some(Command::RequestCount {
                    request_type,
                    count,
                })
            }
            // Server-to-client messages have no meaning here
            Command::StartRequestAck { .. } | Command::RequestCount { .. } | Command::Error { .. } => {
                None
            }
        }
    }

    /// Drive the connection until it closes.
    ///
    /// Consumes the handler; its open requests are released before the close
    /// handshake, or on unwind.
    pub async fn run<S>(mut self, ws: WebSocketStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, mut stream) = ws.split();
        let sink: SharedSink<S> = Arc::new(AsyncMutex::new(sink));
        let (close_tx, mut close_rx) = watch::channel(false);

        lock(&self.liveness).last_heartbeat = Instant::now();
        info!(connection = self.id, "Connection established");

        let heartbeat = HeartbeatTask(tokio::spawn(heartbeat_loop(
            self.id,
            self.config.clone(),
            Arc::clone(&sink),
            Arc::clone(&self.liveness),
            close_tx,
        )));

        loop {
            let frame = tokio::select! {
                frame = stream.next() => frame,
                _ = close_rx.changed() => break,
            };

            let text = match frame {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!(connection = self.id, error = %e, "Read error");
                    break;
                }
            };

            if self.config.log_messages {
                debug!(connection = self.id, "<<< \n{}", text);
            }

            if let Some(reply) = self.handle_text(&text) {
                // A peer that stops reading stalls the write; the heartbeat
                // task can still close the connection meanwhile
                let written = tokio::select! {
                    written = send(&sink, &self.liveness, &self.config, self.id, &reply) => written,
                    _ = close_rx.changed() => break,
                };
                if let Err(e) = written {
                    debug!(connection = self.id, error = %e, "Write error");
                    break;
                }
            }
        }

        lock(&self.liveness).closed = true;
        drop(heartbeat);
        drop(self.open_requests);

        let closing = async { sink.lock().await.close().await };
        if timeout(self.config.heartbeat_interval, closing).await.is_err() {
            debug!(connection = self.id, "Close handshake did not complete");
        }
        info!(connection = self.id, "Connection closed");
    }
}

/// Send HEARTBEAT periodically and close the connection once the client has
/// been silent for twice the interval.
async fn heartbeat_loop<S>(
    connection_id: u64,
    config: HandlerConfig,
    sink: SharedSink<S>,
    liveness: Arc<Mutex<Liveness>>,
    close_tx: watch::Sender<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let period = config.heartbeat_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);

    loop {
        ticker.tick().await;

        let silent_for = {
            let state = lock(&liveness);
            if state.closed {
                return;
            }
            state.last_heartbeat.elapsed()
        };

        if silent_for >= config.heartbeat_timeout() {
            warn!(
                connection = connection_id,
                silent_secs = silent_for.as_secs(),
                "No heartbeat from client, closing connection"
            );
            close_tx.send_replace(true);
            return;
        }

        if let Err(e) = send(&sink, &liveness, &config, connection_id, &Command::Heartbeat).await {
            debug!(connection = connection_id, error = %e, "Heartbeat write failed");
            close_tx.send_replace(true);
            return;
        }
    }
}

/// Write one command to the client unless the connection is already closed.
///
/// Gives up once the write, including the wait for the sink, outlasts the
/// heartbeat timeout.
async fn send<S>(
    sink: &SharedSink<S>,
    liveness: &Mutex<Liveness>,
    config: &HandlerConfig,
    connection_id: u64,
    command: &Command,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if lock(liveness).closed {
        return Ok(());
    }

    let text = command.encode();
    if config.log_messages {
        debug!(connection = connection_id, ">>> \n{}", text);
    }

    let write = async { sink.lock().await.send(Message::Text(text)).await };
    match timeout(config.heartbeat_timeout(), write).await {
        Ok(written) => Ok(written?),
        Err(_) => Err(TurnstileError::Timeout(format!(
            "Write to client stalled for {:?}",
            config.heartbeat_timeout()
        ))),
    }
}

fn lock(liveness: &Mutex<Liveness>) -> MutexGuard<'_, Liveness> {
    liveness.lock().unwrap_or_else(|e| e.into_inner())
}
