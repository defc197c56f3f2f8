//! Pooled client connection
//!
//! Keeps one WebSocket to the authority alive: dials, redials after
//! `retry_connection_delay`, heartbeats, and drops the socket when the
//! authority has been silent for twice the heartbeat interval.
//!
//! Every start that has not been ended yet is remembered. When a socket comes
//! up those starts are sent again, together with one `GET-REQUEST-COUNT` per
//! type that still has callers waiting, so an authority restart costs callers
//! latency and nothing else.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout_at, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, WebSocketStream};
use tracing::{debug, info, warn};

use super::config::ClientConfig;
use super::correlator::Correlator;
use crate::protocol::{Command, RpcMessage, ERROR_PROTOCOL};
use crate::types::{Result, TurnstileError};

/// Lifecycle of a pooled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal; set by `close`
    Closed,
}

#[derive(Debug, Clone)]
struct PendingStart {
    request_type: String,
    limit: u32,
}

struct Inner {
    status: ConnectionStatus,
    /// Frames for the live socket, `None` while disconnected
    outbound: Option<mpsc::UnboundedSender<String>>,
    /// Starts not yet ended, replayed in id order after reconnect
    pending_starts: BTreeMap<u64, PendingStart>,
    /// Outstanding count queries per type
    pending_counts: HashMap<String, usize>,
    task: Option<JoinHandle<()>>,
}

impl Inner {
    fn send(&self, command: &Command) {
        if let Some(tx) = &self.outbound {
            // A closed channel means the socket is going down; replay covers it
            let _ = tx.send(command.encode());
        }
    }
}

pub(crate) struct Connection {
    index: usize,
    config: Arc<ClientConfig>,
    correlator: Arc<Correlator>,
    inner: Mutex<Inner>,
    shutdown: watch::Sender<bool>,
}

impl Connection {
    pub fn new(index: usize, config: Arc<ClientConfig>, correlator: Arc<Correlator>) -> Self {
        let (shutdown, _) = watch::channel(false);

        Self {
            index,
            config,
            correlator,
            inner: Mutex::new(Inner {
                status: ConnectionStatus::Disconnected,
                outbound: None,
                pending_starts: BTreeMap::new(),
                pending_counts: HashMap::new(),
                task: None,
            }),
            shutdown,
        }
    }

    /// Start the dial/redial loop. Calling it again is a no-op.
    pub fn connect(self: &Arc<Self>) {
        let mut inner = self.lock();
        if inner.task.is_some() || inner.status == ConnectionStatus::Closed {
            return;
        }
        inner.task = Some(tokio::spawn(Arc::clone(self).run_loop()));
    }

    /// Stop for good and wait for the loop to exit
    pub async fn close(&self) {
        let task = {
            let mut inner = self.lock();
            inner.status = ConnectionStatus::Closed;
            inner.outbound = None;
            inner.pending_starts.clear();
            inner.pending_counts.clear();
            inner.task.take()
        };

        self.shutdown.send_replace(true);

        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Ask the loop to stop without waiting for it
    pub fn signal_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn status(&self) -> ConnectionStatus {
        self.lock().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Remember a start and send it if the socket is up
    pub fn start_request(&self, request_id: u64, request_type: &str, limit: u32) {
        let mut inner = self.lock();
        inner.pending_starts.insert(
            request_id,
            PendingStart {
                request_type: request_type.to_string(),
                limit,
            },
        );
        inner.send(&Command::StartRequest {
            request_id: request_id.to_string(),
            request_type: request_type.to_string(),
            limit,
        });
    }

    /// Forget a start and tell the authority it is over
    pub fn end_request(&self, request_id: u64) {
        let mut inner = self.lock();
        inner.pending_starts.remove(&request_id);
        inner.send(&Command::EndRequest {
            request_id: request_id.to_string(),
        });
    }

    /// Forget a start the authority did not admit; nothing goes on the wire
    pub fn forget_request(&self, request_id: u64) {
        self.lock().pending_starts.remove(&request_id);
    }

    /// Register a count query and send it if the socket is up
    pub fn query_count(&self, request_type: &str) {
        let mut inner = self.lock();
        *inner
            .pending_counts
            .entry(request_type.to_string())
            .or_insert(0) += 1;
        inner.send(&Command::GetRequestCount {
            request_type: request_type.to_string(),
        });
    }

    /// One caller stopped waiting for a count, answered or not
    pub fn count_query_done(&self, request_type: &str) {
        let mut inner = self.lock();
        if let Some(outstanding) = inner.pending_counts.get_mut(request_type) {
            *outstanding = outstanding.saturating_sub(1);
            if *outstanding == 0 {
                inner.pending_counts.remove(request_type);
            }
        }
    }

    pub fn pending_start_count(&self) -> usize {
        self.lock().pending_starts.len()
    }

    #[cfg(test)]
    pub fn index(&self) -> usize {
        self.index
    }

    async fn run_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();

        let url = match self.config.connection_url() {
            Ok(url) => url,
            Err(e) => {
                self.config.report_connection_error(&e);
                return;
            }
        };

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_status(ConnectionStatus::Connecting);
            debug!(connection = self.index, "Connecting to authority");

            let dialed = tokio::select! {
                dialed = connect_async(url.as_str()) => dialed,
                _ = shutdown.changed() => break,
            };

            let result = match dialed {
                Ok((ws, _)) => self.drive(ws, &mut shutdown).await,
                Err(e) => Err(e.into()),
            };

            self.detach();
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = result {
                self.config.report_connection_error(&e);
            }

            warn!(
                connection = self.index,
                "Reconnecting to authority in {:?}...", self.config.retry_connection_delay
            );
            tokio::select! {
                _ = sleep(self.config.retry_connection_delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        debug!(connection = self.index, "Connection loop stopped");
    }

    /// Pump one socket until it fails, goes silent, or shutdown is requested
    async fn drive<S>(
        &self,
        ws: WebSocketStream<S>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel();

        if !self.attach(tx) {
            let _ = sink.close().await;
            return Ok(());
        }
        info!(connection = self.index, "Connected to authority");

        let period = self.config.heartbeat_interval;
        let silence_limit = self.config.heartbeat_timeout();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        let deadline = sleep(silence_limit);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = timeout_at(deadline.deadline(), sink.close()).await;
                    return Ok(());
                }
                Some(text) = rx.recv() => {
                    if self.config.log_messages {
                        debug!(connection = self.index, ">>> \n{}", text);
                    }
                    write_frame(&mut sink, text, deadline.deadline()).await?;
                }
                _ = heartbeat.tick() => {
                    write_frame(&mut sink, Command::Heartbeat.encode(), deadline.deadline()).await?;
                }
                _ = &mut deadline => {
                    let _ = timeout_at(Instant::now() + period, sink.close()).await;
                    return Err(TurnstileError::Timeout(format!(
                        "No message from authority for {:?}",
                        silence_limit
                    )));
                }
                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            deadline.as_mut().reset(Instant::now() + silence_limit);
                            self.handle_inbound(&text);
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(TurnstileError::WebSocket(
                                "Connection closed by authority".to_string(),
                            ));
                        }
                        Some(Ok(_)) => {
                            deadline.as_mut().reset(Instant::now() + silence_limit);
                        }
                        Some(Err(e)) => return Err(e.into()),
                    }
                }
            }
        }
    }

    /// Install the outbound queue for a fresh socket and replay pending work
    /// into it before anything else can be queued.
    pub(super) fn attach(&self, tx: mpsc::UnboundedSender<String>) -> bool {
        let mut inner = self.lock();
        if inner.status == ConnectionStatus::Closed {
            return false;
        }

        for (request_id, pending) in &inner.pending_starts {
            let _ = tx.send(
                Command::StartRequest {
                    request_id: request_id.to_string(),
                    request_type: pending.request_type.clone(),
                    limit: pending.limit,
                }
                .encode(),
            );
        }
        for request_type in inner.pending_counts.keys() {
            let _ = tx.send(
                Command::GetRequestCount {
                    request_type: request_type.clone(),
                }
                .encode(),
            );
        }

        if !inner.pending_starts.is_empty() {
            info!(
                connection = self.index,
                replayed = inner.pending_starts.len(),
                "Replaying pending starts"
            );
        }

        inner.outbound = Some(tx);
        inner.status = ConnectionStatus::Connected;
        true
    }

    fn detach(&self) {
        let mut inner = self.lock();
        inner.outbound = None;
        if inner.status != ConnectionStatus::Closed {
            inner.status = ConnectionStatus::Disconnected;
        }
    }

    fn handle_inbound(&self, text: &str) {
        if self.config.log_messages {
            debug!(connection = self.index, "<<< \n{}", text);
        }

        match Command::decode(&RpcMessage::parse(text)) {
            Ok(Some(Command::StartRequestAck {
                request_id,
                limit_reached,
            })) => match request_id.parse::<u64>() {
                Ok(id) => {
                    // Nothing is held for a limited start; forget it before
                    // the caller wakes so a reconnect cannot replay it
                    if limit_reached {
                        self.forget_request(id);
                    }
                    if !self.correlator.receive_ack(id, limit_reached) {
                        debug!(connection = self.index, request_id = id, "Ack with no waiter");
                    }
                }
                Err(_) => self.config.report_server_error(
                    ERROR_PROTOCOL,
                    &format!(
                        "Invalid 'Request-ID' '{}' in message 'START-REQUEST-ACK'",
                        request_id
                    ),
                ),
            },
            Ok(Some(Command::RequestCount {
                request_type,
                count,
            })) => {
                self.correlator.receive_count(&request_type, count);
            }
            Ok(Some(Command::Error { code, message })) => {
                self.config.report_server_error(&code, &message);
            }
            Ok(_) => {}
            Err(TurnstileError::Protocol(message)) => {
                self.config.report_server_error(ERROR_PROTOCOL, &message);
            }
            Err(e) => self.config.report_server_error(ERROR_PROTOCOL, &e.to_string()),
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        let mut inner = self.lock();
        if inner.status != ConnectionStatus::Closed {
            inner.status = status;
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Write one frame, giving up at the liveness deadline
async fn write_frame<S>(
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    text: String,
    until: Instant,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match timeout_at(until, sink.send(Message::Text(text))).await {
        Ok(written) => Ok(written?),
        Err(_) => Err(TurnstileError::Timeout(
            "Write to authority stalled past the liveness deadline".to_string(),
        )),
    }
}
