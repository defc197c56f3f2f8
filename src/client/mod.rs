//! Turnstile client
//!
//! Turns the asynchronous wire protocol into two awaitable calls:
//! [`Client::start_request`] and [`Client::get_request_count`]. Calls are spread
//! round-robin over a pool of connections; each call waits for its reply up to
//! the configured timeout.
//!
//! ```no_run
//! # async fn demo() -> turnstile::Result<()> {
//! use turnstile::client::{Client, ClientConfig};
//!
//! let client = Client::new(ClientConfig::new("ws://127.0.0.1:8080", "token"))?;
//! client.connect();
//!
//! let request = client.start_request("thumbnails", 4).await?;
//! if !request.is_limited() {
//!     // ... do the work ...
//! }
//! client.end_request(&request);
//! client.close().await;
//! # Ok(())
//! # }
//! ```

mod config;
mod connection;
mod correlator;
mod started_request;

pub use config::{ClientConfig, ErrorHandler};
pub use connection::ConnectionStatus;
pub use started_request::StartedRequest;

use futures::future::join_all;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::debug;

use connection::Connection;
use correlator::Correlator;

use crate::types::{Result, TurnstileError};

/// Admission client backed by a pool of connections to one authority
pub struct Client {
    config: Arc<ClientConfig>,
    connections: Vec<Arc<Connection>>,
    correlator: Arc<Correlator>,
    balancer: AtomicUsize,
    next_request_id: AtomicU64,
    closed: AtomicBool,
}

impl Client {
    /// Build the pool. Nothing is dialed until [`connect`](Self::connect).
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.connection_url()?;

        let config = Arc::new(config);
        let correlator = Arc::new(Correlator::new());
        let connections = (0..config.pool_size())
            .map(|index| {
                Arc::new(Connection::new(
                    index,
                    Arc::clone(&config),
                    Arc::clone(&correlator),
                ))
            })
            .collect();

        Ok(Self {
            config,
            connections,
            correlator,
            balancer: AtomicUsize::new(0),
            next_request_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Start every pooled connection; each keeps redialing until closed
    pub fn connect(&self) {
        for connection in &self.connections {
            connection.connect();
        }
    }

    /// Number of pooled connections currently up
    pub fn connected_count(&self) -> usize {
        self.connections.iter().filter(|c| c.is_connected()).count()
    }

    /// Status of every pooled connection, in pool order
    pub fn connection_statuses(&self) -> Vec<ConnectionStatus> {
        self.connections.iter().map(|c| c.status()).collect()
    }

    /// Wait until at least one connection is up
    pub async fn wait_until_connected(&self, within: Duration) -> Result<()> {
        let deadline = Instant::now() + within;

        while self.connected_count() == 0 {
            if self.is_closed() {
                return Err(TurnstileError::Closed);
            }
            if Instant::now() >= deadline {
                return Err(TurnstileError::Timeout(format!(
                    "No connection to authority after {:?}",
                    within
                )));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        Ok(())
    }

    /// Ask for one slot of `request_type` with at most `limit` active.
    ///
    /// A zero limit is limited immediately without asking the authority. On
    /// timeout an end is still sent, in case the authority admitted the
    /// request after the caller gave up.
    pub async fn start_request(&self, request_type: &str, limit: u32) -> Result<StartedRequest> {
        self.ensure_open()?;

        if limit < 1 {
            return Ok(StartedRequest::limited(None));
        }
        if request_type.is_empty() {
            return Err(TurnstileError::InvalidRequestType);
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let connection = self.pick();
        let ack = self.correlator.expect_ack(request_id);

        connection.start_request(request_id, request_type, limit);

        match timeout(self.config.timeout, ack).await {
            Ok(Ok(false)) => Ok(StartedRequest::admitted(request_id, connection)),
            Ok(Ok(true)) => Ok(StartedRequest::limited(Some(request_id))),
            Ok(Err(_)) => Err(TurnstileError::Closed),
            Err(_) => {
                self.correlator.cancel_ack(request_id);
                connection.end_request(request_id);
                debug!(request_id, request_type, "Start timed out, sent end");
                Err(TurnstileError::Timeout(format!(
                    "No reply to start of '{}' within {:?}",
                    request_type, self.config.timeout
                )))
            }
        }
    }

    /// Signal that the work behind `request` is done. Safe to call twice.
    pub fn end_request(&self, request: &StartedRequest) {
        request.end();
    }

    /// Current number of active slots of `request_type` across all clients
    pub async fn get_request_count(&self, request_type: &str) -> Result<u32> {
        self.ensure_open()?;

        if request_type.is_empty() {
            return Err(TurnstileError::InvalidRequestType);
        }

        let connection = self.pick();
        let (waiter, reply) = self.correlator.expect_count(request_type);
        connection.query_count(request_type);

        let result = timeout(self.config.timeout, reply).await;
        connection.count_query_done(request_type);

        match result {
            Ok(Ok(count)) => Ok(count),
            Ok(Err(_)) => Err(TurnstileError::Closed),
            Err(_) => {
                self.correlator.cancel_count(request_type, waiter);
                Err(TurnstileError::Timeout(format!(
                    "No count for '{}' within {:?}",
                    request_type, self.config.timeout
                )))
            }
        }
    }

    /// Shut every connection down. Waiting callers get [`TurnstileError::Closed`].
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        join_all(self.connections.iter().map(|c| c.close())).await;
        self.correlator.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(TurnstileError::Closed)
        } else {
            Ok(())
        }
    }

    fn pick(&self) -> Arc<Connection> {
        let next = self.balancer.fetch_add(1, Ordering::Relaxed);
        Arc::clone(&self.connections[next % self.connections.len()])
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        for connection in &self.connections {
            connection.signal_shutdown();
        }
    }
}
