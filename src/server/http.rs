//! HTTP front end
//!
//! hyper http1 with TokioIo; every connection is served with upgrades enabled
//! so `/ws/{token}` can switch to the WebSocket protocol.

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use super::connection::HandlerConfig;
use super::registry::CounterRegistry;
use super::websocket;
use crate::auth::{TokenValidator, WS_PATH_PREFIX};
use crate::config::Args;
use crate::types::{Result, TurnstileError};

/// Body returned for every non-WebSocket request
pub const SERVER_BANNER: &str = "Parallel request controller server.";

/// Shared application state
pub struct AppState {
    pub args: Args,
    /// Active slot counts shared by every connection
    pub registry: Arc<CounterRegistry>,
    pub validator: TokenValidator,
    pub handler_config: HandlerConfig,
    next_connection_id: AtomicU64,
}

impl AppState {
    pub fn new(args: Args) -> Self {
        let validator = TokenValidator::new(args.auth_token.clone());
        let handler_config = args.handler_config();

        Self {
            args,
            registry: Arc::new(CounterRegistry::new()),
            validator,
            handler_config,
            next_connection_id: AtomicU64::new(0),
        }
    }

    /// Allocate the id of the next accepted connection
    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Bind the configured address and serve forever
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let addr = state.args.listen_addr().map_err(TurnstileError::Config)?;
    let listener = TcpListener::bind(addr).await?;
    serve(state, listener).await
}

/// Serve on an already bound listener
pub async fn serve(state: Arc<AppState>, listener: TcpListener) -> Result<()> {
    info!("Turnstile listening on {}", listener.local_addr()?);

    if state.validator.is_empty() {
        warn!("AUTH_TOKEN is empty - any client can connect to /ws/");
    }

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new()
                        .serve_connection(io, service)
                        .with_upgrades()
                        .await
                    {
                        error!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

/// Route incoming HTTP requests
async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();

    // The token is part of the path; keep it out of the logs
    let shown = if path.starts_with(WS_PATH_PREFIX) {
        "/ws/<token>"
    } else {
        path.as_str()
    };
    info!("[{}] {} {}", addr, req.method(), shown);

    let response = match state.validator.validate_path(&path) {
        Some(false) => {
            warn!("[{}] Rejected WebSocket client with invalid token", addr);
            error_response(&TurnstileError::Forbidden("invalid token".to_string()))
        }
        Some(true) if hyper_tungstenite::is_upgrade_request(&req) => {
            websocket::handle_upgrade(Arc::clone(&state), addr, req)
        }
        _ => text_response(StatusCode::OK, SERVER_BANNER),
    };

    Ok(response)
}

/// Plain-text response carrying the status of a front-end error
pub(super) fn error_response(err: &TurnstileError) -> Response<Full<Bytes>> {
    match err {
        TurnstileError::Forbidden(_) => text_response(err.status_code(), "Forbidden."),
        _ => text_response(err.status_code(), err.to_string()),
    }
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
