//! WebSocket upgrade for authenticated `/ws/{token}` requests
//!
//! The token has already been checked by the router; this hands the upgraded
//! socket to a fresh [`ConnectionHandler`] on its own task.

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info};

use super::connection::ConnectionHandler;
use super::http::{error_response, AppState};
use crate::types::TurnstileError;

/// Upgrade the request and spawn its connection handler
pub fn handle_upgrade(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    match hyper_tungstenite::upgrade(req, None) {
        Ok((response, websocket)) => {
            let connection_id = state.next_connection_id();
            let registry = Arc::clone(&state.registry);
            let config = state.handler_config.clone();

            info!(connection = connection_id, peer = %addr, "Accepted WebSocket client");

            tokio::spawn(async move {
                match websocket.await {
                    Ok(ws) => {
                        let handler = ConnectionHandler::new(connection_id, registry, config);
                        debug!(connection = handler.id(), "WebSocket handshake complete");
                        handler.run(ws).await;
                    }
                    Err(e) => {
                        error!(connection = connection_id, "WebSocket upgrade failed: {:?}", e);
                    }
                }
            });

            let (parts, _) = response.into_parts();
            Response::from_parts(parts, Full::new(Bytes::new()))
        }
        Err(e) => {
            error!(peer = %addr, "WebSocket upgrade error: {:?}", e);
            error_response(&TurnstileError::Protocol(format!(
                "WebSocket upgrade failed: {e}"
            )))
        }
    }
}
