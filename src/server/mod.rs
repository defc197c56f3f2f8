//! Admission authority: HTTP front end, per-connection handlers and the
//! shared counter registry

pub mod connection;
pub mod http;
pub mod registry;
pub mod websocket;

pub use connection::{ConnectionHandler, HandlerConfig};
pub use http::{run, serve, AppState};
pub use registry::CounterRegistry;
