//! Turnstile - distributed admission control
//!
//! A single authority counts, per request type, how many callers currently
//! hold a slot. Clients connect over WebSocket, ask to start work of a type
//! against a ceiling they choose, and are told whether they were admitted.
//!
//! ## Components
//!
//! - **Protocol**: line-oriented text frames shared by both ends
//! - **Server**: counter registry, per-connection handlers, HTTP front end
//! - **Client**: connection pool with reconnect, replay and reply correlation

pub mod auth;
pub mod client;
pub mod config;
pub mod protocol;
pub mod server;
pub mod types;

pub use config::Args;
pub use server::{run, serve, AppState};
pub use types::{Result, TurnstileError};
