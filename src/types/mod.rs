//! Shared types for Turnstile

pub mod error;

pub use error::{Result, TurnstileError};
