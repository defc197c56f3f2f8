//! Turnstile wire protocol
//!
//! Every frame is a UTF-8 text message of the form:
//!
//! ```text
//! METHOD
//! Key: value
//! Key: value
//!
//! optional body
//! ```
//!
//! Messages (direction):
//! - `HEARTBEAT` (both) - liveness, sent every 30s
//! - `START-REQUEST` (client -> server) - `Request-ID`, `Request-Type`, `Request-Limit`
//! - `START-REQUEST-ACK` (server -> client) - `Request-ID`, `Request-Limit-Reached`
//! - `END-REQUEST` (client -> server) - `Request-ID`
//! - `GET-REQUEST-COUNT` (client -> server) - `Request-Type`
//! - `REQUEST-COUNT` (server -> client) - `Request-Type`, `Request-Count`
//! - `ERROR` (server -> client) - `Error-Code`, `Error-Message`

pub mod command;
pub mod message;

pub use command::Command;
pub use message::RpcMessage;

/// Method names
pub const HEARTBEAT: &str = "HEARTBEAT";
pub const START_REQUEST: &str = "START-REQUEST";
pub const START_REQUEST_ACK: &str = "START-REQUEST-ACK";
pub const END_REQUEST: &str = "END-REQUEST";
pub const GET_REQUEST_COUNT: &str = "GET-REQUEST-COUNT";
pub const REQUEST_COUNT: &str = "REQUEST-COUNT";
pub const ERROR: &str = "ERROR";

/// Parameter names
pub const PARAM_REQUEST_ID: &str = "Request-ID";
pub const PARAM_REQUEST_TYPE: &str = "Request-Type";
pub const PARAM_REQUEST_LIMIT: &str = "Request-Limit";
pub const PARAM_LIMIT_REACHED: &str = "Request-Limit-Reached";
pub const PARAM_REQUEST_COUNT: &str = "Request-Count";
pub const PARAM_ERROR_CODE: &str = "Error-Code";
pub const PARAM_ERROR_MESSAGE: &str = "Error-Message";

/// Error codes carried by `ERROR` messages
pub const ERROR_PROTOCOL: &str = "PROTOCOL_ERROR";
pub const ERROR_REQUEST_ID_DUPLICATED: &str = "REQUEST_ID_DUPLICATED";
