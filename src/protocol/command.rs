//! Typed protocol commands
//!
//! Validates the parameters of an [`RpcMessage`] once, so the connection
//! handler and the client connection deal with plain Rust values.

use super::*;
use crate::types::{Result, TurnstileError};

/// A decoded protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Heartbeat,
    StartRequest {
        request_id: String,
        request_type: String,
        limit: u32,
    },
    StartRequestAck {
        request_id: String,
        limit_reached: bool,
    },
    EndRequest {
        request_id: String,
    },
    GetRequestCount {
        request_type: String,
    },
    RequestCount {
        request_type: String,
        count: u32,
    },
    Error {
        code: String,
        message: String,
    },
}

impl Command {
    /// Decode a parsed frame.
    ///
    /// Returns `Ok(None)` for unknown methods, which both ends ignore.
    pub fn decode(msg: &RpcMessage) -> Result<Option<Self>> {
        let method = msg.method();

        let command = match method {
            HEARTBEAT => Command::Heartbeat,
            START_REQUEST => {
                let request_id = required(msg, PARAM_REQUEST_ID)?;
                let request_type = required(msg, PARAM_REQUEST_TYPE)?;
                let limit = integer(msg, PARAM_REQUEST_LIMIT)?;
                Command::StartRequest {
                    request_id,
                    request_type,
                    limit,
                }
            }
            START_REQUEST_ACK => Command::StartRequestAck {
                request_id: required(msg, PARAM_REQUEST_ID)?,
                limit_reached: msg
                    .param(PARAM_LIMIT_REACHED)
                    .map(|v| v.eq_ignore_ascii_case("TRUE"))
                    .unwrap_or(false),
            },
            END_REQUEST => Command::EndRequest {
                request_id: required(msg, PARAM_REQUEST_ID)?,
            },
            GET_REQUEST_COUNT => Command::GetRequestCount {
                request_type: required(msg, PARAM_REQUEST_TYPE)?,
            },
            REQUEST_COUNT => Command::RequestCount {
                request_type: required(msg, PARAM_REQUEST_TYPE)?,
                count: integer(msg, PARAM_REQUEST_COUNT)?,
            },
            ERROR => Command::Error {
                code: msg.param(PARAM_ERROR_CODE).unwrap_or("").to_string(),
                message: msg.param(PARAM_ERROR_MESSAGE).unwrap_or("").to_string(),
            },
            _ => return Ok(None),
        };

        Ok(Some(command))
    }

    /// Encode into a frame ready for serialization
    pub fn to_message(&self) -> RpcMessage {
        match self {
            Command::Heartbeat => RpcMessage::new(HEARTBEAT),
            Command::StartRequest {
                request_id,
                request_type,
                limit,
            } => RpcMessage::new(START_REQUEST)
                .with_param(PARAM_REQUEST_ID, request_id.as_str())
                .with_param(PARAM_REQUEST_TYPE, request_type.as_str())
                .with_param(PARAM_REQUEST_LIMIT, limit.to_string()),
            Command::StartRequestAck {
                request_id,
                limit_reached,
            } => RpcMessage::new(START_REQUEST_ACK)
                .with_param(PARAM_REQUEST_ID, request_id.as_str())
                .with_param(
                    PARAM_LIMIT_REACHED,
                    if *limit_reached { "TRUE" } else { "FALSE" },
                ),
            Command::EndRequest { request_id } => {
                RpcMessage::new(END_REQUEST).with_param(PARAM_REQUEST_ID, request_id.as_str())
            }
            Command::GetRequestCount { request_type } => RpcMessage::new(GET_REQUEST_COUNT)
                .with_param(PARAM_REQUEST_TYPE, request_type.as_str()),
            Command::RequestCount {
                request_type,
                count,
            } => RpcMessage::new(REQUEST_COUNT)
                .with_param(PARAM_REQUEST_TYPE, request_type.as_str())
                .with_param(PARAM_REQUEST_COUNT, count.to_string()),
            Command::Error { code, message } => RpcMessage::new(ERROR)
                .with_param(PARAM_ERROR_CODE, code.as_str())
                .with_param(PARAM_ERROR_MESSAGE, message.as_str()),
        }
    }

    /// Shorthand for `to_message().serialize()`
    pub fn encode(&self) -> String {
        self.to_message().serialize()
    }

    /// Build an `ERROR` command
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Command::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Fetch a parameter that must be present and non-empty
fn required(msg: &RpcMessage, name: &str) -> Result<String> {
    match msg.param(name) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(TurnstileError::Protocol(format!(
            "Missing parameter '{}' for message '{}'",
            name,
            msg.method()
        ))),
    }
}

/// Fetch a parameter that must parse as a non-negative 32-bit integer
fn integer(msg: &RpcMessage, name: &str) -> Result<u32> {
    msg.param(name)
        .and_then(|v| v.parse::<u32>().ok())
        .ok_or_else(|| {
            TurnstileError::Protocol(format!(
                "Parameter '{}' for message '{}' must be a valid integer",
                name,
                msg.method()
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(raw: &str) -> Result<Option<Command>> {
        Command::decode(&RpcMessage::parse(raw))
    }

    #[test]
    fn test_decode_start_request() {
        let cmd = decode("START-REQUEST\nRequest-ID: a1\nRequest-Type: t\nRequest-Limit: 5\n")
            .unwrap()
            .unwrap();
        assert_eq!(
            cmd,
            Command::StartRequest {
                request_id: "a1".into(),
                request_type: "t".into(),
                limit: 5,
            }
        );
    }

    #[test]
    fn test_decode_missing_request_id() {
        let err = decode("START-REQUEST\nRequest-Type: t\nRequest-Limit: 5\n").unwrap_err();
        match err {
            TurnstileError::Protocol(msg) => {
                assert_eq!(
                    msg,
                    "Missing parameter 'Request-ID' for message 'START-REQUEST'"
                );
            }
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_invalid_limit() {
        for limit in ["", "-1", "abc", "4294967296"] {
            let raw = format!(
                "START-REQUEST\nRequest-ID: 1\nRequest-Type: t\nRequest-Limit: {}\n",
                limit
            );
            assert!(
                matches!(decode(&raw), Err(TurnstileError::Protocol(_))),
                "limit {:?} should be rejected",
                limit
            );
        }
    }

    #[test]
    fn test_decode_zero_limit_is_valid() {
        let cmd = decode("START-REQUEST\nRequest-ID: 1\nRequest-Type: t\nRequest-Limit: 0\n")
            .unwrap()
            .unwrap();
        assert!(matches!(cmd, Command::StartRequest { limit: 0, .. }));
    }

    #[test]
    fn test_decode_ack_limit_flag() {
        let limited = decode("START-REQUEST-ACK\nRequest-ID: 3\nRequest-Limit-Reached: true\n")
            .unwrap()
            .unwrap();
        assert_eq!(
            limited,
            Command::StartRequestAck {
                request_id: "3".into(),
                limit_reached: true,
            }
        );
    }

    #[test]
    fn test_decode_unknown_method_is_ignored() {
        assert_eq!(decode("SUBSCRIBE\nTopic: x\n").unwrap(), None);
    }

    #[test]
    fn test_decode_request_count_reads_count_field() {
        let cmd = decode("REQUEST-COUNT\nRequest-Type: 17\nRequest-Count: 2\n")
            .unwrap()
            .unwrap();
        assert_eq!(
            cmd,
            Command::RequestCount {
                request_type: "17".into(),
                count: 2,
            }
        );
    }

    #[test]
    fn test_decode_request_count_rejects_non_integer() {
        let err = decode("REQUEST-COUNT\nRequest-Type: t\nRequest-Count: many\n").unwrap_err();
        assert!(err.to_string().contains("'Request-Count'"));
    }

    #[test]
    fn test_encode_decode_commands() {
        let commands = vec![
            Command::Heartbeat,
            Command::EndRequest {
                request_id: "99".into(),
            },
            Command::GetRequestCount {
                request_type: "reports".into(),
            },
            Command::error(ERROR_REQUEST_ID_DUPLICATED, "dup"),
        ];

        for cmd in commands {
            let decoded = decode(&cmd.encode()).unwrap().unwrap();
            assert_eq!(decoded, cmd);
        }
    }
}
