//! Shared-token authentication for WebSocket upgrades
//!
//! Clients connect to `/ws/{token}`. The token is the first path segment after
//! the prefix, percent-decoded, and must equal the configured token.

/// Path prefix of the WebSocket endpoint
pub const WS_PATH_PREFIX: &str = "/ws/";

/// Validates the token embedded in an upgrade path
#[derive(Debug, Clone)]
pub struct TokenValidator {
    token: String,
}

impl TokenValidator {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// True when no token is configured; only an empty segment is accepted then
    pub fn is_empty(&self) -> bool {
        self.token.is_empty()
    }

    /// Check a decoded token against the configured one
    pub fn validate(&self, candidate: &str) -> bool {
        constant_time_compare(candidate, &self.token)
    }

    /// Check the token carried by a request path.
    ///
    /// Returns `None` when the path is not a WebSocket path at all.
    pub fn validate_path(&self, path: &str) -> Option<bool> {
        token_from_path(path).map(|token| self.validate(&token))
    }
}

/// Extract the percent-decoded token from `/ws/{token}[/...]`
pub fn token_from_path(path: &str) -> Option<String> {
    let rest = path.strip_prefix(WS_PATH_PREFIX)?;
    let segment = rest.split('/').next().unwrap_or("");

    match urlencoding::decode(segment) {
        Ok(decoded) => Some(decoded.into_owned()),
        // Not valid UTF-8 once decoded; compare the raw segment instead
        Err(_) => Some(segment.to_string()),
    }
}

/// Constant-time string comparison to prevent timing attacks
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}
