//! Line-oriented RPC message codec
//!
//! The first line is the method, canonicalized to upper case. Each following
//! line up to the first blank line is a `Key: value` parameter; names are
//! matched case-insensitively and stored lower-cased when parsed. A value is
//! everything after the `": "` separator, padding included. Everything after
//! the blank line is the body, verbatim.

use std::fmt;

/// A single protocol frame
#[derive(Debug, Clone, Default)]
pub struct RpcMessage {
    method: String,
    /// Parameters in insertion order
    params: Vec<(String, String)>,
    body: String,
}

impl RpcMessage {
    /// Create a message with no parameters and no body
    pub fn new(method: &str) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            params: Vec::new(),
            body: String::new(),
        }
    }

    /// Builder-style parameter setter
    pub fn with_param(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_param(name, value);
        self
    }

    /// Builder-style body setter
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Parameters in serialization order
    pub fn params(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Look up a parameter by name, ignoring case
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Set a parameter, replacing any existing one with the same name
    pub fn set_param(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .params
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            Some(entry) => entry.1 = value,
            None => self.params.push((name.to_string(), value)),
        }
    }

    /// Parse a raw frame. Parsing never fails; malformed parameter lines
    /// (no `:` separator) are skipped.
    pub fn parse(raw: &str) -> Self {
        let mut msg = RpcMessage::default();
        let mut rest = raw;
        let mut first = true;

        loop {
            let (line, remaining) = match rest.find('\n') {
                Some(i) => (&rest[..i], Some(&rest[i + 1..])),
                None => (rest, None),
            };
            let line = line.strip_suffix('\r').unwrap_or(line);

            if first {
                msg.method = line.trim().to_ascii_uppercase();
                first = false;
            } else if line.is_empty() {
                msg.body = remaining.unwrap_or("").to_string();
                break;
            } else if let Some((name, value)) = line.split_once(':') {
                let name = name.trim();
                if !name.is_empty() {
                    let value = value.strip_prefix(' ').unwrap_or(value);
                    msg.set_param(&name.to_ascii_lowercase(), value);
                }
            }

            match remaining {
                Some(r) => rest = r,
                None => break,
            }
        }

        msg
    }

    /// Serialize to the wire format
    pub fn serialize(&self) -> String {
        let mut out = String::with_capacity(
            self.method.len() + 1 + self.params.len() * 24 + self.body.len() + 1,
        );
        out.push_str(&self.method);
        out.push('\n');

        for (name, value) in &self.params {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push('\n');
        }

        if !self.body.is_empty() {
            out.push('\n');
            out.push_str(&self.body);
        }

        out
    }
}

impl PartialEq for RpcMessage {
    fn eq(&self, other: &Self) -> bool {
        self.method == other.method
            && self.body == other.body
            && self.params.len() == other.params.len()
            && self
                .params
                .iter()
                .zip(other.params.iter())
                .all(|((ka, va), (kb, vb))| ka.eq_ignore_ascii_case(kb) && va == vb)
    }
}

impl Eq for RpcMessage {}

impl fmt::Display for RpcMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}
