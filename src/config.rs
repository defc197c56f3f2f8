//! Configuration for the Turnstile authority
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::server::HandlerConfig;

/// Turnstile - distributed admission control authority
#[derive(Parser, Debug, Clone)]
#[command(name = "turnstile")]
#[command(about = "Counts concurrent requests per type across a fleet of clients")]
pub struct Args {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value = "8080")]
    pub port: u16,

    /// Address to bind to
    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Shared token clients must present in the upgrade path (/ws/{token})
    #[arg(long, env = "AUTH_TOKEN", default_value = "")]
    pub auth_token: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines instead of human-readable text
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,

    /// Dump every inbound and outbound frame at debug level
    #[arg(long, env = "LOG_MESSAGES", default_value = "false")]
    pub log_messages: bool,

    /// Seconds between heartbeats; a client silent for twice this is dropped
    #[arg(long, env = "HEARTBEAT_INTERVAL_SECS", default_value = "30")]
    pub heartbeat_interval_secs: u64,
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval_secs == 0 {
            return Err("HEARTBEAT_INTERVAL_SECS must be greater than zero".to_string());
        }

        self.listen_addr()?;
        Ok(())
    }

    /// Socket address built from BIND_ADDRESS and PORT
    pub fn listen_addr(&self) -> Result<SocketAddr, String> {
        let ip: IpAddr = self
            .bind_address
            .parse()
            .map_err(|_| format!("BIND_ADDRESS '{}' is not an IP address", self.bind_address))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// Per-connection handler settings
    pub fn handler_config(&self) -> HandlerConfig {
        HandlerConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            log_messages: self.log_messages,
        }
    }
}
