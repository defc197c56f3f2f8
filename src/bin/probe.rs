//! Turnstile Probe - operator CLI for a running authority
//!
//! Usage:
//!   turnstile-probe --url ws://localhost:8080 --auth-token secret count uploads
//!   turnstile-probe --url ws://localhost:8080 hold uploads --limit 3 --seconds 30
//!
//! Environment variables:
//!   TURNSTILE_URL - authority base URL (default: ws://127.0.0.1:8080)
//!   AUTH_TOKEN - shared token
//!   TIMEOUT_SECS - reply timeout in seconds (default: 10)

use clap::{Parser, Subcommand};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use turnstile::client::{Client, ClientConfig};

#[derive(Parser, Debug)]
#[command(name = "turnstile-probe")]
#[command(about = "Query and exercise a Turnstile authority")]
#[command(version)]
struct Args {
    /// Authority base URL
    #[arg(long, env = "TURNSTILE_URL", default_value = "ws://127.0.0.1:8080")]
    url: String,

    /// Shared token
    #[arg(long, env = "AUTH_TOKEN", default_value = "")]
    auth_token: String,

    /// Reply timeout in seconds
    #[arg(long, env = "TIMEOUT_SECS", default_value = "10")]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the number of active slots of a request type
    Count {
        request_type: String,
    },
    /// Take one slot, hold it, then give it back
    Hold {
        request_type: String,

        /// Ceiling to request the slot against
        #[arg(long, default_value = "1")]
        limit: u32,

        /// How long to hold the slot
        #[arg(long, default_value = "10")]
        seconds: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let timeout = Duration::from_secs(args.timeout_secs);

    let client = Client::new(ClientConfig {
        timeout,
        ..ClientConfig::new(args.url, args.auth_token)
    })?;
    client.connect();
    client.wait_until_connected(timeout).await?;

    let outcome = run(&client, args.command).await;
    client.close().await;
    outcome
}

async fn run(client: &Client, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Count { request_type } => {
            let count = client.get_request_count(&request_type).await?;
            println!("{}", count);
        }
        Command::Hold {
            request_type,
            limit,
            seconds,
        } => {
            let request = client.start_request(&request_type, limit).await?;
            if request.is_limited() {
                println!("limited");
                return Ok(());
            }

            println!("admitted, holding for {}s", seconds);
            info!(request_type, limit, "Holding slot");

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
                _ = tokio::signal::ctrl_c() => {}
            }

            client.end_request(&request);
            let count = client.get_request_count(&request_type).await?;
            println!("released, {} active", count);
        }
    }

    Ok(())
}
