//! Parley line-mode client.
//!
//! # Usage
//!
//! ```bash
//! # Join a room on a local server
//! parley --user-id alice --room general
//!
//! # Remote server with a bearer token
//! PARLEY_TOKEN=... parley --api-base https://chat.example/api \
//!     --ws-base wss://chat.example --user-id alice
//! ```
//!
//! Type `/help` once running for the list of commands.

mod commands;
mod render;

use std::time::Duration;

use clap::Parser;
use parley_client::{
    ClientConfig, Command, DriverHandle, LocalUser, RoomSession, Runtime, SessionConfig,
    SystemEnv, TransportError, WsDriver,
};
use parley_core::{ConnectionConfig, NotificationConfig, ReconnectPolicy};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout},
    sync::broadcast::error::RecvError,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    commands::{HELP, Parsed},
    render::{Printer, activity_line},
};

/// Parley chat client
#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(about = "Line-mode client for Parley chat rooms")]
#[command(version)]
struct Args {
    /// Message API base URL
    #[arg(long, env = "PARLEY_API_BASE", default_value = parley_client::config::DEFAULT_API_BASE)]
    api_base: String,

    /// Live channel base URL
    #[arg(long, env = "PARLEY_WS_BASE", default_value = parley_client::config::DEFAULT_WS_BASE)]
    ws_base: String,

    /// Bearer token for the API and the live channel
    #[arg(long, env = "PARLEY_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Your user id
    #[arg(short, long, env = "PARLEY_USER")]
    user_id: String,

    /// Display name attached to your messages (defaults to the user id)
    #[arg(short, long)]
    name: Option<String>,

    /// Room to enter on startup
    #[arg(short, long)]
    room: Option<String>,

    /// Seconds between reconnect attempts
    #[arg(long, default_value = "3")]
    reconnect_delay: u64,

    /// Back off exponentially with jitter, up to this many seconds
    #[arg(long)]
    max_reconnect_delay: Option<u64>,

    /// Maximum messages held while disconnected (unbounded by default)
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

impl Args {
    fn client_config(&self) -> ClientConfig {
        let delay = Duration::from_secs(self.reconnect_delay);
        let reconnect = match self.max_reconnect_delay {
            Some(max) => {
                ReconnectPolicy::Exponential { base: delay, max: Duration::from_secs(max), jitter: true }
            },
            None => ReconnectPolicy::Fixed { delay },
        };
        ClientConfig {
            api_base: self.api_base.clone(),
            ws_base: self.ws_base.clone(),
            auth_token: self.token.clone(),
            session: SessionConfig {
                connection: ConnectionConfig { reconnect, outbound_capacity: self.queue_capacity },
                notifications: NotificationConfig::default(),
            },
            ..ClientConfig::default()
        }
    }

    fn local_user(&self) -> LocalUser {
        LocalUser {
            user_id: self.user_id.as_str().into(),
            display_name: self.name.clone().unwrap_or_else(|| self.user_id.clone()),
        }
    }
}

/// Fatal client errors.
#[derive(Debug, Error)]
enum RuntimeError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("terminal i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("frontend task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[tokio::main]
async fn main() -> Result<(), RuntimeError> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let config = args.client_config();
    tracing::info!(api = %config.api_base, ws = %config.ws_base, user = %args.user_id, "parley starting");

    let session = RoomSession::new(SystemEnv::new(), args.local_user(), config.session.clone());
    let (driver, handle) = WsDriver::new(config)?;

    let frontend = tokio::spawn(frontend(handle, args.room));
    let stopped = Runtime::new(driver, session).run().await;
    if stopped.is_err() {
        frontend.abort();
    }
    stopped?;
    frontend.await??;

    tracing::info!("parley stopped");
    Ok(())
}

/// Reads commands from stdin and prints snapshots until quit or EOF.
async fn frontend(handle: DriverHandle, room: Option<String>) -> Result<(), RuntimeError> {
    let mut out = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut snapshots = handle.snapshots();
    let mut activity = handle.activity();
    let mut printer = Printer::default();

    if let Some(room) = room {
        handle.send(Command::EnterRoom(room.into())).await?;
    }

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    handle.send(Command::Quit).await?;
                    return Ok(());
                };
                match commands::parse(&line) {
                    Parsed::Command(Command::Quit) => {
                        handle.send(Command::Quit).await?;
                        return Ok(());
                    },
                    Parsed::Command(command) => handle.send(command).await?,
                    Parsed::Help => write_line(&mut out, HELP).await?,
                    Parsed::Empty => {},
                    Parsed::Unknown { input } => {
                        write_line(&mut out, &format!("unknown command: {input} (try /help)")).await?;
                    },
                    Parsed::InvalidArgs { command, error } => {
                        write_line(&mut out, &format!("/{command}: {error}")).await?;
                    },
                }
            },
            changed = snapshots.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let updates = printer.update(&snapshots.borrow_and_update());
                for update in updates {
                    write_line(&mut out, &update).await?;
                }
            },
            event = activity.recv() => match event {
                Ok(activity) => {
                    if let Some(update) = activity_line(&activity.event) {
                        write_line(&mut out, &update).await?;
                    }
                },
                Err(RecvError::Lagged(skipped)) => tracing::debug!(skipped, "activity lagged"),
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

async fn write_line(out: &mut Stdout, line: &str) -> std::io::Result<()> {
    out.write_all(line.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn arguments_are_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn fixed_backoff_by_default() {
        let args = Args::parse_from(["parley", "--user-id", "alice", "--reconnect-delay", "5"]);
        let config = args.client_config();
        assert_eq!(config.session.connection.reconnect, ReconnectPolicy::Fixed {
            delay: Duration::from_secs(5)
        });
        assert_eq!(args.local_user().display_name, "alice");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn max_delay_selects_exponential_backoff() {
        let args = Args::parse_from([
            "parley",
            "--user-id",
            "alice",
            "--name",
            "Alice",
            "--max-reconnect-delay",
            "30",
            "--queue-capacity",
            "50",
        ]);
        let config = args.client_config();
        assert_eq!(config.session.connection.reconnect, ReconnectPolicy::Exponential {
            base: Duration::from_secs(3),
            max: Duration::from_secs(30),
            jitter: true,
        });
        assert_eq!(config.session.connection.outbound_capacity, Some(50));
        assert_eq!(args.local_user().display_name, "Alice");
    }
}
