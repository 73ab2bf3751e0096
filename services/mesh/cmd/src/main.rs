//! Mesh chat node binary.
//!
//! Hosts a new room or joins an existing one, then runs an interactive
//! console until the user leaves, stdin ends, or Ctrl-C is pressed.

use anyhow::Context;
use clap::Parser;
use mesh_session::Session;
use mesh_wire::PeerAddr;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod console;
mod logging;

use config::ChatConfig;
use console::Console;
use logging::ChatLogFormatter;

/// Full-mesh peer-to-peer chat room
#[derive(Parser, Debug)]
#[command(name = "mesh-chat", version, about = "Full-mesh peer-to-peer chat room")]
struct Args {
    /// Display name announced to the room
    #[arg(long)]
    name: Option<String>,

    /// Host to bind and advertise
    #[arg(long)]
    host: Option<String>,

    /// Listening port
    #[arg(long)]
    port: Option<u16>,

    /// Maximum members when hosting (0 = unlimited)
    #[arg(long)]
    limit: Option<u32>,

    /// Join the room whose admin listens on host:port instead of hosting
    #[arg(long)]
    join: Option<PeerAddr>,

    /// Outbound connect timeout, e.g. 5s
    #[arg(long)]
    connect_timeout: Option<humantime::Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Configuration file path
    #[arg(long, default_value = "mesh-chat.yaml")]
    config: PathBuf,
}

impl Args {
    /// Flags win over file and environment
    fn apply_to(&self, config: &mut ChatConfig) {
        if let Some(name) = &self.name {
            config.name = name.clone();
        }
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(limit) = self.limit {
            config.limit = limit;
        }
        if let Some(timeout) = &self.connect_timeout {
            config.connect_timeout = Some(timeout.to_string());
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("warn")
        .add_directive(format!("mesh_chat={}", args.log_level).parse()?)
        .add_directive(format!("mesh_session={}", args.log_level).parse()?)
        .add_directive(format!("mesh_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(ChatLogFormatter::new("mesh-chat"))
        .init();

    info!("Starting mesh-chat v{}", env!("CARGO_PKG_VERSION"));

    let mut chat_config = ChatConfig::load_from_file(&args.config)?;
    args.apply_to(&mut chat_config);
    chat_config.validate()?;
    let session_config = chat_config
        .to_session_config()
        .context("invalid chat configuration")?;

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let started = match &args.join {
        Some(target) => Session::join(session_config, target.clone(), events_tx).await,
        None => Session::host(session_config, events_tx).await,
    };

    let session = match started {
        Ok(session) => session,
        Err(e) => {
            error!("Could not start session: {}", e);
            while let Ok(event) = events_rx.try_recv() {
                println!("{}", event);
            }
            return Err(e).context("failed to start session");
        }
    };

    match &args.join {
        Some(target) => println!(
            "joined room at {} (listening on {})",
            target,
            session.local_addr()
        ),
        None => println!("hosting room on {}", session.local_addr()),
    }

    let console = Console::new(session.clone(), events_rx);
    tokio::select! {
        result = console.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted; leaving room");
            if let Err(e) = session.leave("").await {
                warn!("Leave after interrupt failed: {}", e);
            }
        }
    }

    info!("mesh-chat stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_flags_override_config() {
        let args = Args::parse_from([
            "mesh-chat",
            "--name",
            "carol",
            "--port",
            "0",
            "--join",
            "localhost:4400",
            "--connect-timeout",
            "3s",
        ]);
        let mut config = ChatConfig {
            name: "from-file".to_string(),
            limit: 5,
            ..ChatConfig::default()
        };
        args.apply_to(&mut config);

        assert_eq!(config.name, "carol");
        assert_eq!(config.port, 0);
        assert_eq!(config.limit, 5);
        assert_eq!(args.join, Some(PeerAddr::new("localhost", 4400)));
        assert_eq!(
            config.connect_timeout().unwrap(),
            Some(Duration::from_secs(3))
        );
    }

    #[test]
    fn test_defaults_host_a_room() {
        let args = Args::parse_from(["mesh-chat"]);
        assert!(args.join.is_none());
        assert_eq!(args.log_level, "warn");
        assert_eq!(args.config, PathBuf::from("mesh-chat.yaml"));
    }
}
