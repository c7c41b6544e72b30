//! opentmuxctl: command-line client for the opentmux control daemon.
//!
//! Exit codes: 0 success, 1 failure, 2 usage error (clap).

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use opentmux_core::control::client::ControlClient;
use opentmux_core::control::{Request, Response};
use opentmux_core::host::HostClient;
use opentmux_core::reaper;
use opentmux_core::{Error, Result};

#[derive(Debug, Parser)]
#[command(name = "opentmuxctl", about = "Drive the opentmux control daemon")]
struct Cli {
    /// Control socket path. Defaults to the newest
    /// <temp-dir>/opentmuxd-*.sock.
    #[arg(long, env = "OPENTMUXD_SOCKET", global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Initialize the daemon against a project directory and host.
    Init {
        /// Project directory searched for opentmux.json.
        #[arg(long, default_value = "")]
        directory: String,
        /// Host base url. Defaults to http://localhost:<OPENCODE_PORT|4096>.
        #[arg(long)]
        server_url: Option<String>,
    },
    /// Deliver a session.created event.
    SessionCreated {
        #[arg(long = "type", default_value = "session.created")]
        event_type: String,
        #[arg(long)]
        id: String,
        #[arg(long)]
        parent_id: String,
        #[arg(long, default_value = "Subagent")]
        title: String,
    },
    /// Request daemon shutdown.
    Shutdown {
        #[arg(long, default_value = "manual")]
        reason: String,
    },
    /// Print the coordinator gauges.
    Stats,
    /// Kill orphaned attach clients across all hosts. Does not need a
    /// running daemon.
    ReapAll {
        /// Session ids that must never be reaped.
        #[arg(long = "protect")]
        protect: Vec<String>,
    },
}

fn default_server_url() -> String {
    let port = std::env::var("OPENCODE_PORT")
        .ok()
        .and_then(|raw| raw.parse::<u16>().ok())
        .unwrap_or(4096);
    format!("http://localhost:{port}")
}

/// Newest daemon socket in the temp dir, for when the caller did not pin one.
fn discover_socket_path() -> Option<PathBuf> {
    let temp = std::env::temp_dir();
    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in std::fs::read_dir(&temp).ok()?.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with("opentmuxd-") || !name.ends_with(".sock") {
            continue;
        }
        let Ok(modified) = entry.metadata().and_then(|meta| meta.modified()) else {
            continue;
        };
        if newest.as_ref().is_none_or(|(when, _)| modified > *when) {
            newest = Some((modified, entry.path()));
        }
    }
    newest.map(|(_, path)| path)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    if let Command::ReapAll { protect } = &cli.command {
        let host = HostClient::new();
        let protected: HashSet<String> = protect.iter().cloned().collect();
        let report = reaper::reap_all(&host, &protected).await;
        println!("scanned={} killed={}", report.scanned, report.killed);
        for pid in &report.killed_pids {
            println!("reaped pid {pid}");
        }
        for error in &report.errors {
            eprintln!("{error}");
        }
        return Ok(());
    }

    let socket = cli
        .socket
        .or_else(discover_socket_path)
        .ok_or_else(|| Error::Protocol("no daemon socket found; pass --socket".to_string()))?;
    let client = ControlClient::new(socket);

    let request = match cli.command {
        Command::Init {
            directory,
            server_url,
        } => Request::Init {
            directory,
            server_url: server_url.unwrap_or_else(default_server_url),
            config: None,
        },
        Command::SessionCreated {
            event_type,
            id,
            parent_id,
            title,
        } => Request::SessionCreated {
            event_type,
            id,
            parent_id,
            title,
        },
        Command::Shutdown { reason } => Request::Shutdown { reason },
        Command::Stats => Request::Stats,
        Command::ReapAll { .. } => unreachable!("handled above"),
    };

    match client.call(&request).await? {
        Response::Init { enabled, message } => {
            println!("{message} enabled={enabled}");
        }
        Response::SessionCreated { accepted } => {
            println!("accepted={accepted}");
        }
        Response::Shutdown { ok } => {
            println!("ok={ok}");
        }
        Response::Stats {
            tracked_sessions,
            pending_sessions,
            queue_depth,
        } => {
            println!("tracked={tracked_sessions} pending={pending_sessions} queue={queue_depth}");
        }
        Response::Error { message } => return Err(Error::Protocol(message)),
    }
    Ok(())
}
