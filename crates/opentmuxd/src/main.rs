//! opentmuxd: the control daemon.
//!
//! Binds a local Unix socket, decodes length-prefixed control frames, and
//! dispatches them onto the control service. The host plugin shim talks to
//! this process; everything else (queue, poller, reaper, panes) lives inside
//! `opentmux-core`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;
use tracing::{info, warn};

use opentmux_core::control::protocol::{read_frame, write_frame};
use opentmux_core::control::{Request, Response, Service};
use opentmux_core::logging::{init_logging, LogConfig, LogFormat};

#[derive(Debug, Parser)]
#[command(name = "opentmuxd", about = "Control daemon for opencode agent panes in tmux")]
struct Args {
    /// Unix socket path (default: <temp-dir>/opentmuxd-<pid>.sock).
    #[arg(long, env = "OPENTMUXD_SOCKET")]
    socket: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit JSON log lines instead of pretty output.
    #[arg(long)]
    log_json: bool,

    /// Append logs to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn default_socket_path() -> PathBuf {
    std::env::temp_dir().join(format!("opentmuxd-{}.sock", std::process::id()))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let log_config = LogConfig {
        level: args.log_level.clone(),
        format: if args.log_json {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        },
        file: args.log_file.clone(),
    };
    if let Err(err) = init_logging(&log_config) {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }

    let socket_path = args.socket.unwrap_or_else(default_socket_path);
    match run(socket_path).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(socket_path: PathBuf) -> opentmux_core::Result<()> {
    // a stale socket file from a crashed run blocks bind; clear it first
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)?;
    restrict_socket_permissions(&socket_path);

    let stop = Arc::new(Notify::new());
    let stop_signal = Arc::clone(&stop);
    let service = Arc::new(Service::new(Some(Arc::new(move |reason: String| {
        info!(reason = %reason, "stop requested");
        stop_signal.notify_one();
    }))));

    info!(socket = %socket_path.display(), "opentmuxd listening");
    println!("{}", socket_path.display());

    loop {
        tokio::select! {
            () = stop.notified() => break,
            () = shutdown_signal() => {
                let _ = service.handle(Request::Shutdown { reason: "signal".to_string() }).await;
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let service = Arc::clone(&service);
                    tokio::spawn(serve_connection(service, stream));
                }
                Err(err) => warn!(error = %err, "accept failed"),
            }
        }
    }

    drop(listener);
    let _ = std::fs::remove_file(&socket_path);
    info!("opentmuxd stopped");
    Ok(())
}

fn restrict_socket_permissions(socket_path: &std::path::Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(err) =
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))
        {
            warn!(error = %err, "could not restrict socket permissions");
        }
    }
    #[cfg(not(unix))]
    let _ = socket_path;
}

async fn serve_connection(service: Arc<Service>, mut stream: UnixStream) {
    loop {
        match read_frame::<_, Request>(&mut stream).await {
            Ok(Some(request)) => {
                let response = service.handle(request).await;
                if write_frame(&mut stream, &response).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(err) => {
                warn!(error = %err, "control connection error");
                let response = Response::Error {
                    message: err.to_string(),
                };
                let _ = write_frame(&mut stream, &response).await;
                return;
            }
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("sigterm handler installation cannot fail");
        let mut sigint =
            signal(SignalKind::interrupt()).expect("sigint handler installation cannot fail");
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
