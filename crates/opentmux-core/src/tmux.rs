//! Multiplexer adapter.
//!
//! The only module allowed to shell out to the tmux binary. The binary path
//! is discovered once (`which tmux` plus a `-V` probe) and cached; every
//! invocation captures stdout/stderr, and failures map to `false`/failure
//! results rather than errors.
//!
//! Writes to tmux are serialized elsewhere: spawns route through the single
//! spawn-queue worker, closes through the session manager's sequential close
//! path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::config::Config;
use crate::host::HostApi;
use crate::process;
use crate::spawn_queue::SpawnResult;

/// Longest pane title tmux gets to render.
const MAX_TITLE_CHARS: usize = 30;

/// Grace before an attach child is SIGKILLed during pane close.
const CHILD_KILL_GRACE: Duration = Duration::from_secs(2);

/// Whether this process runs inside a tmux client, detected by the
/// server-provided environment marker. Without it the adapter refuses all
/// spawns.
#[must_use]
pub fn inside_tmux() -> bool {
    std::env::var("TMUX").map(|v| !v.is_empty()).unwrap_or(false)
}

/// Pane operations the session manager drives, fronted by a trait so the
/// manager can be exercised without a live multiplexer.
#[async_trait]
pub trait PaneDriver: Send + Sync {
    /// Create a detached split attached to `session_id`. Never raises; a
    /// failed invocation is a failed [`SpawnResult`].
    async fn spawn_pane(&self, session_id: &str, title: &str) -> SpawnResult;

    /// Kill the attach subprocess inside the pane, then the pane itself.
    /// Returns success iff `kill-pane` succeeded.
    async fn close_pane(&self, pane_id: &str) -> bool;

    /// Re-apply the configured layout. Never raises.
    async fn apply_layout(&self);
}

/// Production [`PaneDriver`] shelling out to tmux.
pub struct TmuxDriver {
    cfg: Config,
    server_url: String,
    host: Arc<dyn HostApi>,
    tmux_path: OnceCell<Option<String>>,
}

impl TmuxDriver {
    #[must_use]
    pub fn new(cfg: Config, server_url: String, host: Arc<dyn HostApi>) -> Self {
        Self {
            cfg,
            server_url,
            host,
            tmux_path: OnceCell::new(),
        }
    }

    async fn tmux_path(&self) -> Option<&str> {
        self.tmux_path
            .get_or_init(discover_tmux_path)
            .await
            .as_deref()
    }

    async fn run(&self, args: &[&str]) -> Option<Invocation> {
        let path = self.tmux_path().await?;
        Some(invoke(path, args).await)
    }
}

#[async_trait]
impl PaneDriver for TmuxDriver {
    async fn spawn_pane(&self, session_id: &str, title: &str) -> SpawnResult {
        if !self.cfg.enabled || !inside_tmux() {
            return SpawnResult::failure();
        }
        if !self.host.healthy(&self.server_url).await {
            warn!(server_url = %self.server_url, "host unhealthy; refusing pane spawn");
            return SpawnResult::failure();
        }
        let Some(invocation) = self
            .run(&[
                "split-window",
                "-h",
                "-d",
                "-P",
                "-F",
                "#{pane_id}",
                &attach_command(&self.server_url, session_id),
            ])
            .await
        else {
            warn!("tmux binary not found; refusing pane spawn");
            return SpawnResult::failure();
        };
        if !invocation.success {
            warn!(session_id, stderr = %invocation.stderr, "split-window failed");
            return SpawnResult::failure();
        }
        let pane_id = invocation.stdout.trim().to_string();
        if pane_id.is_empty() {
            // a zero exit without a pane id is still a failed spawn
            warn!(session_id, "split-window produced no pane id");
            return SpawnResult::failure();
        }

        let _ = self
            .run(&["select-pane", "-t", &pane_id, "-T", &truncate_title(title)])
            .await;
        self.apply_layout().await;

        SpawnResult {
            success: true,
            pane_id,
        }
    }

    async fn close_pane(&self, pane_id: &str) -> bool {
        if pane_id.is_empty() {
            return false;
        }

        if let Some(listing) = self
            .run(&["list-panes", "-t", pane_id, "-F", "#{pane_pid}"])
            .await
        {
            if listing.success {
                if let Some(shell_pid) = parse_pane_pid(&listing.stdout) {
                    kill_attach_children(shell_pid).await;
                }
            }
        }

        let killed = match self.run(&["kill-pane", "-t", pane_id]).await {
            Some(invocation) => {
                if !invocation.success {
                    warn!(pane_id, stderr = %invocation.stderr, "kill-pane failed");
                }
                invocation.success
            }
            None => false,
        };
        // the window must recover its layout even when the pane was already gone
        self.apply_layout().await;
        killed
    }

    async fn apply_layout(&self) {
        let layout = if self.cfg.layout.is_empty() {
            "main-vertical"
        } else {
            self.cfg.layout.as_str()
        };
        let Some(invocation) = self.run(&["select-layout", layout]).await else {
            return;
        };
        if !invocation.success {
            debug!(layout, stderr = %invocation.stderr, "select-layout failed; falling back");
            let _ = self.run(&["select-layout", "main-vertical"]).await;
            return;
        }
        if layout == "main-horizontal" || layout == "main-vertical" {
            let size_option = if layout == "main-horizontal" {
                "main-pane-height"
            } else {
                "main-pane-width"
            };
            let size = format!("{}%", self.cfg.main_pane_size);
            let _ = self.run(&["set-window-option", size_option, &size]).await;
            if layout == "main-vertical" {
                // re-select so the width option takes effect immediately
                let _ = self.run(&["select-layout", layout]).await;
            }
        }
    }
}

/// Terminate every child of the pane shell whose command line mentions
/// opencode, escalating from SIGTERM to SIGKILL after the grace period.
async fn kill_attach_children(shell_pid: u32) {
    for child in process::children(shell_pid).await {
        let command = process::command_line(child).await;
        if command.contains("opencode") {
            process::terminate_with_grace(child, CHILD_KILL_GRACE).await;
        }
    }
}

/// The attach invocation emitted verbatim into the split.
fn attach_command(server_url: &str, session_id: &str) -> String {
    format!("opencode attach {server_url} --session {session_id}")
}

fn truncate_title(title: &str) -> String {
    title.chars().take(MAX_TITLE_CHARS).collect()
}

fn parse_pane_pid(raw: &str) -> Option<u32> {
    raw.lines().next()?.trim().parse().ok()
}

struct Invocation {
    success: bool,
    stdout: String,
    stderr: String,
}

async fn invoke(program: &str, args: &[&str]) -> Invocation {
    match Command::new(program).args(args).output().await {
        Ok(output) => Invocation {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        },
        Err(err) => {
            warn!(program, error = %err, "invocation failed");
            Invocation {
                success: false,
                stdout: String::new(),
                stderr: err.to_string(),
            }
        }
    }
}

async fn discover_tmux_path() -> Option<String> {
    let output = Command::new("sh")
        .args(["-lc", "which tmux"])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if path.is_empty() {
        return None;
    }
    // version probe weeds out broken shims
    let probe = Command::new(&path).arg("-V").output().await.ok()?;
    probe.status.success().then_some(path)
}
