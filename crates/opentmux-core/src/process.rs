//! Signal-safe process queries and kills.
//!
//! OS-side primitives used by the reaper and the pane lifecycle. Everything
//! shells out (`ps`, `pgrep`, `lsof`, `kill`) and returns sentinel empties on
//! failure or on non-POSIX platforms; none of these raise. No other module
//! spawns process-introspection subprocesses.

use std::time::Duration;

use tokio::process::Command;
use tokio::time::sleep;

/// How often [`wait_for_exit`] re-probes a pid.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default grace before [`wait_for_exit`] gives up.
pub const DEFAULT_EXIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Signals understood by [`safe_kill`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

impl Signal {
    const fn flag(self) -> &'static str {
        match self {
            Self::Term => "-TERM",
            Self::Kill => "-KILL",
        }
    }
}

async fn capture(program: &str, args: &[&str]) -> Option<std::process::Output> {
    if !cfg!(unix) {
        return None;
    }
    Command::new(program).args(args).output().await.ok()
}

fn parse_pids(raw: &str) -> Vec<u32> {
    raw.lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .collect()
}

/// True iff a null-signal probe succeeds.
pub async fn is_alive(pid: u32) -> bool {
    match capture("kill", &["-0", &pid.to_string()]).await {
        Some(output) => output.status.success(),
        None => false,
    }
}

/// The full command line of a process; empty on failure.
pub async fn command_line(pid: u32) -> String {
    match capture("ps", &["-p", &pid.to_string(), "-o", "command="]).await {
        Some(output) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        }
        _ => String::new(),
    }
}

/// Immediate child pids; empty on non-POSIX or failure.
pub async fn children(pid: u32) -> Vec<u32> {
    match capture("pgrep", &["-P", &pid.to_string()]).await {
        Some(output) => parse_pids(&String::from_utf8_lossy(&output.stdout)),
        None => Vec::new(),
    }
}

/// Pids listening on a TCP port; empty on non-POSIX or failure.
pub async fn listening_pids(port: u16) -> Vec<u32> {
    let spec = format!("-iTCP:{port}");
    match capture("lsof", &["-nP", &spec, "-sTCP:LISTEN", "-t"]).await {
        Some(output) => parse_pids(&String::from_utf8_lossy(&output.stdout)),
        None => Vec::new(),
    }
}

/// Pids whose full command line matches `pattern` (extended regex); empty on
/// non-POSIX or failure.
pub async fn find_by_pattern(pattern: &str) -> Vec<u32> {
    match capture("pgrep", &["-f", pattern]).await {
        Some(output) => parse_pids(&String::from_utf8_lossy(&output.stdout)),
        None => Vec::new(),
    }
}

/// Send `signal` to `pid`. Returns true also when the process is already
/// gone; only a live process that refused the signal counts as failure.
pub async fn safe_kill(pid: u32, signal: Signal) -> bool {
    match capture("kill", &[signal.flag(), &pid.to_string()]).await {
        Some(output) => {
            if output.status.success() {
                return true;
            }
            let stderr = String::from_utf8_lossy(&output.stderr);
            stderr.contains("No such process")
        }
        None => false,
    }
}

/// Poll until the process is dead or `timeout` elapses. A zero timeout uses
/// [`DEFAULT_EXIT_TIMEOUT`].
pub async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let timeout = if timeout.is_zero() {
        DEFAULT_EXIT_TIMEOUT
    } else {
        timeout
    };
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if !is_alive(pid).await {
            return true;
        }
        sleep(EXIT_POLL_INTERVAL).await;
    }
    !is_alive(pid).await
}

/// SIGTERM, wait up to `grace`, then SIGKILL if the process is still there.
pub async fn terminate_with_grace(pid: u32, grace: Duration) {
    safe_kill(pid, Signal::Term).await;
    if !wait_for_exit(pid, grace).await {
        safe_kill(pid, Signal::Kill).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pids_skips_garbage() {
        assert_eq!(parse_pids("123\n  456 \nabc\n\n789"), vec![123, 456, 789]);
        assert!(parse_pids("").is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn own_process_is_alive() {
        assert!(is_alive(std::process::id()).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn own_command_line_is_nonempty() {
        assert!(!command_line(std::process::id()).await.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn safe_kill_reports_true_for_missing_pid() {
        // pid from the far end of the range; almost certainly unused
        assert!(safe_kill(4_000_000, Signal::Term).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_and_wait_reaps_a_child() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep");
        let pid = child.id().expect("child pid");
        assert!(is_alive(pid).await);
        assert!(safe_kill(pid, Signal::Kill).await);
        // reap, otherwise the defunct entry still answers the null signal
        let _ = child.wait().await;
        assert!(wait_for_exit(pid, Duration::from_secs(2)).await);
    }
}
