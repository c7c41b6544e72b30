//! Zombie reaper for orphaned attach clients.
//!
//! Agent panes run `opencode attach` subprocesses that can outlive their
//! session when a pane close races a host restart or the daemon crashes
//! mid-teardown. The reaper periodically scans for attach processes whose
//! session no longer appears in the host's active set and kills them — but
//! only processes it can prove belong to this instance.
//!
//! # Safety invariants
//!
//! - Never kill a pid whose target url does not normalize to this instance's
//!   server url.
//! - Never kill on a single scan: a pid must look dead on
//!   `reaper_min_zombie_checks` consecutive scans *and* have been a candidate
//!   for `reaper_grace_period_ms` of wall clock.
//! - Never kill on transient host unavailability; a failed status fetch
//!   aborts the scan.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::Config;
use crate::host::HostApi;
use crate::process;

/// Pattern matched against full command lines when enumerating attach
/// clients.
const ATTACH_PATTERN: &str = "opencode attach";

/// Grace before an interval-scan kill escalates to SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(2);

// =============================================================================
// Candidate tracking
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Candidate {
    count: u32,
    first_seen: Instant,
}

/// Pure candidate bookkeeping: counts consecutive sightings per pid and
/// decides kill eligibility. The reaper wraps this with the actual process
/// and host I/O.
#[derive(Debug)]
pub struct ZombieTracker {
    min_checks: u32,
    grace: Duration,
    candidates: HashMap<u32, Candidate>,
}

impl ZombieTracker {
    #[must_use]
    pub fn new(min_checks: u32, grace: Duration) -> Self {
        Self {
            min_checks,
            grace,
            candidates: HashMap::new(),
        }
    }

    /// Record one zombie sighting at `now`. Returns true iff the pid is now
    /// eligible to kill: both the consecutive-check and the wall-clock gates
    /// must hold.
    pub fn observe(&mut self, pid: u32, now: Instant) -> bool {
        let candidate = self.candidates.entry(pid).or_insert(Candidate {
            count: 0,
            first_seen: now,
        });
        candidate.count += 1;
        candidate.count >= self.min_checks
            && now.saturating_duration_since(candidate.first_seen) >= self.grace
    }

    /// Drop the record for a pid that turned out alive, owned elsewhere, or
    /// killed.
    pub fn clear(&mut self, pid: u32) {
        self.candidates.remove(&pid);
    }

    /// Drop records for pids no longer present in the latest enumeration.
    pub fn retain_present(&mut self, present: &HashSet<u32>) {
        self.candidates.retain(|pid, _| present.contains(pid));
    }

    /// Forget everything (no attach processes exist at all).
    pub fn reset(&mut self) {
        self.candidates.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

// =============================================================================
// Attach command parsing and URL ownership
// =============================================================================

/// Target parsed out of an attach command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AttachInfo {
    pub target_url: String,
    /// Empty when the command line carries no `--session` argument.
    pub session_id: String,
}

/// Extract the target url (first non-flag token after `attach`) and the
/// session id (argument following `--session`) from a command line.
pub(crate) fn parse_attach_command(command: &str) -> Option<AttachInfo> {
    let tokens: Vec<&str> = command.split_whitespace().collect();
    let attach_idx = tokens.iter().position(|t| *t == "attach")?;

    let mut target_url = None;
    let mut session_id = String::new();
    let mut idx = attach_idx + 1;
    while idx < tokens.len() {
        let token = tokens[idx];
        if token == "--session" {
            if let Some(value) = tokens.get(idx + 1) {
                session_id = (*value).to_string();
            }
            idx += 2;
            continue;
        }
        if !token.starts_with('-') && target_url.is_none() {
            target_url = Some(token.to_string());
        }
        idx += 1;
    }

    target_url.map(|target_url| AttachInfo {
        target_url,
        session_id,
    })
}

/// Normalize a server url to a comparable `(scheme, host, port)` origin.
/// `localhost` and `127.0.0.1` compare equal; a missing scheme defaults to
/// http.
fn normalize_origin(raw: &str) -> Option<(String, String, u16)> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    let url = Url::parse(&with_scheme).ok()?;
    let host = match url.host_str()? {
        "localhost" => "127.0.0.1".to_string(),
        other => other.to_ascii_lowercase(),
    };
    let port = url.port_or_known_default()?;
    Some((url.scheme().to_string(), host, port))
}

/// Whether two urls refer to the same origin after normalization. Anything
/// unparseable matches nothing.
#[must_use]
pub fn same_origin(a: &str, b: &str) -> bool {
    match (normalize_origin(a), normalize_origin(b)) {
        (Some(left), Some(right)) => left == right,
        _ => false,
    }
}

// =============================================================================
// Periodic reaper
// =============================================================================

/// Background scanner owning the candidate state for one daemon instance.
pub struct Reaper {
    server_url: String,
    host: Arc<dyn HostApi>,
    enabled: bool,
    interval: Duration,
    tracker: Mutex<ZombieTracker>,
    started: AtomicBool,
    stopped: AtomicBool,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    self_ref: Weak<Reaper>,
}

impl Reaper {
    #[must_use]
    pub fn new(cfg: &Config, server_url: String, host: Arc<dyn HostApi>) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new_cyclic(|weak| Self {
            server_url,
            host,
            enabled: cfg.reaper_enabled && cfg.reaper_interval_ms > 0,
            interval: Duration::from_millis(cfg.reaper_interval_ms),
            tracker: Mutex::new(ZombieTracker::new(
                cfg.reaper_min_zombie_checks,
                Duration::from_millis(cfg.reaper_grace_period_ms),
            )),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            stop_tx,
            task: Mutex::new(None),
            self_ref: weak.clone(),
        })
    }

    /// Start the interval loop (plus one startup scan). No-op when disabled
    /// or already running.
    pub fn start(&self) {
        if !self.enabled
            || self.stopped.load(Ordering::SeqCst)
            || self.started.swap(true, Ordering::SeqCst)
        {
            return;
        }
        let Some(reaper) = self.self_ref.upgrade() else {
            return;
        };
        let mut stop_rx = self.stop_tx.subscribe();
        let handle = tokio::spawn(async move {
            debug!(interval_ms = reaper.interval.as_millis() as u64, "reaper started");
            reaper.scan_once().await;
            loop {
                tokio::select! {
                    () = sleep(reaper.interval) => reaper.scan_once().await,
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        *self.task.lock().unwrap() = Some(handle);
    }

    /// Stop the interval loop and run one final scan. Idempotent.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.stop_tx.send(true);
        let handle = self.task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
            // one last sweep so orphans do not outlive the daemon
            self.scan_once().await;
        }
    }

    /// Run one scan cycle. Aborts (keeping candidate state untouched) when
    /// the host's active set cannot be fetched.
    pub async fn scan_once(&self) {
        let pids = process::find_by_pattern(ATTACH_PATTERN).await;
        if pids.is_empty() {
            self.tracker.lock().unwrap().reset();
            return;
        }

        let Some(statuses) = self.host.session_statuses(&self.server_url).await else {
            warn!("active session fetch failed; skipping reaper scan");
            return;
        };
        let active: HashSet<&str> = statuses.keys().map(String::as_str).collect();

        let now = Instant::now();
        let mut present = HashSet::with_capacity(pids.len());
        let mut eligible = Vec::new();

        for pid in pids {
            present.insert(pid);
            let command = process::command_line(pid).await;
            let Some(info) = parse_attach_command(&command) else {
                continue;
            };
            if !same_origin(&info.target_url, &self.server_url) {
                // another instance's client; not ours to touch
                continue;
            }
            if info.session_id.is_empty() || active.contains(info.session_id.as_str()) {
                self.tracker.lock().unwrap().clear(pid);
                continue;
            }
            if self.tracker.lock().unwrap().observe(pid, now) {
                eligible.push((pid, info.session_id));
            }
        }

        for (pid, session_id) in eligible {
            process::terminate_with_grace(pid, KILL_GRACE).await;
            self.tracker.lock().unwrap().clear(pid);
            info!(pid, session_id = %session_id, "reaped zombie attach process");
        }

        self.tracker.lock().unwrap().retain_present(&present);
    }

    #[cfg(test)]
    fn candidate_count(&self) -> usize {
        self.tracker.lock().unwrap().len()
    }
}

// =============================================================================
// Manual global reap
// =============================================================================

/// Summary of one [`reap_all`] invocation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReapReport {
    /// Attach processes enumerated.
    pub scanned: usize,
    /// Processes killed.
    pub killed: usize,
    /// PIDs that were killed.
    pub killed_pids: Vec<u32>,
    /// Problems encountered along the way.
    pub errors: Vec<String>,
}

/// One-shot global reap used from the CLI: enumerate every attach client,
/// group them by target host, and kill those whose session is not active
/// there. Clients of unreachable hosts are killed outright. There is no
/// grace period on this path. `protected` session ids are never touched —
/// a live daemon passes its own sessions here to avoid self-termination.
pub async fn reap_all(host: &dyn HostApi, protected: &HashSet<String>) -> ReapReport {
    let mut report = ReapReport::default();
    let pids = process::find_by_pattern(ATTACH_PATTERN).await;
    report.scanned = pids.len();

    // origin key → (representative url, clients)
    let mut by_origin: HashMap<(String, String, u16), (String, Vec<(u32, String)>)> =
        HashMap::new();
    for pid in pids {
        let command = process::command_line(pid).await;
        let Some(info) = parse_attach_command(&command) else {
            continue;
        };
        if protected.contains(&info.session_id) {
            continue;
        }
        let Some(origin) = normalize_origin(&info.target_url) else {
            report
                .errors
                .push(format!("pid {pid}: unparseable target {}", info.target_url));
            continue;
        };
        by_origin
            .entry(origin)
            .or_insert_with(|| (info.target_url.clone(), Vec::new()))
            .1
            .push((pid, info.session_id));
    }

    for (target_url, clients) in by_origin.into_values() {
        let active = host.session_statuses(&target_url).await;
        if active.is_none() {
            warn!(target_url = %target_url, "host unreachable; reaping all of its attach clients");
        }
        for (pid, session_id) in clients {
            let is_active = active
                .as_ref()
                .is_some_and(|statuses| statuses.contains_key(&session_id));
            if is_active {
                continue;
            }
            if process::safe_kill(pid, process::Signal::Kill).await {
                info!(pid, session_id = %session_id, target_url = %target_url, "reaped attach process");
                report.killed += 1;
                report.killed_pids.push(pid);
            } else {
                report.errors.push(format!("failed to kill pid {pid}"));
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN_CHECKS: u32 = 3;
    const GRACE: Duration = Duration::from_secs(5);

    #[test]
    fn tracker_requires_both_gates() {
        let mut tracker = ZombieTracker::new(MIN_CHECKS, GRACE);
        let start = Instant::now();

        // two scans inside four seconds: count gate not met
        assert!(!tracker.observe(42, start));
        assert!(!tracker.observe(42, start + Duration::from_secs(4)));

        // third scan after six seconds: both gates hold
        assert!(tracker.observe(42, start + Duration::from_secs(6)));
    }

    #[test]
    fn tracker_count_alone_is_not_enough() {
        let mut tracker = ZombieTracker::new(MIN_CHECKS, GRACE);
        let start = Instant::now();
        // three rapid scans: count satisfied, wall clock not
        assert!(!tracker.observe(7, start));
        assert!(!tracker.observe(7, start + Duration::from_millis(10)));
        assert!(!tracker.observe(7, start + Duration::from_millis(20)));
        // and age alone is not enough either once cleared
        tracker.clear(7);
        assert!(!tracker.observe(7, start + Duration::from_secs(60)));
    }

    #[test]
    fn tracker_clear_and_prune() {
        let mut tracker = ZombieTracker::new(MIN_CHECKS, GRACE);
        let now = Instant::now();
        tracker.observe(1, now);
        tracker.observe(2, now);
        tracker.clear(1);
        assert_eq!(tracker.len(), 1);

        let present: HashSet<u32> = HashSet::new();
        tracker.retain_present(&present);
        assert!(tracker.is_empty());
    }

    #[test]
    fn parses_attach_command_lines() {
        let info =
            parse_attach_command("opencode attach http://localhost:4096 --session ses_z").unwrap();
        assert_eq!(info.target_url, "http://localhost:4096");
        assert_eq!(info.session_id, "ses_z");

        // flags may precede the target
        let info =
            parse_attach_command("opencode attach --session ses_a http://127.0.0.1:5000").unwrap();
        assert_eq!(info.target_url, "http://127.0.0.1:5000");
        assert_eq!(info.session_id, "ses_a");

        // no --session: empty session id, still parsed
        let info = parse_attach_command("opencode attach http://localhost:4096").unwrap();
        assert!(info.session_id.is_empty());

        assert!(parse_attach_command("opencode serve --port 4096").is_none());
        assert!(parse_attach_command("opencode attach").is_none());
    }

    #[test]
    fn origins_treat_localhost_and_loopback_as_equal() {
        assert!(same_origin("http://localhost:4096", "http://127.0.0.1:4096"));
        assert!(same_origin("localhost:4096", "http://127.0.0.1:4096"));
        assert!(same_origin(
            "http://localhost:4096/",
            "http://localhost:4096"
        ));
    }

    #[test]
    fn origins_differ_on_port_host_or_scheme() {
        // different port is a different instance, loopback alias or not
        assert!(!same_origin(
            "http://localhost:4097",
            "http://127.0.0.1:4096"
        ));
        assert!(!same_origin("http://10.0.0.5:4096", "http://127.0.0.1:4096"));
        assert!(!same_origin("https://localhost:443", "http://localhost:80"));
        assert!(!same_origin("", "http://localhost:4096"));
    }

    #[test]
    fn default_http_port_applies_when_missing() {
        assert!(same_origin("http://localhost", "http://127.0.0.1:80"));
    }

    #[tokio::test]
    async fn reaper_shutdown_is_idempotent_without_start() {
        struct NoHost;
        #[async_trait::async_trait]
        impl HostApi for NoHost {
            async fn healthy(&self, _server_url: &str) -> bool {
                false
            }
            async fn session_statuses(
                &self,
                _server_url: &str,
            ) -> Option<HashMap<String, String>> {
                None
            }
        }

        let cfg = Config::default();
        let reaper = Reaper::new(&cfg, "http://localhost:4096".to_string(), Arc::new(NoHost));
        reaper.shutdown().await;
        reaper.shutdown().await;
        assert_eq!(reaper.candidate_count(), 0);
    }
}
