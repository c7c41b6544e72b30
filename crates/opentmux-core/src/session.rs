//! Session manager: tracked sessions, the status poller, and lifecycle
//! orchestration.
//!
//! Owns the map of tracked sessions and the pending set, feeds accepted
//! events into the spawn queue, drives the poller that decides when a pane
//! should close, and re-applies the layout (debounced) when the queue
//! drains. All state mutation happens under one mutex, and the mutex is
//! never held across an RPC or subprocess call.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::host::{HostApi, HostClient};
use crate::metrics::{Metrics, Snapshot};
use crate::reaper::Reaper;
use crate::spawn_queue::{Options as QueueOptions, SpawnFn, SpawnQueue};
use crate::tmux::{self, PaneDriver, TmuxDriver};

const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Sessions older than this get closed regardless of status.
const SESSION_TIMEOUT: Duration = Duration::from_secs(600);
/// How long a session may be absent from the status map before its pane
/// closes (three poll intervals).
const SESSION_MISSING_GRACE: Duration = Duration::from_secs(6);
/// Consecutive failed status fetches before the host health probe decides
/// whether to shut the whole manager down.
const MAX_POLL_FAILURES: u32 = 5;

/// Incoming session event from the control surface.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub event_type: String,
    pub id: String,
    pub parent_id: String,
    pub title: String,
}

/// Why a tracked session's pane was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    Idle,
    MissingTooLong,
    TimedOut,
    Shutdown,
}

impl CloseReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::MissingTooLong => "missing_too_long",
            Self::TimedOut => "timeout",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug)]
struct TrackedSession {
    pane_id: String,
    #[allow(dead_code)]
    parent_id: String,
    #[allow(dead_code)]
    title: String,
    created_at: Instant,
    last_seen_at: Instant,
    missing_since: Option<Instant>,
}

#[derive(Default)]
struct ManagerState {
    sessions: HashMap<String, TrackedSession>,
    pending: HashSet<String>,
    poller: Option<JoinHandle<()>>,
    layout_timer: Option<JoinHandle<()>>,
    poll_failures: u32,
    is_shutdown: bool,
}

enum PollOutcome {
    Continue,
    Stop,
    HostUnreachable,
}

/// The coordinator. Construct with [`Manager::new`] (production wiring) or
/// [`Manager::with_parts`] (explicit driver/host, used by tests and embedding
/// callers).
pub struct Manager {
    cfg: Config,
    server_url: String,
    enabled: bool,
    driver: Arc<dyn PaneDriver>,
    host: Arc<dyn HostApi>,
    queue: Arc<SpawnQueue>,
    reaper: Arc<Reaper>,
    metrics: Arc<Metrics>,
    state: Mutex<ManagerState>,
    self_ref: Weak<Manager>,
}

impl Manager {
    /// Production wiring: real tmux driver, real host client.
    #[must_use]
    pub fn new(cfg: Config, server_url: String, metrics: Arc<Metrics>) -> Arc<Self> {
        let host: Arc<dyn HostApi> = Arc::new(HostClient::new());
        let driver: Arc<dyn PaneDriver> = Arc::new(TmuxDriver::new(
            cfg.clone(),
            server_url.clone(),
            Arc::clone(&host),
        ));
        Self::with_parts(cfg, server_url, driver, host, metrics, tmux::inside_tmux())
    }

    /// Assemble a manager around explicit pane-driver and host seams.
    pub fn with_parts(
        cfg: Config,
        server_url: String,
        driver: Arc<dyn PaneDriver>,
        host: Arc<dyn HostApi>,
        metrics: Arc<Metrics>,
        inside_multiplexer: bool,
    ) -> Arc<Self> {
        let enabled = cfg.enabled && inside_multiplexer;
        let manager = Arc::new_cyclic(|weak: &Weak<Manager>| {
            let spawn_driver = Arc::clone(&driver);
            let spawn_fn: SpawnFn = Arc::new(move |request| {
                let driver = Arc::clone(&spawn_driver);
                Box::pin(async move { driver.spawn_pane(&request.session_id, &request.title).await })
            });

            let update_metrics = Arc::clone(&metrics);
            let drain_target = weak.clone();
            let queue = SpawnQueue::new(QueueOptions {
                spawn_fn,
                spawn_delay: Duration::from_millis(cfg.spawn_delay_ms),
                max_retries: cfg.max_retry_attempts,
                stale_threshold: Duration::ZERO,
                on_queue_update: Some(Arc::new(move |pending| {
                    update_metrics.set_queue_depth(pending as u64);
                })),
                on_queue_drained: Some(Arc::new(move || {
                    if let Some(manager) = drain_target.upgrade() {
                        manager.schedule_layout();
                    }
                })),
            });

            let reaper = Reaper::new(&cfg, server_url.clone(), Arc::clone(&host));

            Manager {
                cfg,
                server_url,
                enabled,
                driver,
                host,
                queue,
                reaper,
                metrics,
                state: Mutex::new(ManagerState::default()),
                self_ref: weak.clone(),
            }
        });
        if manager.enabled {
            manager.reaper.start();
        }
        manager
    }

    /// Handle a `session.created` event. Accepts only child sessions while
    /// enabled inside tmux; duplicates and in-flight ids are rejected. On
    /// spawn success the session is tracked and the poller ensured.
    pub async fn on_session_created(&self, event: SessionEvent) -> bool {
        if !self.enabled
            || event.event_type != "session.created"
            || event.id.is_empty()
            || event.parent_id.is_empty()
        {
            return false;
        }

        {
            let mut state = self.state.lock().unwrap();
            if state.is_shutdown
                || state.sessions.contains_key(&event.id)
                || state.pending.contains(&event.id)
            {
                return false;
            }
            state.pending.insert(event.id.clone());
            self.metrics.set_pending_sessions(state.pending.len() as u64);
        }

        let title = if event.title.is_empty() {
            "Subagent".to_string()
        } else {
            event.title.clone()
        };
        let result = self.queue.enqueue(&event.id, &title).await;

        let mut state = self.state.lock().unwrap();
        state.pending.remove(&event.id);
        self.metrics.set_pending_sessions(state.pending.len() as u64);

        if result.success && !result.pane_id.is_empty() && !state.is_shutdown {
            let now = Instant::now();
            state.sessions.insert(
                event.id.clone(),
                TrackedSession {
                    pane_id: result.pane_id.clone(),
                    parent_id: event.parent_id.clone(),
                    title,
                    created_at: now,
                    last_seen_at: now,
                    missing_since: None,
                },
            );
            self.metrics.set_tracked_sessions(state.sessions.len() as u64);
            self.ensure_poller(&mut state);
        }

        result.success
    }

    fn ensure_poller(&self, state: &mut ManagerState) {
        if state.poller.is_some() {
            return;
        }
        let weak = self.self_ref.clone();
        state.poller = Some(tokio::spawn(async move {
            let mut ticker = interval(POLL_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // discard the immediate first tick
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    return;
                };
                match manager.poll_once().await {
                    PollOutcome::Continue => {}
                    PollOutcome::Stop => return,
                    PollOutcome::HostUnreachable => {
                        tokio::spawn(async move {
                            manager.shutdown("server-unreachable").await;
                        });
                        return;
                    }
                }
            }
        }));
    }

    async fn poll_once(&self) -> PollOutcome {
        {
            let mut state = self.state.lock().unwrap();
            if state.is_shutdown {
                return PollOutcome::Stop;
            }
            if state.sessions.is_empty() {
                state.poller = None;
                return PollOutcome::Stop;
            }
        }

        let statuses = match self.host.session_statuses(&self.server_url).await {
            Some(statuses) => {
                self.state.lock().unwrap().poll_failures = 0;
                statuses
            }
            None => {
                let failures = {
                    let mut state = self.state.lock().unwrap();
                    state.poll_failures += 1;
                    state.poll_failures
                };
                debug!(failures, "session status poll failed; skipping tick");
                if failures >= MAX_POLL_FAILURES {
                    if !self.host.healthy(&self.server_url).await {
                        warn!("host unreachable after sustained poll failures");
                        return PollOutcome::HostUnreachable;
                    }
                    self.state.lock().unwrap().poll_failures = 0;
                }
                return PollOutcome::Continue;
            }
        };

        let now = Instant::now();
        let mut to_close: Vec<(String, CloseReason)> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            for (session_id, tracked) in &mut state.sessions {
                let status = statuses.get(session_id);
                match status {
                    Some(_) => {
                        tracked.last_seen_at = now;
                        tracked.missing_since = None;
                    }
                    None => {
                        if tracked.missing_since.is_none() {
                            tracked.missing_since = Some(now);
                        }
                    }
                }

                let is_idle = status.is_some_and(|kind| kind == "idle");
                let missing_too_long = tracked.missing_since.is_some_and(|since| {
                    now.saturating_duration_since(since) >= SESSION_MISSING_GRACE
                });
                let timed_out =
                    now.saturating_duration_since(tracked.created_at) >= SESSION_TIMEOUT;

                // idle wins over missing_too_long when both apply
                let reason = if is_idle {
                    Some(CloseReason::Idle)
                } else if missing_too_long {
                    Some(CloseReason::MissingTooLong)
                } else if timed_out {
                    Some(CloseReason::TimedOut)
                } else {
                    None
                };
                if let Some(reason) = reason {
                    to_close.push((session_id.clone(), reason));
                }
            }
        }

        for (session_id, reason) in to_close {
            self.close_session(&session_id, reason).await;
        }

        let mut state = self.state.lock().unwrap();
        if state.sessions.is_empty() {
            state.poller = None;
            return PollOutcome::Stop;
        }
        PollOutcome::Continue
    }

    async fn close_session(&self, session_id: &str, reason: CloseReason) {
        let tracked = {
            let mut state = self.state.lock().unwrap();
            let Some(tracked) = state.sessions.remove(session_id) else {
                return;
            };
            self.metrics.set_tracked_sessions(state.sessions.len() as u64);
            tracked
        };
        info!(
            session_id,
            pane_id = %tracked.pane_id,
            reason = reason.as_str(),
            "closing session pane"
        );
        // even a failed kill-pane leaves the entry removed; the pane is gone
        // or beyond our reach either way
        let _ = self.driver.close_pane(&tracked.pane_id).await;
    }

    /// Queue-drained callback target: (re)arm the one-shot layout timer so a
    /// burst of spawns produces a single layout pass.
    fn schedule_layout(&self) {
        let mut state = self.state.lock().unwrap();
        if state.is_shutdown {
            return;
        }
        if let Some(timer) = state.layout_timer.take() {
            timer.abort();
        }
        let debounce = Duration::from_millis(self.cfg.layout_debounce_ms.max(1));
        let driver = Arc::clone(&self.driver);
        state.layout_timer = Some(tokio::spawn(async move {
            sleep(debounce).await;
            driver.apply_layout().await;
        }));
    }

    /// Tear everything down: poller, layout timer, queue, reaper (final scan
    /// included), then the remaining panes. Idempotent.
    pub async fn shutdown(&self, reason: &str) {
        {
            let mut state = self.state.lock().unwrap();
            if state.is_shutdown {
                return;
            }
            state.is_shutdown = true;
            if let Some(poller) = state.poller.take() {
                poller.abort();
            }
            if let Some(timer) = state.layout_timer.take() {
                timer.abort();
            }
        }
        info!(reason, "session manager shutting down");

        self.queue.shutdown();
        self.reaper.shutdown().await;

        let session_ids: Vec<String> = {
            let state = self.state.lock().unwrap();
            state.sessions.keys().cloned().collect()
        };
        for session_id in session_ids {
            self.close_session(&session_id, CloseReason::Shutdown).await;
        }
    }

    /// Current gauge values.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.metrics.snapshot()
    }

    /// Session ids currently tracked (panes open).
    #[must_use]
    pub fn tracked_session_ids(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.sessions.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_reasons_render_stable_labels() {
        assert_eq!(CloseReason::Idle.as_str(), "idle");
        assert_eq!(CloseReason::MissingTooLong.as_str(), "missing_too_long");
        assert_eq!(CloseReason::TimedOut.as_str(), "timeout");
        assert_eq!(CloseReason::Shutdown.as_str(), "shutdown");
    }
}
