//! End-to-end session manager scenarios against fake pane-driver and host
//! seams: accept/reject filtering, spawn bookkeeping, the poller's close
//! decisions, and shutdown ordering.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use opentmux_core::config::Config;
use opentmux_core::host::HostApi;
use opentmux_core::metrics::Metrics;
use opentmux_core::session::{Manager, SessionEvent};
use opentmux_core::spawn_queue::SpawnResult;
use opentmux_core::tmux::PaneDriver;

#[derive(Default)]
struct FakeDriver {
    spawn_calls: AtomicU32,
    /// Spawn attempts that fail before the first success.
    fail_first: AtomicU32,
    closed: Mutex<Vec<String>>,
    layouts: AtomicU32,
    /// When set, spawns block until notified.
    gate: Option<Arc<Notify>>,
}

impl FakeDriver {
    fn closed_panes(&self) -> Vec<String> {
        self.closed.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaneDriver for FakeDriver {
    async fn spawn_pane(&self, session_id: &str, _title: &str) -> SpawnResult {
        let call = self.spawn_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.fail_first.load(Ordering::SeqCst) >= call {
            return SpawnResult::failure();
        }
        SpawnResult {
            success: true,
            pane_id: format!("%{session_id}"),
        }
    }

    async fn close_pane(&self, pane_id: &str) -> bool {
        self.closed.lock().unwrap().push(pane_id.to_string());
        true
    }

    async fn apply_layout(&self) {
        self.layouts.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakeHost {
    healthy: std::sync::atomic::AtomicBool,
    statuses: Mutex<Option<HashMap<String, String>>>,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self {
            healthy: std::sync::atomic::AtomicBool::new(true),
            statuses: Mutex::new(None),
        }
    }
}

impl FakeHost {
    fn set_statuses(&self, entries: &[(&str, &str)]) {
        let map = entries
            .iter()
            .map(|(id, kind)| ((*id).to_string(), (*kind).to_string()))
            .collect();
        *self.statuses.lock().unwrap() = Some(map);
    }
}

#[async_trait]
impl HostApi for FakeHost {
    async fn healthy(&self, _server_url: &str) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn session_statuses(&self, _server_url: &str) -> Option<HashMap<String, String>> {
        self.statuses.lock().unwrap().clone()
    }
}

fn test_config() -> Config {
    Config {
        reaper_enabled: false,
        ..Config::default()
    }
    .normalized()
}

fn build_manager(driver: Arc<FakeDriver>, host: Arc<FakeHost>) -> Arc<Manager> {
    Manager::with_parts(
        test_config(),
        "http://localhost:4096".to_string(),
        driver,
        host,
        Arc::new(Metrics::new()),
        true,
    )
}

fn child_event(id: &str) -> SessionEvent {
    SessionEvent {
        event_type: "session.created".to_string(),
        id: id.to_string(),
        parent_id: "ses_parent".to_string(),
        title: "Research".to_string(),
    }
}

#[tokio::test(start_paused = true)]
async fn happy_path_tracks_session_and_starts_poller() {
    let driver = Arc::new(FakeDriver::default());
    let host = Arc::new(FakeHost::default());
    host.set_statuses(&[("ses_1", "busy")]);
    let manager = build_manager(driver.clone(), host.clone());

    assert!(manager.on_session_created(child_event("ses_1")).await);
    assert_eq!(driver.spawn_calls.load(Ordering::SeqCst), 1);

    let snapshot = manager.snapshot();
    assert_eq!(snapshot.tracked_sessions, 1);
    assert_eq!(snapshot.pending_sessions, 0);
    assert_eq!(manager.tracked_session_ids(), vec!["ses_1".to_string()]);

    // the poller runs and leaves the busy session alone
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(driver.closed_panes().is_empty());
    assert_eq!(manager.snapshot().tracked_sessions, 1);

    manager.shutdown("test").await;
}

#[tokio::test(start_paused = true)]
async fn rejects_non_child_and_malformed_events() {
    let driver = Arc::new(FakeDriver::default());
    let host = Arc::new(FakeHost::default());
    let manager = build_manager(driver.clone(), host);

    let mut no_parent = child_event("ses_1");
    no_parent.parent_id = String::new();
    assert!(!manager.on_session_created(no_parent).await);

    let mut wrong_type = child_event("ses_1");
    wrong_type.event_type = "session.updated".to_string();
    assert!(!manager.on_session_created(wrong_type).await);

    let mut no_id = child_event("");
    no_id.id = String::new();
    assert!(!manager.on_session_created(no_id).await);

    assert_eq!(driver.spawn_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn disabled_manager_rejects_everything() {
    let driver = Arc::new(FakeDriver::default());
    let host = Arc::new(FakeHost::default());
    let manager = Manager::with_parts(
        Config {
            enabled: false,
            ..test_config()
        },
        "http://localhost:4096".to_string(),
        driver.clone(),
        host,
        Arc::new(Metrics::new()),
        true,
    );
    assert!(!manager.on_session_created(child_event("ses_1")).await);
    assert_eq!(driver.spawn_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn duplicate_events_are_rejected_while_pending_and_while_tracked() {
    let gate = Arc::new(Notify::new());
    let driver = Arc::new(FakeDriver {
        gate: Some(gate.clone()),
        ..FakeDriver::default()
    });
    let host = Arc::new(FakeHost::default());
    host.set_statuses(&[("ses_1", "busy")]);
    let manager = build_manager(driver.clone(), host);

    let first = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.on_session_created(child_event("ses_1")).await })
    };
    // wait until the spawn is actually in flight
    while driver.spawn_calls.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }

    // still pending: duplicate is rejected without another spawn
    assert!(!manager.on_session_created(child_event("ses_1")).await);

    gate.notify_one();
    assert!(first.await.unwrap());
    assert_eq!(driver.spawn_calls.load(Ordering::SeqCst), 1);

    // now tracked: still rejected
    assert!(!manager.on_session_created(child_event("ses_1")).await);
    assert_eq!(driver.spawn_calls.load(Ordering::SeqCst), 1);

    manager.shutdown("test").await;
}

#[tokio::test(start_paused = true)]
async fn failed_spawn_is_not_tracked() {
    let driver = Arc::new(FakeDriver::default());
    driver.fail_first.store(10, Ordering::SeqCst);
    let host = Arc::new(FakeHost::default());
    let manager = build_manager(driver.clone(), host);

    assert!(!manager.on_session_created(child_event("ses_1")).await);
    // default config retries twice on top of the first attempt
    assert_eq!(driver.spawn_calls.load(Ordering::SeqCst), 3);
    assert_eq!(manager.snapshot().tracked_sessions, 0);
    assert!(manager.tracked_session_ids().is_empty());
}

#[tokio::test(start_paused = true)]
async fn poller_closes_idle_session_and_stops() {
    let driver = Arc::new(FakeDriver::default());
    let host = Arc::new(FakeHost::default());
    host.set_statuses(&[("ses_1", "busy")]);
    let manager = build_manager(driver.clone(), host.clone());

    assert!(manager.on_session_created(child_event("ses_1")).await);
    assert_eq!(manager.snapshot().tracked_sessions, 1);

    host.set_statuses(&[("ses_1", "idle")]);
    // two poll periods are more than enough
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(driver.closed_panes(), vec!["%ses_1".to_string()]);
    assert_eq!(manager.snapshot().tracked_sessions, 0);

    // poller stopped; nothing further happens
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(driver.closed_panes().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn poller_closes_session_missing_too_long() {
    let driver = Arc::new(FakeDriver::default());
    let host = Arc::new(FakeHost::default());
    host.set_statuses(&[("ses_1", "busy")]);
    let manager = build_manager(driver.clone(), host.clone());

    assert!(manager.on_session_created(child_event("ses_1")).await);

    // session vanishes from the status map but the host stays up
    host.set_statuses(&[]);
    // grace is three poll periods; give it five
    tokio::time::sleep(Duration::from_secs(12)).await;

    assert_eq!(driver.closed_panes(), vec!["%ses_1".to_string()]);
    assert_eq!(manager.snapshot().tracked_sessions, 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_remaining_panes_once() {
    let driver = Arc::new(FakeDriver::default());
    let host = Arc::new(FakeHost::default());
    host.set_statuses(&[("ses_1", "busy"), ("ses_2", "busy")]);
    let manager = build_manager(driver.clone(), host);

    assert!(manager.on_session_created(child_event("ses_1")).await);
    assert!(manager.on_session_created(child_event("ses_2")).await);
    assert_eq!(manager.snapshot().tracked_sessions, 2);

    manager.shutdown("test").await;
    let mut closed = driver.closed_panes();
    closed.sort();
    assert_eq!(closed, vec!["%ses_1".to_string(), "%ses_2".to_string()]);
    assert_eq!(manager.snapshot().tracked_sessions, 0);

    // idempotent: nothing closes twice
    manager.shutdown("again").await;
    assert_eq!(driver.closed_panes().len(), 2);

    // and no further events are accepted
    assert!(!manager.on_session_created(child_event("ses_3")).await);
}

#[tokio::test(start_paused = true)]
async fn poll_failures_with_healthy_host_are_transient() {
    let driver = Arc::new(FakeDriver::default());
    let host = Arc::new(FakeHost::default());
    host.set_statuses(&[("ses_1", "busy")]);
    let manager = build_manager(driver.clone(), host.clone());

    assert!(manager.on_session_created(child_event("ses_1")).await);

    // status fetches fail but the health probe still answers, so the outage
    // is treated as transient and panes stay open
    *host.statuses.lock().unwrap() = None;
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(manager.snapshot().tracked_sessions, 1);
    assert!(driver.closed_panes().is_empty());

    manager.shutdown("test").await;
}

#[tokio::test(start_paused = true)]
async fn unreachable_host_triggers_full_shutdown() {
    let driver = Arc::new(FakeDriver::default());
    let host = Arc::new(FakeHost::default());
    host.set_statuses(&[("ses_1", "busy")]);
    let manager = build_manager(driver.clone(), host.clone());

    assert!(manager.on_session_created(child_event("ses_1")).await);

    // the host vanishes: fetches fail and the health probe fails too
    *host.statuses.lock().unwrap() = None;
    host.healthy.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(manager.snapshot().tracked_sessions, 0);
    assert_eq!(driver.closed_panes(), vec!["%ses_1".to_string()]);

    // repeat shutdowns stay no-ops
    manager.shutdown("again").await;
    assert_eq!(driver.closed_panes().len(), 1);
}
