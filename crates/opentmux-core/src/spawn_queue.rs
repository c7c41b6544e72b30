//! Ordered, deduped, retrying spawn scheduler with drain signal.
//!
//! tmux is a single-writer resource: concurrent `split-window` invocations
//! interleave layout state unpredictably. The queue therefore drains through
//! exactly one processor task, spacing consecutive spawns by a configurable
//! gap and retrying failed attempts with exponential backoff.
//!
//! Duplicate enqueues coalesce: a second caller for a session id already
//! queued or in flight attaches its waiter to the existing item, so at most
//! one spawn attempt is ever in flight per session id and all callers observe
//! the same result.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::oneshot;
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

const BASE_BACKOFF_MS: u64 = 250;
const DEFAULT_SPAWN_DELAY: Duration = Duration::from_millis(300);
const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(30);

/// Inputs handed to the spawn function for one attempt.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub session_id: String,
    pub title: String,
    /// Milliseconds since the Unix epoch at enqueue time.
    pub enqueued_at_ms: u64,
    /// 0-based attempt index.
    pub retry_count: u32,
}

/// Outcome of a spawn attempt, shared verbatim with every waiter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnResult {
    pub success: bool,
    pub pane_id: String,
}

impl SpawnResult {
    #[must_use]
    pub fn failure() -> Self {
        Self::default()
    }
}

/// Boxed async spawn function driven by the processor.
pub type SpawnFn =
    Arc<dyn Fn(SpawnRequest) -> Pin<Box<dyn Future<Output = SpawnResult> + Send>> + Send + Sync>;

/// Invoked with the pending count whenever items or the in-flight slot change.
pub type QueueUpdateFn = Arc<dyn Fn(usize) + Send + Sync>;

/// Invoked after the processor observes an empty queue.
pub type QueueDrainedFn = Arc<dyn Fn() + Send + Sync>;

/// Construction options. Zero durations fall back to the defaults.
pub struct Options {
    pub spawn_fn: SpawnFn,
    pub spawn_delay: Duration,
    pub max_retries: u32,
    pub stale_threshold: Duration,
    pub on_queue_update: Option<QueueUpdateFn>,
    pub on_queue_drained: Option<QueueDrainedFn>,
}

struct QueueItem {
    title: String,
    enqueued_at: Instant,
    enqueued_at_ms: u64,
    waiters: Vec<oneshot::Sender<SpawnResult>>,
}

#[derive(Default)]
struct State {
    /// FIFO of queued session ids, excluding the in-flight one.
    order: VecDeque<String>,
    /// Dedup index over every live item, including the in-flight one.
    items: HashMap<String, QueueItem>,
    in_flight: Option<String>,
    is_processing: bool,
    is_shutdown: bool,
}

impl State {
    fn pending_count(&self) -> usize {
        self.order.len() + usize::from(self.in_flight.is_some())
    }
}

/// The spawn queue. Construct with [`SpawnQueue::new`]; share via `Arc`.
pub struct SpawnQueue {
    spawn_fn: SpawnFn,
    spawn_delay: Duration,
    max_retries: u32,
    stale_threshold: Duration,
    on_queue_update: Option<QueueUpdateFn>,
    on_queue_drained: Option<QueueDrainedFn>,
    state: Mutex<State>,
    self_ref: Weak<SpawnQueue>,
}

enum Dequeued {
    Stop { pending: usize, drained: bool },
    Item { session_id: String, pending: usize },
}

impl SpawnQueue {
    #[must_use]
    pub fn new(options: Options) -> Arc<Self> {
        let spawn_delay = if options.spawn_delay.is_zero() {
            DEFAULT_SPAWN_DELAY
        } else {
            options.spawn_delay
        };
        let stale_threshold = if options.stale_threshold.is_zero() {
            DEFAULT_STALE_THRESHOLD
        } else {
            options.stale_threshold
        };
        Arc::new_cyclic(|weak| Self {
            spawn_fn: options.spawn_fn,
            spawn_delay,
            max_retries: options.max_retries,
            stale_threshold,
            on_queue_update: options.on_queue_update,
            on_queue_drained: options.on_queue_drained,
            state: Mutex::new(State::default()),
            self_ref: weak.clone(),
        })
    }

    /// Block until the item for `session_id` is processed, the queue shuts
    /// down, or this future is dropped (the spawn still completes for any
    /// remaining waiters; cancellation never crosses callers).
    pub async fn enqueue(&self, session_id: &str, title: &str) -> SpawnResult {
        let (tx, rx) = oneshot::channel();
        let joined_existing = {
            let mut state = self.state.lock().unwrap();
            if state.is_shutdown {
                return SpawnResult::failure();
            }
            if let Some(existing) = state.items.get_mut(session_id) {
                existing.waiters.push(tx);
                None
            } else {
                state.items.insert(
                    session_id.to_string(),
                    QueueItem {
                        title: title.to_string(),
                        enqueued_at: Instant::now(),
                        enqueued_at_ms: unix_millis(),
                        waiters: vec![tx],
                    },
                );
                state.order.push_back(session_id.to_string());
                Some(state.pending_count())
            }
        };

        let Some(pending) = joined_existing else {
            return rx.await.unwrap_or_else(|_| SpawnResult::failure());
        };
        self.notify_update(pending);
        self.ensure_processor();
        rx.await.unwrap_or_else(|_| SpawnResult::failure())
    }

    /// Queued items plus one if something is in flight.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().pending_count()
    }

    /// Resolve every waiter as failure and refuse further enqueues.
    /// Idempotent.
    pub fn shutdown(&self) {
        let waiters = {
            let mut state = self.state.lock().unwrap();
            if state.is_shutdown {
                return;
            }
            state.is_shutdown = true;
            state.order.clear();
            state.in_flight = None;
            state
                .items
                .drain()
                .flat_map(|(_, item)| item.waiters)
                .collect::<Vec<_>>()
        };
        for waiter in waiters {
            let _ = waiter.send(SpawnResult::failure());
        }
        self.notify_update(0);
    }

    fn ensure_processor(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.is_processing || state.is_shutdown {
                return;
            }
            state.is_processing = true;
        }
        if let Some(queue) = self.self_ref.upgrade() {
            tokio::spawn(queue.process_loop());
        }
    }

    async fn process_loop(self: Arc<Self>) {
        loop {
            let dequeued = {
                let mut state = self.state.lock().unwrap();
                if state.is_shutdown || state.order.is_empty() {
                    state.is_processing = false;
                    Dequeued::Stop {
                        pending: state.pending_count(),
                        drained: state.order.is_empty() && state.in_flight.is_none(),
                    }
                } else {
                    let session_id = state.order.pop_front().expect("non-empty order");
                    state.in_flight = Some(session_id.clone());
                    Dequeued::Item {
                        session_id,
                        pending: state.pending_count(),
                    }
                }
            };

            let (session_id, pending) = match dequeued {
                Dequeued::Stop { pending, drained } => {
                    self.notify_update(pending);
                    if drained {
                        self.notify_drained();
                    }
                    return;
                }
                Dequeued::Item {
                    session_id,
                    pending,
                } => (session_id, pending),
            };
            self.notify_update(pending);

            let item_view = {
                let state = self.state.lock().unwrap();
                state
                    .items
                    .get(&session_id)
                    .map(|item| (item.title.clone(), item.enqueued_at, item.enqueued_at_ms))
            };
            let Some((title, enqueued_at, enqueued_at_ms)) = item_view else {
                // shutdown raced the dequeue; its waiters are already resolved
                continue;
            };

            let result = if enqueued_at.elapsed() > self.stale_threshold {
                debug!(session_id = %session_id, "dropping stale spawn request");
                SpawnResult::failure()
            } else {
                self.process_item(&session_id, &title, enqueued_at_ms).await
            };

            let (waiters, has_next) = {
                let mut state = self.state.lock().unwrap();
                if state.in_flight.as_deref() == Some(session_id.as_str()) {
                    state.in_flight = None;
                }
                let waiters = state
                    .items
                    .remove(&session_id)
                    .map(|item| item.waiters)
                    .unwrap_or_default();
                (waiters, !state.order.is_empty() && !state.is_shutdown)
            };
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }

            // throughput-shaping gap between consecutive spawns; the first
            // dequeue after idle is never delayed
            if has_next {
                sleep(self.spawn_delay).await;
            }
        }
    }

    async fn process_item(
        &self,
        session_id: &str,
        title: &str,
        enqueued_at_ms: u64,
    ) -> SpawnResult {
        let mut result = SpawnResult::failure();
        for attempt in 0..=self.max_retries {
            if self.state.lock().unwrap().is_shutdown {
                return SpawnResult::failure();
            }
            let request = SpawnRequest {
                session_id: session_id.to_string(),
                title: title.to_string(),
                enqueued_at_ms,
                retry_count: attempt,
            };
            result = (self.spawn_fn)(request).await;
            if result.success {
                return result;
            }
            if attempt < self.max_retries {
                let backoff = BASE_BACKOFF_MS.saturating_mul(1 << attempt.min(16));
                sleep(Duration::from_millis(backoff)).await;
            }
        }
        result
    }

    fn notify_update(&self, pending: usize) {
        if let Some(callback) = &self.on_queue_update {
            callback(pending);
        }
    }

    fn notify_drained(&self) {
        if let Some(callback) = &self.on_queue_drained {
            callback();
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
