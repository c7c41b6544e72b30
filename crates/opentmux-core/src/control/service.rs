//! The control service behind the socket.
//!
//! Exactly one `Init` is honored per process; before it, session events are
//! rejected, stats read zero, and shutdown is a no-op that still fires the
//! stop callback.

use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::config::{self, ConfigPatch};
use crate::metrics::Metrics;
use crate::session::{Manager, SessionEvent};

use super::protocol::{Request, Response};

/// Out-of-band stop callback fired asynchronously on every shutdown request.
pub type StopFn = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Default)]
struct ServiceState {
    manager: Option<Arc<Manager>>,
    initialized: bool,
}

/// Dispatches control requests onto the session manager.
pub struct Service {
    state: Mutex<ServiceState>,
    metrics: Arc<Metrics>,
    on_stop: Option<StopFn>,
}

impl Service {
    #[must_use]
    pub fn new(on_stop: Option<StopFn>) -> Self {
        Self {
            state: Mutex::new(ServiceState::default()),
            metrics: Arc::new(Metrics::new()),
            on_stop,
        }
    }

    /// Handle one request. Never raises; failures surface as
    /// [`Response::Error`].
    pub async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Init {
                directory,
                server_url,
                config,
            } => self.init(&directory, &server_url, config.as_ref()),
            Request::SessionCreated {
                event_type,
                id,
                parent_id,
                title,
            } => {
                self.on_session_created(SessionEvent {
                    event_type,
                    id,
                    parent_id,
                    title,
                })
                .await
            }
            Request::Shutdown { reason } => self.shutdown(reason).await,
            Request::Stats => self.stats(),
        }
    }

    fn init(&self, directory: &str, server_url: &str, patch: Option<&ConfigPatch>) -> Response {
        let mut state = self.state.lock().unwrap();
        if state.initialized {
            return Response::Error {
                message: "already initialized".to_string(),
            };
        }

        let dir = (!directory.is_empty()).then(|| Path::new(directory));
        let mut cfg = config::load_from_directory(dir);
        if let Some(patch) = patch {
            cfg = config::merge(cfg, patch);
        }

        let enabled = cfg.enabled;
        state.manager = Some(Manager::new(
            cfg,
            server_url.to_string(),
            Arc::clone(&self.metrics),
        ));
        state.initialized = true;
        info!(directory, server_url, "control service initialized");

        Response::Init {
            enabled,
            message: "initialized".to_string(),
        }
    }

    async fn on_session_created(&self, event: SessionEvent) -> Response {
        let manager = self.state.lock().unwrap().manager.clone();
        let accepted = match manager {
            Some(manager) => manager.on_session_created(event).await,
            None => false,
        };
        Response::SessionCreated { accepted }
    }

    async fn shutdown(&self, reason: String) -> Response {
        let manager = self.state.lock().unwrap().manager.take();
        if let Some(manager) = manager {
            manager.shutdown(&reason).await;
        }
        if let Some(on_stop) = &self.on_stop {
            let on_stop = Arc::clone(on_stop);
            tokio::spawn(async move {
                on_stop(reason);
            });
        }
        Response::Shutdown { ok: true }
    }

    fn stats(&self) -> Response {
        let snapshot = self.metrics.snapshot();
        Response::Stats {
            tracked_sessions: snapshot.tracked_sessions,
            pending_sessions: snapshot.pending_sessions,
            queue_depth: snapshot.queue_depth,
        }
    }
}
