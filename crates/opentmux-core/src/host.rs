//! Host endpoint client.
//!
//! The daemon consumes exactly two opencode endpoints: `GET /health` (any
//! 2xx means healthy) and `GET /session/status` (the active session map).
//! Both the poller and the reaper read session status through this one
//! module, so the two paths always agree on the payload shape.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::sleep;
use tracing::debug;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);
const STATUS_TIMEOUT: Duration = Duration::from_secs(2);
const HEALTH_ATTEMPTS: u32 = 2;
const HEALTH_RETRY_PAUSE: Duration = Duration::from_millis(250);

/// Read access to the host endpoints, fronted by a trait so the session
/// manager and reaper can be exercised without a live host.
#[async_trait]
pub trait HostApi: Send + Sync {
    /// Whether `GET <server_url>/health` answers 2xx.
    async fn healthy(&self, server_url: &str) -> bool;

    /// Session id → status type, or `None` when the fetch failed (non-2xx,
    /// parse error, or timeout). Callers must treat `None` as "unknown",
    /// never as "no sessions".
    async fn session_statuses(&self, server_url: &str) -> Option<HashMap<String, String>>;
}

/// Production [`HostApi`] backed by an HTTP client.
///
/// Positive health results are cached per url; a host that was up once is
/// assumed up for the rest of this process's life (the poller catches real
/// outages separately).
pub struct HostClient {
    client: reqwest::Client,
    healthy_urls: Mutex<HashSet<String>>,
}

impl HostClient {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            healthy_urls: Mutex::new(HashSet::new()),
        }
    }
}

impl Default for HostClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostApi for HostClient {
    async fn healthy(&self, server_url: &str) -> bool {
        if self.healthy_urls.lock().unwrap().contains(server_url) {
            return true;
        }
        let url = format!("{}/health", server_url.trim_end_matches('/'));
        for attempt in 0..HEALTH_ATTEMPTS {
            if attempt > 0 {
                sleep(HEALTH_RETRY_PAUSE).await;
            }
            match self.client.get(&url).timeout(HEALTH_TIMEOUT).send().await {
                Ok(resp) if resp.status().is_success() => {
                    self.healthy_urls
                        .lock()
                        .unwrap()
                        .insert(server_url.to_string());
                    return true;
                }
                Ok(resp) => {
                    debug!(url = %url, status = %resp.status(), "health probe rejected");
                }
                Err(err) => {
                    debug!(url = %url, error = %err, "health probe failed");
                }
            }
        }
        false
    }

    async fn session_statuses(&self, server_url: &str) -> Option<HashMap<String, String>> {
        let url = format!("{}/session/status", server_url.trim_end_matches('/'));
        let resp = match self.client.get(&url).timeout(STATUS_TIMEOUT).send().await {
            Ok(resp) => resp,
            Err(err) => {
                debug!(url = %url, error = %err, "session status fetch failed");
                return None;
            }
        };
        if !resp.status().is_success() {
            debug!(url = %url, status = %resp.status(), "session status fetch rejected");
            return None;
        }
        let payload: Value = resp.json().await.ok()?;
        Some(parse_session_statuses(&payload))
    }
}

/// Parse the `/session/status` payload into session id → status type.
///
/// The primary shape nests sessions under `data`; some host builds flatten
/// the map to the top level, in which case keys that look like session ids
/// are accepted. Entries without a `type` map to an empty string.
pub(crate) fn parse_session_statuses(payload: &Value) -> HashMap<String, String> {
    let mut statuses = HashMap::new();

    if let Some(data) = payload.get("data").and_then(Value::as_object) {
        for (id, entry) in data {
            statuses.insert(id.clone(), status_type(entry));
        }
        return statuses;
    }

    if let Some(top) = payload.as_object() {
        for (key, entry) in top {
            if key.starts_with("ses_") || key.starts_with("session_") {
                statuses.insert(key.clone(), status_type(entry));
            }
        }
    }
    statuses
}

fn status_type(entry: &Value) -> String {
    entry
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_data_map() {
        let payload = json!({
            "data": {
                "ses_1": { "type": "idle" },
                "ses_2": { "type": "busy" },
            }
        });
        let statuses = parse_session_statuses(&payload);
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses["ses_1"], "idle");
        assert_eq!(statuses["ses_2"], "busy");
    }

    #[test]
    fn falls_back_to_top_level_session_keys() {
        let payload = json!({
            "ses_abc": { "type": "idle" },
            "session_def": {},
            "unrelated": { "type": "idle" },
        });
        let statuses = parse_session_statuses(&payload);
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses["ses_abc"], "idle");
        assert_eq!(statuses["session_def"], "");
        assert!(!statuses.contains_key("unrelated"));
    }

    #[test]
    fn empty_data_yields_empty_map() {
        let statuses = parse_session_statuses(&json!({ "data": {} }));
        assert!(statuses.is_empty());
    }

    #[test]
    fn non_object_payload_yields_empty_map() {
        assert!(parse_session_statuses(&json!([1, 2, 3])).is_empty());
        assert!(parse_session_statuses(&json!("nope")).is_empty());
    }
}
