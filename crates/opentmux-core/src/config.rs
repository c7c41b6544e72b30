//! Configuration for opentmux.
//!
//! Tunables are loaded once at init, snapped into their declared ranges by
//! [`Config::normalize`], and frozen; callers read, never mutate. Unknown
//! keys in config files are ignored, and parse failures fall back to the
//! defaults so a broken file can never keep the daemon from starting.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Layout names accepted by `tmux select-layout`.
pub const LAYOUTS: [&str; 5] = [
    "main-horizontal",
    "main-vertical",
    "tiled",
    "even-horizontal",
    "even-vertical",
];

/// Process-scoped tunables.
///
/// Every numeric field has a declared range; [`Config::normalize`] replaces
/// out-of-range values with the default rather than erroring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Master switch; when false every spawn is refused.
    pub enabled: bool,
    /// Base port the launcher hands to the host (affects the constructed
    /// server URL only).
    pub port: u16,
    /// tmux layout applied after pane churn.
    pub layout: String,
    /// Main pane size as a percentage, 20–80.
    pub main_pane_size: u32,
    /// Whether finished sessions get their pane closed automatically
    /// (consumed by the plugin shim).
    pub auto_close: bool,
    /// Gap between consecutive pane spawns, 50–2000 ms.
    pub spawn_delay_ms: u64,
    /// Retries after a failed spawn attempt, 0–5.
    pub max_retry_attempts: u32,
    /// Debounce for layout re-application after queue drain, 50–1000 ms.
    pub layout_debounce_ms: u64,
    /// Visual cap used by layout sizing, 1–10.
    pub max_agents_per_column: u32,
    /// Whether the zombie reaper runs at all.
    pub reaper_enabled: bool,
    /// Reaper scan interval in milliseconds.
    pub reaper_interval_ms: u64,
    /// Consecutive scans a pid must look dead before it may be killed.
    pub reaper_min_zombie_checks: u32,
    /// Minimum wall-clock age of a zombie candidate before it may be killed.
    pub reaper_grace_period_ms: u64,
    /// Whether the launcher may recycle the oldest host port when none are
    /// free.
    pub rotate_port: bool,
    /// Size of the port range the launcher probes, 1–100.
    pub max_ports: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 4096,
            layout: "main-vertical".to_string(),
            main_pane_size: 60,
            auto_close: true,
            spawn_delay_ms: 300,
            max_retry_attempts: 2,
            layout_debounce_ms: 150,
            max_agents_per_column: 3,
            reaper_enabled: true,
            reaper_interval_ms: 30_000,
            reaper_min_zombie_checks: 3,
            reaper_grace_period_ms: 5_000,
            rotate_port: false,
            max_ports: 10,
        }
    }
}

impl Config {
    /// Snap every field into its declared range, substituting the default
    /// for missing or out-of-range values.
    pub fn normalize(&mut self) {
        let defaults = Config::default();
        if self.port == 0 {
            self.port = defaults.port;
        }
        if self.layout.is_empty() {
            self.layout = defaults.layout.clone();
        }
        if !(20..=80).contains(&self.main_pane_size) {
            self.main_pane_size = defaults.main_pane_size;
        }
        if !(50..=2000).contains(&self.spawn_delay_ms) {
            self.spawn_delay_ms = defaults.spawn_delay_ms;
        }
        if self.max_retry_attempts > 5 {
            self.max_retry_attempts = defaults.max_retry_attempts;
        }
        if !(50..=1000).contains(&self.layout_debounce_ms) {
            self.layout_debounce_ms = defaults.layout_debounce_ms;
        }
        if !(1..=10).contains(&self.max_agents_per_column) {
            self.max_agents_per_column = defaults.max_agents_per_column;
        }
        if !(1..=100).contains(&self.max_ports) {
            self.max_ports = defaults.max_ports;
        }
    }

    /// [`Config::normalize`], by value.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.normalize();
        self
    }

    /// Reject configs that survived normalization in an unusable state.
    pub fn validate(&self) -> Result<()> {
        if self.layout.is_empty() {
            return Err(Error::InvalidConfig("layout is required".to_string()));
        }
        Ok(())
    }
}

/// Partial override applied on top of a loaded [`Config`].
///
/// Only fields that are present take effect; the merged result is
/// re-normalized.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigPatch {
    pub enabled: Option<bool>,
    pub port: Option<u16>,
    pub layout: Option<String>,
    pub main_pane_size: Option<u32>,
    pub auto_close: Option<bool>,
    pub spawn_delay_ms: Option<u64>,
    pub max_retry_attempts: Option<u32>,
    pub layout_debounce_ms: Option<u64>,
    pub max_agents_per_column: Option<u32>,
    pub reaper_enabled: Option<bool>,
    pub reaper_interval_ms: Option<u64>,
    pub reaper_min_zombie_checks: Option<u32>,
    pub reaper_grace_period_ms: Option<u64>,
    pub rotate_port: Option<bool>,
    pub max_ports: Option<u16>,
}

/// Apply `patch` on top of `base` and re-normalize.
#[must_use]
pub fn merge(base: Config, patch: &ConfigPatch) -> Config {
    let mut merged = base;
    if let Some(v) = patch.enabled {
        merged.enabled = v;
    }
    if let Some(v) = patch.port {
        merged.port = v;
    }
    if let Some(v) = &patch.layout {
        merged.layout = v.clone();
    }
    if let Some(v) = patch.main_pane_size {
        merged.main_pane_size = v;
    }
    if let Some(v) = patch.auto_close {
        merged.auto_close = v;
    }
    if let Some(v) = patch.spawn_delay_ms {
        merged.spawn_delay_ms = v;
    }
    if let Some(v) = patch.max_retry_attempts {
        merged.max_retry_attempts = v;
    }
    if let Some(v) = patch.layout_debounce_ms {
        merged.layout_debounce_ms = v;
    }
    if let Some(v) = patch.max_agents_per_column {
        merged.max_agents_per_column = v;
    }
    if let Some(v) = patch.reaper_enabled {
        merged.reaper_enabled = v;
    }
    if let Some(v) = patch.reaper_interval_ms {
        merged.reaper_interval_ms = v;
    }
    if let Some(v) = patch.reaper_min_zombie_checks {
        merged.reaper_min_zombie_checks = v;
    }
    if let Some(v) = patch.reaper_grace_period_ms {
        merged.reaper_grace_period_ms = v;
    }
    if let Some(v) = patch.rotate_port {
        merged.rotate_port = v;
    }
    if let Some(v) = patch.max_ports {
        merged.max_ports = v;
    }
    merged.normalize();
    merged
}

/// Parse a config from JSON text. Empty input yields the defaults.
pub fn parse_from_str(raw: &str) -> Result<Config> {
    if raw.is_empty() {
        return Ok(Config::default().normalized());
    }
    let cfg: Config = serde_json::from_str(raw)?;
    Ok(cfg.normalized())
}

/// Load the config from the first existing, parseable file in the search
/// order: `<dir>/opentmux.json`, `<dir>/opencode-agent-tmux.json` (legacy),
/// then `$HOME/.config/opencode/opentmux.json`. Falls back to defaults.
#[must_use]
pub fn load_from_directory(directory: Option<&Path>) -> Config {
    let mut candidates: Vec<PathBuf> = Vec::with_capacity(3);
    if let Some(dir) = directory {
        candidates.push(dir.join("opentmux.json"));
        candidates.push(dir.join("opencode-agent-tmux.json"));
    }
    if let Ok(home) = std::env::var("HOME") {
        if !home.is_empty() {
            candidates.push(
                Path::new(&home)
                    .join(".config")
                    .join("opencode")
                    .join("opentmux.json"),
            );
        }
    }

    for path in candidates {
        if !path.exists() {
            continue;
        }
        match std::fs::read_to_string(&path) {
            Ok(raw) => match parse_from_str(&raw) {
                Ok(cfg) => return cfg,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "config file unparseable; trying next");
                }
            },
            Err(err) => {
                warn!(path = %path.display(), error = %err, "config file unreadable; trying next");
            }
        }
    }

    Config::default().normalized()
}
