//! opentmux-core: runtime coordinator for opencode agent panes in tmux.
//!
//! When the opencode host spawns a child agent session, this library attaches
//! a tmux pane to it (running `opencode attach`), keeps the pane alive while
//! the session is active, and tears it down when the session goes idle,
//! disappears, or times out.
//!
//! # Architecture
//!
//! ```text
//! plugin shim → control service → session manager → spawn queue → tmux adapter
//!                                      ↓                               ↑
//!                                   poller  ──────── close panes ──────┘
//!                                 zombie reaper (independent interval)
//! ```
//!
//! # Modules
//!
//! - `config`: normalized, validated tunables with defaults
//! - `process`: signal-safe process queries and kills
//! - `tmux`: the only module allowed to shell out to the tmux binary
//! - `host`: the opencode HTTP boundary (`/health`, `/session/status`)
//! - `metrics`: atomic gauges snapshot-able by the control surface
//! - `spawn_queue`: ordered, deduped, retrying spawn scheduler
//! - `reaper`: background scan that kills orphaned attach processes
//! - `session`: tracked sessions, poller, and lifecycle orchestration
//! - `control`: typed RPC boundary (init / event / shutdown / stats)
//! - `logging`: `tracing` bootstrap for the binaries
//!
//! # Safety
//!
//! This crate forbids unsafe code. The reaper never kills a process it cannot
//! prove belongs to this instance.

#![forbid(unsafe_code)]

pub mod config;
pub mod control;
pub mod error;
pub mod host;
pub mod logging;
pub mod metrics;
pub mod process;
pub mod reaper;
pub mod session;
pub mod spawn_queue;
pub mod tmux;

pub use error::{Error, Result};
