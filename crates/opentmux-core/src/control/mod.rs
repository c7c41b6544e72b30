//! Control boundary: the typed RPC surface the host plugin shim drives.
//!
//! Requests arrive as length-prefixed JSON frames over a local Unix socket;
//! the method set is a closed variant enum — anything else is rejected at
//! decode time.

pub mod client;
pub mod protocol;
pub mod service;

pub use protocol::{Request, Response};
pub use service::{Service, StopFn};
