//! Minimal control client used by `opentmuxctl`.

use std::path::PathBuf;

#[cfg(unix)]
use tokio::net::UnixStream;

use crate::error::{Error, Result};

#[cfg(unix)]
use super::protocol::{read_frame, write_frame};
use super::protocol::{Request, Response};

/// One-request-per-connection client for the control socket.
pub struct ControlClient {
    socket_path: PathBuf,
}

impl ControlClient {
    #[must_use]
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    /// Send one request and await its response.
    #[cfg(unix)]
    pub async fn call(&self, request: &Request) -> Result<Response> {
        let mut stream = UnixStream::connect(&self.socket_path).await.map_err(|err| {
            Error::Protocol(format!(
                "cannot reach daemon at {}: {err}",
                self.socket_path.display()
            ))
        })?;
        write_frame(&mut stream, request).await?;
        match read_frame(&mut stream).await? {
            Some(response) => Ok(response),
            None => Err(Error::Protocol(
                "connection closed before response".to_string(),
            )),
        }
    }

    #[cfg(not(unix))]
    pub async fn call(&self, _request: &Request) -> Result<Response> {
        Err(Error::Protocol(
            "control socket requires a unix platform".to_string(),
        ))
    }
}
