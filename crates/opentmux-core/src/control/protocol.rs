//! Wire protocol for the control socket.
//!
//! Frames are a u32 big-endian length followed by a JSON body. Bodies are
//! the closed [`Request`]/[`Response`] variant sets; unknown methods fail to
//! decode and the connection reports a protocol error.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::ConfigPatch;
use crate::error::{Error, Result};

/// Frames larger than this are rejected outright.
pub const MAX_FRAME_BYTES: u32 = 1024 * 1024;

/// Control requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Request {
    /// Bind the daemon to a project directory and host. Honored exactly
    /// once.
    Init {
        #[serde(default)]
        directory: String,
        server_url: String,
        #[serde(default)]
        config: Option<ConfigPatch>,
    },
    /// A session lifecycle event pushed by the plugin shim.
    SessionCreated {
        #[serde(rename = "type")]
        event_type: String,
        id: String,
        parent_id: String,
        #[serde(default)]
        title: String,
    },
    /// Tear the coordinator down.
    Shutdown {
        #[serde(default)]
        reason: String,
    },
    /// Read the gauges.
    Stats,
}

/// Control responses, one variant per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Response {
    Init {
        enabled: bool,
        message: String,
    },
    SessionCreated {
        accepted: bool,
    },
    Shutdown {
        ok: bool,
    },
    Stats {
        tracked_sessions: u64,
        pending_sessions: u64,
        queue_depth: u64,
    },
    Error {
        message: String,
    },
}

/// Encode one frame onto the stream.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_BYTES as usize {
        return Err(Error::Protocol(format!(
            "frame of {} bytes exceeds the {MAX_FRAME_BYTES}-byte cap",
            body.len()
        )));
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Decode one frame from the stream. `Ok(None)` is a clean end of stream.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if len > MAX_FRAME_BYTES {
        return Err(Error::Protocol(format!(
            "frame of {len} bytes exceeds the {MAX_FRAME_BYTES}-byte cap"
        )));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}
