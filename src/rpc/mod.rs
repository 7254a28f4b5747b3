//! Peer-to-peer wire protocol: length-prefixed structured messages.
//!
//! Frames are a `u32` big-endian length followed by a JSON body. The only
//! method is `Get(group, key)`; responses carry a status code mirroring the
//! RPC statuses the rest of the system understands.
//!
//! `redirected` marks a request that was already forwarded by a peer: the
//! receiving server answers such requests from its local path only, which
//! prevents forwarding loops when ring views momentarily diverge.

pub mod client;
pub mod server;

pub use client::Client;
pub use server::Server;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::CacheError;

/// Upper bound on a single frame; anything larger is a protocol error.
pub const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    NotFound,
    Unavailable,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRequest {
    pub group: String,
    pub key: String,
    /// Set on peer-to-peer fetches; the receiver must not forward again.
    #[serde(default)]
    pub redirected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetResponse {
    pub status: Status,
    #[serde(default)]
    pub value: Vec<u8>,
    #[serde(default)]
    pub message: String,
}

impl GetResponse {
    pub fn ok(value: Vec<u8>) -> Self {
        Self {
            status: Status::Ok,
            value,
            message: String::new(),
        }
    }

    pub fn error(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            value: Vec::new(),
            message: message.into(),
        }
    }
}

/// Writes one length-prefixed frame.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), CacheError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body =
        serde_json::to_vec(message).map_err(|err| CacheError::Rpc(format!("encode: {err}")))?;
    if body.len() as u64 > MAX_FRAME_BYTES as u64 {
        return Err(CacheError::Rpc(format!("frame too large: {}", body.len())));
    }
    writer
        .write_u32(body.len() as u32)
        .await
        .map_err(|err| CacheError::Rpc(format!("write: {err}")))?;
    writer
        .write_all(&body)
        .await
        .map_err(|err| CacheError::Rpc(format!("write: {err}")))?;
    writer
        .flush()
        .await
        .map_err(|err| CacheError::Rpc(format!("flush: {err}")))?;
    Ok(())
}

/// Reads one length-prefixed frame; `Ok(None)` on clean end of stream.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, CacheError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(CacheError::Rpc(format!("read: {err}"))),
    };
    if len > MAX_FRAME_BYTES {
        return Err(CacheError::Rpc(format!("frame too large: {len}")));
    }
    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|err| CacheError::Rpc(format!("read: {err}")))?;
    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|err| CacheError::Rpc(format!("decode: {err}")))
}
