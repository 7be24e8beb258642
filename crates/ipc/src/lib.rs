// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Control protocol between `xpg_ctl` and the `xpg` supervisor.
//!
//! Clients connect to the supervisor's control socket and send one of three
//! commands. Messages are serialized as JSON with length-prefixed framing.

use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;

// ============================================================================
// Protocol types
// ============================================================================

/// Request sent from a client to the supervisor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ControlRequest {
    /// Register one more client depending on the engine.
    Incref,
    /// Drop one client; the last one stops the engine.
    Decref,
    /// Ask the engine to reload its configuration.
    Restart,
}

/// Response sent from the supervisor to a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ControlResponse {
    /// Request applied.
    Ok,
    /// The Decref was the last reference; shutdown has completed.
    Stopped,
    /// Request failed.
    Error { message: String },
}

/// What a Decref amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecrefReply {
    /// Other clients remain; the supervisor keeps running.
    Released,
    /// This was the last client and the supervisor has shut down.
    Stopped,
}

// ============================================================================
// Message framing
// ============================================================================

/// Control message framing.
///
/// Messages are framed as:
/// - 4 bytes: message length (big-endian u32)
/// - N bytes: JSON-encoded message
pub mod framing {
    use std::io;

    use serde::de::DeserializeOwned;
    use serde::Serialize;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    /// Maximum message size (1MB) to prevent malformed messages from causing hangs.
    pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

    /// Write a serializable message to the given writer.
    pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
        T: Serialize,
    {
        let json = serde_json::to_vec(message)
            .map_err(|e| io::Error::other(format!("serialize error: {}", e)))?;
        if json.len() > MAX_MESSAGE_SIZE {
            return Err(io::Error::other("message too large"));
        }
        let len = u32::try_from(json.len()).map_err(|_| io::Error::other("message too large"))?;
        writer.write_all(&len.to_be_bytes()).await?;
        writer.write_all(&json).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read a deserializable message from the given reader.
    ///
    /// Returns `Ok(None)` on a clean end of stream before a new message.
    pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
    where
        R: AsyncRead + Unpin,
        T: DeserializeOwned,
    {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let len = u32::from_be_bytes(len_buf) as usize;

        if len > MAX_MESSAGE_SIZE {
            return Err(io::Error::other(format!(
                "message too large: {} bytes (max {})",
                len, MAX_MESSAGE_SIZE
            )));
        }

        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await?;

        serde_json::from_slice(&buf)
            .map(Some)
            .map_err(|e| io::Error::other(format!("deserialize error: {}", e)))
    }
}

// ============================================================================
// Client
// ============================================================================

/// Connection to a running supervisor.
#[derive(Debug)]
pub struct ControlClient {
    stream: UnixStream,
}

impl ControlClient {
    /// Connect to the control socket at `path`.
    ///
    /// `Ok(None)` means no supervisor is listening: the socket is absent or
    /// refuses connections. No retry is attempted.
    pub async fn connect(path: &Path) -> io::Result<Option<Self>> {
        match UnixStream::connect(path).await {
            Ok(stream) => Ok(Some(ControlClient { stream })),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn request(&mut self, request: ControlRequest) -> io::Result<ControlResponse> {
        framing::write_message(&mut self.stream, &request).await?;
        match framing::read_message(&mut self.stream).await? {
            Some(ControlResponse::Error { message }) => Err(io::Error::other(message)),
            Some(response) => Ok(response),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "supervisor closed the connection",
            )),
        }
    }

    pub async fn incref(&mut self) -> io::Result<()> {
        self.request(ControlRequest::Incref).await.map(|_| ())
    }

    pub async fn restart(&mut self) -> io::Result<()> {
        self.request(ControlRequest::Restart).await.map(|_| ())
    }

    /// Drop this client's reference. If it was the last, the reply only
    /// arrives after shutdown, and this returns once the supervisor has
    /// closed the connection.
    pub async fn decref(mut self) -> io::Result<DecrefReply> {
        match self.request(ControlRequest::Decref).await {
            Ok(ControlResponse::Stopped) => {
                let mut rest = Vec::new();
                self.stream.read_to_end(&mut rest).await?;
                Ok(DecrefReply::Stopped)
            }
            Ok(_) => Ok(DecrefReply::Released),
            // The supervisor exited without replying; it is gone either way.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(DecrefReply::Stopped),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
