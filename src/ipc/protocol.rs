//! Wire protocol for the control socket
//!
//! Every message is a 4-byte big-endian length prefix followed by that many
//! bytes of JSON. Requests and responses share the framing; a subscription
//! turns the connection into a one-way stream of `Event` responses.

use crate::profile::Profile;
use crate::session::{ErrorKind, StatusEvent};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Upper bound on a single frame, defensive against a corrupt prefix
pub const MAX_MESSAGE_SIZE: u32 = 1024 * 1024;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Message too large: {0} bytes")]
    MessageTooLarge(u32),
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Commands a controller can send to the service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Start a session for the named profile
    Connect { profile: String },
    /// Tear down the active session
    Disconnect,
    /// Latest status snapshot
    Status,
    /// Switch this connection to a status event stream
    Subscribe,
    /// List configured profiles
    Profiles,
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ack { message: String },
    Pong,
    Status { event: StatusEvent },
    Profiles { profiles: Vec<Profile> },
    /// One entry of a subscription stream
    Event { event: StatusEvent },
    Error { kind: ErrorKind, message: String },
}

/// Read one length-prefixed JSON message
pub async fn read_message<T, R>(reader: &mut R) -> Result<T, ProtocolError>
where
    T: for<'de> Deserialize<'de>,
    R: AsyncReadExt + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::ConnectionClosed
        } else {
            ProtocolError::Io(e)
        }
    })?;

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(len));
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

/// Write one length-prefixed JSON message
pub async fn write_message<T, W>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    T: Serialize,
    W: AsyncWriteExt + Unpin,
{
    let payload = serde_json::to_vec(message)?;
    let len = payload.len() as u32;
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(len));
    }

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}
