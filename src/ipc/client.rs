//! Control socket client, used by the CLI subcommands

use crate::ipc::protocol::{read_message, write_message, ProtocolError, Request, Response};
use crate::session::StatusEvent;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::net::UnixStream;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Cannot reach the service at {path} ({source}); is `saml-vpn serve` running?")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Unexpected response: {0:?}")]
    UnexpectedResponse(Response),
}

pub struct IpcClient {
    stream: UnixStream,
    socket_path: PathBuf,
}

impl IpcClient {
    pub async fn connect(socket_path: &Path) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(|e| ClientError::Connect {
                path: socket_path.to_path_buf(),
                source: e,
            })?;
        Ok(Self {
            stream,
            socket_path: socket_path.to_path_buf(),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// One request/response exchange
    pub async fn call(&mut self, request: &Request) -> Result<Response, ClientError> {
        write_message(&mut self.stream, request).await?;
        Ok(read_message(&mut self.stream).await?)
    }

    /// Turn this connection into a status event stream. The first frame is
    /// the current status snapshot.
    pub async fn subscribe(mut self) -> Result<EventStream, ClientError> {
        write_message(&mut self.stream, &Request::Subscribe).await?;
        let snapshot = match read_message(&mut self.stream).await? {
            Response::Status { event } => event,
            other => return Err(ClientError::UnexpectedResponse(other)),
        };
        Ok(EventStream {
            stream: self.stream,
            snapshot,
        })
    }
}

/// Subscribed connection yielding status events in order
pub struct EventStream {
    stream: UnixStream,
    snapshot: StatusEvent,
}

impl EventStream {
    /// Status at subscription time
    pub fn snapshot(&self) -> &StatusEvent {
        &self.snapshot
    }

    /// Next event, or `None` once the service closes the stream
    pub async fn next_event(&mut self) -> Option<StatusEvent> {
        match read_message::<Response, _>(&mut self.stream).await {
            Ok(Response::Event { event }) => Some(event),
            Ok(_) | Err(_) => None,
        }
    }
}
