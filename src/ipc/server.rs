//! Control socket server
//!
//! Listens on a unix domain socket with owner-only permissions and serves
//! one task per controller connection. Connections are request/response
//! until a `Subscribe` turns them into a status event stream.

use crate::ipc::protocol::{read_message, write_message, ProtocolError, Request, Response};
use crate::session::{ErrorKind, Orchestrator, SessionError, StatusEvent};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncWrite, BufReader, BufWriter};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind socket {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to set socket permissions: {0}")]
    Permissions(std::io::Error),
}

pub struct IpcServer {
    orchestrator: Arc<Orchestrator>,
    socket_path: PathBuf,
}

impl IpcServer {
    pub fn new(orchestrator: Arc<Orchestrator>, socket_path: PathBuf) -> Self {
        Self {
            orchestrator,
            socket_path,
        }
    }

    /// Accept controller connections until `shutdown` fires.
    ///
    /// A stale socket file from a previous run is replaced. The socket is
    /// restricted to the owning user.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ServerError> {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
        if let Some(parent) = self.socket_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(|e| ServerError::Bind {
            path: self.socket_path.clone(),
            source: e,
        })?;

        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))
                .map_err(ServerError::Permissions)?;
        }

        info!("Control socket listening on {}", self.socket_path.display());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Control socket shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let orchestrator = self.orchestrator.clone();
                            tokio::spawn(async move {
                                handle_client(stream, orchestrator).await;
                            });
                        }
                        Err(e) => warn!("Accept failed: {}", e),
                    }
                }
            }
        }

        let _ = std::fs::remove_file(&self.socket_path);
        Ok(())
    }
}

async fn handle_client(stream: UnixStream, orchestrator: Arc<Orchestrator>) {
    debug!("Controller connected");
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);

    loop {
        let request: Request = match read_message(&mut reader).await {
            Ok(request) => request,
            Err(ProtocolError::ConnectionClosed) => {
                debug!("Controller disconnected");
                return;
            }
            Err(e) => {
                warn!("Bad request from controller: {}", e);
                return;
            }
        };

        debug!("Request: {:?}", request);

        if matches!(request, Request::Subscribe) {
            // Subscribe first so no event between snapshot and stream is lost
            let events = orchestrator.subscribe();
            let snapshot = Response::Status {
                event: orchestrator.status(),
            };
            if write_message(&mut writer, &snapshot).await.is_err() {
                return;
            }
            stream_events(&mut writer, &orchestrator, events).await;
            return;
        }

        let response = dispatch(&orchestrator, request).await;
        if let Err(e) = write_message(&mut writer, &response).await {
            debug!("Controller write failed: {}", e);
            return;
        }
    }
}

async fn dispatch(orchestrator: &Orchestrator, request: Request) -> Response {
    match request {
        Request::Ping => Response::Pong,
        Request::Status => Response::Status {
            event: orchestrator.status(),
        },
        Request::Profiles => Response::Profiles {
            profiles: orchestrator.profiles(),
        },
        Request::Connect { profile } => match orchestrator.connect(&profile).await {
            Ok(id) => Response::Ack {
                message: format!("Session {} starting for profile {}", id, profile),
            },
            Err(SessionError::Busy) => Response::Error {
                kind: ErrorKind::SessionBusy,
                message: "Another session is already in progress".to_string(),
            },
            Err(SessionError::UnknownProfile(name)) => Response::Error {
                kind: ErrorKind::UnknownProfile,
                message: format!("Unknown profile: {}", name),
            },
        },
        Request::Disconnect => {
            if orchestrator.disconnect().await {
                Response::Ack {
                    message: "Disconnecting".to_string(),
                }
            } else {
                Response::Ack {
                    message: "Already disconnected".to_string(),
                }
            }
        }
        // Handled before dispatch
        Request::Subscribe => Response::Error {
            kind: ErrorKind::InternalError,
            message: "Subscribe cannot be dispatched".to_string(),
        },
    }
}

/// Forward status events until the controller goes away.
///
/// A subscriber that falls behind the broadcast buffer loses events; it is
/// resynchronized with the current status snapshot so a terminal event can
/// never be silently dropped.
async fn stream_events<W>(
    writer: &mut W,
    orchestrator: &Orchestrator,
    mut events: broadcast::Receiver<StatusEvent>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        match events.recv().await {
            Ok(event) => {
                let frame = Response::Event { event };
                if write_message(writer, &frame).await.is_err() {
                    debug!("Subscriber disconnected");
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Subscriber lagged, {} events dropped, resynchronizing", n);
                let frame = Response::Event {
                    event: orchestrator.status(),
                };
                if write_message(writer, &frame).await.is_err() {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
