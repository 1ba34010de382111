//! Session state machine
//!
//! The orchestrator proper: sequences SSO login, the client subprocess, and
//! split-tunnel routes for one session at a time, and streams status events
//! to subscribers. The session task is the sole caller of the authenticator,
//! launcher, and route manager; nothing else mutates session resources.
//!
//! State flow:
//!
//! ```text
//! Idle -> Authenticating -> Connecting -> Connected -> Disconnecting -> Disconnected
//! ```
//!
//! `Failed` is reachable from any non-terminal state. A disconnect during
//! `Authenticating` aborts the browser wait and resolves straight to
//! `Disconnected` without ever starting the client or touching routes.

use crate::auth::{AuthError, SsoAuthenticator};
use crate::launcher::{ClientEvent, ClientHandle, ClientLauncher};
use crate::profile::{Profile, ProfileStore};
use crate::routes::{plan_routes, AppliedRoutes, RouteManager};
use crate::state::RecoveryState;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Another session is already in progress")]
    Busy,
    #[error("Unknown profile: {0}")]
    UnknownProfile(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Authenticating,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Failed,
}

impl SessionState {
    /// Terminal states free the session slot for a fresh `connect()`
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Idle | SessionState::Disconnected | SessionState::Failed
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Authenticating => "authenticating",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnecting => "disconnecting",
            SessionState::Disconnected => "disconnected",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Stable error kinds a controller can render distinctly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthTimeout,
    AuthRejected,
    BrowserError,
    LaunchError,
    RouteError,
    TeardownError,
    SessionBusy,
    UnknownProfile,
    InternalError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::AuthTimeout => "auth_timeout",
            ErrorKind::AuthRejected => "auth_rejected",
            ErrorKind::BrowserError => "browser_error",
            ErrorKind::LaunchError => "launch_error",
            ErrorKind::RouteError => "route_error",
            ErrorKind::TeardownError => "teardown_error",
            ErrorKind::SessionBusy => "session_busy",
            ErrorKind::UnknownProfile => "unknown_profile",
            ErrorKind::InternalError => "internal_error",
        };
        f.write_str(s)
    }
}

fn auth_error_kind(e: &AuthError) -> ErrorKind {
    match e {
        AuthError::Timeout => ErrorKind::AuthTimeout,
        AuthError::Rejected(_) => ErrorKind::AuthRejected,
        _ => ErrorKind::BrowserError,
    }
}

/// Point-in-time status snapshot pushed to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub session_id: u64,
    pub state: SessionState,
    pub message: String,
    pub error: Option<ErrorKind>,
    /// Unix seconds
    pub timestamp: u64,
}

fn unix_now() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Everything the session task needs; shared, never mutated
struct Deps {
    authenticator: SsoAuthenticator,
    launcher: Arc<dyn ClientLauncher>,
    routes: RouteManager,
    physical_interface: String,
    state_dir: PathBuf,
}

/// Emits ordered status events for one session
#[derive(Clone)]
struct Emitter {
    session_id: u64,
    events: broadcast::Sender<StatusEvent>,
    last: Arc<RwLock<StatusEvent>>,
    state_tx: watch::Sender<SessionState>,
}

impl Emitter {
    fn emit(&self, state: SessionState, message: impl Into<String>, error: Option<ErrorKind>) {
        let event = StatusEvent {
            session_id: self.session_id,
            state,
            message: message.into(),
            error,
            timestamp: unix_now(),
        };
        info!("Session {}: {} - {}", event.session_id, state, event.message);
        if let Ok(mut last) = self.last.write() {
            *last = event.clone();
        }
        let _ = self.state_tx.send(state);
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

struct ActiveSession {
    id: u64,
    cancel: CancellationToken,
    state: watch::Receiver<SessionState>,
}

/// The long-running service core. One instance per service process;
/// at most one non-terminal session at a time.
pub struct Orchestrator {
    store: ProfileStore,
    deps: Arc<Deps>,
    events: broadcast::Sender<StatusEvent>,
    last_event: Arc<RwLock<StatusEvent>>,
    slot: Mutex<Option<ActiveSession>>,
    next_id: AtomicU64,
}

impl Orchestrator {
    pub fn new(
        store: ProfileStore,
        authenticator: SsoAuthenticator,
        launcher: Arc<dyn ClientLauncher>,
        routes: RouteManager,
        physical_interface: String,
        state_dir: PathBuf,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let initial = StatusEvent {
            session_id: 0,
            state: SessionState::Idle,
            message: "Service ready".to_string(),
            error: None,
            timestamp: unix_now(),
        };
        Self {
            store,
            deps: Arc::new(Deps {
                authenticator,
                launcher,
                routes,
                physical_interface,
                state_dir,
            }),
            events,
            last_event: Arc::new(RwLock::new(initial)),
            slot: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Start a new session for `profile_name`.
    ///
    /// Rejected with [`SessionError::Busy`] while another session is
    /// non-terminal; the running session is unaffected.
    pub async fn connect(&self, profile_name: &str) -> Result<u64, SessionError> {
        let profile = self
            .store
            .get(profile_name)
            .cloned()
            .ok_or_else(|| SessionError::UnknownProfile(profile_name.to_string()))?;

        let mut slot = self.slot.lock().await;
        if let Some(active) = slot.as_ref() {
            if !active.state.borrow().is_terminal() {
                return Err(SessionError::Busy);
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(SessionState::Authenticating);
        let emitter = Emitter {
            session_id: id,
            events: self.events.clone(),
            last: self.last_event.clone(),
            state_tx,
        };

        info!("Starting session {} for profile {}", id, profile.name);
        let deps = self.deps.clone();
        let token = cancel.clone();
        tokio::spawn(run_session(profile, deps, emitter, token));

        *slot = Some(ActiveSession {
            id,
            cancel,
            state: state_rx,
        });
        Ok(id)
    }

    /// Request teardown of the active session. Returns false when nothing
    /// was running (already disconnected).
    pub async fn disconnect(&self) -> bool {
        let slot = self.slot.lock().await;
        if let Some(active) = slot.as_ref() {
            if !active.state.borrow().is_terminal() {
                info!("Disconnect requested for session {}", active.id);
                active.cancel.cancel();
                return true;
            }
        }
        false
    }

    /// Latest status snapshot
    pub fn status(&self) -> StatusEvent {
        self.last_event
            .read()
            .map(|e| e.clone())
            .unwrap_or_else(|_| StatusEvent {
                session_id: 0,
                state: SessionState::Idle,
                message: "Service ready".to_string(),
                error: None,
                timestamp: unix_now(),
            })
    }

    /// Subscribe to the ordered status event stream
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    pub fn profiles(&self) -> Vec<Profile> {
        self.store.iter().cloned().collect()
    }
}

async fn run_session(
    profile: Profile,
    deps: Arc<Deps>,
    emitter: Emitter,
    cancel: CancellationToken,
) {
    emitter.emit(
        SessionState::Authenticating,
        format!("Starting SSO login for {}", profile.name),
        None,
    );

    let artifact = match deps.authenticator.authenticate(&profile.server, &cancel).await {
        Ok(artifact) => artifact,
        Err(AuthError::Cancelled) => {
            // No process was started and no routes were touched
            emitter.emit(
                SessionState::Disconnecting,
                "Login cancelled".to_string(),
                None,
            );
            emitter.emit(SessionState::Disconnected, "Disconnected".to_string(), None);
            return;
        }
        Err(e) => {
            emitter.emit(
                SessionState::Failed,
                format!("SSO login failed: {}", e),
                Some(auth_error_kind(&e)),
            );
            return;
        }
    };

    if artifact.is_expired() {
        emitter.emit(
            SessionState::Failed,
            "SSO artifact expired before the client could use it".to_string(),
            Some(ErrorKind::AuthTimeout),
        );
        return;
    }

    emitter.emit(
        SessionState::Connecting,
        format!("Starting VPN client for {}", profile.server),
        None,
    );

    let mut handle = match deps.launcher.start(&profile, artifact).await {
        Ok(handle) => handle,
        Err(e) => {
            emitter.emit(
                SessionState::Failed,
                format!("Failed to start VPN client: {}", e),
                Some(ErrorKind::LaunchError),
            );
            return;
        }
    };

    let mut recovery = RecoveryState::new(handle.pid());
    save_recovery(&deps, &recovery);

    // Wait for the client to report the tunnel interface
    let device = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                emitter.emit(SessionState::Disconnecting, "Disconnect requested".to_string(), None);
                let problems: Vec<String> =
                    stop_client(&deps, &mut handle).await.into_iter().collect();
                clear_recovery(&deps);
                emit_disconnected(&emitter, "Disconnected", problems);
                return;
            }
            event = handle.next_event() => match event {
                Some(ClientEvent::TunnelUp { device, .. }) => break device,
                Some(ClientEvent::Fatal(line)) => {
                    // Teardown precedes the terminal event
                    stop_client(&deps, &mut handle).await;
                    clear_recovery(&deps);
                    emitter.emit(
                        SessionState::Failed,
                        format!("VPN client error: {}", line),
                        Some(ErrorKind::LaunchError),
                    );
                    return;
                }
                Some(ClientEvent::Exited(_)) | None => {
                    emitter.emit(
                        SessionState::Failed,
                        "VPN client exited before the tunnel came up".to_string(),
                        Some(ErrorKind::LaunchError),
                    );
                    clear_recovery(&deps);
                    return;
                }
                Some(ClientEvent::AuthRequired { url }) => {
                    warn!("Client requested interactive login at {} after cookie delivery", url);
                }
                Some(ClientEvent::Info(_)) => {}
            }
        }
    };

    info!("Tunnel device {} is up", device);

    let plan = plan_routes(&profile.policy, &device, &deps.physical_interface);
    let mut applied = match deps.routes.apply(plan).await {
        Ok(applied) => applied,
        Err(e) => {
            // apply() already rolled back its partial work; finish the
            // teardown before the terminal event
            stop_client(&deps, &mut handle).await;
            clear_recovery(&deps);
            emitter.emit(
                SessionState::Failed,
                format!("Split-tunnel routing failed: {}", e),
                Some(ErrorKind::RouteError),
            );
            return;
        }
    };

    recovery.tunnel_device = Some(device.clone());
    recovery.routes = applied.rules().to_vec();
    save_recovery(&deps, &recovery);

    emitter.emit(
        SessionState::Connected,
        format!("Connected to {}", profile.name),
        None,
    );

    // Steady state: hold until disconnect or the client dies
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                emitter.emit(SessionState::Disconnecting, "Disconnect requested".to_string(), None);
                // Routes come out before the process goes down so a client
                // auto-restart can never see an unrestricted table
                let mut problems: Vec<String> = Vec::new();
                problems.extend(revert_routes(&deps, &mut applied).await);
                problems.extend(stop_client(&deps, &mut handle).await);
                clear_recovery(&deps);
                emit_disconnected(&emitter, "Disconnected", problems);
                return;
            }
            event = handle.next_event() => match event {
                Some(ClientEvent::Exited(_)) | None => {
                    emitter.emit(
                        SessionState::Disconnecting,
                        "VPN client exited unexpectedly".to_string(),
                        None,
                    );
                    let problems: Vec<String> =
                        revert_routes(&deps, &mut applied).await.into_iter().collect();
                    clear_recovery(&deps);
                    emit_disconnected(
                        &emitter,
                        "Disconnected (VPN client exited unexpectedly)",
                        problems,
                    );
                    return;
                }
                Some(ClientEvent::Fatal(line)) => {
                    warn!("Client error while connected: {}", line);
                }
                _ => {}
            }
        }
    }
}

/// Best-effort route removal; a failure is reported back but never blocks
/// teardown
async fn revert_routes(deps: &Deps, applied: &mut AppliedRoutes) -> Option<String> {
    match deps.routes.revert(applied).await {
        Ok(()) => None,
        Err(e) => {
            warn!("Teardown: {}", e);
            Some(e.to_string())
        }
    }
}

/// Best-effort client stop; a failure is reported back but never blocks
/// teardown
async fn stop_client(deps: &Deps, handle: &mut ClientHandle) -> Option<String> {
    match deps.launcher.stop(handle).await {
        Ok(()) => None,
        Err(e) => {
            warn!("Teardown: {}", e);
            Some(e.to_string())
        }
    }
}

/// The session's single terminal `Disconnected` event; teardown problems are
/// folded in rather than emitted after it
fn emit_disconnected(emitter: &Emitter, message: &str, problems: Vec<String>) {
    if problems.is_empty() {
        emitter.emit(SessionState::Disconnected, message.to_string(), None);
    } else {
        emitter.emit(
            SessionState::Disconnected,
            format!("{} (teardown incomplete: {})", message, problems.join("; ")),
            Some(ErrorKind::TeardownError),
        );
    }
}

fn save_recovery(deps: &Deps, recovery: &RecoveryState) {
    if let Err(e) = recovery.save(&deps.state_dir) {
        warn!("Failed to persist recovery state: {}", e);
    }
}

fn clear_recovery(deps: &Deps) {
    if let Err(e) = RecoveryState::delete(&deps.state_dir) {
        warn!("Failed to delete recovery state: {}", e);
    }
}
