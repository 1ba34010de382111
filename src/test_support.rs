//! Shared test doubles for the capability seams

use crate::auth::{AuthArtifact, AuthError, BrowserDriver, LoginRequest};
use crate::launcher::{ClientEvent, ClientHandle, ClientLauncher, LaunchError};
use crate::profile::Profile;
use crate::routes::{RouteRule, RouteTable, TableError};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// In-memory routing table with snapshot support and injectable failures
pub struct MemoryRouteTable {
    routes: Mutex<BTreeSet<String>>,
    adds_before_failure: AtomicUsize,
    fail_removes: AtomicBool,
}

impl MemoryRouteTable {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(BTreeSet::new()),
            adds_before_failure: AtomicUsize::new(usize::MAX),
            fail_removes: AtomicBool::new(false),
        }
    }

    /// Let `n` adds succeed, then fail every add after that
    pub fn fail_add_after(&self, n: usize) {
        self.adds_before_failure.store(n, Ordering::SeqCst);
    }

    pub fn fail_removes(&self, fail: bool) {
        self.fail_removes.store(fail, Ordering::SeqCst);
    }

    /// Current table contents, sorted
    pub fn snapshot(&self) -> Vec<String> {
        self.routes.lock().unwrap().iter().cloned().collect()
    }
}

impl Default for MemoryRouteTable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RouteTable for MemoryRouteTable {
    async fn add(&self, rule: &RouteRule) -> Result<(), TableError> {
        let remaining = self.adds_before_failure.load(Ordering::SeqCst);
        if remaining == 0 {
            return Err(TableError::Add("injected failure".to_string()));
        }
        if remaining != usize::MAX {
            self.adds_before_failure.store(remaining - 1, Ordering::SeqCst);
        }
        self.routes.lock().unwrap().insert(rule.to_string());
        Ok(())
    }

    async fn remove(&self, rule: &RouteRule) -> Result<(), TableError> {
        if self.fail_removes.load(Ordering::SeqCst) {
            return Err(TableError::Delete("injected failure".to_string()));
        }
        self.routes.lock().unwrap().remove(&rule.to_string());
        Ok(())
    }
}

/// Scriptable browser driver
pub enum BrowserScript {
    Succeed(String),
    /// Succeeds with an artifact that is already past its expiry hint
    Expired(String),
    Reject(String),
    Fail(String),
    /// Never completes; exercises timeout and cancellation
    Hang,
}

pub struct MockBrowser {
    script: Mutex<Vec<BrowserScript>>,
    pub calls: AtomicUsize,
}

impl MockBrowser {
    pub fn new(script: Vec<BrowserScript>) -> Self {
        Self {
            script: Mutex::new(script),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn succeeding(cookie: &str) -> Self {
        Self::new(vec![BrowserScript::Succeed(cookie.to_string())])
    }

    fn next(&self) -> BrowserScript {
        let mut script = self.script.lock().unwrap();
        if script.is_empty() {
            BrowserScript::Fail("mock browser script exhausted".to_string())
        } else {
            script.remove(0)
        }
    }
}

#[async_trait]
impl BrowserDriver for MockBrowser {
    async fn authenticate(&self, _request: &LoginRequest) -> Result<AuthArtifact, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.next() {
            BrowserScript::Succeed(cookie) => Ok(AuthArtifact::new(cookie, None)),
            BrowserScript::Expired(cookie) => {
                Ok(AuthArtifact::new(cookie, Some(Duration::ZERO)))
            }
            BrowserScript::Reject(msg) => Err(AuthError::Rejected(msg)),
            BrowserScript::Fail(msg) => Err(AuthError::Browser(msg)),
            BrowserScript::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(AuthError::Timeout)
            }
        }
    }
}

pub fn static_login_request() -> LoginRequest {
    LoginRequest {
        login_url: "https://idp.example.com/saml/login".to_string(),
        completion_url: None,
        token_cookie: "webvpn".to_string(),
    }
}

/// Remote control for one mock client subprocess
pub struct MockClient {
    events_tx: mpsc::Sender<ClientEvent>,
    exit_tx: watch::Sender<Option<i32>>,
    pub pid: u32,
}

impl MockClient {
    pub async fn emit(&self, event: ClientEvent) {
        let _ = self.events_tx.send(event).await;
    }

    pub async fn tunnel_up(&self, device: &str) {
        self.emit(ClientEvent::TunnelUp {
            device: device.to_string(),
            index: None,
        })
        .await;
    }

    /// Mark the process as exited and deliver the trailing event
    pub async fn exit(&self, code: i32) {
        let _ = self.exit_tx.send(Some(code));
        let _ = self.events_tx.send(ClientEvent::Exited(None)).await;
    }
}

/// Scriptable launcher handing a [`MockClient`] to the test per start
pub struct MockLauncher {
    controls_tx: mpsc::UnboundedSender<MockClient>,
    controls_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockClient>>,
    fail_next: Mutex<Option<String>>,
    fail_next_stop: Mutex<Option<String>>,
    next_pid: AtomicUsize,
    pub started: AtomicUsize,
    pub stopped: AtomicUsize,
    /// Secrets the launcher consumed, for assertions
    pub consumed: Mutex<Vec<String>>,
}

impl MockLauncher {
    pub fn new() -> Self {
        let (controls_tx, controls_rx) = mpsc::unbounded_channel();
        Self {
            controls_tx,
            controls_rx: tokio::sync::Mutex::new(controls_rx),
            fail_next: Mutex::new(None),
            fail_next_stop: Mutex::new(None),
            next_pid: AtomicUsize::new(1000),
            started: AtomicUsize::new(0),
            stopped: AtomicUsize::new(0),
            consumed: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_next_start(&self, reason: &str) {
        *self.fail_next.lock().unwrap() = Some(reason.to_string());
    }

    pub fn fail_next_stop(&self, reason: &str) {
        *self.fail_next_stop.lock().unwrap() = Some(reason.to_string());
    }

    /// Control handle for the next spawned client; awaits the spawn
    pub async fn next_client(&self) -> MockClient {
        self.controls_rx
            .lock()
            .await
            .recv()
            .await
            .expect("launcher dropped")
    }
}

impl Default for MockLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClientLauncher for MockLauncher {
    async fn start(
        &self,
        _profile: &Profile,
        artifact: AuthArtifact,
    ) -> Result<ClientHandle, LaunchError> {
        if let Some(reason) = self.fail_next.lock().unwrap().take() {
            return Err(LaunchError::SpawnFailed(reason));
        }

        self.started.fetch_add(1, Ordering::SeqCst);
        self.consumed.lock().unwrap().push(artifact.into_secret());

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst) as u32;
        let (events_tx, events_rx) = mpsc::channel(64);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, _kill_rx) = oneshot::channel();

        let control = MockClient {
            events_tx,
            exit_tx,
            pid,
        };
        let handle = ClientHandle::new(pid, events_rx, exit_rx, kill_tx);
        let _ = self.controls_tx.send(control);
        Ok(handle)
    }

    async fn stop(&self, _handle: &mut ClientHandle) -> Result<(), LaunchError> {
        self.stopped.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self.fail_next_stop.lock().unwrap().take() {
            return Err(LaunchError::Teardown(reason));
        }
        Ok(())
    }
}
