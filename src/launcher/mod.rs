//! VPN client subprocess lifecycle
//!
//! Spawns the wrapped client, feeds it the authentication artifact on stdin,
//! drains its output through the pattern table, and guarantees the process is
//! gone after a stop (graceful first, forced after the grace period).

pub mod patterns;

use crate::auth::AuthArtifact;
use crate::profile::Profile;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub use patterns::{ClientEvent, PatternTable};

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("VPN client binary not found: {0}")]
    BinaryNotFound(String),
    #[error("Failed to start VPN client: {0}")]
    SpawnFailed(String),
    #[error("VPN client exited during startup")]
    EarlyExit,
    #[error("VPN client did not terminate: {0}")]
    Teardown(String),
}

/// Handle to a running client subprocess
///
/// Owned exclusively by the session while the process runs. Events arrive in
/// output order; an `Exited` event is always delivered last.
pub struct ClientHandle {
    pid: u32,
    events: mpsc::Receiver<ClientEvent>,
    exit: watch::Receiver<Option<i32>>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl ClientHandle {
    pub(crate) fn new(
        pid: u32,
        events: mpsc::Receiver<ClientEvent>,
        exit: watch::Receiver<Option<i32>>,
        kill_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            pid,
            events,
            exit,
            kill_tx: Some(kill_tx),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Next classified event; `None` once the process is gone and the
    /// channel has drained
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }

    /// True once the subprocess has exited
    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Wait for the subprocess to exit, returning its exit code if known
    pub async fn wait_exit(&mut self) -> Option<i32> {
        let result = self.exit.wait_for(|status| status.is_some()).await;
        match result {
            Ok(status) => *status,
            // Monitor task dropped; the child is gone either way
            Err(_) => None,
        }
    }

    /// Force-kill the subprocess (SIGKILL equivalent)
    pub fn force_kill(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Capability seam over starting/stopping the client subprocess
#[async_trait]
pub trait ClientLauncher: Send + Sync {
    /// Spawn the client for `profile`, consuming the artifact
    async fn start(
        &self,
        profile: &Profile,
        artifact: AuthArtifact,
    ) -> Result<ClientHandle, LaunchError>;

    /// Graceful stop, force-killing after the grace period
    async fn stop(&self, handle: &mut ClientHandle) -> Result<(), LaunchError>;
}

/// Launcher for the openconnect binary
pub struct OpenconnectLauncher {
    binary: PathBuf,
    table: Arc<PatternTable>,
    stop_grace: Duration,
}

impl OpenconnectLauncher {
    pub fn new(binary: PathBuf, stop_grace: Duration) -> Self {
        Self {
            binary,
            table: Arc::new(PatternTable::openconnect()),
            stop_grace,
        }
    }
}

#[async_trait]
impl ClientLauncher for OpenconnectLauncher {
    async fn start(
        &self,
        profile: &Profile,
        artifact: AuthArtifact,
    ) -> Result<ClientHandle, LaunchError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg(&profile.server).arg("--cookie-on-stdin");
        if let Some(group) = &profile.authgroup {
            cmd.arg("--authgroup").arg(group);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // The artifact travels on stdin, never on argv
        info!(
            "Starting {} {} --cookie-on-stdin",
            self.binary.display(),
            profile.server
        );

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LaunchError::BinaryNotFound(self.binary.display().to_string())
            } else {
                LaunchError::SpawnFailed(e.to_string())
            }
        })?;

        let pid = child.id().ok_or(LaunchError::EarlyExit)?;

        let mut stdin = child.stdin.take().ok_or(LaunchError::EarlyExit)?;
        let stdout = child.stdout.take().ok_or(LaunchError::EarlyExit)?;
        let stderr = child.stderr.take().ok_or(LaunchError::EarlyExit)?;

        let secret = artifact.into_secret();
        if let Err(e) = stdin.write_all(format!("{}\n", secret).as_bytes()).await {
            let _ = child.start_kill();
            return Err(LaunchError::SpawnFailed(format!(
                "failed to deliver cookie: {}",
                e
            )));
        }
        drop(stdin);

        let (events_tx, events_rx) = mpsc::channel(64);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();

        // One pump per stream, both through the same table (stderr carries
        // most of the client's progress output)
        let stdout_pump = pump_lines(stdout, self.table.clone(), events_tx.clone(), "stdout");
        let stderr_pump = pump_lines(stderr, self.table.clone(), events_tx.clone(), "stderr");

        tokio::spawn(monitor_child(
            child, pid, events_tx, exit_tx, kill_rx, stdout_pump, stderr_pump,
        ));

        Ok(ClientHandle::new(pid, events_rx, exit_rx, kill_tx))
    }

    async fn stop(&self, handle: &mut ClientHandle) -> Result<(), LaunchError> {
        if handle.has_exited() {
            debug!("Client pid {} already exited", handle.pid());
            return Ok(());
        }

        info!("Stopping client pid {} (graceful)", handle.pid());
        terminate(handle.pid());

        if timeout(self.stop_grace, handle.wait_exit()).await.is_ok() {
            info!("Client terminated gracefully");
            return Ok(());
        }

        warn!(
            "Client pid {} did not exit within {:?}, force-killing",
            handle.pid(),
            self.stop_grace
        );
        handle.force_kill();

        match timeout(Duration::from_secs(2), handle.wait_exit()).await {
            Ok(_) => Ok(()),
            Err(_) => Err(LaunchError::Teardown(format!(
                "pid {} still running after SIGKILL",
                handle.pid()
            ))),
        }
    }
}

fn pump_lines<R>(
    stream: R,
    table: Arc<PatternTable>,
    events: mpsc::Sender<ClientEvent>,
    stream_name: &'static str,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    debug!("[openconnect {}] {}", stream_name, line);
                    if events.send(table.classify(&line)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Error reading client {}: {}", stream_name, e);
                    break;
                }
            }
        }
    })
}

#[allow(clippy::too_many_arguments)]
async fn monitor_child(
    mut child: tokio::process::Child,
    pid: u32,
    events: mpsc::Sender<ClientEvent>,
    exit_tx: watch::Sender<Option<i32>>,
    kill_rx: oneshot::Receiver<()>,
    stdout_pump: tokio::task::JoinHandle<()>,
    stderr_pump: tokio::task::JoinHandle<()>,
) {
    let mut kill_rx = Some(kill_rx);
    let status = loop {
        if let Some(rx) = kill_rx.take() {
            tokio::select! {
                status = child.wait() => break status.ok(),
                _ = rx => {
                    warn!("Force-killing client pid {}", pid);
                    let _ = child.start_kill();
                }
            }
        } else {
            break child.wait().await.ok();
        }
    };

    let code = status.and_then(|s| s.code());
    info!("Client pid {} exited (code: {:?})", pid, code);

    // Drain pumps before the Exited marker so event order matches output order
    let _ = stdout_pump.await;
    let _ = stderr_pump.await;

    let _ = exit_tx.send(Some(code.unwrap_or(-1)));
    let _ = events.send(ClientEvent::Exited(status)).await;
}

/// Ask the process to terminate (SIGTERM on unix)
#[cfg(unix)]
fn terminate(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        debug!("SIGTERM to pid {} failed: {}", pid, e);
    }
}

#[cfg(not(unix))]
fn terminate(_pid: u32) {
    // No graceful signal available; stop() falls through to force-kill
}

/// True if a process with this pid still exists
#[cfg(unix)]
pub fn process_exists(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
pub fn process_exists(_pid: u32) -> bool {
    false
}

/// Terminate an orphaned client left over from a previous run.
///
/// Sends SIGTERM, waits up to `grace`, then SIGKILL. Returns true once the
/// process is gone.
#[cfg(unix)]
pub async fn reap_orphan(pid: u32, grace: Duration) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let target = Pid::from_raw(pid as i32);
    if kill(target, None).is_err() {
        return true;
    }

    warn!("Reaping orphaned client pid {}", pid);
    let _ = kill(target, Signal::SIGTERM);

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if kill(target, None).is_err() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    warn!("Orphan pid {} ignored SIGTERM, sending SIGKILL", pid);
    let _ = kill(target, Signal::SIGKILL);
    tokio::time::sleep(Duration::from_millis(200)).await;
    kill(target, None).is_err()
}

#[cfg(not(unix))]
pub async fn reap_orphan(pid: u32, _grace: Duration) -> bool {
    warn!("Orphan reaping not supported on this platform (pid {})", pid);
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::SplitTunnelPolicy;

    /// Write an executable shim script that ignores the launcher's argv
    /// (server name + `--cookie-on-stdin`) and runs `body` instead.
    #[cfg(unix)]
    fn shim_binary(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.path().join("shim.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn test_profile() -> Profile {
        Profile {
            name: "vpn-main".to_string(),
            server: "vpn.example.com".to_string(),
            authgroup: None,
            policy: SplitTunnelPolicy::AllTraffic,
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_launch_error() {
        let launcher = OpenconnectLauncher::new(
            PathBuf::from("/nonexistent/openconnect-test-binary"),
            Duration::from_secs(1),
        );
        let artifact = AuthArtifact::new("cookie".to_string(), None);
        let result = launcher.start(&test_profile(), artifact).await;
        assert!(matches!(result, Err(LaunchError::BinaryNotFound(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_drains_output_and_reports_exit() {
        // `cat` echoes the cookie from stdin and exits on EOF, which
        // exercises spawn, the stdin write, both pumps, and the exit marker.
        // A shim swallows the launcher's argv, which cat would reject.
        let dir = tempfile::tempdir().unwrap();
        let launcher =
            OpenconnectLauncher::new(shim_binary(&dir, "exec cat"), Duration::from_secs(1));
        let artifact = AuthArtifact::new("test-cookie-value".to_string(), None);
        let mut handle = launcher.start(&test_profile(), artifact).await.unwrap();

        let mut saw_exit = false;
        let mut saw_cookie_line = false;
        while let Some(event) = handle.next_event().await {
            match event {
                ClientEvent::Info(line) if line.contains("test-cookie-value") => {
                    saw_cookie_line = true;
                }
                ClientEvent::Exited(_) => {
                    saw_exit = true;
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_cookie_line, "stdin should have been echoed by cat");
        assert!(saw_exit);
        assert!(handle.has_exited());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_terminates_long_running_process() {
        // `cat` with stdin open after the cookie write would exit on EOF, so
        // use `sleep` via a shim to get a process that ignores nothing but
        // signals (the shim also swallows the launcher's argv).
        let dir = tempfile::tempdir().unwrap();
        let launcher =
            OpenconnectLauncher::new(shim_binary(&dir, "exec sleep 30"), Duration::from_secs(2));

        let artifact = AuthArtifact::new("unused".to_string(), None);
        let mut handle = launcher.start(&test_profile(), artifact).await.unwrap();
        assert!(!handle.has_exited());

        launcher.stop(&mut handle).await.unwrap();
        assert!(handle.has_exited());
        assert!(!process_exists(handle.pid()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reap_orphan_kills_recorded_pid() {
        let mut child = std::process::Command::new("/bin/sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id();
        assert!(process_exists(pid));

        // Reap the zombie as soon as the child dies, as init would for a
        // true orphan; otherwise the pid probe keeps succeeding
        std::thread::spawn(move || {
            let _ = child.wait();
        });

        assert!(reap_orphan(pid, Duration::from_secs(2)).await);
        assert!(!process_exists(pid));
    }

    #[tokio::test]
    async fn test_reap_orphan_gone_pid_is_ok() {
        // A pid far outside the normal range should not exist
        #[cfg(unix)]
        assert!(reap_orphan(4_000_000, Duration::from_millis(100)).await);
    }
}
