//! Recovery state persistence
//!
//! Tracks the running client pid and the orchestrator-owned routes so a
//! crashed service can clean up after itself on the next start. The state
//! file exists only while a session holds resources; clean teardown deletes
//! it.
//!
//! # State File Format
//!
//! ```json
//! {
//!   "version": 1,
//!   "pid": 4242,
//!   "tunnel_device": "tun0",
//!   "routes": [
//!     {"cidr": "10.0.0.0/8", "action": "Include", "interface": "tun0", "origin": "Orchestrator"}
//!   ],
//!   "connected_at": "1755900000"
//! }
//! ```

use crate::launcher;
use crate::routes::{AppliedRoutes, RouteManager, RouteRule, RouteTable};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Failed to read state file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse state file: {0}")]
    ParseError(#[from] serde_json::Error),
}

/// Resources a session holds, persisted for crash recovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryState {
    /// State file format version
    pub version: u32,
    /// Pid of the running client subprocess
    pub pid: u32,
    /// Tunnel device, once known
    pub tunnel_device: Option<String>,
    /// Orchestrator-owned routes currently applied
    pub routes: Vec<RouteRule>,
    /// When the session started (unix seconds)
    pub connected_at: String,
}

impl RecoveryState {
    pub fn new(pid: u32) -> Self {
        Self {
            version: 1,
            pid,
            tunnel_device: None,
            routes: vec![],
            connected_at: unix_now(),
        }
    }

    fn file_path(state_dir: &Path) -> PathBuf {
        state_dir.join("state.json")
    }

    pub fn load(state_dir: &Path) -> Result<Option<Self>, StateError> {
        let path = Self::file_path(state_dir);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        let state: RecoveryState = serde_json::from_str(&content)?;
        Ok(Some(state))
    }

    pub fn save(&self, state_dir: &Path) -> Result<(), StateError> {
        fs::create_dir_all(state_dir)?;
        let content = serde_json::to_string_pretty(self)?;
        fs::write(Self::file_path(state_dir), content)?;
        Ok(())
    }

    pub fn delete(state_dir: &Path) -> Result<(), StateError> {
        let path = Self::file_path(state_dir);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }
}

/// Clean up after a previous crash before accepting any new connection.
///
/// If a state file is present, the recorded client process is reaped and the
/// recorded orchestrator-owned routes are removed best-effort, then the file
/// is deleted. Returns true when orphaned resources were found.
pub async fn recover(
    state_dir: &Path,
    table: Arc<dyn RouteTable>,
    grace: Duration,
) -> Result<bool, StateError> {
    let Some(state) = RecoveryState::load(state_dir)? else {
        return Ok(false);
    };

    warn!(
        "Orphaned resources detected from a previous run (pid {}, {} routes)",
        state.pid,
        state.routes.len()
    );

    if !launcher::reap_orphan(state.pid, grace).await {
        warn!("Could not confirm orphan pid {} is gone", state.pid);
    }

    if !state.routes.is_empty() {
        let manager = RouteManager::new(table);
        let mut applied = AppliedRoutes::from_rules(state.routes);
        if let Err(e) = manager.revert(&mut applied).await {
            warn!("Orphaned route cleanup incomplete: {}", e);
        }
    }

    RecoveryState::delete(state_dir)?;
    info!("Recovery complete");
    Ok(true)
}

fn unix_now() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}", duration.as_secs())
}
