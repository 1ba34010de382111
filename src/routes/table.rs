//! OS routing table access
//!
//! Thin seam over the platform route tool. Every call is independently
//! fallible; no multi-rule transaction is assumed from the OS.

use super::RouteRule;
use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Error, Debug)]
pub enum TableError {
    #[error("Failed to add route: {0}")]
    Add(String),
    #[error("Failed to delete route: {0}")]
    Delete(String),
    #[error("Unsupported platform")]
    UnsupportedPlatform,
}

/// Platform-agnostic routing table interface
#[async_trait]
pub trait RouteTable: Send + Sync {
    async fn add(&self, rule: &RouteRule) -> Result<(), TableError>;
    async fn remove(&self, rule: &RouteRule) -> Result<(), TableError>;
}

/// Real routing table, driven through the platform route tool
pub struct SystemRouteTable;

impl SystemRouteTable {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SystemRouteTable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RouteTable for SystemRouteTable {
    #[cfg(target_os = "linux")]
    async fn add(&self, rule: &RouteRule) -> Result<(), TableError> {
        run_route_tool(
            "ip",
            &[
                "route",
                "replace",
                &rule.cidr.to_string(),
                "dev",
                &rule.interface,
            ],
            TableError::Add,
        )
        .await
    }

    #[cfg(target_os = "linux")]
    async fn remove(&self, rule: &RouteRule) -> Result<(), TableError> {
        run_route_tool(
            "ip",
            &[
                "route",
                "del",
                &rule.cidr.to_string(),
                "dev",
                &rule.interface,
            ],
            TableError::Delete,
        )
        .await
    }

    #[cfg(target_os = "macos")]
    async fn add(&self, rule: &RouteRule) -> Result<(), TableError> {
        run_route_tool(
            "route",
            &[
                "-n",
                "add",
                "-net",
                &rule.cidr.to_string(),
                "-interface",
                &rule.interface,
            ],
            TableError::Add,
        )
        .await
    }

    #[cfg(target_os = "macos")]
    async fn remove(&self, rule: &RouteRule) -> Result<(), TableError> {
        run_route_tool(
            "route",
            &["-n", "delete", "-net", &rule.cidr.to_string()],
            TableError::Delete,
        )
        .await
    }

    #[cfg(target_os = "windows")]
    async fn add(&self, rule: &RouteRule) -> Result<(), TableError> {
        run_route_tool(
            "route",
            &[
                "add",
                &rule.cidr.addr().to_string(),
                "mask",
                &rule.cidr.netmask().to_string(),
                "0.0.0.0",
                "IF",
                &rule.interface,
            ],
            TableError::Add,
        )
        .await
    }

    #[cfg(target_os = "windows")]
    async fn remove(&self, rule: &RouteRule) -> Result<(), TableError> {
        run_route_tool(
            "route",
            &[
                "delete",
                &rule.cidr.addr().to_string(),
                "mask",
                &rule.cidr.netmask().to_string(),
            ],
            TableError::Delete,
        )
        .await
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    async fn add(&self, _rule: &RouteRule) -> Result<(), TableError> {
        Err(TableError::UnsupportedPlatform)
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    async fn remove(&self, _rule: &RouteRule) -> Result<(), TableError> {
        Err(TableError::UnsupportedPlatform)
    }
}

#[allow(dead_code)]
async fn run_route_tool(
    program: &str,
    args: &[&str],
    wrap: fn(String) -> TableError,
) -> Result<(), TableError> {
    debug!("Executing: {} {}", program, args.join(" "));

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| wrap(e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(wrap(stderr.trim().to_string()));
    }

    Ok(())
}
