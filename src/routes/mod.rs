//! Split-tunnel route planning and application
//!
//! Computes the rule set for a profile's policy, applies it once the tunnel
//! interface is up, and guarantees removal on teardown. Rules carry an origin
//! marker so recovery never touches pre-existing system routes.

pub mod table;

use crate::profile::{Cidr, SplitTunnelPolicy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub use table::{RouteTable, SystemRouteTable, TableError};

#[derive(Error, Debug)]
pub enum RouteError {
    #[error("Failed to apply route {rule}: {source}")]
    Apply {
        rule: String,
        #[source]
        source: TableError,
    },
    #[error("Failed to remove {count} route(s) during revert: {summary}")]
    Revert { count: usize, summary: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteAction {
    /// Route the range over the tunnel interface
    Include,
    /// Pin the range to the physical interface
    Exclude,
}

/// Who installed a rule; teardown removes only orchestrator-owned rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteOrigin {
    Orchestrator,
    Preexisting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    pub cidr: Cidr,
    pub action: RouteAction,
    pub interface: String,
    pub origin: RouteOrigin,
}

impl fmt::Display for RouteRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = match self.action {
            RouteAction::Include => "include",
            RouteAction::Exclude => "exclude",
        };
        write!(f, "{} {} via {}", action, self.cidr, self.interface)
    }
}

/// Compute the rule set for a policy.
///
/// All-traffic policies need no explicit rules (the client installs the
/// default route). For split policies, include ranges go over the tunnel
/// interface and exclude ranges over the physical one. An include covered by
/// an exclude (identical or broader) resolves to exclude; the plan is ordered
/// most-specific-first so narrower prefixes land before wider ones.
pub fn plan_routes(
    policy: &SplitTunnelPolicy,
    tunnel_if: &str,
    physical_if: &str,
) -> Vec<RouteRule> {
    let (include, exclude) = match policy {
        SplitTunnelPolicy::AllTraffic => return Vec::new(),
        SplitTunnelPolicy::Split { include, exclude } => (include, exclude),
    };

    let mut rules: Vec<RouteRule> = Vec::new();

    for cidr in include {
        if let Some(covering) = exclude.iter().find(|e| e.contains(cidr)) {
            warn!("{} is covered by exclude {}, excluding it", cidr, covering);
            continue;
        }
        rules.push(RouteRule {
            cidr: *cidr,
            action: RouteAction::Include,
            interface: tunnel_if.to_string(),
            origin: RouteOrigin::Orchestrator,
        });
    }

    for cidr in exclude {
        rules.push(RouteRule {
            cidr: *cidr,
            action: RouteAction::Exclude,
            interface: physical_if.to_string(),
            origin: RouteOrigin::Orchestrator,
        });
    }

    rules.sort_by(|a, b| b.cidr.prefix().cmp(&a.cidr.prefix()));
    rules.dedup();
    rules
}

/// The rules a session has actually installed.
///
/// Draining on revert makes a second revert a no-op.
#[derive(Debug, Default)]
pub struct AppliedRoutes {
    rules: Vec<RouteRule>,
}

impl AppliedRoutes {
    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn from_rules(rules: Vec<RouteRule>) -> Self {
        Self { rules }
    }
}

/// Applies and reverts split-tunnel rule sets
pub struct RouteManager {
    table: Arc<dyn RouteTable>,
}

impl RouteManager {
    pub fn new(table: Arc<dyn RouteTable>) -> Self {
        Self { table }
    }

    /// Apply a plan in order. Any failure rolls back rules already applied
    /// and fails the whole apply; a partially split-tunneled session is
    /// worse than a failed one.
    pub async fn apply(&self, plan: Vec<RouteRule>) -> Result<AppliedRoutes, RouteError> {
        let mut applied = AppliedRoutes::default();

        for rule in plan {
            info!("Applying route: {}", rule);
            match self.table.add(&rule).await {
                Ok(()) => applied.rules.push(rule),
                Err(e) => {
                    warn!("Route apply failed at {}: {}, rolling back", rule, e);
                    let _ = self.revert(&mut applied).await;
                    return Err(RouteError::Apply {
                        rule: rule.to_string(),
                        source: e,
                    });
                }
            }
        }

        Ok(applied)
    }

    /// Best-effort removal of everything in `applied`. Idempotent: the set
    /// is drained even when individual removals fail, and failures are
    /// aggregated into the error rather than stopping the sweep.
    pub async fn revert(&self, applied: &mut AppliedRoutes) -> Result<(), RouteError> {
        if applied.rules.is_empty() {
            return Ok(());
        }

        let mut failures: Vec<String> = Vec::new();

        for rule in applied.rules.drain(..) {
            if rule.origin != RouteOrigin::Orchestrator {
                continue;
            }
            info!("Removing route: {}", rule);
            if let Err(e) = self.table.remove(&rule).await {
                warn!("Route removal failed for {}: {}", rule, e);
                failures.push(format!("{}: {}", rule, e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(RouteError::Revert {
                count: failures.len(),
                summary: failures.join("; "),
            })
        }
    }
}
