//! saml-vpn - SSO session orchestrator for OpenConnect-style VPN clients
//!
//! This crate drives an external VPN client binary through a browser-based
//! SSO login, applies split-tunnel routes once the tunnel is up, and exposes
//! the whole session over a local control socket. The VPN client never sees
//! the browser and the browser never sees the routing table; the orchestrator
//! sits between them and owns the session lifecycle.
//!
//! # Architecture
//!
//! - `config`: Service configuration (TOML)
//! - `profile`: VPN endpoint profiles and split-tunnel policies
//! - `auth`: SSO prelogin and automated browser login
//! - `launcher`: VPN client subprocess lifecycle and output classification
//! - `routes`: Split-tunnel route planning and application
//! - `session`: The session state machine
//! - `ipc`: Control socket (unix domain socket, length-prefixed JSON)
//! - `state`: Crash-recovery state file
//!
//! # Usage
//!
//! Run the service, then drive it from another terminal:
//! ```bash
//! saml-vpn serve
//! saml-vpn connect vpn-main
//! saml-vpn watch
//! saml-vpn disconnect
//! ```

pub mod auth;
pub mod config;
pub mod ipc;
pub mod launcher;
pub mod profile;
pub mod routes;
pub mod session;
pub mod state;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::Config;
pub use profile::{Profile, ProfileStore};
pub use session::{Orchestrator, SessionState, StatusEvent};
