//! Control interface over a unix domain socket
//!
//! The service owns the socket; CLI subcommands are thin clients. The wire
//! format is length-prefixed JSON ([`protocol`]), so any controller that can
//! speak it (a GUI, a status bar applet) can drive the service.

pub mod protocol;

#[cfg(unix)]
pub mod client;
#[cfg(unix)]
pub mod server;
