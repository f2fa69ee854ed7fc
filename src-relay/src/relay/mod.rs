// Relay between browser extensions and the focus app
// This module is shared between the daemon and host bridge binaries

pub mod authority;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod framing;
pub mod host;
pub mod peer;
pub mod protocol;
pub mod router;
pub mod server;
