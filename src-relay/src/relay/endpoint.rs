// Local socket endpoint: stale detection and binding
//
// A leftover socket file is only deleted after a connect attempt against it
// fails, which proves no live relay owns it.

use std::io;
use std::os::unix::net::UnixStream;
use std::path::Path;

use tokio::net::UnixSocket;
use tracing::{info, warn};

use super::error::RelayError;

/// Pending-connection backlog for the relay socket
pub const LISTEN_BACKLOG: u32 = 5;

/// State of the endpoint path before binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// Nothing at the path
    Absent,
    /// A file exists but nobody accepts connections on it
    Stale,
    /// Another process is listening
    Live,
}

pub fn probe(path: &Path) -> Probe {
    if std::fs::symlink_metadata(path).is_err() {
        return Probe::Absent;
    }
    match UnixStream::connect(path) {
        Ok(_) => Probe::Live,
        Err(_) => Probe::Stale,
    }
}

/// Remove a stale endpoint; refuse if a live relay answers
pub fn clear_stale(path: &Path) -> Result<(), RelayError> {
    match probe(path) {
        Probe::Absent => Ok(()),
        Probe::Live => Err(RelayError::AlreadyRunning(path.to_path_buf())),
        Probe::Stale => {
            warn!("Removing stale relay socket {}", path.display());
            std::fs::remove_file(path).map_err(|source| RelayError::StaleCleanup {
                path: path.to_path_buf(),
                source,
            })
        }
    }
}

/// Bind and listen on `path` with owner-only permissions.
///
/// Must be called from within a tokio runtime.
pub fn bind(path: &Path, backlog: u32) -> Result<tokio::net::UnixListener, RelayError> {
    let bind_err = |source: io::Error| RelayError::Bind {
        path: path.to_path_buf(),
        source,
    };

    let socket = UnixSocket::new_stream().map_err(bind_err)?;
    socket.bind(path).map_err(bind_err)?;
    let listener = socket.listen(backlog).map_err(bind_err)?;

    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(bind_err)?;
    }

    info!("Relay listening on {}", path.display());
    Ok(listener)
}
