// Error types for the relay
//
// Transport and frame errors stay inside a single connection. Only
// `RelayError` surfaces to whoever calls `RelayServer::start`.

use std::io;
use std::path::PathBuf;

use super::protocol::MAX_FRAME_SIZE;

/// Errors produced by a framed channel
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The stream reached EOF or the channel was marked must-close
    #[error("channel closed")]
    Closed,

    #[error("i/o error on channel: {0}")]
    Io(#[from] io::Error),

    /// Length prefix outside `(0, MAX_FRAME_SIZE)`
    #[error("invalid frame length {0} (must be between 1 and {max})", max = MAX_FRAME_SIZE - 1)]
    InvalidLength(u32),

    /// Outgoing message serializes to a body that cannot be framed
    #[error("message too large to frame: {0} bytes")]
    TooLarge(usize),

    /// Body is not a JSON object carrying a string `type`
    #[error("malformed frame body: {0}")]
    Malformed(String),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl FrameError {
    /// Whether the error ends the connection rather than a single frame
    pub fn is_fatal(&self) -> bool {
        matches!(self, FrameError::Closed | FrameError::Io(_))
    }
}

/// Errors surfaced while starting the relay server
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("relay is already listening")]
    AlreadyListening,

    /// Another live process answered the connect probe on the endpoint
    #[error("another relay instance owns {}", .0.display())]
    AlreadyRunning(PathBuf),

    #[error("failed to remove stale endpoint {}: {source}", path.display())]
    StaleCleanup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind {}: {source}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(FrameError::Closed.is_fatal());
        assert!(FrameError::Io(io::Error::from(io::ErrorKind::BrokenPipe)).is_fatal());
        assert!(!FrameError::InvalidLength(0).is_fatal());
        assert!(!FrameError::TooLarge(2_000_000).is_fatal());
        assert!(!FrameError::Malformed("not an object".to_string()).is_fatal());
    }

    #[test]
    fn test_invalid_length_message_mentions_bounds() {
        let message = FrameError::InvalidLength(0).to_string();
        assert!(message.contains("999999"), "got: {}", message);
    }
}
