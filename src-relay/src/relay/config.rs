// Environment configuration helpers for the relay
// Handles platform-specific paths for the socket, PID file, and log file

use std::path::PathBuf;

/// Environment variable overriding the runtime directory
pub const RELAY_DIR_ENV: &str = "FOCUS_RELAY_DIR";

/// Environment variable enabling an append-only log file
pub const LOG_FILE_ENV: &str = "FOCUS_RELAY_LOG_FILE";

/// Configuration for relay paths
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for runtime files (socket, PID)
    pub runtime_dir: PathBuf,
    /// Path to the per-user Unix socket
    pub socket_path: PathBuf,
    /// Path to the daemon PID file
    pub pid_file: PathBuf,
    /// Optional log file (stderr is always used)
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// Per-user default layout
    pub fn default_paths() -> Self {
        Self::in_dir(Self::default_runtime_dir())
    }

    /// Layout from `FOCUS_RELAY_DIR` and `FOCUS_RELAY_LOG_FILE`, else the default
    pub fn from_env() -> Self {
        Self::from_vars(
            std::env::var(RELAY_DIR_ENV).ok(),
            std::env::var(LOG_FILE_ENV).ok(),
        )
    }

    /// Build from the values of `RELAY_DIR_ENV` and `LOG_FILE_ENV`; empty counts as unset
    pub fn from_vars(relay_dir: Option<String>, log_file: Option<String>) -> Self {
        let mut config = match relay_dir.filter(|dir| !dir.is_empty()) {
            Some(dir) => Self::in_dir(PathBuf::from(dir)),
            None => Self::default_paths(),
        };
        config.log_file = log_file.filter(|s| !s.is_empty()).map(PathBuf::from);
        config
    }

    /// Lay out every runtime file under `runtime_dir`
    pub fn in_dir(runtime_dir: PathBuf) -> Self {
        Self {
            socket_path: runtime_dir.join(socket_file_name(current_uid())),
            pid_file: runtime_dir.join("relay.pid"),
            runtime_dir,
            log_file: None,
        }
    }

    fn default_runtime_dir() -> PathBuf {
        #[cfg(target_os = "linux")]
        {
            // Linux: prefer XDG_RUNTIME_DIR if set, else fall back to home
            if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
                return PathBuf::from(runtime_dir).join("focus-relay");
            }
        }

        dirs::home_dir()
            .map(|h| h.join(".focus-relay"))
            .unwrap_or_else(|| PathBuf::from("/tmp/focus-relay"))
    }

    /// Create the runtime directory, readable by its owner only
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        std::fs::create_dir_all(&self.runtime_dir)?;
        let owner_only = std::fs::Permissions::from_mode(0o700);
        std::fs::set_permissions(&self.runtime_dir, owner_only)
    }

    /// Record this process as the running relay
    pub fn write_pid(&self) -> std::io::Result<()> {
        self.ensure_dirs()?;
        std::fs::write(&self.pid_file, format!("{}\n", std::process::id()))
    }

    /// PID of the recorded relay, if the file exists and parses
    pub fn read_pid(&self) -> Option<u32> {
        let content = std::fs::read_to_string(&self.pid_file).ok()?;
        content.trim().parse().ok()
    }

    pub fn remove_pid(&self) -> std::io::Result<()> {
        match std::fs::remove_file(&self.pid_file) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    /// Whether a socket file is present; says nothing about a listener
    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }
}

/// Socket file name for a given numeric user id
pub fn socket_file_name(uid: u32) -> String {
    format!("relay-{}.sock", uid)
}

/// Numeric id of the user owning this process
pub fn current_uid() -> u32 {
    // SAFETY: getuid has no preconditions and cannot fail.
    unsafe { libc::getuid() }
}
