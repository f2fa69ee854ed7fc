use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use focus_relay_lib::relay::server::RelayServer;

const INITIAL_DELAY: Duration = Duration::from_millis(20);
const MAX_DELAY: Duration = Duration::from_millis(500);

/// A runtime file never reached the expected state
#[derive(Debug)]
pub struct WaitError {
    path: PathBuf,
    attempts: u32,
    waited: Duration,
    last_content: Option<String>,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gave up on {} after {} attempts over {:?} (last content: {})",
            self.path.display(),
            self.attempts,
            self.waited,
            self.last_content
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or("<missing>")
        )
    }
}

impl std::error::Error for WaitError {}

/// Poll `path` with exponential backoff until `predicate` accepts its content
pub fn wait_for_file_content<F>(
    path: &Path,
    predicate: F,
    timeout: Duration,
) -> Result<String, WaitError>
where
    F: Fn(&str) -> bool,
{
    let started = Instant::now();
    let mut delay = INITIAL_DELAY;
    let mut attempts = 0;
    let mut last_content = None;

    loop {
        attempts += 1;
        if let Ok(content) = fs::read_to_string(path) {
            if predicate(&content) {
                return Ok(content);
            }
            last_content = Some(content);
        }

        let remaining = timeout.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(WaitError {
                path: path.to_path_buf(),
                attempts,
                waited: started.elapsed(),
                last_content,
            });
        }
        thread::sleep(delay.min(remaining));
        delay = (delay * 2).min(MAX_DELAY);
    }
}

/// Poll until `path` no longer exists
pub fn wait_for_removal(path: &Path, timeout: Duration) -> bool {
    let started = Instant::now();
    while path.exists() {
        if started.elapsed() >= timeout {
            return false;
        }
        thread::sleep(INITIAL_DELAY);
    }
    true
}

/// Wait until the relay's registry holds exactly `expected` connections
pub async fn wait_for_connections(server: &RelayServer, expected: usize) {
    let started = Instant::now();
    loop {
        let count = server.connection_count();
        if count == expected {
            return;
        }
        if started.elapsed() >= Duration::from_secs(3) {
            panic!(
                "expected {} registered connections, still {} after {:?}",
                expected,
                count,
                started.elapsed()
            );
        }
        tokio::time::sleep(INITIAL_DELAY).await;
    }
}
