use super::polling::{wait_for_file_content, WaitError};
use serde_json::{Map, Value};
use std::fmt;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use focus_relay_lib::relay::config::RELAY_DIR_ENV;
use focus_relay_lib::relay::protocol::encode_frame;

const READY_TIMEOUT: Duration = Duration::from_secs(5);
const EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// RAII wrapper around a spawned `focus-relay-daemon`
pub struct DaemonGuard {
    child: Child,
    runtime_dir: PathBuf,
}

impl DaemonGuard {
    /// Start the daemon in `runtime_dir` and wait for its PID file
    pub fn start(runtime_dir: &Path) -> Result<Self, DaemonError> {
        let child = Command::new(env!("CARGO_BIN_EXE_focus-relay-daemon"))
            .env(RELAY_DIR_ENV, runtime_dir)
            .env("FOCUS_RELAY_LOG", "debug")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(DaemonError::SpawnFailed)?;

        let guard = Self {
            child,
            runtime_dir: runtime_dir.to_path_buf(),
        };
        guard.wait_for_ready().map_err(DaemonError::ReadyTimeout)?;
        Ok(guard)
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    fn wait_for_ready(&self) -> Result<(), WaitError> {
        wait_for_file_content(
            &self.runtime_dir.join("relay.pid"),
            |content| content.trim().parse::<u32>().is_ok(),
            READY_TIMEOUT,
        )
        .map(|_| ())
    }

    /// Send SIGTERM and wait for a clean exit
    pub fn terminate(mut self) -> Option<std::process::ExitStatus> {
        unsafe {
            libc::kill(self.child.id() as i32, libc::SIGTERM);
        }
        wait_with_timeout(&mut self.child, EXIT_TIMEOUT)
    }
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }
        if let Err(err) = self.child.kill() {
            eprintln!("Failed to kill focus-relay-daemon pid {}: {}", self.child.id(), err);
            return;
        }
        let _ = self.child.wait();
    }
}

/// A spawned `focus-relay-host`, spoken to through its stdio
pub struct HostProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    frames: mpsc::Receiver<Map<String, Value>>,
}

impl HostProcess {
    pub fn spawn(runtime_dir: &Path) -> io::Result<Self> {
        let mut child = Command::new(env!("CARGO_BIN_EXE_focus-relay-host"))
            .env(RELAY_DIR_ENV, runtime_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdin = child.stdin.take();
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "host stdout not piped"))?;

        let (tx, frames) = mpsc::channel();
        thread::spawn(move || {
            while let Some(frame) = read_frame(&mut stdout) {
                if tx.send(frame).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            child,
            stdin,
            frames,
        })
    }

    pub fn send(&mut self, message: &Value) -> io::Result<()> {
        let frame = encode_frame(message).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stdin closed"))?;
        stdin.write_all(&frame)?;
        stdin.flush()
    }

    pub fn recv(&self, timeout: Duration) -> Option<Map<String, Value>> {
        self.frames.recv_timeout(timeout).ok()
    }

    /// Close stdin, as the browser does when the extension goes away
    pub fn close_stdin(&mut self) {
        self.stdin.take();
    }

    pub fn wait(&mut self, timeout: Duration) -> Option<std::process::ExitStatus> {
        wait_with_timeout(&mut self.child, timeout)
    }
}

impl Drop for HostProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

fn read_frame(reader: &mut impl Read) -> Option<Map<String, Value>> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len).ok()?;
    let mut body = vec![0u8; u32::from_le_bytes(len) as usize];
    reader.read_exact(&mut body).ok()?;
    serde_json::from_slice(&body).ok()
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Option<std::process::ExitStatus> {
    let started = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) if started.elapsed() < timeout => thread::sleep(Duration::from_millis(20)),
            _ => return None,
        }
    }
}

/// Errors that can occur when starting the daemon for tests
#[derive(Debug)]
pub enum DaemonError {
    SpawnFailed(io::Error),
    ReadyTimeout(WaitError),
}

impl fmt::Display for DaemonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SpawnFailed(err) => write!(f, "failed to spawn focus-relay-daemon: {}", err),
            Self::ReadyTimeout(err) => write!(f, "focus-relay-daemon never became ready: {}", err),
        }
    }
}

impl std::error::Error for DaemonError {}
