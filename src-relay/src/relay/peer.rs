//! Peer identity resolution.
//!
//! The socket tells us which process is on the other end. That process is
//! usually a native-messaging host spawned by a browser, so the interesting
//! identity is its parent application. One intermediary layer (a shell or
//! launcher wrapper between the browser and the host) is tolerated.

use serde::{Deserialize, Serialize};
use tokio::net::UnixStream;

/// Binary name of the native-messaging host bridge
pub const HOST_BINARY_NAME: &str = "focus-relay-host";

/// Process names that are never the application behind a connection
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
const NON_APPLICATION_NAMES: &[&str] = &[
    "sh", "bash", "dash", "zsh", "fish", "env", "nohup", "login", "sudo", "init", "systemd",
    "launchd", HOST_BINARY_NAME,
];

/// Application resolved as the originator of a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerIdentity {
    /// Human-readable application name, e.g. "Google Chrome"
    pub name: String,
    /// Stable identifier: bundle path on macOS, executable path elsewhere
    pub identifier: String,
    /// Pid of the application process
    pub pid: u32,
}

/// Name and identifier of a running application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInfo {
    pub name: String,
    pub identifier: String,
}

/// Read access to the OS process table
pub trait ProcessTable {
    fn parent_pid(&self, pid: u32) -> Option<u32>;

    /// Application metadata for `pid`, or `None` if it is not an application
    fn application(&self, pid: u32) -> Option<AppInfo>;
}

/// Walks process ancestry from a connected socket to its application
#[derive(Debug, Default, Clone)]
pub struct PeerResolver<T = OsProcessTable> {
    table: T,
}

impl PeerResolver<OsProcessTable> {
    pub fn new() -> Self {
        Self {
            table: OsProcessTable,
        }
    }
}

impl<T: ProcessTable> PeerResolver<T> {
    pub fn with_table(table: T) -> Self {
        Self { table }
    }

    /// Resolve starting from the pid of the socket peer
    pub fn resolve_pid(&self, peer_pid: u32) -> Option<PeerIdentity> {
        let parent = self.parent_of(peer_pid)?;
        if let Some(app) = self.table.application(parent) {
            return Some(identity(app, parent));
        }

        let grandparent = self.parent_of(parent)?;
        self.table
            .application(grandparent)
            .map(|app| identity(app, grandparent))
    }

    fn parent_of(&self, pid: u32) -> Option<u32> {
        self.table.parent_pid(pid).filter(|&ppid| ppid != 0)
    }
}

fn identity(app: AppInfo, pid: u32) -> PeerIdentity {
    PeerIdentity {
        name: app.name,
        identifier: app.identifier,
        pid,
    }
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn is_non_application(name: &str) -> bool {
    NON_APPLICATION_NAMES.contains(&name)
}

/// Pid of the process on the other end of a Unix socket
pub fn peer_pid(stream: &UnixStream) -> Option<u32> {
    let cred = stream.peer_cred().ok()?;
    cred.pid().filter(|&pid| pid > 0).map(|pid| pid as u32)
}

/// Process table backed by the running OS
#[derive(Debug, Default, Clone, Copy)]
pub struct OsProcessTable;

#[cfg(target_os = "linux")]
impl ProcessTable for OsProcessTable {
    fn parent_pid(&self, pid: u32) -> Option<u32> {
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
        parse_stat_ppid(&stat)
    }

    fn application(&self, pid: u32) -> Option<AppInfo> {
        let comm = std::fs::read_to_string(format!("/proc/{}/comm", pid)).ok()?;
        let name = comm.trim().to_string();
        let exe = std::fs::read_link(format!("/proc/{}/exe", pid)).ok()?;

        let exe_name = exe
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if name.is_empty() || is_non_application(&name) || is_non_application(&exe_name) {
            return None;
        }

        Some(AppInfo {
            name,
            identifier: exe.to_string_lossy().into_owned(),
        })
    }
}

#[cfg(target_os = "macos")]
impl ProcessTable for OsProcessTable {
    fn parent_pid(&self, pid: u32) -> Option<u32> {
        let mut info: libc::proc_bsdinfo = unsafe { std::mem::zeroed() };
        let size = std::mem::size_of::<libc::proc_bsdinfo>() as libc::c_int;

        // SAFETY: `info` is a valid buffer of `size` bytes.
        let written = unsafe {
            libc::proc_pidinfo(
                pid as libc::c_int,
                libc::PROC_PIDTBSDINFO,
                0,
                &mut info as *mut libc::proc_bsdinfo as *mut libc::c_void,
                size,
            )
        };

        if written != size {
            return None;
        }
        Some(info.pbi_ppid)
    }

    fn application(&self, pid: u32) -> Option<AppInfo> {
        let mut buf = vec![0u8; libc::PROC_PIDPATHINFO_MAXSIZE as usize];

        // SAFETY: `buf` is valid for writes of its full length.
        let len = unsafe {
            libc::proc_pidpath(
                pid as libc::c_int,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len() as u32,
            )
        };
        if len <= 0 {
            return None;
        }
        buf.truncate(len as usize);

        let exe = std::path::PathBuf::from(String::from_utf8_lossy(&buf).into_owned());
        app_bundle_of(&exe)
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
impl ProcessTable for OsProcessTable {
    fn parent_pid(&self, _pid: u32) -> Option<u32> {
        None
    }

    fn application(&self, _pid: u32) -> Option<AppInfo> {
        None
    }
}

/// Extract the ppid from the contents of `/proc/<pid>/stat`.
///
/// The command name is wrapped in parentheses and may itself contain spaces
/// or parentheses, so fields are counted from the last `)`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_stat_ppid(stat: &str) -> Option<u32> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    let mut fields = after_comm.split_whitespace();
    let _state = fields.next()?;
    fields.next()?.parse().ok()
}

/// Outermost `.app` bundle containing `exe`.
///
/// Browser helper processes live in nested bundles; the outermost one is the
/// application the user sees.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn app_bundle_of(exe: &std::path::Path) -> Option<AppInfo> {
    let mut bundle = std::path::PathBuf::new();
    for component in exe.components() {
        bundle.push(component);
        let is_app = bundle
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("app"))
            .unwrap_or(false);
        if is_app {
            let name = bundle.file_stem()?.to_string_lossy().into_owned();
            return Some(AppInfo {
                name,
                identifier: bundle.to_string_lossy().into_owned(),
            });
        }
    }
    None
}
