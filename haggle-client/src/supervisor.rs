//! Daemon discovery and launch: pid file liveness check, spawn, readiness wait.

use std::fs;
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use haggle_core::paths::DAEMON_NAME;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;

/// What the pid file says about the daemon.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DaemonStatus {
    NotRunning,
    Running(u32),
    /// Pid file left behind by a daemon that is gone.
    Crashed(u32),
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("read pid file {path}: {source}")]
    PidFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("pid file {path} does not hold a pid: {contents:?}")]
    BadPidFile { path: PathBuf, contents: String },
    #[error("no daemon executable found in {0:?}")]
    NotFound(Vec<PathBuf>),
    #[error("spawn {path}: {source}")]
    Spawn {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("daemon not accepting connections after {0:?}")]
    NotReady(Duration),
}

pub struct Supervisor {
    pid_file: PathBuf,
    daemon_path: Option<PathBuf>,
    search_paths: Vec<PathBuf>,
    addr: SocketAddr,
}

impl Supervisor {
    pub fn new(cfg: &ClientConfig) -> Self {
        Self {
            pid_file: cfg.pid_file.clone(),
            daemon_path: cfg.daemon_path.clone(),
            search_paths: cfg.daemon_search_paths.clone(),
            addr: cfg.daemon_addr(),
        }
    }

    pub fn daemon_status(&self) -> Result<DaemonStatus, SupervisorError> {
        let contents = match fs::read_to_string(&self.pid_file) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(DaemonStatus::NotRunning)
            }
            Err(source) => {
                return Err(SupervisorError::PidFile {
                    path: self.pid_file.clone(),
                    source,
                })
            }
        };
        let pid = parse_pid(&contents).ok_or_else(|| SupervisorError::BadPidFile {
            path: self.pid_file.clone(),
            contents: contents.clone(),
        })?;
        if process_alive(pid) {
            Ok(DaemonStatus::Running(pid))
        } else {
            debug!(pid, "stale daemon pid file");
            Ok(DaemonStatus::Crashed(pid))
        }
    }

    /// Pid of the running daemon, 0 when there is none.
    pub fn daemon_pid(&self) -> u32 {
        match self.daemon_status() {
            Ok(DaemonStatus::Running(pid)) => pid,
            Ok(_) => 0,
            Err(e) => {
                warn!(error = %e, "daemon status unknown");
                0
            }
        }
    }

    /// Launch the daemon unless one is running. `path` overrides the configured locations.
    /// Returns the pid of the running or launched daemon; does not wait for it to be ready.
    pub fn spawn(&self, path: Option<&Path>) -> Result<u32, SupervisorError> {
        if let Ok(DaemonStatus::Running(pid)) = self.daemon_status() {
            return Ok(pid);
        }
        let exe = match path.or(self.daemon_path.as_deref()) {
            Some(p) => p.to_path_buf(),
            None => self
                .search_paths
                .iter()
                .find(|p| p.is_file())
                .cloned()
                .ok_or_else(|| SupervisorError::NotFound(self.search_paths.clone()))?,
        };
        let mut child = Command::new(&exe)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                path: exe.clone(),
                source,
            })?;
        let pid = child.id();
        info!(pid, path = %exe.display(), "daemon launched");
        // Reap the child when it exits so it does not linger as a zombie.
        let _ = std::thread::Builder::new()
            .name("haggle-daemon-reaper".into())
            .spawn(move || {
                let _ = child.wait();
            });
        Ok(pid)
    }

    /// Poll the daemon endpoint until it accepts a connection.
    pub fn wait_ready(&self, timeout: Duration) -> Result<(), SupervisorError> {
        let deadline = Instant::now() + timeout;
        loop {
            let attempt = deadline
                .saturating_duration_since(Instant::now())
                .clamp(Duration::from_millis(1), Duration::from_millis(250));
            if TcpStream::connect_timeout(&self.addr, attempt).is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(SupervisorError::NotReady(timeout));
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

fn parse_pid(contents: &str) -> Option<u32> {
    let pid = contents.trim().parse::<u32>().ok()?;
    (pid > 0 && pid <= i32::MAX as u32).then_some(pid)
}

/// Signal-0 liveness check; on Linux the process must also look like the daemon.
#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) | Err(Errno::EPERM) => {}
        Err(_) => return false,
    }
    if cfg!(target_os = "linux") {
        return match fs::read(format!("/proc/{pid}/cmdline")) {
            Ok(cmdline) => cmdline
                .windows(DAEMON_NAME.len())
                .any(|w| w == DAEMON_NAME.as_bytes()),
            Err(_) => false,
        };
    }
    true
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}
