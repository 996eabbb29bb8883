//! Well-known locations shared by the daemon and its clients.

use std::path::PathBuf;

/// Process name the liveness check looks for.
pub const DAEMON_NAME: &str = "haggle";

/// Executable name of the daemon binary.
pub const DAEMON_EXECUTABLE: &str = "haggled";

const PID_FILE_NAME: &str = "haggle.pid";

/// Private daemon directory: `$HOME/.haggle`, or the temp dir when HOME is unset.
pub fn data_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".haggle"),
        None => std::env::temp_dir().join("haggle"),
    }
}

pub fn default_pid_file() -> PathBuf {
    data_dir().join(PID_FILE_NAME)
}

pub fn default_storage_dir() -> PathBuf {
    data_dir().join("storage")
}

/// Places to look for the daemon executable when no path is given.
pub fn default_daemon_paths() -> Vec<PathBuf> {
    let mut out = vec![
        PathBuf::from(".").join(DAEMON_EXECUTABLE),
        PathBuf::from("./bin").join(DAEMON_EXECUTABLE),
    ];
    for dir in ["/usr/bin", "/usr/local/bin", "/opt/bin", "/opt/local/bin"] {
        out.push(PathBuf::from(dir).join(DAEMON_EXECUTABLE));
    }
    out
}

/// Config file candidates for `file_name`, most specific first.
pub fn config_paths(file_name: &str) -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/haggle").join(file_name));
    }
    out.push(PathBuf::from("/etc/haggle").join(file_name));
    out
}
