//! Client configuration: where the daemon is, and how patient to be with it.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use haggle_core::{paths, DEFAULT_PORT};
use serde::Deserialize;
use tracing::warn;

pub const CONFIG_FILE: &str = "client.toml";

/// File: ~/.config/haggle/client.toml or /etc/haggle/client.toml.
/// Env overrides: HAGGLE_PORT, HAGGLE_PID_FILE, HAGGLE_DAEMON_PATH.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    /// Daemon application port (default 8787).
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "paths::default_pid_file")]
    pub pid_file: PathBuf,
    /// Explicit daemon executable; takes precedence over the search paths.
    #[serde(default)]
    pub daemon_path: Option<PathBuf>,
    #[serde(default = "paths::default_daemon_paths")]
    pub daemon_search_paths: Vec<PathBuf>,
    /// Pause between force-unregistering a busy name and registering again.
    #[serde(default = "default_busy_backoff_ms")]
    pub busy_backoff_ms: u64,
    /// Upper bound on any request/reply round trip.
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_busy_backoff_ms() -> u64 {
    2000
}
fn default_reply_timeout_ms() -> u64 {
    10_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            pid_file: paths::default_pid_file(),
            daemon_path: None,
            daemon_search_paths: paths::default_daemon_paths(),
            busy_backoff_ms: default_busy_backoff_ms(),
            reply_timeout_ms: default_reply_timeout_ms(),
        }
    }
}

impl ClientConfig {
    /// Config pointing at a daemon listening on `addr`, everything else default.
    pub fn for_addr(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip(),
            port: addr.port(),
            ..Self::default()
        }
    }

    pub fn daemon_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn busy_backoff(&self) -> Duration {
        Duration::from_millis(self.busy_backoff_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Load config: default, then the first config file found, then env vars.
pub fn load() -> ClientConfig {
    let found = paths::config_paths(CONFIG_FILE)
        .into_iter()
        .find(|p| p.exists());
    let mut c = match found {
        Some(p) => load_from(&p).unwrap_or_else(|e| {
            warn!(error = %e, "ignoring config file");
            ClientConfig::default()
        }),
        None => ClientConfig::default(),
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

pub fn load_from(path: &Path) -> Result<ClientConfig, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn apply_env(c: &mut ClientConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("HAGGLE_PORT") {
        match s.parse::<u16>() {
            Ok(p) => c.port = p,
            Err(_) => warn!(value = %s, "HAGGLE_PORT is not a port number"),
        }
    }
    if let Some(s) = var("HAGGLE_PID_FILE") {
        c.pid_file = PathBuf::from(s);
    }
    if let Some(s) = var("HAGGLE_DAEMON_PATH") {
        c.daemon_path = Some(PathBuf::from(s));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = ClientConfig::default();
        assert_eq!(c.daemon_addr(), "127.0.0.1:8787".parse().unwrap());
        assert_eq!(c.busy_backoff(), Duration::from_secs(2));
        assert!(c.daemon_path.is_none());
        assert!(c
            .daemon_search_paths
            .iter()
            .any(|p| p == Path::new("/usr/local/bin/haggled")));
    }

    #[test]
    fn parse_file() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &p,
            "port = 9001\ndaemon_path = \"/opt/haggle/haggled\"\nbusy_backoff_ms = 10\n",
        )
        .unwrap();
        let c = load_from(&p).unwrap();
        assert_eq!(c.port, 9001);
        assert_eq!(c.daemon_path, Some(PathBuf::from("/opt/haggle/haggled")));
        assert_eq!(c.busy_backoff(), Duration::from_millis(10));
        assert_eq!(c.reply_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_from(&dir.path().join("nope.toml")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn env_overrides() {
        let mut c = ClientConfig::default();
        apply_env(&mut c, |k| match k {
            "HAGGLE_PORT" => Some("9200".into()),
            "HAGGLE_DAEMON_PATH" => Some("/tmp/haggled".into()),
            _ => None,
        });
        assert_eq!(c.port, 9200);
        assert_eq!(c.daemon_path, Some(PathBuf::from("/tmp/haggled")));
    }

    #[test]
    #[serial_test::serial]
    fn load_applies_process_env() {
        let home = tempfile::tempdir().unwrap();
        let old_home = std::env::var_os("HOME");
        std::env::set_var("HOME", home.path());
        std::env::set_var("HAGGLE_PID_FILE", "/tmp/other.pid");
        let c = load();
        std::env::remove_var("HAGGLE_PID_FILE");
        match old_home {
            Some(h) => std::env::set_var("HOME", h),
            None => std::env::remove_var("HOME"),
        }
        assert_eq!(c.pid_file, PathBuf::from("/tmp/other.pid"));
    }
}
