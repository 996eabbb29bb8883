//! Daemon configuration: defaults, then config file, then environment.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use haggle_core::{paths, DEFAULT_PORT};
use serde::Deserialize;
use tracing::warn;

pub const CONFIG_FILE: &str = "daemon.toml";

/// File: ~/.config/haggle/daemon.toml or /etc/haggle/daemon.toml.
/// Env overrides: HAGGLE_PORT, HAGGLE_PID_FILE, HAGGLE_STORAGE_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Application port (default 8787).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Listen address. Applications are local, so loopback by default.
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "paths::default_pid_file")]
    pub pid_file: PathBuf,
    /// Handed to applications in the registration reply.
    #[serde(default = "paths::default_storage_dir")]
    pub storage_dir: PathBuf,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            pid_file: paths::default_pid_file(),
            storage_dir: paths::default_storage_dir(),
        }
    }
}

impl DaemonConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
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
/// A broken config file is logged and ignored.
pub fn load() -> DaemonConfig {
    let mut c = match find_file() {
        Some(p) => load_from(&p).unwrap_or_else(|e| {
            warn!(error = %e, "ignoring config file");
            DaemonConfig::default()
        }),
        None => DaemonConfig::default(),
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

pub fn load_from(path: &Path) -> Result<DaemonConfig, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn find_file() -> Option<PathBuf> {
    paths::config_paths(CONFIG_FILE).into_iter().find(|p| p.exists())
}

pub(crate) fn apply_env(c: &mut DaemonConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("HAGGLE_PORT") {
        match s.parse::<u16>() {
            Ok(p) => c.port = p,
            Err(_) => warn!(value = %s, "HAGGLE_PORT is not a port number"),
        }
    }
    if let Some(s) = var("HAGGLE_PID_FILE") {
        c.pid_file = PathBuf::from(s);
    }
    if let Some(s) = var("HAGGLE_STORAGE_DIR") {
        c.storage_dir = PathBuf::from(s);
    }
}
