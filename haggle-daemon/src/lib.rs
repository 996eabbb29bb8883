//! Reference haggle daemon: serves the application IPC on loopback TCP.
//! The binary is `haggled`; the library lets hosts and tests embed the server.

pub mod config;
pub mod pidfile;
pub mod server;

pub use config::DaemonConfig;
pub use server::{spawn_background, BackgroundServer, Server, ServerHandle};
