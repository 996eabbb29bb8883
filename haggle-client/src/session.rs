//! Session lifecycle: registration with the daemon, busy recovery, release.

use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Weak};

use haggle_core::status;
use haggle_core::Command;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::connection::{self, Connection};
use crate::error::{Error, Result};
use crate::event_loop::EventLoop;
use crate::subscription::SubscriptionTable;

pub(crate) struct SessionShared {
    open: AtomicBool,
    pub(crate) conn: Arc<Connection>,
    pub(crate) subscriptions: Arc<SubscriptionTable>,
    pub(crate) event_loop: Arc<EventLoop>,
}

/// Live registration of one application name. Released by `close` or on drop.
pub struct Session {
    shared: Arc<SessionShared>,
    handle: SessionHandle,
}

/// Non-owning reference to a session, for other threads and callbacks.
/// Every operation fails with `SessionClosed` once the session is released.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Weak<SessionShared>,
    name: Arc<str>,
    session_id: u32,
    storage_dir: Arc<Path>,
}

impl Session {
    /// Register `name` once. `Busy` if another live session holds it.
    pub fn register(cfg: &ClientConfig, name: &str) -> Result<Session> {
        check_name(name)?;
        let (tx, rx) = mpsc::channel();
        let (conn, registration) = Connection::register(cfg, name, tx.clone())?;
        let shared = Arc::new(SessionShared {
            open: AtomicBool::new(true),
            conn,
            subscriptions: Arc::new(SubscriptionTable::new()),
            event_loop: Arc::new(EventLoop::new(rx, tx)),
        });
        let handle = SessionHandle {
            shared: Arc::downgrade(&shared),
            name: Arc::from(name),
            session_id: registration.session_id,
            storage_dir: Arc::from(PathBuf::from(registration.storage_dir)),
        };
        info!(
            name,
            session_id = handle.session_id,
            storage_dir = %handle.storage_dir.display(),
            "registered with daemon"
        );
        Ok(Session { shared, handle })
    }

    /// Register `name`; if it is busy, force-unregister the stale holder, wait the configured
    /// backoff and register once more.
    pub fn open(cfg: &ClientConfig, name: &str) -> Result<Session> {
        match Session::register(cfg, name) {
            Err(Error::Busy(_)) => {
                warn!(name, "name busy, unregistering stale session");
                match unregister(cfg, name) {
                    Ok(()) => {}
                    // The stale holder went away on its own.
                    Err(Error::Daemon(s)) if s.code() == status::NOT_REGISTERED => {
                        debug!(name, "stale session already gone");
                    }
                    Err(e) => return Err(e),
                }
                std::thread::sleep(cfg.busy_backoff());
                Session::register(cfg, name)
            }
            other => other,
        }
    }

    /// Release the session. Stops the event loop, deregisters and closes the channel.
    pub fn close(self) {
        self.release();
    }

    /// Handle usable after the session moves elsewhere.
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    fn release(&self) {
        if !self.shared.open.swap(false, Ordering::AcqRel) {
            return;
        }
        match self.shared.event_loop.stop() {
            Ok(()) | Err(Error::EventLoopNotRunning) => {}
            Err(e) => debug!(error = %e, "stopping event loop"),
        }
        if let Err(e) = self.shared.conn.call(Command::Deregister) {
            debug!(error = %e, "deregistration not acknowledged");
        }
        self.shared.conn.shutdown();
        self.shared.subscriptions.clear();
        info!(name = %self.handle.name, "session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.release();
    }
}

impl Deref for Session {
    type Target = SessionHandle;

    fn deref(&self) -> &SessionHandle {
        &self.handle
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.handle.name)
            .field("session_id", &self.handle.session_id)
            .finish()
    }
}

/// Ask the daemon to drop whatever registration holds `name`.
pub fn unregister(cfg: &ClientConfig, name: &str) -> Result<()> {
    check_name(name)?;
    connection::call_once(
        cfg,
        Command::Unregister {
            name: name.to_string(),
        },
    )
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('\0') {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(())
}

impl SessionHandle {
    pub(crate) fn shared(&self) -> Result<Arc<SessionShared>> {
        let shared = self.shared.upgrade().ok_or(Error::SessionClosed)?;
        if !shared.open.load(Ordering::Acquire) || shared.conn.is_ended() {
            return Err(Error::SessionClosed);
        }
        Ok(shared)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Daemon-assigned session id.
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Daemon storage directory, as reported at registration.
    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Open, and the daemon still connected.
    pub fn is_open(&self) -> bool {
        self.shared().is_ok()
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("name", &self.name)
            .field("session_id", &self.session_id)
            .field("open", &self.is_open())
            .finish()
    }
}
