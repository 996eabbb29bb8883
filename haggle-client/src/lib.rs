//! Haggle application library.
//!
//! An application registers a [`Session`] under its name, subscribes callbacks to event
//! categories, runs an event loop (blocking or detached) and issues commands at any time while
//! the session is open. [`Supervisor`] finds or launches the daemon. `ffi` exposes the same
//! surface to C.

pub mod config;
mod connection;
mod dispatcher;
pub mod error;
mod event_loop;
pub mod ffi;
pub mod session;
pub mod subscription;
pub mod supervisor;

pub use config::ClientConfig;
pub use error::{Error, RegistrationError, Result};
pub use event_loop::LoopHook;
pub use haggle_core::{
    Attribute, DataObject, DataObjectId, EventCategory, Interest, InvalidCategory, Status,
};
pub use session::{unregister, Session, SessionHandle};
pub use subscription::{Event, Subscription};
pub use supervisor::{DaemonStatus, Supervisor, SupervisorError};
