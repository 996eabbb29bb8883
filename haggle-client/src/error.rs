//! Client error taxonomy and its mapping onto daemon status codes.

use std::net::SocketAddr;
use std::time::Duration;

use haggle_core::status::{self, Status};
use haggle_core::{EventCategory, FrameError, InvalidCategory};

use crate::supervisor::SupervisorError;

pub type Result<T> = std::result::Result<T, Error>;

/// Registration could not produce a session.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("daemon unreachable at {addr}: {source}")]
    Unreachable {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("registration rejected: {0}")]
    Rejected(Status),
    #[error("unexpected registration reply")]
    BadReply,
    #[error("registration failed: {0}")]
    Frame(#[from] FrameError),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    /// Application names must be non-empty and free of NUL bytes.
    #[error("invalid application name {0:?}")]
    InvalidName(String),
    /// Name held by another live session.
    #[error("application {0:?} is already registered")]
    Busy(String),
    #[error(transparent)]
    InvalidCategory(#[from] InvalidCategory),
    #[error("already subscribed to {0} events")]
    AlreadySubscribed(EventCategory),
    #[error("session closed")]
    SessionClosed,
    /// Command rejected by the daemon; status carried verbatim.
    #[error("daemon returned {0}")]
    Daemon(Status),
    #[error("no reply from daemon within {0:?}")]
    Timeout(Duration),
    #[error("channel error: {0}")]
    Channel(#[from] FrameError),
    #[error("event loop already running")]
    EventLoopRunning,
    #[error("event loop not running")]
    EventLoopNotRunning,
    #[error("no event subscriptions to run a loop for")]
    NoSubscriptions,
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error("event loop hooks already set")]
    LoopHooksAlreadySet,
    #[error("failed to start event loop thread: {0}")]
    Thread(std::io::Error),
}

impl Error {
    /// Status code reported for this error across the C ABI.
    pub fn status(&self) -> Status {
        let code = match self {
            Error::Registration(RegistrationError::Rejected(s)) | Error::Daemon(s) => return *s,
            Error::Registration(_) => status::REGISTRATION_ERROR,
            Error::Busy(_) => status::BUSY_ERROR,
            Error::InvalidName(_) | Error::InvalidCategory(_) | Error::AlreadySubscribed(_) => {
                status::PARAM_ERROR
            }
            Error::SessionClosed => status::NOT_REGISTERED,
            Error::Thread(_) => status::INTERNAL_ERROR,
            Error::Timeout(_)
            | Error::Channel(_)
            | Error::EventLoopRunning
            | Error::EventLoopNotRunning
            | Error::NoSubscriptions
            | Error::LoopHooksAlreadySet
            | Error::Supervisor(_) => status::ERROR,
        };
        Status(code)
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Error::Busy(_))
    }
}
