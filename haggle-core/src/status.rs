//! Status codes returned by the daemon for every command.

use std::fmt;

pub const NO_ERROR: i32 = 0;
pub const ERROR: i32 = -1;
pub const PARAM_ERROR: i32 = -2;
pub const INTERNAL_ERROR: i32 = -3;
pub const REGISTRATION_ERROR: i32 = -4;
/// Application name already registered by a live session.
pub const BUSY_ERROR: i32 = -5;
pub const NOT_REGISTERED: i32 = -6;
pub const NOT_FOUND: i32 = -7;
pub const SHUTTING_DOWN: i32 = -8;
pub const PROTOCOL_ERROR: i32 = -9;

/// Raw daemon status. Zero is success; negative codes are surfaced verbatim.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct Status(pub i32);

impl Status {
    pub const OK: Status = Status(NO_ERROR);

    pub fn code(self) -> i32 {
        self.0
    }

    pub fn is_ok(self) -> bool {
        self.0 == NO_ERROR
    }

    /// True for the busy code only; every other negative code is opaque.
    pub fn is_busy(self) -> bool {
        self.0 == BUSY_ERROR
    }
}

impl From<i32> for Status {
    fn from(code: i32) -> Self {
        Status(code)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.0 {
            NO_ERROR => "ok",
            ERROR => "error",
            PARAM_ERROR => "bad parameter",
            INTERNAL_ERROR => "internal error",
            REGISTRATION_ERROR => "registration error",
            BUSY_ERROR => "busy",
            NOT_REGISTERED => "not registered",
            NOT_FOUND => "not found",
            SHUTTING_DOWN => "shutting down",
            PROTOCOL_ERROR => "protocol mismatch",
            _ => "daemon error",
        };
        write!(f, "{} ({})", label, self.0)
    }
}
