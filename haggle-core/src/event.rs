//! Event categories the daemon can push to a session.

use std::fmt;

/// Closed set of asynchronous notification types. Codes are fixed on the wire.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum EventCategory {
    DaemonShutdown = 0,
    NeighborUpdate = 1,
    NewDataObject = 2,
    InterestList = 3,
}

impl EventCategory {
    pub const ALL: [EventCategory; 4] = [
        EventCategory::DaemonShutdown,
        EventCategory::NeighborUpdate,
        EventCategory::NewDataObject,
        EventCategory::InterestList,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<i32> for EventCategory {
    type Error = InvalidCategory;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(EventCategory::DaemonShutdown),
            1 => Ok(EventCategory::NeighborUpdate),
            2 => Ok(EventCategory::NewDataObject),
            3 => Ok(EventCategory::InterestList),
            other => Err(InvalidCategory(other)),
        }
    }
}

impl TryFrom<u8> for EventCategory {
    type Error = InvalidCategory;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        EventCategory::try_from(code as i32)
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventCategory::DaemonShutdown => "daemon-shutdown",
            EventCategory::NeighborUpdate => "neighbor-update",
            EventCategory::NewDataObject => "new-data-object",
            EventCategory::InterestList => "interest-list",
        };
        f.write_str(name)
    }
}

/// Event category code outside the closed range.
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
#[error("invalid event category {0}")]
pub struct InvalidCategory(pub i32);
