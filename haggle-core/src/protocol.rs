//! Application IPC protocol: message types and version.

use serde::{Deserialize, Serialize};

use crate::dataobject::{DataObject, DataObjectId, Interest};

/// Current protocol version. Sent in the registration request.
pub const PROTOCOL_VERSION: u8 = 1;

/// Loopback port the daemon listens on for applications.
pub const DEFAULT_PORT: u16 = 8787;

/// All wire message types. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Application to daemon. Every request is answered by a `Reply` or `Registered` with the same seq.
    Request { seq: u64, command: Command },
    /// Status for a request. 0 = accepted, negative = daemon error code.
    Reply { seq: u64, status: i32 },
    /// Successful registration: the connection is now bound to the application.
    Registered {
        seq: u64,
        session_id: u32,
        storage_dir: String,
    },
    /// Daemon-originated event. `payload` is absent for daemon-shutdown.
    Event {
        category: u8,
        payload: Option<DataObject>,
    },
}

/// Commands an application may issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Register `name` on this connection.
    Register { protocol_version: u8, name: String },
    /// Release the registration bound to this connection.
    Deregister,
    /// Drop whatever registration holds `name`. Valid without a registration.
    Unregister { name: String },
    /// Route events of `category` to this connection.
    SubscribeEvent { category: u8 },
    Publish { object: DataObject },
    AddInterests { interests: Vec<Interest> },
    RemoveInterests { interests: Vec<Interest> },
    /// Answered later with an interest-list event.
    GetInterests,
    /// Answered later with new-data-object events for every matching stored object.
    GetDataObjects,
    DeleteDataObject { id: DataObjectId },
    /// Stop the daemon; subscribers get daemon-shutdown first.
    Shutdown,
}

impl Command {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Register { .. } => "register",
            Command::Deregister => "deregister",
            Command::Unregister { .. } => "unregister",
            Command::SubscribeEvent { .. } => "subscribe-event",
            Command::Publish { .. } => "publish",
            Command::AddInterests { .. } => "add-interests",
            Command::RemoveInterests { .. } => "remove-interests",
            Command::GetInterests => "get-interests",
            Command::GetDataObjects => "get-data-objects",
            Command::DeleteDataObject { .. } => "delete-data-object",
            Command::Shutdown => "shutdown",
        }
    }
}
