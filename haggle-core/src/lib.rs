//! Haggle application IPC core.
//! Host-driven: no I/O; the daemon feeds requests into the registry and writes out what it returns.

pub mod dataobject;
pub mod event;
pub mod identity;
pub mod paths;
pub mod protocol;
pub mod registry;
pub mod status;
pub mod wire;

pub use dataobject::{Attribute, DataObject, DataObjectId, Interest};
pub use event::{EventCategory, InvalidCategory};
pub use identity::ApplicationId;
pub use protocol::{Command, Message, DEFAULT_PORT, PROTOCOL_VERSION};
pub use registry::{ApplicationRegistry, ConnId, Outbound};
pub use status::Status;
pub use wire::{decode_frame, encode_frame, read_frame, write_frame, FrameError};
