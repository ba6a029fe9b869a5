//! Event callback dispatcher for timers, device handles, and idle work.

pub mod backend;
pub mod portable;
mod table;
pub mod types;

pub use backend::{active, init, install, uninstall, Poll, PollBackend, Registration};
pub use portable::PortableBackend;
pub use types::{
    client_data, Callback, ClassSet, ClientData, EntryLock, EventFlags, EventType, PollError,
    PollHandle,
};
