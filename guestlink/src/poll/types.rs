//! Vocabulary types for the dispatcher: classes, flags, handles, callbacks.

use std::any::Any;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    /// Logical subsystem classes an entry belongs to.
    ///
    /// Every registration must include [`ClassSet::MAIN`]; the remaining
    /// bits group entries by owning subsystem so a host can drive a
    /// restricted slice of the dispatcher.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ClassSet: u32 {
        /// The main loop class. Mandatory for every entry.
        const MAIN = 1 << 0;
        /// Entries owned by the RPC channel layer.
        const CHANNEL = 1 << 1;
        /// Entries owned by the embedding application.
        const APP = 1 << 2;
    }
}

bitflags! {
    /// Behavior flags for a registration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventFlags: u32 {
        /// Fire when the device handle becomes readable.
        const READ = 1 << 0;
        /// Fire when the device handle becomes writable.
        const WRITE = 1 << 1;
        /// Keep firing; without this the entry is removed immediately
        /// before its single invocation.
        const PERIODIC = 1 << 2;
        /// The device handle is a socket rather than a plain descriptor.
        const SOCKET = 1 << 3;
    }
}

/// The kind of event source an entry is registered against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Real-time timer; the handle carries the period in microseconds.
    Timer,
    /// File descriptor / socket readiness.
    Device,
    /// Main-loop (idle) work, fired once per loop pass.
    MainLoop,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timer => write!(f, "timer"),
            Self::Device => write!(f, "device"),
            Self::MainLoop => write!(f, "main-loop"),
        }
    }
}

/// Event-source handle: a file descriptor for devices, a period in
/// microseconds for timers, [`PollHandle::NONE`] for main-loop entries.
///
/// The handle does not participate in removal matching; removal matches on
/// the `(class_set, flags, callback, client_data, event)` tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PollHandle(i64);

impl PollHandle {
    /// The zero handle, required for main-loop entries.
    pub const NONE: Self = Self(0);

    /// Wraps a device file descriptor.
    #[must_use]
    pub fn from_fd(fd: RawFd) -> Self {
        Self(i64::from(fd))
    }

    /// Wraps a timer period.
    #[must_use]
    pub fn from_period(period: Duration) -> Self {
        Self(period.as_micros() as i64)
    }

    /// Returns the handle as a file descriptor.
    #[must_use]
    pub fn as_fd(self) -> RawFd {
        self.0 as RawFd
    }

    /// Returns the handle as a timer period.
    #[must_use]
    pub fn as_period(self) -> Duration {
        Duration::from_micros(self.0 as u64)
    }
}

impl fmt::Display for PollHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque per-registration state handed back to the callback.
///
/// Identity-compared (`Arc::ptr_eq`) for removal matching.
pub type ClientData = Arc<dyn Any + Send + Sync>;

/// Wraps a value as [`ClientData`].
#[must_use]
pub fn client_data<T: Any + Send + Sync>(value: T) -> ClientData {
    Arc::new(value)
}

/// A dispatcher callback. Plain function pointers keep removal matching
/// well-defined: two registrations are "the same callback" exactly when
/// the pointers are equal.
pub type Callback = fn(&ClientData);

/// Optional per-entry lock the firing thread must hold across the
/// invocation. Acquisition is always `try_lock`; contention defers the
/// firing rather than blocking the loop.
pub type EntryLock = Arc<Mutex<()>>;

/// Errors from dispatcher registration.
#[derive(Debug, Error)]
pub enum PollError {
    /// The class set does not include [`ClassSet::MAIN`].
    #[error("class set must include the main class")]
    MissingMainClass,
    /// An active entry with the identical five-field identity exists.
    #[error("entry already registered")]
    AlreadyRegistered,
    /// A device registration must set exactly one of READ/WRITE.
    #[error("device entries take exactly one of the read/write flags")]
    BadDeviceFlags,
    /// A device handle already has an entry for the requested direction.
    #[error("device handle already watched in that direction")]
    DirectionTaken,
    /// Main-loop entries must use [`PollHandle::NONE`].
    #[error("main-loop entries take no handle")]
    MainLoopHandle,
    /// A per-entry lock was supplied but the backend does not honor locks.
    #[error("per-entry locks are not enabled on this backend")]
    LockingDisabled,
    /// OS-level registration failed.
    #[error("event source registration failed: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_roundtrips() {
        let fd = PollHandle::from_fd(7);
        assert_eq!(fd.as_fd(), 7);

        let period = PollHandle::from_period(Duration::from_micros(1500));
        assert_eq!(period.as_period(), Duration::from_micros(1500));

        assert_eq!(PollHandle::NONE, PollHandle::default());
    }

    #[test]
    fn client_data_identity() {
        let a = client_data(5u32);
        let b = Arc::clone(&a);
        let c = client_data(5u32);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
