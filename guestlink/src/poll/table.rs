//! Registration table: entry identity, device read/write merging, removal.
//!
//! The table is pure bookkeeping; OS-level watch management is the
//! backend's job. Mutations report the required watch adjustment as a
//! [`DeviceChange`] so a single table operation maps to at most one
//! registry call.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::Arc;

use minstant::Instant;

use crate::poll::types::{
    Callback, ClassSet, ClientData, EntryLock, EventFlags, EventType, PollError, PollHandle,
};

/// Stable entry identifier. Monotonic and never reused, so a stale id held
/// across a table mutation can only miss, never alias another entry.
pub(crate) type EntryId = u64;

/// One registered interest.
pub(crate) struct Entry {
    pub class_set: ClassSet,
    pub flags: EventFlags,
    pub callback: Callback,
    pub client_data: ClientData,
    pub event: EventType,
    pub handle: PollHandle,
    pub lock: Option<EntryLock>,
    /// Current deadline for timer entries; `None` for other kinds.
    pub deadline: Option<Instant>,
}

impl Entry {
    /// Exact five-field identity used by removal and duplicate detection.
    pub(crate) fn matches_identity(
        &self,
        class_set: ClassSet,
        flags: EventFlags,
        callback: Callback,
        client_data: &ClientData,
        event: EventType,
    ) -> bool {
        self.class_set == class_set
            && self.flags == flags
            && self.callback as usize == callback as usize
            && Arc::ptr_eq(&self.client_data, client_data)
            && self.event == event
    }

    /// Identity match ignoring client data, for callers that no longer
    /// hold the original pointer.
    pub(crate) fn matches_callback(
        &self,
        class_set: ClassSet,
        flags: EventFlags,
        callback: Callback,
        event: EventType,
    ) -> bool {
        self.class_set == class_set
            && self.flags == flags
            && self.callback as usize == callback as usize
            && self.event == event
    }
}

/// Directions a device watch must cover after a table mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DirSet {
    pub read: bool,
    pub write: bool,
}

/// OS-watch adjustment implied by a table mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeviceChange {
    /// No watch adjustment needed.
    None,
    /// First entry on this descriptor: create the watch.
    Add(RawFd, DirSet),
    /// Merge or partial removal: update the watch's interest set.
    Update(RawFd, DirSet),
    /// Last entry gone: drop the watch.
    Drop(RawFd),
}

/// Read/write entry ids sharing one underlying descriptor watch.
#[derive(Default)]
pub(crate) struct DeviceSlot {
    pub read: Option<EntryId>,
    pub write: Option<EntryId>,
}

impl DeviceSlot {
    fn dirs(&self) -> DirSet {
        DirSet {
            read: self.read.is_some(),
            write: self.write.is_some(),
        }
    }

    fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }
}

#[derive(Default)]
pub(crate) struct Table {
    entries: HashMap<EntryId, Entry>,
    devices: HashMap<RawFd, DeviceSlot>,
    next_id: EntryId,
}

impl Table {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Validates and inserts an entry, reporting the watch adjustment.
    pub(crate) fn insert(&mut self, entry: Entry) -> Result<(EntryId, DeviceChange), PollError> {
        if !entry.class_set.contains(ClassSet::MAIN) {
            return Err(PollError::MissingMainClass);
        }
        match entry.event {
            EventType::Device => {
                let dir = entry.flags & (EventFlags::READ | EventFlags::WRITE);
                if dir != EventFlags::READ && dir != EventFlags::WRITE {
                    return Err(PollError::BadDeviceFlags);
                }
            }
            EventType::MainLoop => {
                if entry.handle != PollHandle::NONE {
                    return Err(PollError::MainLoopHandle);
                }
            }
            EventType::Timer => {}
        }
        if self.entries.values().any(|e| {
            e.matches_identity(
                entry.class_set,
                entry.flags,
                entry.callback,
                &entry.client_data,
                entry.event,
            )
        }) {
            return Err(PollError::AlreadyRegistered);
        }

        let id = self.next_id;
        let change = if entry.event == EventType::Device {
            let fd = entry.handle.as_fd();
            let slot = self.devices.entry(fd).or_default();
            // An occupied direction implies the slot preexisted, so the
            // freshly-defaulted-slot case needs no rollback here.
            let was_empty = slot.is_empty();
            if entry.flags.contains(EventFlags::READ) {
                if slot.read.is_some() {
                    return Err(PollError::DirectionTaken);
                }
                slot.read = Some(id);
            } else {
                if slot.write.is_some() {
                    return Err(PollError::DirectionTaken);
                }
                slot.write = Some(id);
            }
            let dirs = slot.dirs();
            if was_empty {
                DeviceChange::Add(fd, dirs)
            } else {
                DeviceChange::Update(fd, dirs)
            }
        } else {
            DeviceChange::None
        };

        self.next_id += 1;
        self.entries.insert(id, entry);
        Ok((id, change))
    }

    /// Removes an entry by exact identity.
    pub(crate) fn remove_matching(
        &mut self,
        class_set: ClassSet,
        flags: EventFlags,
        callback: Callback,
        client_data: &ClientData,
        event: EventType,
    ) -> Option<(EntryId, Entry, DeviceChange)> {
        let id = self.entries.iter().find_map(|(id, e)| {
            e.matches_identity(class_set, flags, callback, client_data, event)
                .then_some(*id)
        })?;
        self.remove_id(id).map(|(entry, change)| (id, entry, change))
    }

    /// Removes one entry matching on callback identity alone.
    pub(crate) fn remove_by_callback(
        &mut self,
        class_set: ClassSet,
        flags: EventFlags,
        callback: Callback,
        event: EventType,
    ) -> Option<(EntryId, Entry, DeviceChange)> {
        let id = self.entries.iter().find_map(|(id, e)| {
            e.matches_callback(class_set, flags, callback, event)
                .then_some(*id)
        })?;
        self.remove_id(id).map(|(entry, change)| (id, entry, change))
    }

    /// Removes an entry by id, unlinking any device slot.
    pub(crate) fn remove_id(&mut self, id: EntryId) -> Option<(Entry, DeviceChange)> {
        let entry = self.entries.remove(&id)?;
        let change = if entry.event == EventType::Device {
            let fd = entry.handle.as_fd();
            let slot = self
                .devices
                .get_mut(&fd)
                .expect("device entry without slot");
            if slot.read == Some(id) {
                slot.read = None;
            }
            if slot.write == Some(id) {
                slot.write = None;
            }
            if slot.is_empty() {
                self.devices.remove(&fd);
                DeviceChange::Drop(fd)
            } else {
                DeviceChange::Update(fd, self.devices[&fd].dirs())
            }
        } else {
            DeviceChange::None
        };
        Some((entry, change))
    }

    pub(crate) fn get(&self, id: EntryId) -> Option<&Entry> {
        self.entries.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: EntryId) -> Option<&mut Entry> {
        self.entries.get_mut(&id)
    }

    pub(crate) fn device_slot(&self, fd: RawFd) -> Option<&DeviceSlot> {
        self.devices.get(&fd)
    }

    pub(crate) fn clear(&mut self) -> Vec<RawFd> {
        self.entries.clear();
        let fds = self.devices.keys().copied().collect();
        self.devices.clear();
        fds
    }
}
