//! Portable polling backend.
//!
//! Device readiness comes from mio, timers from a deadline-ordered heap,
//! main-loop work from a FIFO snapshot per pass. All firing follows the
//! shared contract: the table lock is never held across an invocation,
//! non-periodic entries are unregistered immediately before their single
//! invocation, and a contended per-entry lock defers the firing instead
//! of blocking the loop.
//!
//! mio readiness is edge-like, so this backend re-arms a descriptor after
//! every periodic fire and keeps lock-deferred device firings in a
//! signaled set retried each pass until they succeed.

use std::collections::{BinaryHeap, VecDeque};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, TryLockError};
use std::time::Duration;

use minstant::Instant;
use mio::unix::SourceFd;
use mio::{Events, Interest, Token, Waker};

use crate::poll::backend::PollBackend;
use crate::poll::table::{DeviceChange, DirSet, Entry, EntryId, Table};
use crate::poll::types::{
    Callback, ClassSet, ClientData, EntryLock, EventFlags, EventType, PollError, PollHandle,
};
use crate::trace::{debug, warn};

const WAKER_TOKEN: Token = Token(usize::MAX);

/// Capacity of one readiness batch.
const EVENT_CAPACITY: usize = 64;

/// Upper bound on a single blocking wait, so the exit flag is honored
/// even if a waker wake is lost.
const MAX_WAIT_SLICE: Duration = Duration::from_millis(250);

/// Fixed backoff before retrying a lock-deferred firing.
const DEFER_BACKOFF: Duration = Duration::from_millis(1);

/// Heap node for a scheduled timer. Nodes are lazily invalidated: a node
/// whose entry is gone, or whose deadline no longer matches the entry's,
/// is a leftover from removal or rescheduling and is skipped on pop.
struct TimerNode {
    deadline: Instant,
    id: EntryId,
}

impl PartialEq for TimerNode {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for TimerNode {}

impl PartialOrd for TimerNode {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerNode {
    // Reversed: BinaryHeap is a max-heap, we want the earliest deadline.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// A callback ready to be invoked, captured outside the table.
struct Firing {
    callback: Callback,
    client_data: ClientData,
    lock: Option<EntryLock>,
}

impl Firing {
    fn of(entry: &Entry) -> Self {
        Self {
            callback: entry.callback,
            client_data: entry.client_data.clone(),
            lock: entry.lock.clone(),
        }
    }
}

/// Where a staged firing came from, which decides how a lock-contended
/// attempt is retried.
enum Origin {
    /// Entry already unregistered; the firing itself is carried until it
    /// succeeds.
    Oneshot,
    /// Still queued; the idle queue retries it next pass.
    PeriodicIdle,
    /// Rescheduled as a zero-delay timer.
    PeriodicTimer(EntryId),
    /// Joins the signaled set; readiness was consumed by this attempt.
    PeriodicDevice(EntryId),
}

struct Invocation {
    firing: Firing,
    origin: Origin,
}

#[derive(Default)]
struct State {
    table: Table,
    timers: BinaryHeap<TimerNode>,
    idle: VecDeque<EntryId>,
    /// Unregistered one-shot firings awaiting their per-entry lock.
    deferred: Vec<Firing>,
    /// Periodic device entries whose readiness edge was consumed by a
    /// deferred attempt.
    signaled: Vec<EntryId>,
}

/// The portable backend.
pub struct PortableBackend {
    state: Mutex<State>,
    registry: mio::Registry,
    poller: Mutex<mio::Poll>,
    waker: Waker,
}

impl PortableBackend {
    /// Creates the backend and its OS poller.
    pub fn new() -> Result<Self, PollError> {
        let poller = mio::Poll::new()?;
        let registry = poller.registry().try_clone()?;
        let waker = Waker::new(poller.registry(), WAKER_TOKEN)?;
        Ok(Self {
            state: Mutex::new(State::default()),
            registry,
            poller: Mutex::new(poller),
            waker,
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("dispatcher table lock poisoned")
    }

    fn apply_device_change(&self, change: DeviceChange) -> std::io::Result<()> {
        match change {
            DeviceChange::None => Ok(()),
            DeviceChange::Add(fd, dirs) => {
                self.registry
                    .register(&mut SourceFd(&fd), Token(fd as usize), interest(dirs))
            }
            DeviceChange::Update(fd, dirs) => {
                self.registry
                    .reregister(&mut SourceFd(&fd), Token(fd as usize), interest(dirs))
            }
            DeviceChange::Drop(fd) => self.registry.deregister(&mut SourceFd(&fd)),
        }
    }

    /// Undoes a watch adjustment after a removal; failure is logged, not
    /// propagated (the descriptor may already be closed).
    fn apply_removal_change(&self, change: DeviceChange) {
        if let Err(e) = self.apply_device_change(change) {
            warn!(error = %e, "device watch adjustment failed on removal");
        }
    }

    /// One dispatch pass: wait for readiness, stage ready work, invoke.
    fn pass(&self, class_set: ClassSet, max_wait: Duration) {
        // Phase 1: wait budget. Pending retries poll with a short
        // backoff; otherwise sleep until the next in-class deadline,
        // bounded by the caller's budget.
        let wait = {
            let st = self.state();
            if !st.deferred.is_empty() || !st.signaled.is_empty() {
                DEFER_BACKOFF.min(max_wait)
            } else {
                let now = Instant::now();
                let mut wait = max_wait;
                for node in st.timers.iter() {
                    let live = st.table.get(node.id).is_some_and(|e| {
                        e.deadline == Some(node.deadline) && e.class_set.intersects(class_set)
                    });
                    if live {
                        let delta = node.deadline.checked_duration_since(now).unwrap_or_default();
                        wait = wait.min(delta);
                    }
                }
                wait
            }
        };

        // Phase 2: wait for device readiness.
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        {
            let mut poller = self.poller.lock().expect("poller lock poisoned");
            if let Err(e) = poller.poll(&mut events, Some(wait)) {
                if e.kind() != std::io::ErrorKind::Interrupted {
                    warn!(error = %e, "readiness poll failed");
                }
            }
        }

        // Phase 3: stage everything ready under one table-lock
        // acquisition; in particular both directions of a merged device
        // watch are collected without re-taking the lock.
        let mut invocations: Vec<Invocation> = Vec::new();
        let mut watch_changes: Vec<DeviceChange> = Vec::new();
        {
            let mut st = self.state();
            let now = Instant::now();

            // Due timers. Drain before processing so a zero-interval
            // periodic reschedule cannot re-enter this pass.
            let mut due = Vec::new();
            while let Some(top) = st.timers.peek() {
                if top.deadline > now {
                    break;
                }
                due.push(st.timers.pop().expect("peeked node"));
            }
            let mut held = Vec::new();
            for node in due {
                let Some(entry) = st.table.get(node.id) else {
                    continue; // removed; stale node
                };
                if entry.deadline != Some(node.deadline) {
                    continue; // rescheduled; stale node
                }
                if !entry.class_set.intersects(class_set) {
                    held.push(node);
                    continue;
                }
                if entry.flags.contains(EventFlags::PERIODIC) {
                    let next = now + entry.handle.as_period();
                    invocations.push(Invocation {
                        firing: Firing::of(entry),
                        origin: Origin::PeriodicTimer(node.id),
                    });
                    st.table
                        .get_mut(node.id)
                        .expect("entry just read")
                        .deadline = Some(next);
                    st.timers.push(TimerNode {
                        deadline: next,
                        id: node.id,
                    });
                } else {
                    let (entry, _) = st.table.remove_id(node.id).expect("entry just read");
                    invocations.push(Invocation {
                        firing: Firing::of(&entry),
                        origin: Origin::Oneshot,
                    });
                }
            }
            for node in held {
                st.timers.push(node);
            }

            // Idle batch: snapshot, so work queued from within a callback
            // runs on the next pass, not this one.
            let batch: Vec<EntryId> = st.idle.drain(..).collect();
            let mut keep = Vec::new();
            for id in batch {
                let Some(entry) = st.table.get(id) else {
                    continue;
                };
                if !entry.class_set.intersects(class_set) {
                    keep.push(id);
                    continue;
                }
                if entry.flags.contains(EventFlags::PERIODIC) {
                    invocations.push(Invocation {
                        firing: Firing::of(entry),
                        origin: Origin::PeriodicIdle,
                    });
                    keep.push(id);
                } else {
                    let (entry, _) = st.table.remove_id(id).expect("entry just read");
                    invocations.push(Invocation {
                        firing: Firing::of(&entry),
                        origin: Origin::Oneshot,
                    });
                }
            }
            st.idle.extend(keep);

            // Device readiness.
            let mut rearm: Vec<RawFd> = Vec::new();
            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue;
                }
                let fd = event.token().0 as RawFd;
                let Some(slot) = st.table.device_slot(fd) else {
                    continue;
                };
                // Error and hangup conditions fire the affected direction
                // so the owner can observe the failure and unregister.
                let readable = event.is_readable() || event.is_read_closed() || event.is_error();
                let writable = event.is_writable() || event.is_write_closed() || event.is_error();
                let read_id = if readable { slot.read } else { None };
                let write_id = if writable { slot.write } else { None };

                for id in [read_id, write_id].into_iter().flatten() {
                    let Some(entry) = st.table.get(id) else {
                        continue;
                    };
                    if !entry.class_set.intersects(class_set) {
                        // Readiness edge consumed; hand to the signaled
                        // set so a pass with the right class retries it.
                        st.signaled.push(id);
                        continue;
                    }
                    if entry.flags.contains(EventFlags::PERIODIC) {
                        invocations.push(Invocation {
                            firing: Firing::of(entry),
                            origin: Origin::PeriodicDevice(id),
                        });
                        rearm.push(fd);
                    } else {
                        let (entry, change) = st.table.remove_id(id).expect("entry just read");
                        watch_changes.push(change);
                        invocations.push(Invocation {
                            firing: Firing::of(&entry),
                            origin: Origin::Oneshot,
                        });
                    }
                }
            }

            // Lock-deferred retries.
            for firing in st.deferred.drain(..).collect::<Vec<_>>() {
                invocations.push(Invocation {
                    firing,
                    origin: Origin::Oneshot,
                });
            }
            let signaled: Vec<EntryId> = std::mem::take(&mut st.signaled);
            for id in signaled {
                let Some(entry) = st.table.get(id) else {
                    continue;
                };
                if !entry.class_set.intersects(class_set) {
                    st.signaled.push(id);
                    continue;
                }
                if entry.flags.contains(EventFlags::PERIODIC) {
                    invocations.push(Invocation {
                        firing: Firing::of(entry),
                        origin: Origin::PeriodicDevice(id),
                    });
                } else {
                    let (entry, change) = st.table.remove_id(id).expect("entry just read");
                    watch_changes.push(change);
                    invocations.push(Invocation {
                        firing: Firing::of(&entry),
                        origin: Origin::Oneshot,
                    });
                }
            }

            // Re-arm periodic descriptors whose edge was just delivered,
            // using the slot's surviving interest set.
            for fd in rearm {
                if let Some(slot) = st.table.device_slot(fd) {
                    let dirs = DirSet {
                        read: slot.read.is_some(),
                        write: slot.write.is_some(),
                    };
                    if let Err(e) = self.apply_device_change(DeviceChange::Update(fd, dirs)) {
                        warn!(fd, error = %e, "device watch re-arm failed");
                    }
                }
            }
        }
        for change in watch_changes {
            self.apply_removal_change(change);
        }

        // Phase 4: invoke with the table lock released.
        for invocation in invocations {
            self.invoke(invocation);
        }
    }

    fn invoke(&self, invocation: Invocation) {
        let firing = &invocation.firing;
        let would_block = match &firing.lock {
            None => {
                (firing.callback)(&firing.client_data);
                false
            }
            Some(lock) => match lock.try_lock() {
                Ok(_held) => {
                    (firing.callback)(&firing.client_data);
                    false
                }
                // A poisoned lock is still acquired; the previous holder
                // panicked but the firing must not be dropped.
                Err(TryLockError::Poisoned(_held)) => {
                    (firing.callback)(&firing.client_data);
                    false
                }
                Err(TryLockError::WouldBlock) => true,
            },
        };
        if would_block {
            self.defer(invocation);
        }
    }

    /// Re-queues a lock-contended firing for a later pass.
    fn defer(&self, invocation: Invocation) {
        let mut st = self.state();
        match invocation.origin {
            Origin::Oneshot => st.deferred.push(invocation.firing),
            // Still queued; nothing to do.
            Origin::PeriodicIdle => {}
            Origin::PeriodicTimer(id) => {
                if let Some(entry) = st.table.get_mut(id) {
                    let now = Instant::now();
                    entry.deadline = Some(now);
                    st.timers.push(TimerNode { deadline: now, id });
                }
            }
            Origin::PeriodicDevice(id) => st.signaled.push(id),
        }
    }
}

fn interest(dirs: DirSet) -> Interest {
    match (dirs.read, dirs.write) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (true, false) => Interest::READABLE,
        (false, true) => Interest::WRITABLE,
        (false, false) => unreachable!("empty interest set"),
    }
}

impl PollBackend for PortableBackend {
    fn init(&self) -> Result<(), PollError> {
        Ok(())
    }

    fn exit(&self) {
        let mut st = self.state();
        for fd in st.table.clear() {
            let _ = self.registry.deregister(&mut SourceFd(&fd));
        }
        st.timers.clear();
        st.idle.clear();
        st.deferred.clear();
        st.signaled.clear();
    }

    fn loop_timeout(
        &self,
        block_forever: bool,
        exit_flag: &AtomicBool,
        class_set: ClassSet,
        timeout: Duration,
    ) {
        if !block_forever {
            if !exit_flag.load(Ordering::Acquire) {
                self.pass(class_set, timeout);
            }
            return;
        }
        while !exit_flag.load(Ordering::Acquire) {
            self.pass(class_set, MAX_WAIT_SLICE);
        }
    }

    fn callback(
        &self,
        class_set: ClassSet,
        flags: EventFlags,
        callback: Callback,
        client_data: ClientData,
        event: EventType,
        handle: PollHandle,
        lock: Option<EntryLock>,
    ) -> Result<(), PollError> {
        let deadline = match event {
            EventType::Timer => Some(Instant::now() + handle.as_period()),
            _ => None,
        };
        let entry = Entry {
            class_set,
            flags,
            callback,
            client_data,
            event,
            handle,
            lock,
            deadline,
        };

        let (id, change) = {
            let mut st = self.state();
            let (id, change) = st.table.insert(entry)?;
            match event {
                EventType::Timer => st.timers.push(TimerNode {
                    deadline: deadline.expect("timer deadline set above"),
                    id,
                }),
                EventType::MainLoop => st.idle.push_back(id),
                EventType::Device => {}
            }
            (id, change)
        };

        if let Err(e) = self.apply_device_change(change) {
            // Roll the table back so a failed OS registration leaves no
            // phantom entry.
            let mut st = self.state();
            let _ = st.table.remove_id(id);
            return Err(PollError::Io(e));
        }

        debug!(%event, %handle, "registered dispatcher entry");
        // Wake a blocked loop so the new source is taken into account.
        let _ = self.waker.wake();
        Ok(())
    }

    fn callback_remove(
        &self,
        class_set: ClassSet,
        flags: EventFlags,
        callback: Callback,
        client_data: &ClientData,
        event: EventType,
    ) -> bool {
        let change = {
            let mut st = self.state();
            st.table
                .remove_matching(class_set, flags, callback, client_data, event)
                .map(|(_, _, change)| change)
        };
        match change {
            Some(change) => {
                self.apply_removal_change(change);
                true
            }
            None => false,
        }
    }

    fn callback_remove_one(
        &self,
        class_set: ClassSet,
        flags: EventFlags,
        callback: Callback,
        event: EventType,
    ) -> Option<ClientData> {
        let removed = {
            let mut st = self.state();
            st.table
                .remove_by_callback(class_set, flags, callback, event)
                .map(|(_, entry, change)| (entry.client_data, change))
        };
        removed.map(|(client_data, change)| {
            self.apply_removal_change(change);
            client_data
        })
    }

    fn locking_enabled(&self) -> bool {
        true
    }

    fn notify_change(&self, _class_set: ClassSet) {
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "dispatch loop wake failed");
        }
    }
}
