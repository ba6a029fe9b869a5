//! Backend seam and the `Poll` facade.
//!
//! A backend supplies the waiting primitive (OS readiness, host toolkit
//! loop); the firing contract is identical across backends. Exactly one
//! backend is active process-wide at a time, but construction-injected
//! instances ([`Poll::with_backend`]) are first-class so tests never need
//! the global.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use crate::poll::portable::PortableBackend;
use crate::poll::types::{
    Callback, ClassSet, ClientData, EntryLock, EventFlags, EventType, PollError, PollHandle,
};

/// Contract an event-loop implementation must provide.
pub trait PollBackend: Send + Sync {
    /// One-time backend initialization.
    fn init(&self) -> Result<(), PollError>;

    /// Tears down all registrations and OS resources.
    fn exit(&self);

    /// Drives dispatch. See [`Poll::run`] for the semantics. Backends
    /// whose host toolkit already drives dispatch may implement this as
    /// a no-op.
    fn loop_timeout(
        &self,
        block_forever: bool,
        exit_flag: &AtomicBool,
        class_set: ClassSet,
        timeout: Duration,
    );

    /// Registers a callback entry.
    #[allow(clippy::too_many_arguments)]
    fn callback(
        &self,
        class_set: ClassSet,
        flags: EventFlags,
        callback: Callback,
        client_data: ClientData,
        event: EventType,
        handle: PollHandle,
        lock: Option<EntryLock>,
    ) -> Result<(), PollError>;

    /// Removes an entry by exact identity; returns whether one was found.
    fn callback_remove(
        &self,
        class_set: ClassSet,
        flags: EventFlags,
        callback: Callback,
        client_data: &ClientData,
        event: EventType,
    ) -> bool;

    /// Removes one entry matching on callback identity alone, returning
    /// its client data.
    fn callback_remove_one(
        &self,
        class_set: ClassSet,
        flags: EventFlags,
        callback: Callback,
        event: EventType,
    ) -> Option<ClientData>;

    /// Whether per-entry locks are honored by this backend.
    fn locking_enabled(&self) -> bool;

    /// Wakes a sleeping dispatch loop early.
    fn notify_change(&self, class_set: ClassSet);
}

/// A complete registration request.
///
/// Constructors cover the common shapes; `class_set` defaults to
/// [`ClassSet::MAIN`] and can be widened with [`Registration::classes`].
pub struct Registration {
    pub class_set: ClassSet,
    pub flags: EventFlags,
    pub callback: Callback,
    pub client_data: ClientData,
    pub event: EventType,
    pub handle: PollHandle,
    pub lock: Option<EntryLock>,
}

impl Registration {
    /// A one-shot timer firing once after `period`.
    #[must_use]
    pub fn timer(period: Duration, callback: Callback, client_data: ClientData) -> Self {
        Self {
            class_set: ClassSet::MAIN,
            flags: EventFlags::empty(),
            callback,
            client_data,
            event: EventType::Timer,
            handle: PollHandle::from_period(period),
            lock: None,
        }
    }

    /// A periodic timer firing every `period`.
    #[must_use]
    pub fn periodic_timer(period: Duration, callback: Callback, client_data: ClientData) -> Self {
        let mut reg = Self::timer(period, callback, client_data);
        reg.flags |= EventFlags::PERIODIC;
        reg
    }

    /// A one-shot read watch on a descriptor.
    #[must_use]
    pub fn device_read(fd: std::os::fd::RawFd, callback: Callback, client_data: ClientData) -> Self {
        Self {
            class_set: ClassSet::MAIN,
            flags: EventFlags::READ,
            callback,
            client_data,
            event: EventType::Device,
            handle: PollHandle::from_fd(fd),
            lock: None,
        }
    }

    /// A one-shot write watch on a descriptor.
    #[must_use]
    pub fn device_write(
        fd: std::os::fd::RawFd,
        callback: Callback,
        client_data: ClientData,
    ) -> Self {
        let mut reg = Self::device_read(fd, callback, client_data);
        reg.flags = EventFlags::WRITE;
        reg
    }

    /// One-shot main-loop (idle) work.
    #[must_use]
    pub fn main_loop(callback: Callback, client_data: ClientData) -> Self {
        Self {
            class_set: ClassSet::MAIN,
            flags: EventFlags::empty(),
            callback,
            client_data,
            event: EventType::MainLoop,
            handle: PollHandle::NONE,
            lock: None,
        }
    }

    /// Adds the periodic flag.
    #[must_use]
    pub fn periodic(mut self) -> Self {
        self.flags |= EventFlags::PERIODIC;
        self
    }

    /// Replaces the class set. [`ClassSet::MAIN`] is still mandatory.
    #[must_use]
    pub fn classes(mut self, class_set: ClassSet) -> Self {
        self.class_set = class_set;
        self
    }

    /// Attaches a per-entry lock held across each invocation.
    #[must_use]
    pub fn with_lock(mut self, lock: EntryLock) -> Self {
        self.lock = Some(lock);
        self
    }
}

/// The dispatcher: a registration surface over the active backend.
pub struct Poll {
    backend: Box<dyn PollBackend>,
}

impl Poll {
    /// Creates a dispatcher over an injected backend.
    pub fn with_backend(backend: Box<dyn PollBackend>) -> Result<Arc<Self>, PollError> {
        backend.init()?;
        Ok(Arc::new(Self { backend }))
    }

    /// Creates a dispatcher over the portable polling backend.
    pub fn new_portable() -> Result<Arc<Self>, PollError> {
        Self::with_backend(Box::new(PortableBackend::new()?))
    }

    /// Registers an entry.
    pub fn register(&self, reg: Registration) -> Result<(), PollError> {
        if reg.lock.is_some() && !self.backend.locking_enabled() {
            return Err(PollError::LockingDisabled);
        }
        self.backend.callback(
            reg.class_set,
            reg.flags,
            reg.callback,
            reg.client_data,
            reg.event,
            reg.handle,
            reg.lock,
        )
    }

    /// Removes an entry by exact identity; returns whether one was found.
    ///
    /// A callback removing itself after having been auto-unregistered
    /// simply gets `false` back; that is not an error.
    pub fn remove(
        &self,
        class_set: ClassSet,
        flags: EventFlags,
        callback: Callback,
        client_data: &ClientData,
        event: EventType,
    ) -> bool {
        self.backend
            .callback_remove(class_set, flags, callback, client_data, event)
    }

    /// Removes one entry matching on callback identity alone, returning
    /// the client data of the removed entry.
    pub fn remove_one_by_callback(
        &self,
        class_set: ClassSet,
        flags: EventFlags,
        callback: Callback,
        event: EventType,
    ) -> Option<ClientData> {
        self.backend
            .callback_remove_one(class_set, flags, callback, event)
    }

    /// Wakes a sleeping dispatch loop early, e.g. after publishing state
    /// no registered source will signal.
    pub fn notify_change(&self, class_set: ClassSet) {
        self.backend.notify_change(class_set);
    }

    /// Drives dispatch for entries whose class set intersects `class_set`.
    ///
    /// With `block_forever` the loop runs until `exit_flag` becomes true
    /// (pair the store with [`Poll::notify_change`] to wake it promptly);
    /// otherwise it makes a single pass waiting at most `timeout`.
    pub fn run(
        &self,
        block_forever: bool,
        exit_flag: &AtomicBool,
        class_set: ClassSet,
        timeout: Duration,
    ) {
        self.backend
            .loop_timeout(block_forever, exit_flag, class_set, timeout);
    }

    /// Whether per-entry locks are honored.
    #[must_use]
    pub fn locking_enabled(&self) -> bool {
        self.backend.locking_enabled()
    }
}

impl Drop for Poll {
    fn drop(&mut self) {
        self.backend.exit();
    }
}

/// Process-wide active dispatcher slot.
static ACTIVE: Mutex<Option<Arc<Poll>>> = Mutex::new(None);
static DEFAULT_INSTALL: OnceLock<()> = OnceLock::new();

/// Installs a dispatcher as the process-wide instance.
pub fn install(poll: Arc<Poll>) {
    *ACTIVE.lock().expect("active dispatcher lock poisoned") = Some(poll);
}

/// Installs a portable-backend dispatcher once and returns it.
///
/// Subsequent calls return the already-installed instance.
pub fn init() -> Result<Arc<Poll>, PollError> {
    // The once guard keeps two racing initializers from each building a
    // backend; the slot itself stays swappable via install/uninstall.
    let mut result = Ok(());
    DEFAULT_INSTALL.get_or_init(|| match Poll::new_portable() {
        Ok(poll) => install(poll),
        Err(e) => result = Err(e),
    });
    result?;
    active().ok_or_else(|| PollError::Io(std::io::Error::other("dispatcher uninstalled")))
}

/// Returns the process-wide dispatcher, if one is installed.
#[must_use]
pub fn active() -> Option<Arc<Poll>> {
    ACTIVE.lock().expect("active dispatcher lock poisoned").clone()
}

/// Removes the process-wide dispatcher. Existing `Arc` handles stay valid.
pub fn uninstall() {
    *ACTIVE.lock().expect("active dispatcher lock poisoned") = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::types::client_data;
    use serial_test::serial;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Minimal backend stub: counts registrations, honors no locks.
    #[derive(Default)]
    struct StubBackend {
        registered: Arc<AtomicU32>,
    }

    impl PollBackend for StubBackend {
        fn init(&self) -> Result<(), PollError> {
            Ok(())
        }

        fn exit(&self) {}

        fn loop_timeout(
            &self,
            _block_forever: bool,
            _exit_flag: &AtomicBool,
            _class_set: ClassSet,
            _timeout: Duration,
        ) {
        }

        fn callback(
            &self,
            _class_set: ClassSet,
            _flags: EventFlags,
            _callback: Callback,
            _client_data: ClientData,
            _event: EventType,
            _handle: PollHandle,
            _lock: Option<EntryLock>,
        ) -> Result<(), PollError> {
            self.registered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn callback_remove(
            &self,
            _class_set: ClassSet,
            _flags: EventFlags,
            _callback: Callback,
            _client_data: &ClientData,
            _event: EventType,
        ) -> bool {
            false
        }

        fn callback_remove_one(
            &self,
            _class_set: ClassSet,
            _flags: EventFlags,
            _callback: Callback,
            _event: EventType,
        ) -> Option<ClientData> {
            None
        }

        fn locking_enabled(&self) -> bool {
            false
        }

        fn notify_change(&self, _class_set: ClassSet) {}
    }

    fn noop(_: &ClientData) {}

    #[test]
    fn injected_backend_receives_registrations() {
        let registered = Arc::new(AtomicU32::new(0));
        let poll = Poll::with_backend(Box::new(StubBackend {
            registered: Arc::clone(&registered),
        }))
        .unwrap();
        poll.register(Registration::main_loop(noop, client_data(())))
            .unwrap();
        poll.register(Registration::main_loop(noop, client_data(())))
            .unwrap();
        assert_eq!(registered.load(Ordering::SeqCst), 2);
        assert!(!poll.locking_enabled());
    }

    #[test]
    fn lock_on_a_lock_less_backend_is_refused() {
        let poll = Poll::with_backend(Box::<StubBackend>::default()).unwrap();
        let lock: EntryLock = Arc::new(Mutex::new(()));
        let err = poll
            .register(Registration::main_loop(noop, client_data(())).with_lock(lock))
            .unwrap_err();
        assert!(matches!(err, PollError::LockingDisabled));
    }

    #[test]
    #[serial]
    fn install_and_uninstall_manage_the_process_slot() {
        uninstall();
        assert!(active().is_none());

        let poll = Poll::with_backend(Box::<StubBackend>::default()).unwrap();
        install(Arc::clone(&poll));
        let found = active().expect("installed dispatcher");
        assert!(Arc::ptr_eq(&found, &poll));

        uninstall();
        assert!(active().is_none());
    }
}
