//! The RPC channel endpoint.
//!
//! One outbound lock serializes every send and every transport mutation
//! (stop, start, fallback substitution), so a slow transport stalls other
//! senders rather than racing them. All recovery work (reset checks,
//! restarts, failure reporting) is scheduled onto the dispatch loop,
//! never run synchronously inside an RPC handler or a failing send.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::channel::dispatch::{DispatchTable, RpcResponse};
use crate::channel::reset::{CheckOutcome, ResetMonitor};
use crate::channel::selector;
use crate::channel::types::{ChannelConfig, ChannelError, RpcReply, Transport, TransportKind};
use crate::poll::{ClassSet, ClientData, EventFlags, EventType, Poll, Registration};
use crate::trace::{debug, info, warn};

/// Classes for the channel's own dispatcher entries.
const CHANNEL_CLASSES: ClassSet = ClassSet::MAIN.union(ClassSet::CHANNEL);

/// Invoked from the dispatch loop after a reset check resolves:
/// `true` for a validated-healthy channel, `false` when restart attempts
/// are exhausted.
pub type ResetCallback = Box<dyn Fn(bool) + Send + Sync>;

/// Invoked from the dispatch loop, at most once, when the cumulative
/// transport-failure threshold is reached.
pub type FailureCallback = Box<dyn Fn() + Send + Sync>;

/// Transport state guarded by the outbound lock.
struct Link {
    transport: Box<dyn Transport>,
    /// Fixed at creation: whether the transport may be substituted.
    mutable: bool,
    out_started: bool,
    in_started: bool,
}

struct Shared {
    config: ChannelConfig,
    /// The outbound lock.
    link: Mutex<Link>,
    table: Mutex<DispatchTable>,
    poll: OnceLock<Arc<Poll>>,
    app_name: OnceLock<String>,
    reset_cb: OnceLock<ResetCallback>,
    failure_cb: OnceLock<FailureCallback>,
    monitor: Mutex<ResetMonitor>,
    /// Sticky "a send or receive has errored since the last healthy
    /// point" flag, inspected by the reset check.
    errored: AtomicBool,
}

impl Shared {
    fn as_client(shared: &Arc<Shared>) -> ClientData {
        let data: ClientData = shared.clone();
        data
    }

    /// Routes one received request. Reaching this point counts as a
    /// successful receive and clears the cumulative failure counter.
    fn dispatch(&self, data: &[u8]) -> RpcResponse {
        self.monitor().on_receive_ok();
        self.table
            .lock()
            .expect("dispatch table lock poisoned")
            .dispatch(data)
    }

    fn monitor(&self) -> std::sync::MutexGuard<'_, ResetMonitor> {
        self.monitor.lock().expect("reset monitor lock poisoned")
    }

    fn app_name(&self) -> &str {
        self.app_name.get().map(String::as_str).unwrap_or("")
    }

    /// Records a low-level transport error and, on the first crossing of
    /// the cumulative threshold, schedules the failure callback onto the
    /// loop.
    fn io_error(shared: &Arc<Shared>) {
        shared.errored.store(true, Ordering::Release);
        let fire = shared.monitor().on_io_error();
        if fire {
            warn!("cumulative transport failure threshold reached");
            if let Some(poll) = shared.poll.get() {
                let reg = Registration::main_loop(failure_fire_cb, Shared::as_client(shared))
                    .classes(CHANNEL_CLASSES);
                if let Err(e) = poll.register(reg) {
                    warn!(error = %e, "failure callback scheduling failed");
                }
            }
        }
    }

    /// Schedules a deferred reset check, coalescing with any pending one.
    fn schedule_reset_check(shared: &Arc<Shared>) {
        if !shared.monitor().on_reset_rpc() {
            debug!("reset while a check is pending; coalesced");
            return;
        }
        let Some(poll) = shared.poll.get() else {
            shared.monitor().check_aborted();
            return;
        };
        let reg = Registration::main_loop(reset_check_cb, Shared::as_client(shared))
            .classes(CHANNEL_CLASSES);
        if let Err(e) = poll.register(reg) {
            warn!(error = %e, "reset check scheduling failed");
            shared.monitor().check_aborted();
        }
    }

    /// Starts the transport, substituting the fallback on failure when
    /// permitted. Caller holds the outbound lock.
    fn start_locked(shared: &Arc<Shared>, link: &mut Link) -> bool {
        if link.out_started && link.in_started {
            return true;
        }
        if link.transport.start() {
            link.out_started = true;
            link.in_started = true;
            shared.errored.store(false, Ordering::Release);
            debug!(kind = %link.transport.kind(), "channel started");
            return true;
        }
        if link.mutable {
            if let Some(mut fallback) = link.transport.on_start_error() {
                info!(
                    from = %link.transport.kind(),
                    to = %fallback.kind(),
                    "transport start failed; substituting fallback"
                );
                selector::force_fallback();
                if let Some(poll) = shared.poll.get() {
                    let inbound = InboundHandle {
                        shared: Arc::downgrade(shared),
                    };
                    fallback.setup(poll, shared.app_name(), inbound);
                }
                link.transport.shutdown();
                link.transport = fallback;
                if link.transport.start() {
                    link.out_started = true;
                    link.in_started = true;
                    shared.errored.store(false, Ordering::Release);
                    return true;
                }
            }
        }
        warn!(kind = %link.transport.kind(), "channel start failed");
        false
    }
}

/// Idle-queue callback running a scheduled reset check.
fn reset_check_cb(data: &ClientData) {
    let Some(shared) = data.downcast_ref::<Shared>() else {
        return;
    };
    let errored = shared.errored.load(Ordering::Acquire);
    let outcome = shared
        .monitor()
        .check_fired(errored, shared.config.max_restart_attempts);
    match outcome {
        CheckOutcome::Healthy => {
            info!("reset check: channel healthy");
            selector::clear_fallback();
            if let Some(cb) = shared.reset_cb.get() {
                cb(true);
            }
        }
        CheckOutcome::ScheduleRestart => {
            debug!("reset check: channel errored; restart scheduled");
            if let Some(poll) = shared.poll.get() {
                let reg = Registration::timer(
                    shared.config.restart_delay,
                    restart_cb,
                    Arc::clone(data),
                )
                .classes(CHANNEL_CLASSES);
                if let Err(e) = poll.register(reg) {
                    warn!(error = %e, "restart timer scheduling failed");
                    shared.monitor().restart_fired();
                }
            }
        }
        CheckOutcome::GiveUp => {
            warn!("reset check: restart attempts exhausted");
            if let Some(cb) = shared.reset_cb.get() {
                cb(false);
            }
        }
    }
}

/// One-shot timer callback restarting a stopped, errored channel.
fn restart_cb(data: &ClientData) {
    let Ok(shared) = Arc::clone(data).downcast::<Shared>() else {
        return;
    };
    {
        let mut link = shared.link.lock().expect("outbound lock poisoned");
        link.transport.stop();
        link.out_started = false;
        link.in_started = false;
        selector::clear_fallback();
        let restarted = Shared::start_locked(&shared, &mut link);
        info!(restarted, "channel restart attempt");
    }
    shared.monitor().restart_fired();
}

/// Handle a transport uses to feed its inbound direction into the
/// channel. Holds the channel weakly, so a torn-down channel makes the
/// handle inert instead of keeping the endpoint alive.
#[derive(Clone)]
pub struct InboundHandle {
    shared: Weak<Shared>,
}

impl InboundHandle {
    /// Routes one received request and returns the reply to flush back,
    /// or `None` when the channel is gone.
    pub fn dispatch(&self, data: &[u8]) -> Option<RpcResponse> {
        self.shared.upgrade().map(|shared| shared.dispatch(data))
    }

    /// Reports a low-level receive failure.
    pub fn report_io_error(&self) {
        if let Some(shared) = self.shared.upgrade() {
            Shared::io_error(&shared);
        }
    }
}

/// Idle-queue callback delivering the cumulative failure notification.
fn failure_fire_cb(data: &ClientData) {
    let Some(shared) = data.downcast_ref::<Shared>() else {
        return;
    };
    if let Some(cb) = shared.failure_cb.get() {
        cb();
    }
}

/// An RPC channel over a pluggable transport.
pub struct Channel {
    shared: Arc<Shared>,
}

impl Channel {
    /// Wraps a transport. Whether the channel may substitute a fallback
    /// transport is fixed here, from `supports_fallback`.
    #[must_use]
    pub fn create(transport: Box<dyn Transport>) -> Self {
        Self::with_config(transport, ChannelConfig::default())
    }

    /// Like [`Channel::create`] with explicit recovery tunables.
    #[must_use]
    pub fn with_config(transport: Box<dyn Transport>, config: ChannelConfig) -> Self {
        let mutable = transport.supports_fallback();
        Self {
            shared: Arc::new(Shared {
                config,
                link: Mutex::new(Link {
                    transport,
                    mutable,
                    out_started: false,
                    in_started: false,
                }),
                table: Mutex::new(DispatchTable::new()),
                poll: OnceLock::new(),
                app_name: OnceLock::new(),
                reset_cb: OnceLock::new(),
                failure_cb: OnceLock::new(),
                monitor: Mutex::new(ResetMonitor::new(0)),
                errored: AtomicBool::new(false),
            }),
        }
    }

    /// Builds a channel over whichever transport kind is currently
    /// preferred (see [`selector`]).
    #[must_use]
    pub fn create_selected<P, F>(preferred: P, fallback: F) -> Self
    where
        P: FnOnce() -> Box<dyn Transport>,
        F: FnOnce() -> Box<dyn Transport>,
    {
        if selector::fallback_forced() {
            Self::create(fallback())
        } else {
            Self::create(preferred())
        }
    }

    /// Attaches the dispatch table, the dispatcher, and the recovery
    /// callbacks, and registers the built-in `ping` and `reset` handlers.
    ///
    /// `max_failures` is the cumulative transport-error threshold for the
    /// failure callback; zero disables it.
    ///
    /// # Panics
    ///
    /// Panics if called twice, or if `table` collides with an
    /// already-registered handler name.
    pub fn setup(
        &self,
        table: DispatchTable,
        poll: Arc<Poll>,
        app_name: &str,
        reset_cb: Option<ResetCallback>,
        failure_cb: Option<FailureCallback>,
        max_failures: u32,
    ) {
        if self.shared.poll.set(poll).is_err() {
            panic!("channel already set up");
        }
        self.shared
            .app_name
            .set(app_name.to_owned())
            .ok()
            .expect("app name already set");
        if let Some(cb) = reset_cb {
            let _ = self.shared.reset_cb.set(cb);
        }
        if let Some(cb) = failure_cb {
            let _ = self.shared.failure_cb.set(cb);
        }
        *self.shared.monitor() = ResetMonitor::new(max_failures);

        {
            let mut own = self.shared.table.lock().expect("dispatch table lock poisoned");
            own.absorb(table);
            own.register("ping", |_request| RpcResponse::ok(Vec::new()));
            let weak = Arc::downgrade(&self.shared);
            own.register("reset", move |_request| {
                let Some(shared) = weak.upgrade() else {
                    return RpcResponse::failure("channel destroyed");
                };
                // The check never runs inside this handler; it is
                // deferred to the idle queue (and coalesced there).
                Shared::schedule_reset_check(&shared);
                RpcResponse::ok(format!("ATR {}", shared.app_name()).into_bytes())
            });
        }

        let mut link = self.shared.link.lock().expect("outbound lock poisoned");
        let poll = self.shared.poll.get().expect("poll just set");
        let inbound = InboundHandle {
            shared: Arc::downgrade(&self.shared),
        };
        link.transport.setup(poll, self.shared.app_name(), inbound);
    }

    /// Activates the transport. On a failed start of a fallback-capable
    /// transport the fallback is substituted and stickiness is set, so
    /// later channels prefer it too.
    pub fn start(&self) -> bool {
        let mut link = self.shared.link.lock().expect("outbound lock poisoned");
        Shared::start_locked(&self.shared, &mut link)
    }

    /// Deactivates the transport.
    pub fn stop(&self) {
        let mut link = self.shared.link.lock().expect("outbound lock poisoned");
        if link.out_started || link.in_started {
            link.transport.stop();
            link.out_started = false;
            link.in_started = false;
        }
    }

    /// The kind of the currently active transport.
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        self.shared
            .link
            .lock()
            .expect("outbound lock poisoned")
            .transport
            .kind()
    }

    /// Sends one request and returns the peer's reply.
    ///
    /// Holds the outbound lock for the whole operation: concurrent sends
    /// are totally ordered and never interleave on the transport. On a
    /// transport-level failure of a non-baseline transport the outbound
    /// path is stopped, started again (possibly falling back), and the
    /// send retried exactly once.
    pub fn send(&self, data: &[u8]) -> Result<RpcReply, ChannelError> {
        let mut link = self.shared.link.lock().expect("outbound lock poisoned");
        if !link.out_started {
            return Err(ChannelError::NotStarted);
        }
        match link.transport.send(data) {
            Ok(reply) => Ok(reply),
            Err(first) => {
                Shared::io_error(&self.shared);
                if link.transport.kind().is_baseline() {
                    // The baseline transport has nothing to fall back to.
                    return Err(first.into());
                }
                warn!(error = %first, "send failed; restarting the outbound path");
                link.transport.stop_rpc_out();
                link.out_started = false;
                if !Shared::start_locked(&self.shared, &mut link) {
                    return Err(first.into());
                }
                match link.transport.send(data) {
                    Ok(reply) => Ok(reply),
                    Err(second) => {
                        Shared::io_error(&self.shared);
                        Err(second.into())
                    }
                }
            }
        }
    }

    /// One-shot convenience: create, set up, start, send, stop.
    pub fn send_one_raw(
        transport: Box<dyn Transport>,
        poll: Arc<Poll>,
        app_name: &str,
        data: &[u8],
    ) -> Result<RpcReply, ChannelError> {
        let channel = Channel::create(transport);
        channel.setup(DispatchTable::new(), poll, app_name, None, None, 0);
        if !channel.start() {
            return Err(ChannelError::NotStarted);
        }
        let reply = channel.send(data);
        channel.stop();
        reply
    }

    /// Registers a named handler. Call before [`Channel::start`] or from
    /// the dispatch thread.
    ///
    /// # Panics
    ///
    /// Panics if a handler is already registered under `name`.
    pub fn register_callback<F>(&self, name: &str, handler: F)
    where
        F: Fn(&crate::channel::dispatch::RpcRequest<'_>) -> RpcResponse + Send + Sync + 'static,
    {
        self.shared
            .table
            .lock()
            .expect("dispatch table lock poisoned")
            .register(name, handler);
    }

    /// Removes a named handler; returns whether one was registered.
    pub fn unregister_callback(&self, name: &str) -> bool {
        self.shared
            .table
            .lock()
            .expect("dispatch table lock poisoned")
            .unregister(name)
    }

    /// Inbound entry point for transports: routes one received request
    /// and returns the reply to flush back. Reaching this point counts as
    /// a successful receive and clears the cumulative failure counter.
    pub fn dispatch_inbound(&self, data: &[u8]) -> RpcResponse {
        self.shared.dispatch(data)
    }

    /// Inbound error report for transports: a low-level receive failure.
    pub fn report_io_error(&self) {
        Shared::io_error(&self.shared);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // Blocks on the outbound lock until any in-flight send finishes.
        {
            let mut link = self.shared.link.lock().expect("outbound lock poisoned");
            if link.out_started || link.in_started {
                link.transport.stop();
                link.out_started = false;
                link.in_started = false;
            }
            link.transport.shutdown();
        }
        // Release any recovery work still scheduled on the loop.
        if let Some(poll) = self.shared.poll.get() {
            let data = Shared::as_client(&self.shared);
            poll.remove(
                CHANNEL_CLASSES,
                EventFlags::empty(),
                reset_check_cb,
                &data,
                EventType::MainLoop,
            );
            poll.remove(
                CHANNEL_CLASSES,
                EventFlags::empty(),
                restart_cb,
                &data,
                EventType::Timer,
            );
            poll.remove(
                CHANNEL_CLASSES,
                EventFlags::empty(),
                failure_fire_cb,
                &data,
                EventType::MainLoop,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::types::TransportError;
    use serial_test::serial;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    /// Shared script driving a [`ScriptedTransport`] and recording what
    /// the channel did to it.
    #[derive(Default)]
    struct Script {
        fail_sends: u32,
        fail_starts: u32,
        ops: Vec<String>,
        sent: Vec<Vec<u8>>,
        in_send: bool,
    }

    struct ScriptedTransport {
        kind: TransportKind,
        script: Arc<Mutex<Script>>,
        fallback_to: Option<TransportKind>,
        send_delay: Duration,
    }

    impl ScriptedTransport {
        fn new(kind: TransportKind, script: &Arc<Mutex<Script>>) -> Box<dyn Transport> {
            Box::new(Self {
                kind,
                script: Arc::clone(script),
                fallback_to: None,
                send_delay: Duration::ZERO,
            })
        }
    }

    impl Transport for ScriptedTransport {
        fn setup(&mut self, _poll: &Arc<Poll>, _app_name: &str, _inbound: InboundHandle) {
            self.script.lock().unwrap().ops.push(format!("setup:{}", self.kind));
        }

        fn start(&mut self) -> bool {
            let mut script = self.script.lock().unwrap();
            if script.fail_starts > 0 {
                script.fail_starts -= 1;
                script.ops.push(format!("start-failed:{}", self.kind));
                false
            } else {
                script.ops.push(format!("start:{}", self.kind));
                true
            }
        }

        fn stop(&mut self) {
            self.script.lock().unwrap().ops.push("stop".to_owned());
        }

        fn send(&mut self, data: &[u8]) -> Result<RpcReply, TransportError> {
            {
                let mut script = self.script.lock().unwrap();
                assert!(!script.in_send, "interleaved writes on the transport");
                script.in_send = true;
            }
            std::thread::sleep(self.send_delay);
            let mut script = self.script.lock().unwrap();
            script.in_send = false;
            if script.fail_sends > 0 {
                script.fail_sends -= 1;
                script.ops.push("send-failed".to_owned());
                return Err(TransportError::Closed);
            }
            script.ops.push("send".to_owned());
            script.sent.push(data.to_vec());
            Ok(RpcReply::ok(b"1 ".to_vec()))
        }

        fn shutdown(&mut self) {
            self.script.lock().unwrap().ops.push("shutdown".to_owned());
        }

        fn kind(&self) -> TransportKind {
            self.kind
        }

        fn supports_fallback(&self) -> bool {
            self.fallback_to.is_some()
        }

        fn on_start_error(&mut self) -> Option<Box<dyn Transport>> {
            self.fallback_to.map(|kind| ScriptedTransport::new(kind, &self.script))
        }
    }

    fn drive(poll: &Poll, passes: usize, wait: Duration) {
        let exit = AtomicBool::new(false);
        for _ in 0..passes {
            poll.run(false, &exit, ClassSet::MAIN, wait);
        }
    }

    fn started_channel(
        kind: TransportKind,
        config: ChannelConfig,
        max_failures: u32,
    ) -> (Channel, Arc<Poll>, Arc<Mutex<Script>>, Arc<Mutex<Vec<bool>>>, Arc<AtomicU32>) {
        let poll = Poll::new_portable().unwrap();
        let script = Arc::new(Mutex::new(Script::default()));
        let resets: Arc<Mutex<Vec<bool>>> = Arc::default();
        let failures = Arc::new(AtomicU32::new(0));

        let channel = Channel::with_config(ScriptedTransport::new(kind, &script), config);
        let reset_log = Arc::clone(&resets);
        let failure_log = Arc::clone(&failures);
        channel.setup(
            DispatchTable::new(),
            Arc::clone(&poll),
            "toolbox",
            Some(Box::new(move |ok| reset_log.lock().unwrap().push(ok))),
            Some(Box::new(move || {
                failure_log.fetch_add(1, Ordering::SeqCst);
            })),
            max_failures,
        );
        assert!(channel.start());
        (channel, poll, script, resets, failures)
    }

    #[test]
    #[serial]
    fn send_before_start_is_refused() {
        let script = Arc::new(Mutex::new(Script::default()));
        let channel = Channel::create(ScriptedTransport::new(TransportKind::Backdoor, &script));
        assert!(matches!(
            channel.send(b"log hello"),
            Err(ChannelError::NotStarted)
        ));
    }

    #[test]
    #[serial]
    fn ping_replies_with_empty_success() {
        let (channel, _poll, _script, _resets, _failures) =
            started_channel(TransportKind::Backdoor, ChannelConfig::default(), 0);
        let reply = channel.dispatch_inbound(b"ping");
        assert!(reply.success);
        assert!(reply.payload.is_empty());
    }

    #[test]
    #[serial]
    fn unknown_command_replies_with_failure() {
        let (channel, _poll, _script, _resets, _failures) =
            started_channel(TransportKind::Backdoor, ChannelConfig::default(), 0);
        let reply = channel.dispatch_inbound(b"no.such.command args");
        assert!(!reply.success);
        assert_eq!(reply.payload, b"Unknown Command");
    }

    #[test]
    #[serial]
    fn reset_replies_atr_and_runs_a_deferred_healthy_check() {
        let (channel, poll, _script, resets, _failures) =
            started_channel(TransportKind::Backdoor, ChannelConfig::default(), 0);

        let reply = channel.dispatch_inbound(b"reset");
        assert!(reply.success);
        assert_eq!(reply.payload, b"ATR toolbox");
        // The check has not run synchronously inside the handler.
        assert!(resets.lock().unwrap().is_empty());

        drive(&poll, 2, Duration::ZERO);
        assert_eq!(*resets.lock().unwrap(), vec![true]);
    }

    #[test]
    #[serial]
    fn resets_while_a_check_is_pending_are_coalesced() {
        let (channel, poll, _script, resets, _failures) =
            started_channel(TransportKind::Backdoor, ChannelConfig::default(), 0);

        channel.dispatch_inbound(b"reset");
        channel.dispatch_inbound(b"reset");
        channel.dispatch_inbound(b"reset");
        drive(&poll, 4, Duration::ZERO);

        // One check ran, not three.
        assert_eq!(*resets.lock().unwrap(), vec![true]);
    }

    #[test]
    #[serial]
    fn failed_send_on_non_baseline_restarts_and_retries_once() {
        let (channel, _poll, script, _resets, _failures) =
            started_channel(TransportKind::VsockPrivileged, ChannelConfig::default(), 0);
        script.lock().unwrap().fail_sends = 1;

        let reply = channel.send(b"log hello").unwrap();
        assert!(reply.success);

        let ops = script.lock().unwrap().ops.clone();
        assert_eq!(
            ops,
            vec![
                "setup:vsock (privileged)",
                "start:vsock (privileged)",
                "send-failed",
                "stop",
                "start:vsock (privileged)",
                "send",
            ]
        );
    }

    #[test]
    #[serial]
    fn failed_send_on_baseline_is_not_retried() {
        let (channel, _poll, script, _resets, _failures) =
            started_channel(TransportKind::Backdoor, ChannelConfig::default(), 0);
        script.lock().unwrap().fail_sends = 1;

        assert!(channel.send(b"log hello").is_err());
        let ops = script.lock().unwrap().ops.clone();
        assert_eq!(ops, vec!["setup:backdoor", "start:backdoor", "send-failed"]);
    }

    #[test]
    #[serial]
    fn retry_is_bounded_to_exactly_one_attempt() {
        let (channel, _poll, script, _resets, _failures) =
            started_channel(TransportKind::VsockPrivileged, ChannelConfig::default(), 0);
        script.lock().unwrap().fail_sends = 2;

        assert!(channel.send(b"log hello").is_err());
        let sends = script
            .lock()
            .unwrap()
            .ops
            .iter()
            .filter(|op| op.starts_with("send"))
            .count();
        assert_eq!(sends, 2);
    }

    #[test]
    #[serial]
    fn failed_start_substitutes_fallback_and_sets_stickiness() {
        selector::clear_fallback();
        let poll = Poll::new_portable().unwrap();
        let script = Arc::new(Mutex::new(Script::default()));
        script.lock().unwrap().fail_starts = 1;

        let transport = Box::new(ScriptedTransport {
            kind: TransportKind::VsockPrivileged,
            script: Arc::clone(&script),
            fallback_to: Some(TransportKind::Backdoor),
            send_delay: Duration::ZERO,
        });
        let channel = Channel::create(transport);
        channel.setup(DispatchTable::new(), poll, "toolbox", None, None, 0);

        assert!(channel.start());
        assert_eq!(channel.kind(), TransportKind::Backdoor);
        assert!(selector::fallback_forced());

        // New channels now prefer the fallback until the flag clears.
        let chosen = Channel::create_selected(
            || ScriptedTransport::new(TransportKind::VsockPrivileged, &script),
            || ScriptedTransport::new(TransportKind::Backdoor, &script),
        );
        assert_eq!(chosen.kind(), TransportKind::Backdoor);

        selector::clear_fallback();
    }

    #[test]
    #[serial]
    fn errored_channel_schedules_bounded_restarts_then_recovers() {
        selector::clear_fallback();
        let config = ChannelConfig {
            restart_delay: Duration::from_millis(5),
            max_restart_attempts: 5,
        };
        let (channel, poll, script, resets, _failures) =
            started_channel(TransportKind::VsockPrivileged, config, 0);

        // Two consecutive failures: the in-send restart succeeds (which
        // clears the sticky flag), so the retry's failure is what leaves
        // the channel marked errored.
        script.lock().unwrap().fail_sends = 2;
        assert!(channel.send(b"log hello").is_err());

        channel.dispatch_inbound(b"reset");
        drive(&poll, 2, Duration::ZERO);
        // Check ran, saw the error, armed the restart timer; no reset
        // callback yet.
        assert!(resets.lock().unwrap().is_empty());

        let starts_before = script
            .lock()
            .unwrap()
            .ops
            .iter()
            .filter(|op| op.starts_with("start:"))
            .count();
        drive(&poll, 4, Duration::from_millis(50));
        let starts_after = script
            .lock()
            .unwrap()
            .ops
            .iter()
            .filter(|op| op.starts_with("start:"))
            .count();
        assert!(starts_after > starts_before, "restart never ran");

        // The restart succeeded; the next check validates health.
        channel.dispatch_inbound(b"reset");
        drive(&poll, 2, Duration::ZERO);
        assert_eq!(*resets.lock().unwrap(), vec![true]);
    }

    #[test]
    #[serial]
    fn exhausted_restart_attempts_report_failure_exactly_once() {
        selector::clear_fallback();
        let config = ChannelConfig {
            restart_delay: Duration::from_millis(2),
            max_restart_attempts: 2,
        };
        let (channel, poll, script, resets, _failures) =
            started_channel(TransportKind::VsockPrivileged, config, 0);

        // Every start from here on fails, so restarts cannot clear the
        // sticky error flag.
        {
            let mut script = script.lock().unwrap();
            script.fail_starts = u32::MAX;
            script.fail_sends = u32::MAX;
        }
        assert!(channel.send(b"log hello").is_err());

        // First failed check schedules a restart (which fails).
        channel.dispatch_inbound(b"reset");
        drive(&poll, 4, Duration::from_millis(20));
        assert!(resets.lock().unwrap().is_empty());

        // Second failed check exhausts the budget.
        channel.dispatch_inbound(b"reset");
        drive(&poll, 4, Duration::from_millis(20));
        assert_eq!(*resets.lock().unwrap(), vec![false]);

        // No further automatic restarts: nothing new without an external
        // reset request.
        drive(&poll, 4, Duration::from_millis(20));
        assert_eq!(*resets.lock().unwrap(), vec![false]);

        selector::clear_fallback();
    }

    #[test]
    #[serial]
    fn cumulative_failures_fire_the_failure_callback_once() {
        let (channel, poll, script, _resets, failures) =
            started_channel(TransportKind::Backdoor, ChannelConfig::default(), 3);
        script.lock().unwrap().fail_sends = u32::MAX;

        for _ in 0..3 {
            assert!(channel.send(b"log hello").is_err());
        }
        drive(&poll, 2, Duration::ZERO);
        assert_eq!(failures.load(Ordering::SeqCst), 1);

        // Further failures never re-fire it.
        for _ in 0..3 {
            assert!(channel.send(b"log hello").is_err());
        }
        drive(&poll, 2, Duration::ZERO);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[serial]
    fn successful_receive_clears_the_cumulative_count() {
        let (channel, poll, script, _resets, failures) =
            started_channel(TransportKind::Backdoor, ChannelConfig::default(), 3);

        script.lock().unwrap().fail_sends = 2;
        assert!(channel.send(b"a").is_err());
        assert!(channel.send(b"b").is_err());

        // An inbound request counts as a successful receive.
        channel.dispatch_inbound(b"ping");

        script.lock().unwrap().fail_sends = 2;
        assert!(channel.send(b"c").is_err());
        assert!(channel.send(b"d").is_err());
        drive(&poll, 2, Duration::ZERO);
        // Two errors, then cleared, then two more: threshold of three was
        // never crossed.
        assert_eq!(failures.load(Ordering::SeqCst), 0);
    }

    #[test]
    #[serial]
    fn concurrent_sends_never_interleave() {
        let poll = Poll::new_portable().unwrap();
        let script = Arc::new(Mutex::new(Script::default()));
        let transport = Box::new(ScriptedTransport {
            kind: TransportKind::Backdoor,
            script: Arc::clone(&script),
            fallback_to: None,
            send_delay: Duration::from_millis(10),
        });
        let channel = Channel::create(transport);
        channel.setup(DispatchTable::new(), poll, "toolbox", None, None, 0);
        assert!(channel.start());

        let channel = Arc::new(channel);
        let mut workers = Vec::new();
        for payload in [&b"A"[..], &b"B"[..], &b"C"[..], &b"D"[..]] {
            let channel = Arc::clone(&channel);
            workers.push(std::thread::spawn(move || {
                channel.send(payload).unwrap();
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }

        // The transport double panics on interleaving; also verify every
        // payload arrived intact.
        let mut sent = script.lock().unwrap().sent.clone();
        sent.sort();
        assert_eq!(sent, vec![b"A".to_vec(), b"B".to_vec(), b"C".to_vec(), b"D".to_vec()]);
    }

    #[test]
    #[serial]
    fn send_one_raw_runs_a_full_lifecycle() {
        let poll = Poll::new_portable().unwrap();
        let script = Arc::new(Mutex::new(Script::default()));
        let reply = Channel::send_one_raw(
            ScriptedTransport::new(TransportKind::Backdoor, &script),
            poll,
            "toolbox",
            b"log one-shot",
        )
        .unwrap();
        assert!(reply.success);

        let ops = script.lock().unwrap().ops.clone();
        assert_eq!(
            ops,
            vec![
                "setup:backdoor",
                "start:backdoor",
                "send",
                "stop",
                "shutdown",
            ]
        );
    }

    #[test]
    #[serial]
    fn drop_with_a_pending_check_releases_loop_work() {
        let (channel, poll, _script, resets, _failures) =
            started_channel(TransportKind::Backdoor, ChannelConfig::default(), 0);

        channel.dispatch_inbound(b"reset");
        drop(channel);
        drive(&poll, 3, Duration::ZERO);
        // The scheduled check was removed with the channel; its callback
        // never fired.
        assert!(resets.lock().unwrap().is_empty());
    }

    #[test]
    #[serial]
    fn app_handlers_registered_before_setup_survive_it() {
        let script = Arc::new(Mutex::new(Script::default()));
        let channel = Channel::create(ScriptedTransport::new(TransportKind::Backdoor, &script));
        channel.register_callback("caps.get", |_req| RpcResponse::ok(b"caps".to_vec()));

        let poll = Poll::new_portable().unwrap();
        channel.setup(DispatchTable::new(), poll, "toolbox", None, None, 0);
        assert!(channel.start());

        let reply = channel.dispatch_inbound(b"caps.get");
        assert!(reply.success);
        assert_eq!(reply.payload, b"caps");

        assert!(channel.unregister_callback("caps.get"));
        assert!(!channel.dispatch_inbound(b"caps.get").success);
    }
}
