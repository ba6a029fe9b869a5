//! Transport contract and channel vocabulary types.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::channel::endpoint::InboundHandle;
use crate::poll::Poll;

/// Delay between scheduled channel restart attempts.
pub const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Maximum consecutive failed reset checks before giving up.
pub const MAX_RESTART_ATTEMPTS: u32 = 60;

/// The kind of transport currently backing a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// No transport active.
    Inactive,
    /// The baseline hardware channel. Always available, never falls back
    /// further.
    Backdoor,
    /// Privileged virtual-socket connection.
    VsockPrivileged,
    /// Unprivileged virtual-socket connection.
    VsockUnprivileged,
}

impl TransportKind {
    /// Whether this is the baseline kind with no further fallback.
    #[must_use]
    pub fn is_baseline(self) -> bool {
        matches!(self, Self::Backdoor)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inactive => write!(f, "inactive"),
            Self::Backdoor => write!(f, "backdoor"),
            Self::VsockPrivileged => write!(f, "vsock (privileged)"),
            Self::VsockUnprivileged => write!(f, "vsock (unprivileged)"),
        }
    }
}

/// A completed round trip: the host-side status plus its reply bytes.
///
/// `success == false` is an RPC-level failure (the peer answered, and the
/// answer was "no"), distinct from a transport-level error, which is an
/// `Err` from [`Transport::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcReply {
    pub success: bool,
    pub payload: Vec<u8>,
}

impl RpcReply {
    /// A successful reply carrying `payload`.
    #[must_use]
    pub fn ok(payload: Vec<u8>) -> Self {
        Self {
            success: true,
            payload,
        }
    }

    /// A failed reply carrying a diagnostic message.
    #[must_use]
    pub fn failure(message: &str) -> Self {
        Self {
            success: false,
            payload: message.as_bytes().to_vec(),
        }
    }
}

/// Low-level transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport's outbound path is not started.
    #[error("transport not started")]
    NotStarted,
    /// The peer closed the connection.
    #[error("transport closed by peer")]
    Closed,
    /// I/O failure on the underlying byte pipe.
    #[error("transport i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Contract a concrete transport implements.
///
/// The channel serializes every call into this trait behind its outbound
/// lock, so implementations see at most one call at a time.
///
/// A transport drives the inbound direction itself (typically off a
/// dispatcher device source): for each received request it calls
/// [`Channel::dispatch_inbound`] and writes the returned reply back to the
/// peer, reporting low-level receive errors through
/// [`Channel::report_io_error`].
///
/// [`Channel::dispatch_inbound`]: crate::channel::Channel::dispatch_inbound
/// [`Channel::report_io_error`]: crate::channel::Channel::report_io_error
pub trait Transport: Send {
    /// Binds the transport to the dispatcher, the application identity,
    /// and the channel's inbound entry point. Called once before `start`,
    /// and again on any substituted fallback transport.
    fn setup(&mut self, poll: &Arc<Poll>, app_name: &str, inbound: InboundHandle);

    /// Activates both directions. Returns whether activation succeeded.
    fn start(&mut self) -> bool;

    /// Deactivates both directions.
    fn stop(&mut self);

    /// Sends one request and waits for the peer's reply.
    fn send(&mut self, data: &[u8]) -> Result<RpcReply, TransportError>;

    /// Releases all transport resources. The transport is not usable
    /// afterwards.
    fn shutdown(&mut self);

    /// The kind this transport currently is.
    fn kind(&self) -> TransportKind;

    /// Whether this transport can produce a fallback replacement.
    fn supports_fallback(&self) -> bool {
        false
    }

    /// Stops only the outbound sub-channel, leaving inbound routing
    /// intact. Used by the send retry path on fallback-capable
    /// transports.
    fn stop_rpc_out(&mut self) {
        self.stop();
    }

    /// Invoked after a failed `start` on a fallback-capable transport.
    /// Returns the replacement transport to substitute, if any.
    fn on_start_error(&mut self) -> Option<Box<dyn Transport>> {
        None
    }
}

/// Channel recovery tunables.
///
/// The defaults are the reference constants; embedders with unusual host
/// latency can widen them.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Delay between scheduled restart attempts.
    pub restart_delay: Duration,
    /// Consecutive failed reset checks tolerated before giving up.
    pub max_restart_attempts: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            restart_delay: RESTART_DELAY,
            max_restart_attempts: MAX_RESTART_ATTEMPTS,
        }
    }
}

/// Errors surfaced to [`Channel::send`] callers.
///
/// [`Channel::send`]: crate::channel::Channel::send
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel (or its outbound path) is not started.
    #[error("channel not started")]
    NotStarted,
    /// The transport failed and the bounded retry did not recover it.
    #[error("send failed: {0}")]
    Transport(#[from] TransportError),
}
