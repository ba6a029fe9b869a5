//! Guest-side host/guest communication core.
//!
//! Two layers:
//! - [`poll`]: a thread-safe event callback dispatcher for timers, device
//!   handles, and main-loop (idle) work, fired by a single cooperative loop.
//! - [`channel`]: an RPC channel over a pluggable transport, with an
//!   inbound dispatch table and a reset/failure monitor that schedules all
//!   recovery work onto the poll loop.

pub mod channel;
pub mod poll;
pub mod trace;

pub use trace::init_tracing;
