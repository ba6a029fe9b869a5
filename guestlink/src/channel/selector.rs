//! Transport selection with fallback stickiness.
//!
//! Once a channel is forced onto its fallback transport, every channel
//! created afterwards prefers the fallback too, until a successful reset
//! or restart clears the flag (or the process restarts). This keeps a
//! fleet of channels from repeatedly probing a transport the host has
//! already rejected.

use std::sync::atomic::{AtomicBool, Ordering};

static FALLBACK_STICKY: AtomicBool = AtomicBool::new(false);

/// Whether new channels should prefer the fallback transport.
#[must_use]
pub fn fallback_forced() -> bool {
    FALLBACK_STICKY.load(Ordering::Acquire)
}

/// Marks the fallback transport as preferred process-wide.
pub(crate) fn force_fallback() {
    FALLBACK_STICKY.store(true, Ordering::Release);
}

/// Clears the stickiness; the preferred transport is tried again.
pub(crate) fn clear_fallback() {
    FALLBACK_STICKY.store(false, Ordering::Release);
}

/// Picks between a preferred and a fallback value based on stickiness.
pub fn select<T>(preferred: T, fallback: T) -> T {
    if fallback_forced() {
        fallback
    } else {
        preferred
    }
}
