//! Reset/failure monitor: the channel-health state machine.
//!
//! Pure state transitions live here; the channel performs the side
//! effects (scheduling idle checks and restart timers, invoking the
//! application callbacks) on the dispatch loop. Keeping the machine free
//! of I/O makes every transition unit-testable.

/// Where the monitor is in the reset cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResetState {
    /// Nothing pending.
    Idle,
    /// A reset check is scheduled on the idle queue.
    CheckPending,
    /// A restart timer is armed.
    RestartScheduled,
}

/// Verdict of a reset check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CheckOutcome {
    /// No error since the last healthy point: report success.
    Healthy,
    /// Errored; arm the restart timer.
    ScheduleRestart,
    /// Errored and out of attempts: report failure, stop retrying until
    /// the next external reset request.
    GiveUp,
}

pub(crate) struct ResetMonitor {
    state: ResetState,
    /// Failed reset checks since the last healthy one.
    consecutive_failures: u32,
    /// Low-level transport errors since the last successful receive.
    cumulative_failures: u32,
    /// Application-supplied cumulative threshold; zero disables it.
    max_cumulative: u32,
    /// The cumulative failure callback fires at most once.
    cumulative_reported: bool,
}

impl ResetMonitor {
    pub(crate) fn new(max_cumulative: u32) -> Self {
        Self {
            state: ResetState::Idle,
            consecutive_failures: 0,
            cumulative_failures: 0,
            max_cumulative,
            cumulative_reported: false,
        }
    }

    /// A reset RPC arrived. Returns whether a check must be scheduled;
    /// resets arriving while a check is already pending are coalesced.
    pub(crate) fn on_reset_rpc(&mut self) -> bool {
        match self.state {
            ResetState::CheckPending => false,
            ResetState::Idle | ResetState::RestartScheduled => {
                self.state = ResetState::CheckPending;
                true
            }
        }
    }

    /// The scheduled check ran. `errored` is the sticky send/receive
    /// error flag at check time.
    pub(crate) fn check_fired(&mut self, errored: bool, max_attempts: u32) -> CheckOutcome {
        if !errored {
            // Only the consecutive count belongs to the reset cycle; the
            // cumulative count is cleared by successful receives alone.
            self.state = ResetState::Idle;
            self.consecutive_failures = 0;
            return CheckOutcome::Healthy;
        }
        self.consecutive_failures += 1;
        if self.consecutive_failures >= max_attempts {
            // Out of attempts. Start a fresh count so a later external
            // reset request gets a full cycle of its own.
            self.state = ResetState::Idle;
            self.consecutive_failures = 0;
            CheckOutcome::GiveUp
        } else {
            self.state = ResetState::RestartScheduled;
            CheckOutcome::ScheduleRestart
        }
    }

    /// The restart timer fired and the restart ran.
    pub(crate) fn restart_fired(&mut self) {
        self.state = ResetState::Idle;
    }

    /// The pending check could not be scheduled after all; a later reset
    /// request must be able to try again.
    pub(crate) fn check_aborted(&mut self) {
        if self.state == ResetState::CheckPending {
            self.state = ResetState::Idle;
        }
    }

    /// A low-level transport error occurred. Returns whether the
    /// cumulative failure callback must fire (first threshold crossing
    /// only).
    pub(crate) fn on_io_error(&mut self) -> bool {
        self.cumulative_failures = self.cumulative_failures.saturating_add(1);
        if self.max_cumulative != 0
            && self.cumulative_failures >= self.max_cumulative
            && !self.cumulative_reported
        {
            self.cumulative_reported = true;
            return true;
        }
        false
    }

    /// The inbound path completed a successful receive.
    pub(crate) fn on_receive_ok(&mut self) {
        self.cumulative_failures = 0;
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> ResetState {
        self.state
    }
}
