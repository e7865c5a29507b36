use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::command::ControlCommand;

/// Default interval between command checks while paused.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Single-slot mailbox holding the latest control command for one run.
///
/// The lock guards only the command value and is never held across I/O or
/// sleeps. A poisoned lock is recovered rather than propagated: the slot holds
/// a plain `Copy` value, so it cannot be left half-written.
#[derive(Debug)]
pub struct ControlChannel {
    command: Mutex<ControlCommand>,
    changed: Condvar,
    poll_interval: Duration,
}

impl ControlChannel {
    pub fn new() -> Self {
        Self::with_poll_interval(DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        ControlChannel {
            command: Mutex::new(ControlCommand::Proceed),
            changed: Condvar::new(),
            poll_interval,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Overwrite the current command. Any unread command is discarded.
    pub fn set(&self, command: ControlCommand) {
        *self.lock() = command;
        self.changed.notify_all();
    }

    pub fn get(&self) -> ControlCommand {
        *self.lock()
    }

    /// Block the calling thread until the command is no longer `Pause`.
    ///
    /// Each wait is bounded by the poll interval and the command is re-read
    /// after every wake, so a notification that races the wait is still seen
    /// within one interval. Returns the command that ended the pause.
    pub fn await_resume(&self) -> ControlCommand {
        let mut guard = self.lock();
        while *guard == ControlCommand::Pause {
            guard = match self.changed.wait_timeout(guard, self.poll_interval) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        *guard
    }

    /// Consume a pending `Snapshot` request, reverting the slot to `Proceed`.
    ///
    /// Returns `true` exactly once per `Snapshot` write.
    pub fn take_snapshot_request(&self) -> bool {
        let mut guard = self.lock();
        if *guard == ControlCommand::Snapshot {
            *guard = ControlCommand::Proceed;
            true
        } else {
            false
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControlCommand> {
        self.command.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ControlChannel {
    fn default() -> Self {
        Self::new()
    }
}
