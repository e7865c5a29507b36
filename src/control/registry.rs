use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::channel::{ControlChannel, DEFAULT_POLL_INTERVAL};
use super::command::ControlCommand;
use crate::session::RunId;

/// Per-run control channels, keyed by explicit run id.
///
/// The control plane looks a run up here; the worker holds its own
/// `Arc<ControlChannel>` handle and never touches the map.
#[derive(Debug)]
pub struct ControlRegistry {
    channels: Mutex<HashMap<RunId, Arc<ControlChannel>>>,
    poll_interval: Duration,
}

impl ControlRegistry {
    pub fn new() -> Self {
        Self::with_poll_interval(DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        ControlRegistry {
            channels: Mutex::new(HashMap::new()),
            poll_interval,
        }
    }

    /// Get the channel for `run_id`, creating it on first use.
    pub fn channel(&self, run_id: &RunId) -> Arc<ControlChannel> {
        self.lock()
            .entry(run_id.clone())
            .or_insert_with(|| Arc::new(ControlChannel::with_poll_interval(self.poll_interval)))
            .clone()
    }

    pub fn get(&self, run_id: &RunId) -> Option<Arc<ControlChannel>> {
        self.lock().get(run_id).cloned()
    }

    /// Write `command` to the run's channel, creating it if needed.
    pub fn send(&self, run_id: &RunId, command: ControlCommand) {
        let channel = self.channel(run_id);
        channel.set(command);
    }

    /// Drop the registry's handle for a finished run.
    pub fn remove(&self, run_id: &RunId) -> Option<Arc<ControlChannel>> {
        self.lock().remove(run_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RunId, Arc<ControlChannel>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ControlRegistry {
    fn default() -> Self {
        Self::new()
    }
}
