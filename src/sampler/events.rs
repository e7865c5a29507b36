use std::path::PathBuf;

use crate::control::ControlCommand;

/// Updates sent from the sampling thread to whoever is watching the run.
#[derive(Debug, Clone, PartialEq)]
pub enum SamplerUpdate {
    StepCompleted {
        step: u64,
        end_step: u64,
    },
    /// The worker is blocked at the boundary after `after_step`.
    Paused {
        after_step: u64,
    },
    Resumed {
        after_step: u64,
        command: ControlCommand,
    },
    SnapshotSaved {
        step: u64,
        path: PathBuf,
        size_bytes: u64,
        forced: bool,
    },
    Evicted {
        steps: Vec<u64>,
        bytes_freed: u64,
    },
    Finished {
        last_step: u64,
    },
    Aborted {
        last_step: u64,
    },
}
