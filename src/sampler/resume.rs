use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::checkpoint::{DeviceRngs, HistoryBuffer, HistoryReconstructor, NumericBuffer, Settings, StateCodec};
use crate::error::CheckpointError;

use super::solver::gaussian_like;

/// Where a run starts: the step already completed, the state after it, and
/// any momentum the solver should be seeded with.
#[derive(Debug, Clone)]
pub struct ResumePlan {
    /// Last completed step; the loop executes `start_step + 1` next.
    pub start_step: u64,
    pub state: NumericBuffer,
    pub history: HistoryBuffer,
    /// Whether initial noise was added to `state`.
    pub noised: bool,
    /// Checkpoint this plan was loaded from, if any.
    pub resumed_from: Option<PathBuf>,
    /// Settings recorded in the source checkpoint.
    pub settings: Settings,
}

impl ResumePlan {
    /// Start from `state` as given, with no history.
    pub fn fresh(start_step: u64, state: NumericBuffer) -> Self {
        ResumePlan {
            start_step,
            state,
            history: HistoryBuffer::new(),
            noised: false,
            resumed_from: None,
            settings: Settings::new(),
        }
    }

    /// Start from `state` plus standard normal noise scaled by `sigma`, drawn
    /// from the default device generator.
    pub fn noised(start_step: u64, state: NumericBuffer, sigma: f32, rngs: &mut DeviceRngs) -> Self {
        let noise = gaussian_like(&state, rngs);
        ResumePlan {
            state: state.add_scaled(sigma, &noise),
            noised: true,
            ..Self::fresh(start_step, state)
        }
    }

    /// Cold resume from a checkpoint file.
    ///
    /// Restores the RNG into `rngs`, starts after the checkpoint's step, and
    /// never adds noise. `history_depth` is the number of derivative frames
    /// the solver consumes; all but the newest are recovered from sibling
    /// checkpoints in the same directory, and the newest is the checkpoint's
    /// own derivative.
    pub fn from_checkpoint(
        path: &Path,
        rngs: &mut DeviceRngs,
        history_depth: usize,
    ) -> Result<Self, CheckpointError> {
        let checkpoint = StateCodec::load(path, rngs)?;
        let step = checkpoint.step;

        let mut history = HistoryBuffer::new();
        if history_depth > 0 {
            let run_dir = path.parent().unwrap_or_else(|| Path::new("."));
            history = HistoryReconstructor::gather(run_dir, step, history_depth - 1);
            match checkpoint.derivative {
                Some(derivative) => history.push_newest(step, derivative),
                None => warn!(
                    path = %path.display(),
                    step,
                    "Resume checkpoint has no momentum data; solver starts with partial history"
                ),
            }
        }

        info!(
            path = %path.display(),
            step,
            history_frames = history.len(),
            "Resuming from checkpoint"
        );

        Ok(ResumePlan {
            start_step: step,
            state: checkpoint.state,
            history,
            noised: false,
            resumed_from: Some(path.to_path_buf()),
            settings: checkpoint.settings,
        })
    }
}
