use std::path::Path;

use tracing::{info, warn};

use super::buffer::NumericBuffer;
use super::codec::StateCodec;
use super::store::checkpoint_file_name;
use crate::error::CheckpointError;

/// One recovered derivative and the step it was captured at.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryFrame {
    pub step: u64,
    pub derivative: NumericBuffer,
}

/// Derivative history for a multi-step integrator, oldest frame first.
///
/// May be shorter than requested, or empty: it is best-effort momentum.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryBuffer {
    frames: Vec<HistoryFrame>,
}

impl HistoryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> &[HistoryFrame] {
        &self.frames
    }

    pub fn steps(&self) -> Vec<u64> {
        self.frames.iter().map(|f| f.step).collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Append a frame newer than every frame already held.
    pub fn push_newest(&mut self, step: u64, derivative: NumericBuffer) {
        self.frames.push(HistoryFrame { step, derivative });
    }

    fn push_oldest(&mut self, step: u64, derivative: NumericBuffer) {
        self.frames.insert(0, HistoryFrame { step, derivative });
    }

    pub fn into_derivatives(self) -> Vec<NumericBuffer> {
        self.frames.into_iter().map(|f| f.derivative).collect()
    }
}

/// Rebuilds derivative history from the checkpoint files of a run directory.
pub struct HistoryReconstructor;

impl HistoryReconstructor {
    /// Walk back from `current_step` over at most `depth` earlier steps and
    /// collect their derivatives in chronological order.
    ///
    /// Never fails: missing files, files without momentum, and unreadable
    /// files are logged and skipped. The scan stops before step 0.
    pub fn gather(run_dir: &Path, current_step: u64, depth: usize) -> HistoryBuffer {
        let mut history = HistoryBuffer::new();

        for i in 1..=depth as u64 {
            let target = match current_step.checked_sub(i) {
                Some(t) if t >= 1 => t,
                _ => break,
            };

            let file_name = checkpoint_file_name(target);
            let path = run_dir.join(&file_name);

            match StateCodec::read(&path) {
                Ok(checkpoint) => match checkpoint.derivative {
                    Some(derivative) => history.push_oldest(target, derivative),
                    None => warn!(
                        file = %file_name,
                        step = target,
                        "Checkpoint has no momentum data; skipping frame"
                    ),
                },
                Err(CheckpointError::MissingCheckpoint(_)) => warn!(
                    file = %file_name,
                    step = target,
                    "Missing history file; momentum will be imperfect"
                ),
                Err(e) => warn!(
                    file = %file_name,
                    step = target,
                    error = %e,
                    "Unreadable history file; skipping frame"
                ),
            }
        }

        info!(
            current_step,
            depth,
            frames = history.len(),
            steps = ?history.steps(),
            "Rebuilt history buffer"
        );
        history
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::codec::Checkpoint;
    use crate::checkpoint::metadata::Settings;
    use crate::checkpoint::rng::DeviceRngs;
    use std::fs;

    fn derivative_for(step: u64) -> NumericBuffer {
        NumericBuffer::from_vec(vec![step as f32, step as f32 * 0.5])
    }

    fn write(dir: &Path, step: u64, with_momentum: bool) {
        let state = NumericBuffer::from_vec(vec![0.0, 0.0]);
        let derivative = derivative_for(step);
        let checkpoint = Checkpoint::capture(
            step,
            &state,
            with_momentum.then_some(&derivative),
            &Settings::new(),
            &DeviceRngs::seeded(step),
        )
        .unwrap();
        StateCodec::save(&dir.join(checkpoint_file_name(step)), &checkpoint).unwrap();
    }

    #[test]
    fn test_full_history_is_chronological() {
        let dir = tempfile::tempdir().unwrap();
        for step in 1..=6 {
            write(dir.path(), step, true);
        }
        let history = HistoryReconstructor::gather(dir.path(), 6, 3);
        assert_eq!(history.steps(), vec![3, 4, 5]);
        assert_eq!(
            history.into_derivatives(),
            vec![derivative_for(3), derivative_for(4), derivative_for(5)]
        );
    }

    #[test]
    fn test_gap_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), 7, true);
        write(dir.path(), 9, true);

        let history = HistoryReconstructor::gather(dir.path(), 10, 3);
        assert_eq!(history.steps(), vec![7, 9]);
        assert_eq!(
            history.into_derivatives(),
            vec![derivative_for(7), derivative_for(9)]
        );
    }

    #[test]
    fn test_stops_at_first_step() {
        let dir = tempfile::tempdir().unwrap();
        for step in 1..=2 {
            write(dir.path(), step, true);
        }
        assert_eq!(HistoryReconstructor::gather(dir.path(), 3, 5).steps(), vec![1, 2]);
        assert!(HistoryReconstructor::gather(dir.path(), 1, 3).is_empty());
        assert!(HistoryReconstructor::gather(dir.path(), 0, 3).is_empty());
    }

    #[test]
    fn test_skips_frames_without_momentum() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), 4, true);
        write(dir.path(), 5, false);
        assert_eq!(HistoryReconstructor::gather(dir.path(), 6, 2).steps(), vec![4]);
    }

    #[test]
    fn test_skips_corrupt_frames() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), 3, true);
        fs::write(dir.path().join(checkpoint_file_name(4)), b"garbage").unwrap();
        write(dir.path(), 5, true);
        assert_eq!(HistoryReconstructor::gather(dir.path(), 6, 3).steps(), vec![3, 5]);
    }

    #[test]
    fn test_skips_frame_with_overflowing_shape() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), 3, true);
        write(dir.path(), 4, true);
        // Rewrite step 4 so its derivative claims an impossible element count.
        let path = dir.path().join(checkpoint_file_name(4));
        let mut value: ciborium::value::Value =
            ciborium::from_reader(fs::read(&path).unwrap().as_slice()).unwrap();
        for (key, tensors) in value.as_map_mut().unwrap() {
            if key.as_text() != Some("tensors") {
                continue;
            }
            for (_, record) in tensors.as_map_mut().unwrap() {
                for (field, shape) in record.as_map_mut().unwrap() {
                    if field.as_text() == Some("shape") {
                        *shape = ciborium::value::Value::Array(vec![
                            ciborium::value::Value::Integer(u64::MAX.into()),
                            ciborium::value::Value::Integer(2u8.into()),
                        ]);
                    }
                }
            }
        }
        let mut bytes = Vec::new();
        ciborium::into_writer(&value, &mut bytes).unwrap();
        fs::write(&path, bytes).unwrap();

        assert_eq!(HistoryReconstructor::gather(dir.path(), 5, 2).steps(), vec![3]);
    }

    #[test]
    fn test_zero_depth_and_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(HistoryReconstructor::gather(dir.path(), 10, 0).is_empty());
        assert!(HistoryReconstructor::gather(dir.path(), 10, 3).is_empty());
    }

    #[test]
    fn test_idempotent_and_monotonically_degrading() {
        let dir = tempfile::tempdir().unwrap();
        for step in 5..=9 {
            write(dir.path(), step, true);
        }
        let first = HistoryReconstructor::gather(dir.path(), 10, 4);
        let second = HistoryReconstructor::gather(dir.path(), 10, 4);
        assert_eq!(first, second);
        assert_eq!(first.steps(), vec![6, 7, 8, 9]);

        fs::remove_file(dir.path().join(checkpoint_file_name(8))).unwrap();
        let degraded = HistoryReconstructor::gather(dir.path(), 10, 4);
        assert_eq!(degraded.steps(), vec![6, 7, 9]);
        let kept: Vec<_> = first.frames().iter().filter(|f| f.step != 8).cloned().collect();
        assert_eq!(degraded.frames(), kept.as_slice());
    }
}
