use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::checkpoint::{Checkpoint, DeviceRngs, NumericBuffer, Settings, SnapshotStore, StateCodec};
use crate::config::SnapshotConfig;
use crate::control::{ControlChannel, ControlCommand};
use crate::error::{CheckpointError, SamplingError};

use super::events::SamplerUpdate;
use super::metrics::RunMetrics;
use super::resume::ResumePlan;
use super::schedule::Schedule;
use super::solver::{Solver, StepContext};

/// When the worker writes checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotPolicy {
    /// Snapshot after every step divisible by this. 0 disables cadence snapshots.
    pub interval: u64,
    /// Bytes reserved beyond the encoded size for cadence snapshots.
    pub headroom_bytes: u64,
    /// Bytes reserved beyond the encoded size for forced snapshots.
    pub forced_headroom_bytes: u64,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        SnapshotPolicy::from(&SnapshotConfig::default())
    }
}

impl From<&SnapshotConfig> for SnapshotPolicy {
    fn from(config: &SnapshotConfig) -> Self {
        SnapshotPolicy {
            interval: config.interval,
            headroom_bytes: config.headroom_bytes,
            forced_headroom_bytes: config.forced_headroom_bytes,
        }
    }
}

impl SnapshotPolicy {
    fn is_due(&self, step: u64) -> bool {
        self.interval > 0 && step % self.interval == 0
    }
}

/// How a run ended. Both variants carry the state after `last_step`.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed { state: NumericBuffer, last_step: u64 },
    /// An `EXIT` command was observed at a step boundary.
    Aborted { state: NumericBuffer, last_step: u64 },
}

impl RunOutcome {
    pub fn state(&self) -> &NumericBuffer {
        match self {
            RunOutcome::Completed { state, .. } | RunOutcome::Aborted { state, .. } => state,
        }
    }

    pub fn into_state(self) -> NumericBuffer {
        match self {
            RunOutcome::Completed { state, .. } | RunOutcome::Aborted { state, .. } => state,
        }
    }

    pub fn last_step(&self) -> u64 {
        match self {
            RunOutcome::Completed { last_step, .. } | RunOutcome::Aborted { last_step, .. } => {
                *last_step
            }
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, RunOutcome::Aborted { .. })
    }
}

/// Step loop for one run: consults the control channel at every boundary and
/// writes checkpoints into the run's snapshot store.
pub struct Sampler {
    channel: Arc<ControlChannel>,
    store: SnapshotStore,
    policy: SnapshotPolicy,
    settings: Settings,
    updates: Option<mpsc::Sender<SamplerUpdate>>,
    metrics: RunMetrics,
}

impl Sampler {
    pub fn new(channel: Arc<ControlChannel>, store: SnapshotStore) -> Self {
        Sampler {
            channel,
            store,
            policy: SnapshotPolicy::default(),
            settings: Settings::new(),
            updates: None,
            metrics: RunMetrics::new(),
        }
    }

    pub fn with_policy(mut self, policy: SnapshotPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Settings recorded in every checkpoint this sampler writes.
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_updates(mut self, updates: mpsc::Sender<SamplerUpdate>) -> Self {
        self.updates = Some(updates);
        self
    }

    pub fn channel(&self) -> &Arc<ControlChannel> {
        &self.channel
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn metrics(&self) -> &RunMetrics {
        &self.metrics
    }

    /// Execute steps `plan.start_step + 1 ..= end_step` (clamped to the
    /// schedule length).
    ///
    /// The solver is seeded with the plan's history before the first step.
    /// `EXIT` ends the run with [`RunOutcome::Aborted`] and the state of the
    /// last completed step. Snapshot failures are logged and never end the run.
    pub fn run(
        &mut self,
        solver: &mut dyn Solver,
        schedule: &Schedule,
        plan: ResumePlan,
        end_step: u64,
        rngs: &mut DeviceRngs,
    ) -> Result<RunOutcome, SamplingError> {
        let end_step = end_step.min(schedule.steps());
        if plan.start_step > end_step {
            return Err(SamplingError::StepOutOfRange {
                start: plan.start_step,
                end: end_step,
            });
        }

        let ResumePlan {
            start_step,
            mut state,
            history,
            resumed_from,
            ..
        } = plan;

        info!(
            run_id = %self.store.run_id(),
            solver = solver.name(),
            start_step,
            end_step,
            history_frames = history.len(),
            resumed_from = ?resumed_from,
            "Starting sampling run"
        );
        solver.begin(history.into_derivatives());

        let mut last_step = start_step;
        for step in start_step + 1..=end_step {
            if self.at_boundary(last_step) == ControlCommand::Exit {
                info!(run_id = %self.store.run_id(), last_step, "Exit requested; stopping at step boundary");
                self.emit(SamplerUpdate::Aborted { last_step });
                return Ok(RunOutcome::Aborted { state, last_step });
            }

            let (sigma, sigma_next) = schedule.sigma_pair(step).ok_or(SamplingError::StepOutOfRange {
                start: step,
                end: schedule.steps(),
            })?;
            let ctx = StepContext {
                step,
                sigma,
                sigma_next,
            };

            let started = Instant::now();
            let output = solver.step(&ctx, &state, rngs);
            self.metrics.record_step(started.elapsed());
            state = output.state;
            last_step = step;
            debug!(step, sigma, sigma_next, "Step completed");
            self.emit(SamplerUpdate::StepCompleted { step, end_step });

            let forced = self.channel.take_snapshot_request();
            if forced || self.policy.is_due(step) {
                self.snapshot(step, &state, &output.derivative, rngs, forced);
            }
        }

        info!(
            run_id = %self.store.run_id(),
            last_step,
            snapshots = self.metrics.snapshots_written(),
            avg_step_ms = self.metrics.avg_step_ms(100),
            "Sampling run finished"
        );
        self.emit(SamplerUpdate::Finished { last_step });
        Ok(RunOutcome::Completed { state, last_step })
    }

    /// Handle the command in effect at the boundary after `after_step`,
    /// blocking while paused. Returns the command that lets the loop go on
    /// (or stop).
    fn at_boundary(&mut self, after_step: u64) -> ControlCommand {
        let command = self.channel.get();
        if command != ControlCommand::Pause {
            return command;
        }

        info!(run_id = %self.store.run_id(), after_step, "Paused");
        self.emit(SamplerUpdate::Paused { after_step });
        let blocked = Instant::now();
        let command = self.channel.await_resume();
        self.metrics.record_pause(blocked.elapsed());
        info!(run_id = %self.store.run_id(), after_step, command = %command, "Resumed");
        self.emit(SamplerUpdate::Resumed { after_step, command });
        command
    }

    fn snapshot(
        &mut self,
        step: u64,
        state: &NumericBuffer,
        derivative: &NumericBuffer,
        rngs: &DeviceRngs,
        forced: bool,
    ) {
        let written = Checkpoint::capture(step, state, Some(derivative), &self.settings, rngs)
            .and_then(|checkpoint| self.write_checkpoint(&checkpoint, forced));
        match written {
            Ok((path, size_bytes)) => {
                self.metrics.record_snapshot(size_bytes);
                info!(
                    run_id = %self.store.run_id(),
                    step,
                    path = %path.display(),
                    size_bytes,
                    forced,
                    "Snapshot saved"
                );
                self.emit(SamplerUpdate::SnapshotSaved {
                    step,
                    path,
                    size_bytes,
                    forced,
                });
            }
            Err(e) => {
                self.metrics.record_snapshot_failure();
                warn!(run_id = %self.store.run_id(), step, error = %e, "Snapshot failed; continuing");
            }
        }
    }

    fn write_checkpoint(
        &mut self,
        checkpoint: &Checkpoint,
        forced: bool,
    ) -> Result<(PathBuf, u64), CheckpointError> {
        let bytes = StateCodec::encode(checkpoint)?;
        let size_bytes = bytes.len() as u64;
        let headroom = if forced {
            self.policy.forced_headroom_bytes
        } else {
            self.policy.headroom_bytes
        };

        let report = self.store.enforce_limit(size_bytes.saturating_add(headroom))?;
        if !report.is_empty() {
            self.metrics.record_eviction(report.evicted_steps.len());
            self.emit(SamplerUpdate::Evicted {
                steps: report.evicted_steps,
                bytes_freed: report.bytes_freed,
            });
        }

        let path = self.store.path_for_step(checkpoint.step);
        StateCodec::write_encoded(&path, &bytes)?;
        self.store.register(&path, checkpoint.step)?;
        Ok((path, size_bytes))
    }

    fn emit(&self, update: SamplerUpdate) {
        if let Some(tx) = &self.updates {
            let _ = tx.send(update);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::checkpoint_file_name;
    use crate::sampler::solver::{EulerSolver, ShrinkDenoiser, StepOutput};
    use crate::session::RunId;
    use std::path::Path;

    /// Adds 1.0 to every value and runs a hook after the given step.
    struct CountingSolver<F: FnMut(u64)> {
        hook: F,
    }

    impl<F: FnMut(u64)> Solver for CountingSolver<F> {
        fn name(&self) -> &str {
            "counting"
        }

        fn step(&mut self, ctx: &StepContext, state: &NumericBuffer, _rngs: &mut DeviceRngs) -> StepOutput {
            (self.hook)(ctx.step);
            let ones = state.map(|_| 1.0);
            StepOutput {
                state: state.add_scaled(1.0, &ones),
                denoised: state.clone(),
                derivative: ones,
            }
        }
    }

    fn sampler(dir: &Path, interval: u64) -> Sampler {
        let store = SnapshotStore::new(dir, RunId::new("test").unwrap(), u64::MAX).unwrap();
        Sampler::new(Arc::new(ControlChannel::new()), store).with_policy(SnapshotPolicy {
            interval,
            ..SnapshotPolicy::default()
        })
    }

    fn schedule(steps: u64) -> Schedule {
        Schedule::karras(steps, 0.1, 10.0).unwrap()
    }

    #[test]
    fn test_runs_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let mut sampler = sampler(dir.path(), 0);
        let mut solver = CountingSolver { hook: |_: u64| {} };
        let outcome = sampler
            .run(
                &mut solver,
                &schedule(5),
                ResumePlan::fresh(0, NumericBuffer::zeros(vec![2])),
                100,
                &mut DeviceRngs::seeded(0),
            )
            .unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Completed {
                state: NumericBuffer::from_vec(vec![5.0, 5.0]),
                last_step: 5
            }
        );
        assert_eq!(sampler.metrics().steps_completed(), 5);
    }

    #[test]
    fn test_exit_mid_step_returns_last_completed_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut sampler = sampler(dir.path(), 0);
        let channel = sampler.channel().clone();
        let mut executed = Vec::new();
        let mut solver = CountingSolver {
            hook: |step: u64| {
                executed.push(step);
                if step == 3 {
                    channel.set(ControlCommand::Exit);
                }
            },
        };
        let outcome = sampler
            .run(
                &mut solver,
                &schedule(10),
                ResumePlan::fresh(0, NumericBuffer::zeros(vec![1])),
                10,
                &mut DeviceRngs::seeded(0),
            )
            .unwrap();
        drop(solver);

        assert!(outcome.is_aborted());
        assert_eq!(outcome.last_step(), 3);
        assert_eq!(outcome.state().values(), &[3.0]);
        assert_eq!(executed, vec![1, 2, 3]);
    }

    #[test]
    fn test_cadence_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let mut sampler = sampler(dir.path(), 2);
        let mut solver = CountingSolver { hook: |_: u64| {} };
        sampler
            .run(
                &mut solver,
                &schedule(7),
                ResumePlan::fresh(0, NumericBuffer::zeros(vec![1])),
                7,
                &mut DeviceRngs::seeded(0),
            )
            .unwrap();

        let steps: Vec<u64> = sampler.store().index().iter().map(|e| e.step).collect();
        assert_eq!(steps, vec![2, 4, 6]);
        let saved = StateCodec::read(&sampler.store().path_for_step(4)).unwrap();
        assert_eq!(saved.state.values(), &[4.0]);
        assert!(saved.has_momentum());
        assert_eq!(sampler.metrics().snapshots_written(), 3);
    }

    #[test]
    fn test_forced_snapshot_fires_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut sampler = sampler(dir.path(), 0);
        let channel = sampler.channel().clone();
        let mut solver = CountingSolver {
            hook: |step: u64| {
                if step == 2 {
                    channel.set(ControlCommand::Snapshot);
                }
            },
        };
        sampler
            .run(
                &mut solver,
                &schedule(5),
                ResumePlan::fresh(0, NumericBuffer::zeros(vec![1])),
                5,
                &mut DeviceRngs::seeded(0),
            )
            .unwrap();
        drop(solver);

        let steps: Vec<u64> = sampler.store().index().iter().map(|e| e.step).collect();
        assert_eq!(steps, vec![2]);
        assert_eq!(sampler.channel().get(), ControlCommand::Proceed);
    }

    /// Runs five counting steps with a cadence snapshot after every step and a
    /// SNAPSHOT request after step 4. Returns the final index and each eviction batch.
    fn run_with_headroom(
        dir: &Path,
        budget_in_checkpoints: u64,
        headroom: u64,
        forced_headroom: u64,
    ) -> (Vec<u64>, Vec<Vec<u64>>) {
        // Every checkpoint of this run encodes to the same size.
        let one = NumericBuffer::from_vec(vec![1.0]);
        let sample = Checkpoint::capture(1, &one, Some(&one), &Settings::new(), &DeviceRngs::seeded(0)).unwrap();
        let size = StateCodec::encode(&sample).unwrap().len() as u64;

        let store = SnapshotStore::new(dir, RunId::new("headroom").unwrap(), budget_in_checkpoints * size).unwrap();
        let (tx, rx) = mpsc::channel();
        let mut sampler = Sampler::new(Arc::new(ControlChannel::new()), store)
            .with_policy(SnapshotPolicy {
                interval: 1,
                headroom_bytes: headroom * size,
                forced_headroom_bytes: forced_headroom * size,
            })
            .with_updates(tx);
        let channel = sampler.channel().clone();
        let mut solver = CountingSolver {
            hook: |step: u64| {
                if step == 4 {
                    channel.set(ControlCommand::Snapshot);
                }
            },
        };
        sampler
            .run(
                &mut solver,
                &schedule(5),
                ResumePlan::fresh(0, NumericBuffer::zeros(vec![1])),
                5,
                &mut DeviceRngs::seeded(0),
            )
            .unwrap();
        drop(solver);

        assert_eq!(sampler.metrics().snapshots_written(), 5);
        assert!(sampler.store().disk_usage().unwrap() <= budget_in_checkpoints * size);
        let index = sampler.store().index().iter().map(|e| e.step).collect();
        drop(sampler);
        let evictions = rx
            .iter()
            .filter_map(|u| match u {
                SamplerUpdate::Evicted { steps, .. } => Some(steps),
                _ => None,
            })
            .collect();
        (index, evictions)
    }

    #[test]
    fn test_forced_snapshot_reserves_its_own_headroom() {
        let dir = tempfile::tempdir().unwrap();
        let (index, evictions) = run_with_headroom(dir.path(), 3, 0, 1);
        // Cadence steps 1-3 fill the budget exactly. The forced snapshot at
        // step 4 needs room for itself plus one checkpoint of headroom.
        assert_eq!(evictions, vec![vec![1, 2]]);
        assert_eq!(index, vec![3, 4, 5]);
    }

    #[test]
    fn test_cadence_snapshot_reserves_its_own_headroom() {
        let dir = tempfile::tempdir().unwrap();
        let (index, evictions) = run_with_headroom(dir.path(), 3, 1, 0);
        // Cadence step 3 already needs headroom; the forced step 4 does not.
        assert_eq!(evictions, vec![vec![1], vec![2, 3]]);
        assert_eq!(index, vec![4, 5]);
    }

    #[test]
    fn test_zero_headroom_evicts_one_per_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let (index, evictions) = run_with_headroom(dir.path(), 3, 0, 0);
        assert_eq!(evictions, vec![vec![1], vec![2]]);
        assert_eq!(index, vec![3, 4, 5]);
    }

    #[test]
    fn test_snapshot_failure_does_not_stop_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut sampler = sampler(dir.path(), 1);
        let run_dir = sampler.store().run_dir().to_path_buf();
        // A directory where the checkpoint file should go makes the rename fail.
        std::fs::create_dir(run_dir.join(checkpoint_file_name(2))).unwrap();
        let mut solver = CountingSolver { hook: |_: u64| {} };
        let outcome = sampler
            .run(
                &mut solver,
                &schedule(3),
                ResumePlan::fresh(0, NumericBuffer::zeros(vec![1])),
                3,
                &mut DeviceRngs::seeded(0),
            )
            .unwrap();
        assert_eq!(outcome.last_step(), 3);
        assert_eq!(sampler.metrics().snapshot_failures(), 1);
        let steps: Vec<u64> = sampler.store().index().iter().map(|e| e.step).collect();
        assert_eq!(steps, vec![1, 3]);
    }

    #[test]
    fn test_start_past_end_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut sampler = sampler(dir.path(), 0);
        let mut solver = EulerSolver::new(ShrinkDenoiser { strength: 0.5 });
        let err = sampler
            .run(
                &mut solver,
                &schedule(5),
                ResumePlan::fresh(6, NumericBuffer::zeros(vec![1])),
                5,
                &mut DeviceRngs::seeded(0),
            )
            .unwrap_err();
        assert!(matches!(err, SamplingError::StepOutOfRange { start: 6, end: 5 }));
    }

    #[test]
    fn test_resume_at_final_step_completes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let mut sampler = sampler(dir.path(), 0);
        let mut solver = CountingSolver {
            hook: |step: u64| assert!(step == 0, "no step should run"),
        };
        let outcome = sampler
            .run(
                &mut solver,
                &schedule(4),
                ResumePlan::fresh(4, NumericBuffer::from_vec(vec![7.0])),
                4,
                &mut DeviceRngs::seeded(0),
            )
            .unwrap();
        assert_eq!(outcome.last_step(), 4);
        assert_eq!(outcome.state().values(), &[7.0]);
    }

    #[test]
    fn test_events_are_emitted() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::channel();
        let mut sampler = sampler(dir.path(), 2).with_updates(tx);
        let mut solver = CountingSolver { hook: |_: u64| {} };
        sampler
            .run(
                &mut solver,
                &schedule(2),
                ResumePlan::fresh(0, NumericBuffer::zeros(vec![1])),
                2,
                &mut DeviceRngs::seeded(0),
            )
            .unwrap();
        drop(sampler);

        let updates: Vec<SamplerUpdate> = rx.iter().collect();
        assert_eq!(updates[0], SamplerUpdate::StepCompleted { step: 1, end_step: 2 });
        assert_eq!(updates[1], SamplerUpdate::StepCompleted { step: 2, end_step: 2 });
        assert!(matches!(
            updates[2],
            SamplerUpdate::SnapshotSaved { step: 2, forced: false, .. }
        ));
        assert_eq!(updates[3], SamplerUpdate::Finished { last_step: 2 });
    }
}
