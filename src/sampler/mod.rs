//! The step loop and everything it drives: solvers, the sigma schedule,
//! resume planning, progress events, and run metrics.

pub mod events;
pub mod metrics;
pub mod resume;
pub mod schedule;
pub mod solver;
pub mod worker;

pub use events::SamplerUpdate;
pub use metrics::RunMetrics;
pub use resume::ResumePlan;
pub use schedule::Schedule;
pub use solver::{
    Denoiser, EulerAncestralSolver, EulerSolver, MultistepSolver, ShrinkDenoiser, Solver,
    SolverKind, StepContext, StepOutput,
};
pub use worker::{RunOutcome, Sampler, SnapshotPolicy};
