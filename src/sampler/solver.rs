//! The solver seam and a few reference integrators.
//!
//! Production solvers live outside this crate and implement [`Solver`]. The
//! integrators here exist to drive the step loop end to end: one consumes
//! randomness every step, two carry multi-step momentum.

use std::collections::VecDeque;

use rand::Rng;
use rand_distr::StandardNormal;

use crate::checkpoint::{DeviceRngs, NumericBuffer};

/// Where a single step sits in the schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepContext {
    /// 1-based absolute step index.
    pub step: u64,
    pub sigma: f32,
    pub sigma_next: f32,
}

/// Result of one solver step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    /// State after the step.
    pub state: NumericBuffer,
    /// The denoiser's estimate at the start of the step.
    pub denoised: NumericBuffer,
    /// Trajectory derivative at the start of the step; this is what
    /// snapshots store as momentum.
    pub derivative: NumericBuffer,
}

pub trait Solver {
    fn name(&self) -> &str;

    /// Number of derivative frames the solver wants when resumed, counting
    /// the derivative stored in the resume checkpoint itself.
    fn history_depth(&self) -> usize {
        0
    }

    /// Seed the solver's momentum before the first step, oldest frame first.
    fn begin(&mut self, _initial_history: Vec<NumericBuffer>) {}

    fn step(&mut self, ctx: &StepContext, state: &NumericBuffer, rngs: &mut DeviceRngs) -> StepOutput;
}

/// Predicts the clean signal from a noisy state.
pub trait Denoiser {
    fn denoise(&self, x: &NumericBuffer, sigma: f32) -> NumericBuffer;
}

/// Reference denoiser that pulls the state toward zero in proportion to the
/// noise level.
#[derive(Debug, Clone, Copy)]
pub struct ShrinkDenoiser {
    pub strength: f32,
}

impl Denoiser for ShrinkDenoiser {
    fn denoise(&self, x: &NumericBuffer, sigma: f32) -> NumericBuffer {
        x.scale(1.0 / (1.0 + self.strength * sigma))
    }
}

/// Karras derivative `(x - x0) / sigma`.
fn to_derivative(x: &NumericBuffer, denoised: &NumericBuffer, sigma: f32) -> NumericBuffer {
    x.sub(denoised).scale(1.0 / sigma)
}

/// Draw standard normal noise shaped like `like` from the default device.
pub fn gaussian_like(like: &NumericBuffer, rngs: &mut DeviceRngs) -> NumericBuffer {
    let rng = rngs.default_mut();
    like.map(|_| rng.sample::<f32, _>(StandardNormal))
}

/// Named reference solvers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverKind {
    Euler,
    EulerAncestral,
    Multistep2M,
    Multistep3M,
}

impl SolverKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "euler" => Some(SolverKind::Euler),
            "euler_ancestral" => Some(SolverKind::EulerAncestral),
            "multistep_2m" => Some(SolverKind::Multistep2M),
            "multistep_3m" => Some(SolverKind::Multistep3M),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SolverKind::Euler => "euler",
            SolverKind::EulerAncestral => "euler_ancestral",
            SolverKind::Multistep2M => "multistep_2m",
            SolverKind::Multistep3M => "multistep_3m",
        }
    }

    pub fn history_depth(self) -> usize {
        match self {
            SolverKind::Euler | SolverKind::EulerAncestral => 0,
            SolverKind::Multistep2M => 1,
            SolverKind::Multistep3M => 2,
        }
    }

    pub fn build<D: Denoiser + 'static>(self, denoiser: D) -> Box<dyn Solver> {
        match self {
            SolverKind::Euler => Box::new(EulerSolver { denoiser }),
            SolverKind::EulerAncestral => Box::new(EulerAncestralSolver { denoiser }),
            SolverKind::Multistep2M => Box::new(MultistepSolver::new(denoiser, 2)),
            SolverKind::Multistep3M => Box::new(MultistepSolver::new(denoiser, 3)),
        }
    }
}

pub struct EulerSolver<D> {
    denoiser: D,
}

impl<D: Denoiser> EulerSolver<D> {
    pub fn new(denoiser: D) -> Self {
        EulerSolver { denoiser }
    }
}

impl<D: Denoiser> Solver for EulerSolver<D> {
    fn name(&self) -> &str {
        SolverKind::Euler.name()
    }

    fn step(&mut self, ctx: &StepContext, state: &NumericBuffer, _rngs: &mut DeviceRngs) -> StepOutput {
        let denoised = self.denoiser.denoise(state, ctx.sigma);
        let derivative = to_derivative(state, &denoised, ctx.sigma);
        let next = state.add_scaled(ctx.sigma_next - ctx.sigma, &derivative);
        StepOutput {
            state: next,
            denoised,
            derivative,
        }
    }
}

/// Euler step to `sigma_down`, then fresh noise up to `sigma_next`.
pub struct EulerAncestralSolver<D> {
    denoiser: D,
}

impl<D: Denoiser> EulerAncestralSolver<D> {
    pub fn new(denoiser: D) -> Self {
        EulerAncestralSolver { denoiser }
    }
}

impl<D: Denoiser> Solver for EulerAncestralSolver<D> {
    fn name(&self) -> &str {
        SolverKind::EulerAncestral.name()
    }

    fn step(&mut self, ctx: &StepContext, state: &NumericBuffer, rngs: &mut DeviceRngs) -> StepOutput {
        let (sigma, sigma_next) = (ctx.sigma, ctx.sigma_next);
        let denoised = self.denoiser.denoise(state, sigma);
        let derivative = to_derivative(state, &denoised, sigma);

        let sigma_up = if sigma_next > 0.0 {
            (sigma_next * sigma_next * (sigma * sigma - sigma_next * sigma_next) / (sigma * sigma))
                .max(0.0)
                .sqrt()
                .min(sigma_next)
        } else {
            0.0
        };
        let sigma_down = (sigma_next * sigma_next - sigma_up * sigma_up).max(0.0).sqrt();

        let mut next = state.add_scaled(sigma_down - sigma, &derivative);
        if sigma_next > 0.0 {
            let noise = gaussian_like(state, rngs);
            next = next.add_scaled(sigma_up, &noise);
        }

        StepOutput {
            state: next,
            denoised,
            derivative,
        }
    }
}

/// Adams–Bashforth integrator over past derivatives. Runs at reduced order
/// until enough history has accumulated.
pub struct MultistepSolver<D> {
    denoiser: D,
    order: usize,
    /// Previous derivatives, oldest first, at most `order - 1`.
    history: VecDeque<NumericBuffer>,
}

impl<D: Denoiser> MultistepSolver<D> {
    pub fn new(denoiser: D, order: usize) -> Self {
        let order = order.clamp(1, 3);
        MultistepSolver {
            denoiser,
            order,
            history: VecDeque::with_capacity(order),
        }
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    fn remember(&mut self, derivative: NumericBuffer) {
        self.history.push_back(derivative);
        while self.history.len() > self.order - 1 {
            self.history.pop_front();
        }
    }
}

impl<D: Denoiser> Solver for MultistepSolver<D> {
    fn name(&self) -> &str {
        if self.order >= 3 {
            SolverKind::Multistep3M.name()
        } else {
            SolverKind::Multistep2M.name()
        }
    }

    fn history_depth(&self) -> usize {
        self.order - 1
    }

    fn begin(&mut self, initial_history: Vec<NumericBuffer>) {
        self.history.clear();
        for frame in initial_history {
            self.remember(frame);
        }
    }

    fn step(&mut self, ctx: &StepContext, state: &NumericBuffer, _rngs: &mut DeviceRngs) -> StepOutput {
        let denoised = self.denoiser.denoise(state, ctx.sigma);
        let derivative = to_derivative(state, &denoised, ctx.sigma);
        let h = ctx.sigma_next - ctx.sigma;

        // Frames whose shape no longer matches (e.g. a resumed run with a
        // different state size) are ignored.
        let usable: Vec<&NumericBuffer> = self
            .history
            .iter()
            .rev()
            .filter(|d| d.same_shape(&derivative))
            .collect();

        let slope = match (self.order, usable.as_slice()) {
            (3.., [d1, d2, ..]) => derivative.combine(&[
                (23.0 / 12.0, &derivative),
                (-16.0 / 12.0, *d1),
                (5.0 / 12.0, *d2),
            ]),
            (2.., [d1, ..]) => derivative.combine(&[(1.5, &derivative), (-0.5, *d1)]),
            _ => derivative.clone(),
        };

        let next = state.add_scaled(h, &slope);
        self.remember(derivative.clone());

        StepOutput {
            state: next,
            denoised,
            derivative,
        }
    }
}
