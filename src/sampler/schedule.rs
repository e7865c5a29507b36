use crate::error::SamplingError;

const KARRAS_RHO: f32 = 7.0;

/// Noise levels for each step boundary, descending, ending at zero.
///
/// Step `k` (1-based) moves the state from `sigmas[k - 1]` to `sigmas[k]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    sigmas: Vec<f32>,
}

impl Schedule {
    /// Karras et al. spacing between `sigma_max` and `sigma_min`.
    pub fn karras(steps: u64, sigma_min: f32, sigma_max: f32) -> Result<Self, SamplingError> {
        if steps == 0 {
            return Err(SamplingError::EmptySchedule);
        }
        let min_inv = sigma_min.powf(1.0 / KARRAS_RHO);
        let max_inv = sigma_max.powf(1.0 / KARRAS_RHO);
        let mut sigmas: Vec<f32> = (0..steps)
            .map(|i| {
                let t = if steps == 1 {
                    0.0
                } else {
                    i as f32 / (steps - 1) as f32
                };
                (max_inv + t * (min_inv - max_inv)).powf(KARRAS_RHO)
            })
            .collect();
        sigmas.push(0.0);
        Ok(Schedule { sigmas })
    }

    pub fn from_sigmas(sigmas: Vec<f32>) -> Result<Self, SamplingError> {
        if sigmas.len() < 2 {
            return Err(SamplingError::EmptySchedule);
        }
        Ok(Schedule { sigmas })
    }

    pub fn steps(&self) -> u64 {
        (self.sigmas.len() - 1) as u64
    }

    pub fn sigmas(&self) -> &[f32] {
        &self.sigmas
    }

    /// Noise level at the boundary after `step` (0 is the initial level).
    pub fn sigma_at(&self, step: u64) -> Option<f32> {
        self.sigmas.get(usize::try_from(step).ok()?).copied()
    }

    /// `(sigma, sigma_next)` for 1-based `step`.
    pub fn sigma_pair(&self, step: u64) -> Option<(f32, f32)> {
        if step == 0 {
            return None;
        }
        Some((self.sigma_at(step - 1)?, self.sigma_at(step)?))
    }
}
