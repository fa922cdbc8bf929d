use serde::{Deserialize, Serialize};

/// Exponentially decayed learning rate at `step`.
///
/// Computes `initial * decay_rate^(step / decay_steps)`. With `staircase` the
/// exponent uses integer division, so the rate drops once per `decay_steps`.
/// A `decay_steps` of zero disables decay.
pub fn exponential_decay(
    initial: f64,
    step: usize,
    decay_steps: usize,
    decay_rate: f64,
    staircase: bool,
) -> f64 {
    if decay_steps == 0 {
        return initial;
    }

    let exponent = if staircase {
        (step / decay_steps) as f64
    } else {
        step as f64 / decay_steps as f64
    };
    initial * decay_rate.powf(exponent)
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExponentialDecay {
    pub initial: f64,
    pub decay_steps: usize,
    pub decay_rate: f64,
    pub staircase: bool,
}

impl ExponentialDecay {
    pub fn rate_at(&self, step: usize) -> f64 {
        exponential_decay(
            self.initial,
            step,
            self.decay_steps,
            self.decay_rate,
            self.staircase,
        )
    }
}
