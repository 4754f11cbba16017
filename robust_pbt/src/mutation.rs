//! The "explore" half of exploit/explore: hyperparameter perturbation.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::population::{HyperValue, Hyperparameters};
use crate::settings::{MutationConfig, ParamBounds};

/// Perturbs hyperparameters of cloned seeds.
#[derive(Debug, Clone)]
pub struct Mutator {
    config: MutationConfig,
}

impl Mutator {
    pub fn new(config: MutationConfig) -> Self {
        Self { config }
    }

    /// Produce a perturbed copy of `params`. The input is left untouched.
    pub fn explore<R: Rng + ?Sized>(&self, params: &Hyperparameters, rng: &mut R) -> Hyperparameters {
        params
            .iter()
            .map(|(name, value)| (name.clone(), self.explore_value(name, value, rng)))
            .collect()
    }

    /// Sample a fresh generation 0 configuration around `base`.
    pub fn sample_initial<R: Rng + ?Sized>(&self, base: &Hyperparameters, rng: &mut R) -> Hyperparameters {
        base.iter()
            .map(|(name, value)| {
                let sampled = if self.is_frozen(name) {
                    value.clone()
                } else if let Some(choice) = self.config.choices.get(name).and_then(|c| c.choose(rng)) {
                    choice.clone()
                } else if let Some(bounds) = self.config.bounds.get(name) {
                    let raw = if bounds.min < bounds.max {
                        rng.gen_range(bounds.min..=bounds.max)
                    } else {
                        bounds.min
                    };
                    numeric_like(value, raw, Some(bounds))
                } else {
                    value.clone()
                };
                (name.clone(), sampled)
            })
            .collect()
    }

    fn is_frozen(&self, name: &str) -> bool {
        self.config.frozen.iter().any(|f| f == name)
    }

    fn explore_value<R: Rng + ?Sized>(&self, name: &str, value: &HyperValue, rng: &mut R) -> HyperValue {
        if self.is_frozen(name) {
            return value.clone();
        }

        let resample = rng.gen_bool(self.config.resample_probability);

        if let Some(choices) = self.config.choices.get(name) {
            if resample {
                if let Some(choice) = choices.choose(rng) {
                    return choice.clone();
                }
            }
            return value.clone();
        }

        let Some(current) = value.as_f64() else {
            return value.clone();
        };
        let bounds = self.config.bounds.get(name);

        let raw = match bounds {
            Some(b) if resample && b.min < b.max => rng.gen_range(b.min..=b.max),
            _ => {
                let factor = if self.config.max_perturb_factor > 1.0 {
                    rng.gen_range(1.0..=self.config.max_perturb_factor)
                } else {
                    1.0
                };
                if rng.gen_bool(0.5) {
                    current * factor
                } else {
                    current / factor
                }
            }
        };

        numeric_like(value, raw, bounds)
    }
}

/// Clamp `raw` into `bounds` and convert it back to the kind of `template`.
fn numeric_like(template: &HyperValue, raw: f64, bounds: Option<&ParamBounds>) -> HyperValue {
    let clamped = match bounds {
        Some(b) => raw.clamp(b.min, b.max),
        None => raw,
    };
    match template {
        HyperValue::Int(_) => HyperValue::Int(clamped.round() as i64),
        _ => HyperValue::Float(clamped),
    }
}
