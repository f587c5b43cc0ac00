//! Control laws mapping a weight error onto shake actuation.
//!
//! Both strategies share the [`ControlLaw`] signature and are selected once, at
//! configuration time, through [`ControlLawKind`]. A law answers `None` when its inputs
//! cannot produce an actuation; callers substitute [`Actuation::SAFE_DEFAULT`] rather
//! than abort the run.

use serde::{Deserialize, Serialize};

mod deterministic;
mod fuzzy;

pub use deterministic::DeterministicLaw;
pub use fuzzy::{FuzzyLaw, MembershipFunction};

/// Shake parameters sent to the rig.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Actuation {
    pub amplitude: f64,
    pub angle: f64,
}

impl Actuation {
    /// Fallback used when a law produces no result.
    pub const SAFE_DEFAULT: Actuation = Actuation { amplitude: 10.0, angle: 10.0 };

    pub fn new(amplitude: f64, angle: f64) -> Self {
        Self { amplitude, angle }
    }
}

/// Inclusive output bounds of a control law.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActuationLimits {
    pub amplitude: (f64, f64),
    pub angle: (f64, f64),
}

impl ActuationLimits {
    /// Clamp both outputs into range.
    pub fn clamp(&self, amplitude: f64, angle: f64) -> Actuation {
        Actuation {
            amplitude: amplitude.clamp(self.amplitude.0, self.amplitude.1),
            angle: angle.clamp(self.angle.0, self.angle.1),
        }
    }

    pub fn contains(&self, actuation: &Actuation) -> bool {
        (self.amplitude.0..=self.amplitude.1).contains(&actuation.amplitude)
            && (self.angle.0..=self.angle.1).contains(&actuation.angle)
    }
}

/// Strategy turning a weight error into an actuation.
pub trait ControlLaw: Send + Sync {
    /// Compute the actuation for the given weights (grams) and material parameters.
    ///
    /// Returns `None` when the inputs are not finite or the density is not positive.
    fn compute(
        &self,
        target_weight: f64,
        current_weight: f64,
        density: f64,
        particle_size: f64,
    ) -> Option<Actuation>;

    /// Output bounds every result of [`ControlLaw::compute`] lies within.
    fn limits(&self) -> ActuationLimits;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Control-law selection, as read from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlLawKind {
    /// Threshold buckets scaled by density.
    #[default]
    Deterministic,
    /// Fuzzy rule base over difference and density.
    Fuzzy,
}

impl ControlLawKind {
    /// Instantiate the selected law.
    pub fn build(self) -> Box<dyn ControlLaw> {
        match self {
            ControlLawKind::Deterministic => Box::new(DeterministicLaw),
            ControlLawKind::Fuzzy => Box::new(FuzzyLaw::new()),
        }
    }
}

/// Shared input check: all values finite and density strictly positive.
fn inputs_valid(target_weight: f64, current_weight: f64, density: f64, particle_size: f64) -> bool {
    let finite = [target_weight, current_weight, density, particle_size]
        .iter()
        .all(|value| value.is_finite());

    if !finite {
        tracing::warn!(
            target_weight,
            current_weight,
            density,
            particle_size,
            "Control law given non-finite input"
        );
        return false;
    }
    if density <= 0.0 {
        tracing::warn!(density, "Control law given non-positive density");
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
          #[test]
          fn every_law_stays_within_its_limits(
            target in 0.0f64..1000.0,
            current in 0.0f64..1000.0,
            density in 1.0e-9f64..100.0,
            particle_size in 0.0f64..20.0
          ) {
            for kind in [ControlLawKind::Deterministic, ControlLawKind::Fuzzy] {
              let law = kind.build();
              let actuation = law.compute(target, current, density, particle_size);
              prop_assert!(actuation.is_some());
              let actuation = actuation.unwrap();
              prop_assert!(
                  law.limits().contains(&actuation),
                  "{} out of range: {:?}",
                  law.name(),
                  actuation
              );
            }
          }
        }
    }

    #[test]
    fn invalid_inputs_produce_no_result() {
        for kind in [ControlLawKind::Deterministic, ControlLawKind::Fuzzy] {
            let law = kind.build();
            assert_eq!(law.compute(10.0, 5.0, 0.0, 3.0), None);
            assert_eq!(law.compute(10.0, 5.0, -1.0, 3.0), None);
            assert_eq!(law.compute(f64::NAN, 5.0, 2.0, 3.0), None);
            assert_eq!(law.compute(10.0, f64::INFINITY, 2.0, 3.0), None);
        }
    }

    #[test]
    fn kind_deserializes_from_snake_case() {
        let kind: ControlLawKind = serde_yaml_ng::from_str("fuzzy").unwrap();
        assert_eq!(kind, ControlLawKind::Fuzzy);
        assert_eq!(kind.build().name(), "fuzzy");
        assert_eq!(ControlLawKind::default().build().name(), "deterministic");
    }
}
