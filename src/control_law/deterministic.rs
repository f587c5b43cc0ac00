//! Threshold control law.

use super::{Actuation, ActuationLimits, ControlLaw, inputs_valid};

const LIMITS: ActuationLimits = ActuationLimits { amplitude: (1.0, 100.0), angle: (1.0, 30.0) };

/// Buckets the relative weight error into an amplitude and the particle size into an
/// angle, then scales both by `1 / density`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeterministicLaw;

impl DeterministicLaw {
    /// `|T - C| / T * 100`, or 0 for a non-positive target.
    pub fn percent_difference(target_weight: f64, current_weight: f64) -> f64 {
        if target_weight <= 0.0 {
            return 0.0;
        }
        (target_weight - current_weight).abs() / target_weight * 100.0
    }

    /// Larger errors shake harder.
    pub fn amplitude_bucket(percent_difference: f64) -> f64 {
        if percent_difference > 50.0 {
            100.0
        } else if percent_difference > 20.0 {
            50.0
        } else if percent_difference > 5.0 {
            20.0
        } else {
            5.0
        }
    }

    /// Coarser particles tilt less.
    pub fn angle_bucket(particle_size: f64) -> f64 {
        if particle_size > 5.0 {
            5.0
        } else if particle_size > 2.0 {
            10.0
        } else {
            15.0
        }
    }
}

impl ControlLaw for DeterministicLaw {
    fn compute(
        &self,
        target_weight: f64,
        current_weight: f64,
        density: f64,
        particle_size: f64,
    ) -> Option<Actuation> {
        if !inputs_valid(target_weight, current_weight, density, particle_size) {
            return None;
        }

        let difference = Self::percent_difference(target_weight, current_weight);
        let density_factor = 1.0 / density;
        let amplitude = Self::amplitude_bucket(difference) * density_factor;
        let angle = Self::angle_bucket(particle_size) * density_factor;

        let actuation = LIMITS.clamp(amplitude, angle);
        tracing::debug!(
            difference_percent = difference,
            amplitude = actuation.amplitude,
            angle = actuation.angle,
            "Deterministic actuation computed"
        );
        Some(actuation)
    }

    fn limits(&self) -> ActuationLimits {
        LIMITS
    }

    fn name(&self) -> &'static str {
        "deterministic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn on_target_uses_smallest_buckets() {
        let actuation = DeterministicLaw.compute(10.0, 10.0, 2.0, 3.0).unwrap();
        assert!(approx(actuation.amplitude, 2.5));
        assert!(approx(actuation.angle, 5.0));
    }

    #[test]
    fn bucket_boundaries() {
        assert_eq!(DeterministicLaw::amplitude_bucket(50.1), 100.0);
        assert_eq!(DeterministicLaw::amplitude_bucket(50.0), 50.0);
        assert_eq!(DeterministicLaw::amplitude_bucket(20.0), 20.0);
        assert_eq!(DeterministicLaw::amplitude_bucket(5.0), 5.0);
        assert_eq!(DeterministicLaw::angle_bucket(5.5), 5.0);
        assert_eq!(DeterministicLaw::angle_bucket(5.0), 10.0);
        assert_eq!(DeterministicLaw::angle_bucket(2.0), 15.0);
    }

    #[test]
    fn non_positive_target_means_no_difference() {
        assert_eq!(DeterministicLaw::percent_difference(0.0, 8.0), 0.0);
        assert_eq!(DeterministicLaw::percent_difference(-3.0, 8.0), 0.0);
        let actuation = DeterministicLaw.compute(0.0, 8.0, 1.0, 1.0).unwrap();
        assert!(approx(actuation.amplitude, 5.0));
        assert!(approx(actuation.angle, 15.0));
    }

    #[test]
    fn vanishing_density_is_clamped() {
        let actuation = DeterministicLaw.compute(10.0, 1.0, 1e-12, 1.0).unwrap();
        assert_eq!(actuation, Actuation::new(100.0, 30.0));
    }

    #[test]
    fn dense_material_hits_lower_clamp() {
        let actuation = DeterministicLaw.compute(10.0, 10.0, 50.0, 10.0).unwrap();
        assert_eq!(actuation, Actuation::new(1.0, 1.0));
    }

    proptest! {
      #[test]
      fn amplitude_bucket_is_monotonic(a in 0.0f64..500.0, b in 0.0f64..500.0) {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(
            DeterministicLaw::amplitude_bucket(low) <= DeterministicLaw::amplitude_bucket(high)
        );
      }

      #[test]
      fn amplitude_grows_with_relative_error(
        target in 0.1f64..100.0,
        near in 0.0f64..1.0,
        extra in 0.0f64..1.0,
        density in 0.1f64..10.0
      ) {
        let close = target * (1.0 - near);
        let far = target * (1.0 - (near + extra).min(1.0));
        let a = DeterministicLaw.compute(target, close, density, 3.0).unwrap();
        let b = DeterministicLaw.compute(target, far, density, 3.0).unwrap();
        prop_assert!(a.amplitude <= b.amplitude);
      }
    }
}
