//! Fuzzy-inference control law.
//!
//! Two inputs (remaining weight difference in grams, material density) with three
//! linguistic terms each feed a 3x3 rule base whose consequents live on the
//! shaking-amplitude domain. Rules fire with min conjunction, consequents aggregate
//! with max, and the clipped output surface is defuzzified by centre of gravity.

use super::{Actuation, ActuationLimits, ControlLaw, inputs_valid};

const LIMITS: ActuationLimits = ActuationLimits { amplitude: (1.0, 20.0), angle: (5.0, 30.0) };

/// Amplitude used when the rule base produces no output.
const DEFAULT_AMPLITUDE: f64 = 10.0;

/// Sampling step of the output domain during defuzzification.
const OUTPUT_RESOLUTION: f64 = 0.1;

/// Membership shape of a linguistic term.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MembershipFunction {
    /// 1 up to `low`, falling linearly to 0 at `high`.
    FallingShoulder { low: f64, high: f64 },
    /// 0 up to `low`, rising linearly to 1 at `high`.
    RisingShoulder { low: f64, high: f64 },
    /// 0 outside `a..d`, rising over `a..b`, 1 over `b..=c`, falling over `c..d`.
    Trapezoid { a: f64, b: f64, c: f64, d: f64 },
}

impl MembershipFunction {
    /// Degree of membership of `x`, in `[0, 1]`.
    pub fn degree(&self, x: f64) -> f64 {
        match *self {
            MembershipFunction::FallingShoulder { low, high } => {
                if x <= low {
                    1.0
                } else if x >= high {
                    0.0
                } else {
                    (high - x) / (high - low)
                }
            }
            MembershipFunction::RisingShoulder { low, high } => {
                if x <= low {
                    0.0
                } else if x >= high {
                    1.0
                } else {
                    (x - low) / (high - low)
                }
            }
            MembershipFunction::Trapezoid { a, b, c, d } => {
                if x <= a || x >= d {
                    0.0
                } else if x < b {
                    (x - a) / (b - a)
                } else if x <= c {
                    1.0
                } else {
                    (d - x) / (d - c)
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Term {
    Small = 0,
    Medium = 1,
    Large = 2,
}

/// A bounded input or output domain with its small/medium/large terms.
#[derive(Debug, Clone, Copy)]
struct Domain {
    min: f64,
    max: f64,
    terms: [MembershipFunction; 3],
}

impl Domain {
    fn memberships(&self, x: f64) -> [f64; 3] {
        let x = x.clamp(self.min, self.max);
        self.terms.map(|term| term.degree(x))
    }
}

const DIFFERENCE: Domain = Domain {
    min: -0.1,
    max: 2.0,
    terms: [
        MembershipFunction::FallingShoulder { low: 0.2, high: 0.4 },
        MembershipFunction::Trapezoid { a: 0.2, b: 0.5, c: 0.6, d: 0.8 },
        MembershipFunction::RisingShoulder { low: 0.6, high: 0.8 },
    ],
};

const DENSITY: Domain = Domain {
    min: 0.0,
    max: 4.0,
    terms: [
        MembershipFunction::FallingShoulder { low: 1.0, high: 2.5 },
        MembershipFunction::Trapezoid { a: 2.0, b: 2.4, c: 2.8, d: 3.2 },
        MembershipFunction::RisingShoulder { low: 3.0, high: 3.2 },
    ],
};

const AMPLITUDE: Domain = Domain {
    min: 0.0,
    max: 20.0,
    terms: [
        MembershipFunction::FallingShoulder { low: 2.0, high: 4.0 },
        MembershipFunction::Trapezoid { a: 2.0, b: 6.0, c: 10.0, d: 12.0 },
        MembershipFunction::RisingShoulder { low: 10.0, high: 15.0 },
    ],
};

/// Consequent term, indexed `[difference term][density term]`.
const RULES: [[Term; 3]; 3] = [
    [Term::Small, Term::Small, Term::Small],
    [Term::Medium, Term::Medium, Term::Medium],
    [Term::Large, Term::Large, Term::Large],
];

/// Mamdani rule base over weight difference and density.
///
/// The difference input is the signed remaining weight `target - current`; overshoot
/// clamps to the bottom of the domain. Particle size does not take part.
#[derive(Debug, Clone)]
pub struct FuzzyLaw {
    rules: [[Term; 3]; 3],
}

impl Default for FuzzyLaw {
    fn default() -> Self {
        Self::new()
    }
}

impl FuzzyLaw {
    pub fn new() -> Self {
        Self { rules: RULES }
    }

    /// Run the rule base and defuzzify. `None` if no rule fires.
    pub fn infer(&self, difference: f64, density: f64) -> Option<f64> {
        let difference_degrees = DIFFERENCE.memberships(difference);
        let density_degrees = DENSITY.memberships(density);

        let mut strengths = [0.0f64; 3];
        for (row, difference_degree) in self.rules.iter().zip(difference_degrees) {
            for (consequent, density_degree) in row.iter().zip(density_degrees) {
                let firing = difference_degree.min(density_degree);
                let slot = &mut strengths[*consequent as usize];
                *slot = slot.max(firing);
            }
        }

        centroid(&strengths)
    }

    /// Angle stepped down as amplitude rises.
    pub fn angle_for(amplitude: f64) -> f64 {
        if amplitude < 5.0 {
            15.0
        } else if amplitude < 10.0 {
            10.0
        } else {
            5.0
        }
    }
}

/// Centre of gravity of the max-aggregated, strength-clipped output terms.
fn centroid(strengths: &[f64; 3]) -> Option<f64> {
    if strengths.iter().all(|s| *s <= 0.0) {
        return None;
    }

    let steps = ((AMPLITUDE.max - AMPLITUDE.min) / OUTPUT_RESOLUTION).round() as usize;
    let mut moment = 0.0;
    let mut area = 0.0;

    for step in 0..=steps {
        let y = AMPLITUDE.min + step as f64 * OUTPUT_RESOLUTION;
        let degree = AMPLITUDE
            .terms
            .iter()
            .zip(strengths)
            .map(|(term, strength)| term.degree(y).min(*strength))
            .fold(0.0, f64::max);
        moment += y * degree;
        area += degree;
    }

    (area > f64::EPSILON).then(|| moment / area)
}

impl ControlLaw for FuzzyLaw {
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

        let difference = target_weight - current_weight;
        let amplitude = match self.infer(difference, density) {
            Some(amplitude) => amplitude,
            None => {
                tracing::warn!(
                    difference,
                    density,
                    "Fuzzy inference produced no output, using default amplitude"
                );
                DEFAULT_AMPLITUDE
            }
        };

        let actuation = LIMITS.clamp(amplitude, Self::angle_for(amplitude));
        tracing::debug!(
            difference,
            density,
            amplitude = actuation.amplitude,
            angle = actuation.angle,
            "Fuzzy actuation computed"
        );
        Some(actuation)
    }

    fn limits(&self) -> ActuationLimits {
        LIMITS
    }

    fn name(&self) -> &'static str {
        "fuzzy"
    }
}
