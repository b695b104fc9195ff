//! Dynamic feature extraction
//!
//! Reduces a simulated [`Trajectory`] to a fixed-length numeric vector
//! according to a [`FeatureSchema`] shared by the whole cohort. The metrics
//! are the usual time-course summaries: peak amplitude and its timing, the
//! terminal (quasi-steady) value, time spent above a threshold, the area
//! under the curve over an optional window, and the post-peak drop rate.
//!
//! A trajectory that did not complete successfully yields
//! [`FeatureVector::Undefined`] rather than fabricated numbers; downstream
//! classification skips undefined vectors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::ReactionNetwork;
use crate::simulator::{Trajectory, TrajectoryStatus};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeatureError {
    #[error("Feature rule {rule} references unknown species: {name}")]
    UnknownSpecies { rule: String, name: String },
    #[error("Feature rule {rule} has a non-finite threshold")]
    NonFiniteThreshold { rule: String },
    #[error("Feature rule {rule} has an invalid window [{lo}, {hi}]")]
    InvalidWindow { rule: String, lo: f64, hi: f64 },
    #[error("Feature schema has no rules")]
    EmptySchema,
}

/// One scalar summary of a single species' time course.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FeatureRule {
    /// Maximum concentration over the horizon.
    PeakAmplitude { species: String },
    /// Time at which the maximum is first reached.
    TimeToPeak { species: String },
    /// Concentration at the final sample time.
    SteadyState { species: String },
    /// Total time spent strictly above a threshold, with linear
    /// interpolation at the crossings.
    DurationAbove { species: String, threshold: f64 },
    /// Trapezoidal area under the curve, over the full horizon or a
    /// sub-window of it.
    Integral {
        species: String,
        window: Option<(f64, f64)>,
    },
    /// Average decline rate from the peak to the end of the horizon,
    /// `(peak − final) / (t_final − t_peak)`. Zero when the peak is the
    /// final sample.
    DropRate { species: String },
}

impl FeatureRule {
    pub fn species(&self) -> &str {
        match self {
            FeatureRule::PeakAmplitude { species }
            | FeatureRule::TimeToPeak { species }
            | FeatureRule::SteadyState { species }
            | FeatureRule::DurationAbove { species, .. }
            | FeatureRule::Integral { species, .. }
            | FeatureRule::DropRate { species } => species,
        }
    }

    /// Column name used in feature matrices and CSV export.
    pub fn name(&self) -> String {
        match self {
            FeatureRule::PeakAmplitude { species } => format!("{species}_peak"),
            FeatureRule::TimeToPeak { species } => format!("{species}_time_to_peak"),
            FeatureRule::SteadyState { species } => format!("{species}_steady_state"),
            FeatureRule::DurationAbove { species, threshold } => {
                format!("{species}_duration_above_{threshold}")
            }
            FeatureRule::Integral { species, window } => match window {
                None => format!("{species}_auc"),
                Some((lo, hi)) => format!("{species}_auc_{lo}_{hi}"),
            },
            FeatureRule::DropRate { species } => format!("{species}_drop_rate"),
        }
    }
}

/// Ordered list of feature rules applied identically to every patient.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureSchema {
    rules: Vec<FeatureRule>,
    /// Scale each species' series by its own maximum before extraction, so
    /// features compare signal shape rather than absolute abundance.
    normalize: bool,
}

impl FeatureSchema {
    pub fn new(rules: Vec<FeatureRule>) -> Self {
        FeatureSchema {
            rules,
            normalize: false,
        }
    }

    pub fn with_normalization(mut self) -> Self {
        self.normalize = true;
        self
    }

    pub fn rules(&self) -> &[FeatureRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Column names in rule order.
    pub fn names(&self) -> Vec<String> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Check every rule against the network it will be applied to.
    pub fn validate(&self, network: &ReactionNetwork) -> Result<(), FeatureError> {
        if self.rules.is_empty() {
            return Err(FeatureError::EmptySchema);
        }
        for rule in &self.rules {
            if network.species_index(rule.species()).is_none() {
                return Err(FeatureError::UnknownSpecies {
                    rule: rule.name(),
                    name: rule.species().to_string(),
                });
            }
            match rule {
                FeatureRule::DurationAbove { threshold, .. } if !threshold.is_finite() => {
                    return Err(FeatureError::NonFiniteThreshold { rule: rule.name() });
                }
                FeatureRule::Integral {
                    window: Some((lo, hi)),
                    ..
                } if !(lo.is_finite() && hi.is_finite() && lo < hi) => {
                    return Err(FeatureError::InvalidWindow {
                        rule: rule.name(),
                        lo: *lo,
                        hi: *hi,
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Extraction result for one patient under one condition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FeatureVector {
    /// Values in schema rule order.
    Defined(Vec<f64>),
    /// The trajectory failed or was too short to summarize.
    Undefined { reason: String },
}

impl FeatureVector {
    pub fn is_defined(&self) -> bool {
        matches!(self, FeatureVector::Defined(_))
    }

    pub fn values(&self) -> Option<&[f64]> {
        match self {
            FeatureVector::Defined(v) => Some(v),
            FeatureVector::Undefined { .. } => None,
        }
    }
}

/// Apply a schema to one trajectory.
///
/// The schema must have been validated against the same network that
/// produced the trajectory.
pub fn extract(
    network: &ReactionNetwork,
    schema: &FeatureSchema,
    trajectory: &Trajectory,
) -> FeatureVector {
    match trajectory.status() {
        TrajectoryStatus::Success => {}
        TrajectoryStatus::NumericalFailure { reason } => {
            return FeatureVector::Undefined {
                reason: format!("numerical failure: {reason}"),
            };
        }
        TrajectoryStatus::Timeout => {
            return FeatureVector::Undefined {
                reason: "step budget exhausted".to_string(),
            };
        }
    }
    if trajectory.nsamples() < 2 {
        return FeatureVector::Undefined {
            reason: "trajectory has fewer than two samples".to_string(),
        };
    }

    let times = trajectory.times();
    let mut values = Vec::with_capacity(schema.rules.len());
    for rule in &schema.rules {
        // Validated schemas only reference known species.
        let idx = match network.species_index(rule.species()) {
            Some(idx) => idx,
            None => {
                return FeatureVector::Undefined {
                    reason: format!("unknown species {}", rule.species()),
                };
            }
        };
        let mut series = trajectory.species_series(idx);
        if schema.normalize {
            let max = series.iter().cloned().fold(0.0f64, f64::max);
            if max > 0.0 {
                for v in &mut series {
                    *v /= max;
                }
            }
        }
        values.push(apply_rule(rule, times, &series));
    }
    FeatureVector::Defined(values)
}

fn apply_rule(rule: &FeatureRule, times: &[f64], xs: &[f64]) -> f64 {
    match rule {
        FeatureRule::PeakAmplitude { .. } => peak(xs).1,
        FeatureRule::TimeToPeak { .. } => times[peak(xs).0],
        FeatureRule::SteadyState { .. } => xs[xs.len() - 1],
        FeatureRule::DurationAbove { threshold, .. } => duration_above(times, xs, *threshold),
        FeatureRule::Integral { window, .. } => integral(times, xs, *window),
        FeatureRule::DropRate { .. } => {
            let (i_peak, x_peak) = peak(xs);
            let t_peak = times[i_peak];
            let t_end = times[times.len() - 1];
            if t_end <= t_peak {
                0.0
            } else {
                (x_peak - xs[xs.len() - 1]) / (t_end - t_peak)
            }
        }
    }
}

/// Index and value of the first maximum.
fn peak(xs: &[f64]) -> (usize, f64) {
    let mut best = (0, xs[0]);
    for (i, &v) in xs.iter().enumerate().skip(1) {
        if v > best.1 {
            best = (i, v);
        }
    }
    best
}

fn duration_above(times: &[f64], xs: &[f64], threshold: f64) -> f64 {
    let mut total = 0.0;
    for i in 1..times.len() {
        let (t0, t1) = (times[i - 1], times[i]);
        let (x0, x1) = (xs[i - 1], xs[i]);
        match (x0 > threshold, x1 > threshold) {
            (true, true) => total += t1 - t0,
            (true, false) => {
                let tc = t0 + (threshold - x0) / (x1 - x0) * (t1 - t0);
                total += tc - t0;
            }
            (false, true) => {
                let tc = t0 + (threshold - x0) / (x1 - x0) * (t1 - t0);
                total += t1 - tc;
            }
            (false, false) => {}
        }
    }
    total
}

fn integral(times: &[f64], xs: &[f64], window: Option<(f64, f64)>) -> f64 {
    let t_first = times[0];
    let t_last = times[times.len() - 1];
    let (lo, hi) = match window {
        None => (t_first, t_last),
        Some((lo, hi)) => (lo.max(t_first), hi.min(t_last)),
    };
    if hi <= lo {
        return 0.0;
    }

    let mut total = 0.0;
    for i in 1..times.len() {
        let (t0, t1) = (times[i - 1], times[i]);
        if t1 <= lo || t0 >= hi {
            continue;
        }
        // Clip the segment to the window, interpolating boundary values.
        let a = t0.max(lo);
        let b = t1.min(hi);
        let xa = interp(t0, t1, xs[i - 1], xs[i], a);
        let xb = interp(t0, t1, xs[i - 1], xs[i], b);
        total += 0.5 * (xa + xb) * (b - a);
    }
    total
}

fn interp(t0: f64, t1: f64, x0: f64, x1: f64, t: f64) -> f64 {
    if t1 == t0 {
        x0
    } else {
        x0 + (x1 - x0) * (t - t0) / (t1 - t0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ReactionNetwork, ReactionSpec};
    use crate::patient::PatientSpec;
    use crate::personalize::personalize;
    use crate::simulator::{simulate, SolverOptions, TimeGrid};
    use approx::assert_relative_eq;

    fn network() -> ReactionNetwork {
        ReactionNetwork::builder()
            .species("X", 1.0)
            .parameter("k", 0.5)
            .reaction(ReactionSpec::mass_action("decay", "k").reactant("X"))
            .build()
            .unwrap()
    }

    #[test]
    fn duration_above_interpolates_crossings() {
        // Triangle rising 0→2 over [0,1], falling 2→0 over [1,2]; time above
        // 1.0 is exactly the middle unit interval.
        let times = [0.0, 1.0, 2.0];
        let xs = [0.0, 2.0, 0.0];
        assert_relative_eq!(duration_above(&times, &xs, 1.0), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn integral_of_linear_ramp_is_exact() {
        let times = [0.0, 1.0, 2.0];
        let xs = [0.0, 1.0, 2.0];
        assert_relative_eq!(integral(&times, &xs, None), 2.0, epsilon = 1e-12);
        assert_relative_eq!(integral(&times, &xs, Some((0.5, 1.5))), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn windowed_integral_outside_horizon_is_zero() {
        let times = [0.0, 1.0];
        let xs = [1.0, 1.0];
        assert_relative_eq!(integral(&times, &xs, Some((5.0, 6.0))), 0.0);
    }

    #[test]
    fn extracts_decay_summaries() {
        let network = network();
        let params = personalize(&network, &PatientSpec::new("p")).unwrap();
        let grid = TimeGrid::new(0.0, 8.0, 81);
        let trajectory = simulate(&network, &params, &grid, &SolverOptions::default());

        let schema = FeatureSchema::new(vec![
            FeatureRule::PeakAmplitude {
                species: "X".to_string(),
            },
            FeatureRule::TimeToPeak {
                species: "X".to_string(),
            },
            FeatureRule::SteadyState {
                species: "X".to_string(),
            },
            FeatureRule::DropRate {
                species: "X".to_string(),
            },
        ]);
        schema.validate(&network).unwrap();

        let vector = extract(&network, &schema, &trajectory);
        let values = vector.values().unwrap();
        assert_relative_eq!(values[0], 1.0, epsilon = 1e-6); // monotone decay peaks at t=0
        assert_relative_eq!(values[1], 0.0);
        assert_relative_eq!(values[2], (-0.5f64 * 8.0).exp(), epsilon = 1e-4);
        assert!(values[3] > 0.0);
    }

    #[test]
    fn failed_trajectory_yields_undefined_vector() {
        let network = network();
        let spec = PatientSpec::new("p").override_parameter("k", f64::INFINITY);
        let params = personalize(&network, &spec).unwrap();
        let grid = TimeGrid::new(0.0, 1.0, 11);
        let trajectory = simulate(&network, &params, &grid, &SolverOptions::default());

        let schema = FeatureSchema::new(vec![FeatureRule::PeakAmplitude {
            species: "X".to_string(),
        }]);
        let vector = extract(&network, &schema, &trajectory);
        assert!(!vector.is_defined());
    }

    #[test]
    fn normalization_rescales_peak_to_one() {
        let network = ReactionNetwork::builder()
            .species("X", 4.0)
            .parameter("k", 0.5)
            .reaction(ReactionSpec::mass_action("decay", "k").reactant("X"))
            .build()
            .unwrap();
        let params = personalize(&network, &PatientSpec::new("p")).unwrap();
        let grid = TimeGrid::new(0.0, 2.0, 21);
        let trajectory = simulate(&network, &params, &grid, &SolverOptions::default());

        let schema = FeatureSchema::new(vec![FeatureRule::PeakAmplitude {
            species: "X".to_string(),
        }])
        .with_normalization();
        let values = extract(&network, &schema, &trajectory);
        assert_relative_eq!(values.values().unwrap()[0], 1.0);
    }

    #[test]
    fn schema_validation_rejects_unknown_species() {
        let network = network();
        let schema = FeatureSchema::new(vec![FeatureRule::SteadyState {
            species: "missing".to_string(),
        }]);
        assert!(matches!(
            schema.validate(&network),
            Err(FeatureError::UnknownSpecies { .. })
        ));
    }

    #[test]
    fn empty_schema_is_invalid() {
        assert_eq!(
            FeatureSchema::new(vec![]).validate(&network()),
            Err(FeatureError::EmptySchema)
        );
    }

    #[test]
    fn column_names_follow_species_and_metric() {
        let schema = FeatureSchema::new(vec![
            FeatureRule::PeakAmplitude {
                species: "ERK_p".to_string(),
            },
            FeatureRule::DurationAbove {
                species: "ERK_p".to_string(),
                threshold: 0.5,
            },
        ]);
        assert_eq!(
            schema.names(),
            vec!["ERK_p_peak", "ERK_p_duration_above_0.5"]
        );
    }
}
