//! Trajectory simulation
//!
//! Integrates a [`ReactionNetwork`](crate::model::ReactionNetwork) under a
//! patient-specific parameter vector over a fixed output grid. The
//! integration method is a pluggable strategy selected by
//! [`SolverMethod`]: a fixed-step RK4, an adaptive Dormand-Prince 4(5)
//! pair, or an L-stable SDIRK scheme for stiff parameter regimes.
//!
//! Every failure mode is captured in the returned [`Trajectory`]'s
//! [`TrajectoryStatus`] — solver breakdown, non-finite states,
//! negative-concentration excursions, exhausted step budgets. Simulating
//! one patient never raises a fault that could abort a cohort run.

mod explicit;
mod stiff;

use cached::proc_macro::cached;
use cached::UnboundCache;
use serde::{Deserialize, Serialize};

use crate::model::ReactionNetwork;
use crate::personalize::PatientParameters;

pub type T = f64;
pub type V = nalgebra::DVector<T>;

/// Integration strategy.
///
/// Stiffness varies with the patient-specific parameter vector, so the
/// method is explicit configuration rather than runtime detection.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum SolverMethod {
    /// Classical fixed-step fourth-order Runge-Kutta.
    FixedRk4 { dt: f64 },
    /// Dormand-Prince 4(5) embedded pair with adaptive step control.
    /// The default for non-stiff to mildly stiff systems.
    DormandPrince,
    /// L-stable SDIRK2 with simplified Newton iteration and a
    /// finite-difference Jacobian, for stiff parameter regimes.
    Sdirk,
}

impl Default for SolverMethod {
    fn default() -> Self {
        SolverMethod::DormandPrince
    }
}

/// Integration tolerances and budget.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SolverOptions {
    /// Relative error tolerance (default: 1e-6).
    pub rtol: f64,
    /// Absolute error tolerance (default: 1e-9).
    pub atol: f64,
    /// Maximum internal step size (default: unbounded).
    pub max_step: f64,
    /// Minimum internal step size (default: 1e-12).
    pub min_step: f64,
    /// Maximum number of attempted internal steps over the whole horizon.
    /// Exhausting it yields [`TrajectoryStatus::Timeout`] (default: 100000).
    pub step_budget: usize,
    /// Integration strategy (default: [`SolverMethod::DormandPrince`]).
    pub method: SolverMethod,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            rtol: 1e-6,
            atol: 1e-9,
            max_step: f64::INFINITY,
            min_step: 1e-12,
            step_budget: 100_000,
            method: SolverMethod::default(),
        }
    }
}

impl SolverOptions {
    pub fn with_method(mut self, method: SolverMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_tolerances(mut self, rtol: f64, atol: f64) -> Self {
        self.rtol = rtol;
        self.atol = atol;
        self
    }

    pub fn with_step_budget(mut self, step_budget: usize) -> Self {
        self.step_budget = step_budget;
        self
    }

    pub fn with_max_step(mut self, max_step: f64) -> Self {
        self.max_step = max_step;
        self
    }
}

/// Uniform output grid over the simulation horizon.
///
/// All patients in a cohort share the same grid so that extracted features
/// are directly comparable. `points` is clamped to at least 2.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawTimeGrid")]
pub struct TimeGrid {
    start: f64,
    end: f64,
    points: usize,
}

/// Wire form of [`TimeGrid`]; deserialization funnels through
/// [`TimeGrid::new`] so the minimum point count holds for grids read from
/// configuration too.
#[derive(Deserialize)]
#[serde(rename = "TimeGrid")]
struct RawTimeGrid {
    start: f64,
    end: f64,
    points: usize,
}

impl From<RawTimeGrid> for TimeGrid {
    fn from(raw: RawTimeGrid) -> Self {
        TimeGrid::new(raw.start, raw.end, raw.points)
    }
}

impl TimeGrid {
    pub fn new(start: f64, end: f64, points: usize) -> Self {
        TimeGrid {
            start,
            end,
            points: points.max(2),
        }
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn end(&self) -> f64 {
        self.end
    }

    pub fn points(&self) -> usize {
        self.points
    }

    /// The sample times, inclusive of both endpoints.
    pub fn times(&self) -> Vec<f64> {
        let n = self.points;
        let dt = (self.end - self.start) / (n - 1) as f64;
        (0..n).map(|i| self.start + i as f64 * dt).collect()
    }
}

/// Outcome of one patient's simulation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TrajectoryStatus {
    /// The integrator reached the end of the horizon within tolerance
    /// and budget.
    Success,
    /// Solver breakdown, a non-finite state, or a concentration leaving
    /// the physically valid domain.
    NumericalFailure { reason: String },
    /// The step budget was exhausted before the end of the horizon.
    Timeout,
}

impl TrajectoryStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, TrajectoryStatus::Success)
    }
}

/// Time-course solution for one patient.
///
/// `states` holds one row per reached sample time, one column per species
/// (network order). On failure the rows cover the part of the horizon the
/// integrator reached before breaking down. Immutable after creation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    patient_id: String,
    times: Vec<f64>,
    states: Vec<Vec<f64>>,
    status: TrajectoryStatus,
}

impl Trajectory {
    pub fn patient_id(&self) -> &str {
        &self.patient_id
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn states(&self) -> &[Vec<f64>] {
        &self.states
    }

    pub fn status(&self) -> &TrajectoryStatus {
        &self.status
    }

    pub fn nsamples(&self) -> usize {
        self.times.len()
    }

    /// Time series of a single species (by network index).
    pub fn species_series(&self, species: usize) -> Vec<f64> {
        self.states.iter().map(|row| row[species]).collect()
    }
}

/// Negative values smaller than this (relative to the state magnitude) are
/// numerical noise and clamped; anything more negative is a domain failure.
const NEGATIVE_TOLERANCE: f64 = 1e-9;

#[derive(Debug)]
pub(crate) enum Failure {
    Numerical(String),
    Budget,
}

pub(crate) struct Integration {
    /// State at each reached grid time, starting with the initial state.
    pub states: Vec<V>,
    pub failure: Option<Failure>,
}

/// Reject non-finite states and concentrations beyond the noise band.
pub(crate) fn check_state(network: &ReactionNetwork, x: &V, t: f64) -> Result<(), String> {
    let mut scale: f64 = 1.0;
    for &v in x.iter() {
        if !v.is_finite() {
            return Err(format!("non-finite state at t={t}"));
        }
        scale = scale.max(v.abs());
    }
    let floor = -NEGATIVE_TOLERANCE * scale;
    for (i, &v) in x.iter().enumerate() {
        if v < floor {
            return Err(format!(
                "negative concentration for species {} at t={t} ({v:e})",
                network.species()[i].name()
            ));
        }
    }
    Ok(())
}

/// Simulate one patient's trajectory over the grid.
///
/// Never panics and never returns an error: every failure mode is carried
/// in the trajectory's status.
pub fn simulate(
    network: &ReactionNetwork,
    params: &PatientParameters,
    grid: &TimeGrid,
    options: &SolverOptions,
) -> Trajectory {
    let patient_id = params.patient_id().to_string();

    let fail = |reason: String| Trajectory {
        patient_id: patient_id.clone(),
        times: Vec::new(),
        states: Vec::new(),
        status: TrajectoryStatus::NumericalFailure { reason },
    };

    if !grid.start.is_finite() || !grid.end.is_finite() || grid.end <= grid.start {
        return fail(format!(
            "invalid time horizon [{}, {}]",
            grid.start, grid.end
        ));
    }
    if params.values().iter().any(|v| !v.is_finite()) {
        return fail("non-finite parameter value".to_string());
    }

    let times = grid.times();
    let x0 = params.initial_state().clone();
    if let Err(reason) = check_state(network, &x0, times[0]) {
        return fail(reason);
    }

    let integration = match options.method {
        SolverMethod::FixedRk4 { dt } => {
            explicit::integrate_fixed(network, params.values(), x0, &times, dt, options)
        }
        SolverMethod::DormandPrince => {
            explicit::integrate_adaptive(network, params.values(), x0, &times, options)
        }
        SolverMethod::Sdirk => stiff::integrate(network, params.values(), x0, &times, options),
    };

    let reached = integration.states.len();
    let states = integration
        .states
        .iter()
        .map(|x| x.iter().map(|&v| v.max(0.0)).collect())
        .collect();

    Trajectory {
        patient_id,
        times: times[..reached].to_vec(),
        states,
        status: match integration.failure {
            None => TrajectoryStatus::Success,
            Some(Failure::Numerical(reason)) => TrajectoryStatus::NumericalFailure { reason },
            Some(Failure::Budget) => TrajectoryStatus::Timeout,
        },
    }
}

/// Hash a patient id to a u64 cache key component.
#[inline(always)]
fn id_hash(id: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::hash::DefaultHasher::new();
    id.hash(&mut hasher);
    hasher.finish()
}

/// Hash the network's serialized structure, so a trajectory cached for one
/// model is never returned for a structurally different model that happens
/// to share its parameter and state values.
fn network_hash(network: &ReactionNetwork) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::hash::DefaultHasher::new();
    if let Ok(bytes) = serde_json::to_vec(network) {
        bytes.hash(&mut hasher);
    }
    hasher.finish()
}

/// Hash the full simulation setup (parameters, initial state, grid,
/// options) so cached trajectories are never reused across configurations.
fn setup_hash(params: &PatientParameters, grid: &TimeGrid, options: &SolverOptions) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::hash::DefaultHasher::new();

    // Normalize -0.0 to 0.0 for consistent hashing
    let mut put = |value: f64| {
        let bits = if value == 0.0 { 0u64 } else { value.to_bits() };
        bits.hash(&mut hasher);
    };
    for &v in params.values().iter() {
        put(v);
    }
    for &v in params.initial_state().iter() {
        put(v);
    }
    put(grid.start);
    put(grid.end);
    put(options.rtol);
    put(options.atol);
    put(options.max_step);
    put(options.min_step);
    match options.method {
        SolverMethod::FixedRk4 { dt } => {
            put(1.0);
            put(dt);
        }
        SolverMethod::DormandPrince => put(2.0),
        SolverMethod::Sdirk => put(3.0),
    }
    grid.points.hash(&mut hasher);
    options.step_budget.hash(&mut hasher);
    hasher.finish()
}

#[cached(
    ty = "UnboundCache<(u64, u64, u64), Trajectory>",
    create = "{ UnboundCache::with_capacity(10_000) }",
    convert = r#"{ (id_hash(params.patient_id()), network_hash(network), setup_hash(params, grid, options)) }"#
)]
fn _simulate_cached(
    network: &ReactionNetwork,
    params: &PatientParameters,
    grid: &TimeGrid,
    options: &SolverOptions,
) -> Trajectory {
    simulate(network, params, grid, options)
}

/// [`simulate`], optionally memoized by (patient, network, setup).
///
/// The cache makes partial re-runs of a cohort cheap: unchanged patients
/// hit the memoized trajectory instead of re-integrating.
pub fn simulate_with_cache(
    network: &ReactionNetwork,
    params: &PatientParameters,
    grid: &TimeGrid,
    options: &SolverOptions,
    cache: bool,
) -> Trajectory {
    if cache {
        _simulate_cached(network, params, grid, options)
    } else {
        simulate(network, params, grid, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ReactionNetwork, ReactionSpec};
    use crate::patient::PatientSpec;
    use crate::personalize::personalize;
    use approx::assert_relative_eq;

    fn decay_model() -> ReactionNetwork {
        ReactionNetwork::builder()
            .species("A", 1.0)
            .parameter("k", 0.5)
            .reaction(ReactionSpec::mass_action("decay", "k").reactant("A"))
            .build()
            .unwrap()
    }

    fn methods() -> Vec<SolverMethod> {
        vec![
            SolverMethod::FixedRk4 { dt: 0.01 },
            SolverMethod::DormandPrince,
            SolverMethod::Sdirk,
        ]
    }

    #[test]
    fn exponential_decay_matches_analytic_solution() {
        let network = decay_model();
        let params = personalize(&network, &PatientSpec::new("p")).unwrap();
        let grid = TimeGrid::new(0.0, 4.0, 41);

        for method in methods() {
            let options = SolverOptions::default().with_method(method);
            let trajectory = simulate(&network, &params, &grid, &options);
            assert!(
                trajectory.status().is_success(),
                "{method:?}: {:?}",
                trajectory.status()
            );
            for (t, row) in trajectory.times().iter().zip(trajectory.states()) {
                assert_relative_eq!(row[0], (-0.5 * t).exp(), epsilon = 1e-3);
            }
        }
    }

    #[test]
    fn simulation_is_deterministic() {
        let network = decay_model();
        let params = personalize(&network, &PatientSpec::new("p")).unwrap();
        let grid = TimeGrid::new(0.0, 10.0, 101);
        let options = SolverOptions::default();

        let a = simulate(&network, &params, &grid, &options);
        let b = simulate(&network, &params, &grid, &options);
        assert_eq!(a, b);
    }

    #[test]
    fn runaway_growth_is_a_numerical_failure_not_a_panic() {
        let network = decay_model();
        let spec = PatientSpec::new("p").override_parameter("k", 1e300);
        let params = personalize(&network, &spec).unwrap();
        let grid = TimeGrid::new(0.0, 10.0, 11);

        for method in methods() {
            let options = SolverOptions::default().with_method(method);
            let trajectory = simulate(&network, &params, &grid, &options);
            assert!(
                !trajectory.status().is_success(),
                "{method:?} should not converge"
            );
        }
    }

    #[test]
    fn exhausted_step_budget_times_out() {
        let network = decay_model();
        let params = personalize(&network, &PatientSpec::new("p")).unwrap();
        let grid = TimeGrid::new(0.0, 100.0, 11);
        let options = SolverOptions::default()
            .with_method(SolverMethod::FixedRk4 { dt: 1e-4 })
            .with_step_budget(50);

        let trajectory = simulate(&network, &params, &grid, &options);
        assert_eq!(*trajectory.status(), TrajectoryStatus::Timeout);
        assert!(trajectory.nsamples() < grid.points());
    }

    #[test]
    fn non_finite_parameters_fail_before_integration() {
        let network = decay_model();
        let spec = PatientSpec::new("p").override_parameter("k", f64::INFINITY);
        let params = personalize(&network, &spec).unwrap();
        let grid = TimeGrid::new(0.0, 1.0, 11);
        let trajectory = simulate(&network, &params, &grid, &SolverOptions::default());
        assert!(matches!(
            trajectory.status(),
            TrajectoryStatus::NumericalFailure { .. }
        ));
        assert_eq!(trajectory.nsamples(), 0);
    }

    #[test]
    fn cached_and_uncached_agree() {
        let network = decay_model();
        let params = personalize(&network, &PatientSpec::new("cache-test")).unwrap();
        let grid = TimeGrid::new(0.0, 5.0, 21);
        let options = SolverOptions::default();

        let cold = simulate_with_cache(&network, &params, &grid, &options, true);
        let warm = simulate_with_cache(&network, &params, &grid, &options, true);
        let plain = simulate(&network, &params, &grid, &options);
        assert_eq!(cold, warm);
        assert_eq!(cold, plain);
    }

    #[test]
    fn cache_distinguishes_structurally_different_models() {
        // Same species, parameter values, grid and options; only the
        // reaction direction differs.
        let decay = decay_model();
        let growth = ReactionNetwork::builder()
            .species("A", 1.0)
            .parameter("k", 0.5)
            .reaction(ReactionSpec::mass_action("production", "k").product("A"))
            .build()
            .unwrap();
        let grid = TimeGrid::new(0.0, 4.0, 5);
        let options = SolverOptions::default();

        let decay_params = personalize(&decay, &PatientSpec::new("shared-id")).unwrap();
        let growth_params = personalize(&growth, &PatientSpec::new("shared-id")).unwrap();

        let falling = simulate_with_cache(&decay, &decay_params, &grid, &options, true);
        let rising = simulate_with_cache(&growth, &growth_params, &grid, &options, true);
        assert!(falling.status().is_success());
        assert!(rising.status().is_success());

        // Constant production accumulates linearly; a shared cache entry
        // would have returned the decay curve here instead.
        assert_relative_eq!(rising.states()[4][0], 3.0, epsilon = 1e-6);
        assert_relative_eq!(falling.states()[4][0], (-2.0_f64).exp(), epsilon = 1e-6);
    }

    #[test]
    fn deserialized_grid_keeps_the_minimum_point_count() {
        let grid: TimeGrid =
            serde_json::from_str(r#"{"start":0.0,"end":1.0,"points":0}"#).unwrap();
        assert_eq!(grid.points(), 2);
        assert_eq!(grid.times(), vec![0.0, 1.0]);

        let network = decay_model();
        let params = personalize(&network, &PatientSpec::new("p")).unwrap();
        let trajectory = simulate(&network, &params, &grid, &SolverOptions::default());
        assert!(trajectory.status().is_success());
        assert_eq!(trajectory.nsamples(), 2);
    }

    #[test]
    fn time_grid_is_inclusive_and_uniform() {
        let grid = TimeGrid::new(0.0, 10.0, 6);
        let times = grid.times();
        assert_eq!(times.len(), 6);
        assert_relative_eq!(times[0], 0.0);
        assert_relative_eq!(times[5], 10.0);
        assert_relative_eq!(times[1] - times[0], 2.0);
    }
}
