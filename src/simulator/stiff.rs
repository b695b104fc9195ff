//! Stiff integration: a two-stage singly diagonally implicit Runge-Kutta
//! (SDIRK2) method with Newton stage solves.
//!
//! The method is L-stable with diagonal coefficient `γ = 1 − 1/√2`, so fast
//! relaxation modes (high-gain feedback loops, near-equilibrium binding) do
//! not force the step size down the way they do for the explicit solvers.
//! The iteration matrix `I − hγJ` is factored once per attempted step from a
//! finite-difference Jacobian.

use nalgebra::{DMatrix, Dyn};

use super::{check_state, Failure, Integration, SolverOptions, V};
use crate::model::ReactionNetwork;

const GAMMA: f64 = 1.0 - std::f64::consts::FRAC_1_SQRT_2;
const MAX_NEWTON: usize = 10;
const NEWTON_TOL: f64 = 1e-9;

type Lu = nalgebra::linalg::LU<f64, Dyn, Dyn>;

/// Central finite-difference Jacobian of the vector field at `(t, y)`.
fn jacobian(network: &ReactionNetwork, p: &V, t: f64, y: &V) -> DMatrix<f64> {
    let n = y.len();
    let mut jac = DMatrix::zeros(n, n);
    let mut yp = y.clone();
    let mut f_plus = V::zeros(n);
    let mut f_minus = V::zeros(n);
    for j in 0..n {
        let eps = 1e-8 * (1.0 + y[j].abs());
        yp[j] = y[j] + eps;
        network.derivatives_into(&yp, p, t, &mut f_plus);
        yp[j] = y[j] - eps;
        network.derivatives_into(&yp, p, t, &mut f_minus);
        yp[j] = y[j];
        for i in 0..n {
            jac[(i, j)] = (f_plus[i] - f_minus[i]) / (2.0 * eps);
        }
    }
    jac
}

/// Newton iteration for one implicit stage: `k = f(t, base + hγ·k)`.
///
/// Returns `false` when the iteration diverges, produces non-finite values,
/// or the iteration matrix is singular; the caller retries with a smaller
/// step.
fn newton_stage(
    network: &ReactionNetwork,
    p: &V,
    t: f64,
    base: &V,
    h_gamma: f64,
    lu: &Lu,
    k: &mut V,
    y_stage: &mut V,
    f_buf: &mut V,
) -> bool {
    let n = base.len();
    for _ in 0..MAX_NEWTON {
        for i in 0..n {
            y_stage[i] = base[i] + h_gamma * k[i];
        }
        network.derivatives_into(y_stage, p, t, f_buf);
        let residual = &*k - &*f_buf;
        if residual.iter().any(|v| !v.is_finite()) {
            return false;
        }
        let delta = match lu.solve(&residual) {
            Some(d) => d,
            None => return false,
        };
        *k -= &delta;
        if delta.norm() <= NEWTON_TOL * (1.0 + k.norm()) {
            return true;
        }
    }
    false
}

/// Adaptive SDIRK2 with step-size control from the embedded stage difference.
pub(crate) fn integrate(
    network: &ReactionNetwork,
    p: &V,
    x0: V,
    times: &[f64],
    options: &SolverOptions,
) -> Integration {
    let n = x0.len();
    let span = times[times.len() - 1] - times[0];
    let tiny = 1e-12 * span;

    let mut states = vec![x0.clone()];
    let mut y = x0;
    let mut t = times[0];
    let mut h = (span * 1e-3).clamp(options.min_step, options.max_step);
    let mut steps: usize = 0;

    let mut f_now = V::zeros(n);
    let mut y_stage = V::zeros(n);
    let mut f_buf = V::zeros(n);

    for &target in &times[1..] {
        while target - t > tiny {
            if steps >= options.step_budget {
                return Integration {
                    states,
                    failure: Some(Failure::Budget),
                };
            }
            steps += 1;
            let hs = h.min(target - t).min(options.max_step).max(options.min_step);

            let jac = jacobian(network, p, t, &y);
            let m = DMatrix::identity(n, n) - &jac * (hs * GAMMA);
            let lu = m.lu();

            network.derivatives_into(&y, p, t, &mut f_now);

            // Stage 1: k1 = f(t + γh, y + hγ·k1)
            let mut k1 = f_now.clone();
            let stage1_ok = newton_stage(
                network,
                p,
                t + GAMMA * hs,
                &y,
                hs * GAMMA,
                &lu,
                &mut k1,
                &mut y_stage,
                &mut f_buf,
            );

            // Stage 2: k2 = f(t + h, y + h(1−γ)·k1 + hγ·k2)
            let mut converged = stage1_ok;
            let mut k2 = k1.clone();
            if stage1_ok {
                let base2 = &y + &k1 * (hs * (1.0 - GAMMA));
                converged = newton_stage(
                    network,
                    p,
                    t + hs,
                    &base2,
                    hs * GAMMA,
                    &lu,
                    &mut k2,
                    &mut y_stage,
                    &mut f_buf,
                );
            }

            if !converged {
                if hs <= options.min_step {
                    return Integration {
                        states,
                        failure: Some(Failure::Numerical(format!(
                            "implicit stage iteration failed to converge at t={t}"
                        ))),
                    };
                }
                h = (hs * 0.5).max(options.min_step);
                continue;
            }

            let y_new = &y + (&k1 * (1.0 - GAMMA) + &k2 * GAMMA) * hs;

            // Stage difference gives a first-order error estimate.
            let mut err_norm = 0.0;
            for i in 0..n {
                let ei = hs * GAMMA * (k2[i] - k1[i]);
                let sc = options.atol + options.rtol * y[i].abs().max(y_new[i].abs());
                err_norm += (ei / sc) * (ei / sc);
            }
            err_norm = (err_norm / n as f64).sqrt();
            if !err_norm.is_finite() {
                err_norm = f64::INFINITY;
            }

            if err_norm <= 1.0 {
                t += hs;
                y = y_new;
                if y.iter().any(|v| !v.is_finite()) {
                    return Integration {
                        states,
                        failure: Some(Failure::Numerical(format!("non-finite state at t={t}"))),
                    };
                }
            } else if hs <= options.min_step {
                return Integration {
                    states,
                    failure: Some(Failure::Numerical(format!(
                        "step size underflow at t={t} (local error {err_norm:.3e})"
                    ))),
                };
            }

            let factor = if err_norm == 0.0 {
                4.0
            } else {
                (0.9 * err_norm.powf(-1.0 / 3.0)).clamp(0.25, 4.0)
            };
            h = (hs * factor).clamp(options.min_step, options.max_step);
        }
        if let Err(reason) = check_state(network, &y, target) {
            return Integration {
                states,
                failure: Some(Failure::Numerical(reason)),
            };
        }
        states.push(y.clone());
    }

    Integration {
        states,
        failure: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ReactionNetwork, ReactionSpec};
    use crate::simulator::explicit;
    use approx::assert_relative_eq;

    fn decay(k: f64) -> ReactionNetwork {
        ReactionNetwork::builder()
            .species("S", 1.0)
            .parameter("k_deg", k)
            .reaction(ReactionSpec::mass_action("decay", "k_deg").reactant("S"))
            .build()
            .unwrap()
    }

    #[test]
    fn matches_analytic_decay() {
        let network = decay(0.8);
        let p = network.default_parameters();
        let times: Vec<f64> = (0..=8).map(|i| i as f64 * 0.5).collect();
        let result = integrate(
            &network,
            &p,
            network.initial_state(),
            &times,
            &SolverOptions::default(),
        );
        assert!(result.failure.is_none());
        for (state, &t) in result.states.iter().zip(times.iter()) {
            assert_relative_eq!(state[0], (-0.8f64 * t).exp(), epsilon = 1e-4);
        }
    }

    #[test]
    fn agrees_with_explicit_solver_on_nonstiff_problem() {
        let network = decay(0.3);
        let p = network.default_parameters();
        let times: Vec<f64> = (0..=10).map(|i| i as f64).collect();
        let options = SolverOptions::default();

        let implicit = integrate(&network, &p, network.initial_state(), &times, &options);
        let adaptive =
            explicit::integrate_adaptive(&network, &p, network.initial_state(), &times, &options);
        assert!(implicit.failure.is_none());
        assert!(adaptive.failure.is_none());
        for (a, b) in implicit.states.iter().zip(adaptive.states.iter()) {
            assert_relative_eq!(a[0], b[0], epsilon = 1e-4);
        }
    }

    #[test]
    fn handles_fast_relaxation_within_a_modest_step_budget() {
        // Decay rate 1e4 makes explicit fixed stepping at the stability limit
        // prohibitively expensive over a unit horizon.
        let network = decay(1e4);
        let p = network.default_parameters();
        let times = vec![0.0, 0.5, 1.0];
        let options = SolverOptions::default().with_step_budget(5_000);

        let result = integrate(&network, &p, network.initial_state(), &times, &options);
        assert!(result.failure.is_none(), "failure: {:?}", result.failure);
        assert!(result.states[1][0].abs() < 1e-6);
        assert!(result.states[2][0].abs() < 1e-6);
    }

    #[test]
    fn jacobian_of_linear_decay_is_the_rate_constant() {
        let network = decay(0.8);
        let p = network.default_parameters();
        let y = network.initial_state();
        let jac = jacobian(&network, &p, 0.0, &y);
        assert_relative_eq!(jac[(0, 0)], -0.8, epsilon = 1e-5);
    }
}
