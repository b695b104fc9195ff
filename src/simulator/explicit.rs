//! Explicit integration strategies: fixed-step RK4 and adaptive
//! Dormand-Prince 4(5).
//!
//! Both march from one output grid time to the next and record the state at
//! every grid point reached; on breakdown they return the partial set of
//! samples together with the failure.

use super::{check_state, Failure, Integration, SolverOptions, V};
use crate::model::ReactionNetwork;

/// Fixed-step classical RK4.
pub(crate) fn integrate_fixed(
    network: &ReactionNetwork,
    p: &V,
    x0: V,
    times: &[f64],
    dt: f64,
    options: &SolverOptions,
) -> Integration {
    let mut states = vec![x0.clone()];
    if !(dt.is_finite() && dt > 0.0) {
        return Integration {
            states,
            failure: Some(Failure::Numerical(format!("invalid fixed step size {dt}"))),
        };
    }

    let n = x0.len();
    let span = times[times.len() - 1] - times[0];
    let tiny = 1e-12 * span;

    let mut y = x0;
    let mut t = times[0];
    let mut steps: usize = 0;

    let mut k1 = V::zeros(n);
    let mut k2 = V::zeros(n);
    let mut k3 = V::zeros(n);
    let mut k4 = V::zeros(n);

    for &target in &times[1..] {
        while target - t > tiny {
            if steps >= options.step_budget {
                return Integration {
                    states,
                    failure: Some(Failure::Budget),
                };
            }
            steps += 1;
            let h = dt.min(target - t);

            network.derivatives_into(&y, p, t, &mut k1);
            network.derivatives_into(&(&y + &k1 * (h / 2.0)), p, t + h / 2.0, &mut k2);
            network.derivatives_into(&(&y + &k2 * (h / 2.0)), p, t + h / 2.0, &mut k3);
            network.derivatives_into(&(&y + &k3 * h), p, t + h, &mut k4);

            y += (&k1 + &k2 * 2.0 + &k3 * 2.0 + &k4) * (h / 6.0);
            t += h;

            if y.iter().any(|v| !v.is_finite()) {
                return Integration {
                    states,
                    failure: Some(Failure::Numerical(format!("non-finite state at t={t}"))),
                };
            }
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

// Dormand-Prince coefficients
const A21: f64 = 1.0 / 5.0;
const A31: f64 = 3.0 / 40.0;
const A32: f64 = 9.0 / 40.0;
const A41: f64 = 44.0 / 45.0;
const A42: f64 = -56.0 / 15.0;
const A43: f64 = 32.0 / 9.0;
const A51: f64 = 19372.0 / 6561.0;
const A52: f64 = -25360.0 / 2187.0;
const A53: f64 = 64448.0 / 6561.0;
const A54: f64 = -212.0 / 729.0;
const A61: f64 = 9017.0 / 3168.0;
const A62: f64 = -355.0 / 33.0;
const A63: f64 = 46732.0 / 5247.0;
const A64: f64 = 49.0 / 176.0;
const A65: f64 = -5103.0 / 18656.0;

// 4th-order weights (for the error estimate)
const B1: f64 = 5179.0 / 57600.0;
const B3: f64 = 7571.0 / 16695.0;
const B4: f64 = 393.0 / 640.0;
const B5: f64 = -92097.0 / 339200.0;
const B6: f64 = 187.0 / 2100.0;
const B7: f64 = 1.0 / 40.0;

// 5th-order weights (advancing solution — local extrapolation)
const BH1: f64 = 35.0 / 384.0;
const BH3: f64 = 500.0 / 1113.0;
const BH4: f64 = 125.0 / 192.0;
const BH5: f64 = -2187.0 / 6784.0;
const BH6: f64 = 11.0 / 84.0;

// Error = y5 - y4
const E1: f64 = BH1 - B1;
const E3: f64 = BH3 - B3;
const E4: f64 = BH4 - B4;
const E5: f64 = BH5 - B5;
const E6: f64 = BH6 - B6;
const E7: f64 = -B7;

/// Adaptive Dormand-Prince 4(5) with FSAL and step-size control.
pub(crate) fn integrate_adaptive(
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

    let mut k1 = V::zeros(n);
    let mut k2 = V::zeros(n);
    let mut k3 = V::zeros(n);
    let mut k4 = V::zeros(n);
    let mut k5 = V::zeros(n);
    let mut k6 = V::zeros(n);
    let mut k7 = V::zeros(n);
    let mut y_tmp = V::zeros(n);
    let mut y_new = V::zeros(n);

    network.derivatives_into(&y, p, t, &mut k1);

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

            // Stage 2
            for i in 0..n {
                y_tmp[i] = y[i] + hs * A21 * k1[i];
            }
            network.derivatives_into(&y_tmp, p, t + hs / 5.0, &mut k2);

            // Stage 3
            for i in 0..n {
                y_tmp[i] = y[i] + hs * (A31 * k1[i] + A32 * k2[i]);
            }
            network.derivatives_into(&y_tmp, p, t + 3.0 * hs / 10.0, &mut k3);

            // Stage 4
            for i in 0..n {
                y_tmp[i] = y[i] + hs * (A41 * k1[i] + A42 * k2[i] + A43 * k3[i]);
            }
            network.derivatives_into(&y_tmp, p, t + 4.0 * hs / 5.0, &mut k4);

            // Stage 5
            for i in 0..n {
                y_tmp[i] =
                    y[i] + hs * (A51 * k1[i] + A52 * k2[i] + A53 * k3[i] + A54 * k4[i]);
            }
            network.derivatives_into(&y_tmp, p, t + 8.0 * hs / 9.0, &mut k5);

            // Stage 6
            for i in 0..n {
                y_tmp[i] = y[i]
                    + hs * (A61 * k1[i] + A62 * k2[i] + A63 * k3[i] + A64 * k4[i] + A65 * k5[i]);
            }
            network.derivatives_into(&y_tmp, p, t + hs, &mut k6);

            // 5th-order solution
            for i in 0..n {
                y_new[i] = y[i]
                    + hs * (BH1 * k1[i] + BH3 * k3[i] + BH4 * k4[i] + BH5 * k5[i] + BH6 * k6[i]);
            }

            // Stage 7 (FSAL: first same as last)
            network.derivatives_into(&y_new, p, t + hs, &mut k7);

            let mut err_norm = 0.0;
            for i in 0..n {
                let ei = hs
                    * (E1 * k1[i]
                        + E3 * k3[i]
                        + E4 * k4[i]
                        + E5 * k5[i]
                        + E6 * k6[i]
                        + E7 * k7[i]);
                let sc = options.atol + options.rtol * y[i].abs().max(y_new[i].abs());
                err_norm += (ei / sc) * (ei / sc);
            }
            err_norm = (err_norm / n as f64).sqrt();
            if !err_norm.is_finite() {
                err_norm = f64::INFINITY;
            }

            if err_norm <= 1.0 {
                t += hs;
                y.copy_from(&y_new);
                k1.copy_from(&k7);
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
                5.0
            } else {
                (0.9 * err_norm.powf(-0.2)).clamp(0.2, 5.0)
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
    use crate::model::ReactionSpec;
    use approx::assert_relative_eq;
    use nalgebra::DVector;

    fn two_species() -> ReactionNetwork {
        ReactionNetwork::builder()
            .species("A", 1.0)
            .species("B", 0.0)
            .parameter("k", 0.3)
            .reaction(
                ReactionSpec::mass_action("conversion", "k")
                    .reactant("A")
                    .product("B"),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn fixed_and_adaptive_agree_on_linear_conversion() {
        let network = two_species();
        let p = network.default_parameters();
        let x0 = network.initial_state();
        let times: Vec<f64> = (0..=20).map(|i| i as f64 * 0.5).collect();
        let options = SolverOptions::default();

        let fixed = integrate_fixed(&network, &p, x0.clone(), &times, 0.01, &options);
        let adaptive = integrate_adaptive(&network, &p, x0, &times, &options);
        assert!(fixed.failure.is_none());
        assert!(adaptive.failure.is_none());

        for (a, b) in fixed.states.iter().zip(adaptive.states.iter()) {
            assert_relative_eq!(a[0], b[0], epsilon = 1e-5);
            assert_relative_eq!(a[1], b[1], epsilon = 1e-5);
        }
    }

    #[test]
    fn mass_is_conserved_in_closed_conversion() {
        let network = two_species();
        let p = network.default_parameters();
        let x0 = network.initial_state();
        let times: Vec<f64> = (0..=10).map(|i| i as f64).collect();

        let result = integrate_adaptive(&network, &p, x0, &times, &SolverOptions::default());
        for state in &result.states {
            assert_relative_eq!(state[0] + state[1], 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn zero_step_size_is_rejected() {
        let network = two_species();
        let p = network.default_parameters();
        let x0 = network.initial_state();
        let result = integrate_fixed(
            &network,
            &p,
            x0,
            &[0.0, 1.0],
            0.0,
            &SolverOptions::default(),
        );
        assert!(matches!(result.failure, Some(Failure::Numerical(_))));
    }

    #[test]
    fn partial_states_are_kept_on_budget_exhaustion() {
        let network = two_species();
        let p = network.default_parameters();
        let x0 = network.initial_state();
        let times: Vec<f64> = (0..=10).map(|i| i as f64).collect();
        let options = SolverOptions::default().with_step_budget(250);

        let result = integrate_fixed(&network, &p, x0, &times, 0.01, &options);
        assert!(matches!(result.failure, Some(Failure::Budget)));
        // 250 steps of 0.01 cover 2.5 time units: grid points 0, 1 and 2
        assert_eq!(result.states.len(), 3);
    }

    #[test]
    fn initial_state_is_always_first_sample() {
        let network = two_species();
        let p = network.default_parameters();
        let x0 = DVector::from_vec(vec![0.7, 0.3]);
        let times = vec![0.0, 1.0];
        let result = integrate_adaptive(&network, &p, x0, &times, &SolverOptions::default());
        assert_relative_eq!(result.states[0][0], 0.7);
        assert_relative_eq!(result.states[0][1], 0.3);
    }
}
