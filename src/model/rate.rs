use serde::{Deserialize, Serialize};

use crate::simulator::{T, V};

/// Kinetic rate law of a single reaction, with parameter and species
/// references resolved to indices into the network's ordered tables.
///
/// Each variant is a pure strategy: `(state, parameters, time) -> rate`.
/// Mass-action laws additionally consume the reaction's reactant list so
/// that stoichiometry enters the rate expression.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RateLaw {
    /// v = k * prod([reactant]^stoichiometry)
    ///
    /// With no reactants this degenerates to zero-order synthesis (v = k);
    /// with a single reactant it is first-order conversion or decay.
    MassAction { k: usize },
    /// v = vmax * [substrate] / (km + [substrate])
    MichaelisMenten {
        vmax: usize,
        km: usize,
        substrate: usize,
    },
    /// v = vmax * [regulator]^n / (khalf^n + [regulator]^n)
    ///
    /// `n` is itself a model parameter so cooperativity can be
    /// personalized like any other rate constant.
    Hill {
        vmax: usize,
        khalf: usize,
        n: usize,
        regulator: usize,
    },
    /// Zero-order synthesis active only inside a time window,
    /// v = k for start <= t < end, 0 otherwise.
    ///
    /// Models transient ligand stimulation (e.g. a growth-factor pulse).
    Pulse { k: usize, start: f64, end: f64 },
}

impl RateLaw {
    /// Evaluate the reaction rate at state `x`, parameters `p` and time `t`.
    ///
    /// `reactants` is the owning reaction's (species index, stoichiometry)
    /// list; only mass-action laws use it.
    pub(crate) fn rate(&self, x: &V, p: &V, t: T, reactants: &[(usize, f64)]) -> f64 {
        match *self {
            RateLaw::MassAction { k } => {
                let mut v = p[k];
                for &(species, stoich) in reactants {
                    v *= x[species].max(0.0).powf(stoich);
                }
                v
            }
            RateLaw::MichaelisMenten { vmax, km, substrate } => {
                let s = x[substrate].max(0.0);
                let denom = p[km] + s;
                if denom == 0.0 {
                    0.0
                } else {
                    p[vmax] * s / denom
                }
            }
            RateLaw::Hill {
                vmax,
                khalf,
                n,
                regulator,
            } => {
                let s = x[regulator].max(0.0).powf(p[n]);
                let denom = p[khalf].powf(p[n]) + s;
                if denom == 0.0 {
                    0.0
                } else {
                    p[vmax] * s / denom
                }
            }
            RateLaw::Pulse { k, start, end } => {
                if t >= start && t < end {
                    p[k]
                } else {
                    0.0
                }
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::DVector;

    #[test]
    fn mass_action_multiplies_reactant_concentrations() {
        let x = DVector::from_vec(vec![2.0, 3.0]);
        let p = DVector::from_vec(vec![0.5]);
        let law = RateLaw::MassAction { k: 0 };
        let rate = law.rate(&x, &p, 0.0, &[(0, 1.0), (1, 1.0)]);
        assert_relative_eq!(rate, 0.5 * 2.0 * 3.0);
    }

    #[test]
    fn mass_action_without_reactants_is_zero_order() {
        let x = DVector::from_vec(vec![2.0]);
        let p = DVector::from_vec(vec![0.7]);
        let law = RateLaw::MassAction { k: 0 };
        assert_relative_eq!(law.rate(&x, &p, 0.0, &[]), 0.7);
    }

    #[test]
    fn michaelis_menten_saturates() {
        let p = DVector::from_vec(vec![10.0, 1.0]);
        let law = RateLaw::MichaelisMenten {
            vmax: 0,
            km: 1,
            substrate: 0,
        };
        let low = law.rate(&DVector::from_vec(vec![0.1]), &p, 0.0, &[]);
        let high = law.rate(&DVector::from_vec(vec![1000.0]), &p, 0.0, &[]);
        assert!(low < 1.0);
        assert_relative_eq!(high, 10.0, epsilon = 0.1);
    }

    #[test]
    fn pulse_is_active_only_in_window() {
        let x = DVector::from_vec(vec![0.0]);
        let p = DVector::from_vec(vec![2.0]);
        let law = RateLaw::Pulse {
            k: 0,
            start: 1.0,
            end: 5.0,
        };
        assert_eq!(law.rate(&x, &p, 0.5, &[]), 0.0);
        assert_eq!(law.rate(&x, &p, 3.0, &[]), 2.0);
        assert_eq!(law.rate(&x, &p, 5.0, &[]), 0.0);
    }

    #[test]
    fn negative_concentrations_are_treated_as_zero() {
        let x = DVector::from_vec(vec![-1e-6]);
        let p = DVector::from_vec(vec![1.0]);
        let law = RateLaw::MassAction { k: 0 };
        assert_eq!(law.rate(&x, &p, 0.0, &[(0, 1.0)]), 0.0);
    }
}
