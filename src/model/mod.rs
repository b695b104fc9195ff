//! Immutable representation of a biochemical reaction network
//!
//! A [`ReactionNetwork`] is the compiled intermediate form of a model:
//! ordered species with initial values, ordered parameters with defaults and
//! valid ranges, and reactions whose kinetics are explicit [`RateLaw`]
//! strategies. It is built once from a [`NetworkBuilder`], validated
//! structurally, and shared read-only by every downstream stage — it is safe
//! to hand the same network to many concurrent simulations.

mod rate;
pub use rate::RateLaw;

use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::simulator::{T, V};

/// Structural inconsistency in a model description.
///
/// Any of these aborts the whole pipeline: a malformed model cannot be
/// simulated for any patient.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("Duplicate species name: {0}")]
    DuplicateSpecies(String),
    #[error("Duplicate parameter name: {0}")]
    DuplicateParameter(String),
    #[error("Reaction '{reaction}' references unknown species: {name}")]
    UnknownSpecies { reaction: String, name: String },
    #[error("Reaction '{reaction}' references unknown parameter: {name}")]
    UnknownParameter { reaction: String, name: String },
    #[error("Invalid range for parameter {name}: [{lo}, {hi}]")]
    InvalidRange { name: String, lo: f64, hi: f64 },
    #[error("Non-finite default value for parameter {0}")]
    NonFiniteDefault(String),
    #[error("Negative initial value for species {0}")]
    NegativeInitial(String),
    #[error("Model declares no species")]
    NoSpecies,
}

/// A molecular species with its baseline initial concentration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Species {
    name: String,
    initial_value: f64,
}

impl Species {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn initial_value(&self) -> f64 {
        self.initial_value
    }
}

/// Closed interval of biologically valid values for a parameter.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Range {
    lo: f64,
    hi: f64,
}

impl Range {
    pub fn new(lo: f64, hi: f64) -> Self {
        Range { lo, hi }
    }

    /// The default range for rate constants: `[0, +inf)`.
    pub fn nonnegative() -> Self {
        Range {
            lo: 0.0,
            hi: f64::INFINITY,
        }
    }

    pub fn lo(&self) -> f64 {
        self.lo
    }

    pub fn hi(&self) -> f64 {
        self.hi
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.lo && value <= self.hi
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.max(self.lo).min(self.hi)
    }
}

/// A model parameter: name, default value and valid range.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    name: String,
    default: f64,
    range: Range,
}

impl Parameter {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default(&self) -> f64 {
        self.default
    }

    pub fn range(&self) -> Range {
        self.range
    }
}

/// A reaction with resolved species indices and a rate-law strategy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    name: String,
    reactants: Vec<(usize, f64)>,
    products: Vec<(usize, f64)>,
    rate: RateLaw,
}

impl Reaction {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rate_law(&self) -> &RateLaw {
        &self.rate
    }
}

/// Compiled, immutable reaction network.
///
/// Constructed via [`ReactionNetwork::builder`]; all name references are
/// resolved to indices at build time, so evaluation of the right-hand side
/// involves no lookups.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReactionNetwork {
    species: Vec<Species>,
    parameters: Vec<Parameter>,
    reactions: Vec<Reaction>,
    species_index: HashMap<String, usize>,
    parameter_index: HashMap<String, usize>,
}

impl ReactionNetwork {
    pub fn builder() -> NetworkBuilder {
        NetworkBuilder::default()
    }

    /// Ordered species table.
    pub fn species(&self) -> &[Species] {
        &self.species
    }

    /// Ordered parameter table.
    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn reactions(&self) -> &[Reaction] {
        &self.reactions
    }

    pub fn nspecies(&self) -> usize {
        self.species.len()
    }

    pub fn nparams(&self) -> usize {
        self.parameters.len()
    }

    pub fn species_index(&self, name: &str) -> Option<usize> {
        self.species_index.get(name).copied()
    }

    pub fn parameter_index(&self, name: &str) -> Option<usize> {
        self.parameter_index.get(name).copied()
    }

    /// Baseline initial state vector, one entry per species.
    pub fn initial_state(&self) -> V {
        DVector::from_iterator(
            self.species.len(),
            self.species.iter().map(|s| s.initial_value),
        )
    }

    /// Default parameter vector, one entry per parameter.
    pub fn default_parameters(&self) -> V {
        DVector::from_iterator(
            self.parameters.len(),
            self.parameters.iter().map(|p| p.default),
        )
    }

    /// Evaluate the ODE right-hand side into `dx`.
    ///
    /// Pure function of `(x, p, t)`; `dx` is fully overwritten.
    pub fn derivatives_into(&self, x: &V, p: &V, t: T, dx: &mut V) {
        dx.fill(0.0);
        for reaction in &self.reactions {
            let v = reaction.rate.rate(x, p, t, &reaction.reactants);
            for &(species, stoich) in &reaction.reactants {
                dx[species] -= stoich * v;
            }
            for &(species, stoich) in &reaction.products {
                dx[species] += stoich * v;
            }
        }
    }

    /// Convenience wrapper around [`ReactionNetwork::derivatives_into`].
    pub fn derivatives(&self, x: &V, p: &V, t: T) -> V {
        let mut dx = DVector::zeros(self.nspecies());
        self.derivatives_into(x, p, t, &mut dx);
        dx
    }
}

/// Rate law referencing parameters and species by name, resolved at build.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RateLawSpec {
    MassAction {
        k: String,
    },
    MichaelisMenten {
        vmax: String,
        km: String,
        substrate: String,
    },
    Hill {
        vmax: String,
        khalf: String,
        n: String,
        regulator: String,
    },
    Pulse {
        k: String,
        start: f64,
        end: f64,
    },
}

/// Unresolved reaction description consumed by [`NetworkBuilder::reaction`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReactionSpec {
    name: String,
    reactants: Vec<(String, f64)>,
    products: Vec<(String, f64)>,
    rate: RateLawSpec,
}

impl ReactionSpec {
    /// Mass-action reaction; add reactants/products with
    /// [`ReactionSpec::reactant`] and [`ReactionSpec::product`].
    pub fn mass_action(name: impl Into<String>, k: impl Into<String>) -> Self {
        ReactionSpec {
            name: name.into(),
            reactants: Vec::new(),
            products: Vec::new(),
            rate: RateLawSpec::MassAction { k: k.into() },
        }
    }

    /// Michaelis-Menten conversion of `substrate`.
    pub fn michaelis_menten(
        name: impl Into<String>,
        vmax: impl Into<String>,
        km: impl Into<String>,
        substrate: impl Into<String>,
    ) -> Self {
        ReactionSpec {
            name: name.into(),
            reactants: Vec::new(),
            products: Vec::new(),
            rate: RateLawSpec::MichaelisMenten {
                vmax: vmax.into(),
                km: km.into(),
                substrate: substrate.into(),
            },
        }
    }

    /// Hill-type activation driven by `regulator`.
    pub fn hill(
        name: impl Into<String>,
        vmax: impl Into<String>,
        khalf: impl Into<String>,
        n: impl Into<String>,
        regulator: impl Into<String>,
    ) -> Self {
        ReactionSpec {
            name: name.into(),
            reactants: Vec::new(),
            products: Vec::new(),
            rate: RateLawSpec::Hill {
                vmax: vmax.into(),
                khalf: khalf.into(),
                n: n.into(),
                regulator: regulator.into(),
            },
        }
    }

    /// Windowed zero-order synthesis (stimulus pulse).
    pub fn pulse(
        name: impl Into<String>,
        k: impl Into<String>,
        start: f64,
        end: f64,
    ) -> Self {
        ReactionSpec {
            name: name.into(),
            reactants: Vec::new(),
            products: Vec::new(),
            rate: RateLawSpec::Pulse {
                k: k.into(),
                start,
                end,
            },
        }
    }

    /// Add a reactant with unit stoichiometry.
    pub fn reactant(self, species: impl Into<String>) -> Self {
        self.reactant_n(species, 1.0)
    }

    /// Add a reactant with explicit stoichiometry.
    pub fn reactant_n(mut self, species: impl Into<String>, stoichiometry: f64) -> Self {
        self.reactants.push((species.into(), stoichiometry));
        self
    }

    /// Add a product with unit stoichiometry.
    pub fn product(self, species: impl Into<String>) -> Self {
        self.product_n(species, 1.0)
    }

    /// Add a product with explicit stoichiometry.
    pub fn product_n(mut self, species: impl Into<String>, stoichiometry: f64) -> Self {
        self.products.push((species.into(), stoichiometry));
        self
    }
}

/// Builder for [`ReactionNetwork`].
///
/// Collects species, parameters and reactions by name, then resolves and
/// validates everything in [`NetworkBuilder::build`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NetworkBuilder {
    species: Vec<Species>,
    parameters: Vec<Parameter>,
    reactions: Vec<ReactionSpec>,
}

impl NetworkBuilder {
    /// Declare a species with its baseline initial concentration.
    pub fn species(mut self, name: impl Into<String>, initial_value: f64) -> Self {
        self.species.push(Species {
            name: name.into(),
            initial_value,
        });
        self
    }

    /// Declare a rate constant with the default `[0, +inf)` range.
    pub fn parameter(self, name: impl Into<String>, default: f64) -> Self {
        self.parameter_in(name, default, Range::nonnegative())
    }

    /// Declare a parameter with an explicit valid range.
    pub fn parameter_in(mut self, name: impl Into<String>, default: f64, range: Range) -> Self {
        self.parameters.push(Parameter {
            name: name.into(),
            default,
            range,
        });
        self
    }

    pub fn reaction(mut self, spec: ReactionSpec) -> Self {
        self.reactions.push(spec);
        self
    }

    /// Parse a builder from a JSON model description.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize the unresolved model description to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Resolve names to indices and validate the structure.
    pub fn build(self) -> Result<ReactionNetwork, ModelError> {
        if self.species.is_empty() {
            return Err(ModelError::NoSpecies);
        }

        let mut species_index = HashMap::new();
        for (i, s) in self.species.iter().enumerate() {
            if species_index.insert(s.name.clone(), i).is_some() {
                return Err(ModelError::DuplicateSpecies(s.name.clone()));
            }
            if s.initial_value < 0.0 {
                return Err(ModelError::NegativeInitial(s.name.clone()));
            }
        }

        let mut parameter_index = HashMap::new();
        for (i, p) in self.parameters.iter().enumerate() {
            if parameter_index.insert(p.name.clone(), i).is_some() {
                return Err(ModelError::DuplicateParameter(p.name.clone()));
            }
            if !p.default.is_finite() {
                return Err(ModelError::NonFiniteDefault(p.name.clone()));
            }
            if !p.range.lo.is_finite() || p.range.lo > p.range.hi || p.range.hi.is_nan() {
                return Err(ModelError::InvalidRange {
                    name: p.name.clone(),
                    lo: p.range.lo,
                    hi: p.range.hi,
                });
            }
        }

        let lookup_species = |reaction: &str, name: &str| -> Result<usize, ModelError> {
            species_index
                .get(name)
                .copied()
                .ok_or_else(|| ModelError::UnknownSpecies {
                    reaction: reaction.to_string(),
                    name: name.to_string(),
                })
        };
        let lookup_parameter = |reaction: &str, name: &str| -> Result<usize, ModelError> {
            parameter_index
                .get(name)
                .copied()
                .ok_or_else(|| ModelError::UnknownParameter {
                    reaction: reaction.to_string(),
                    name: name.to_string(),
                })
        };

        let mut reactions = Vec::with_capacity(self.reactions.len());
        for spec in &self.reactions {
            let mut reactants = Vec::with_capacity(spec.reactants.len());
            for (name, stoich) in &spec.reactants {
                reactants.push((lookup_species(&spec.name, name)?, *stoich));
            }
            let mut products = Vec::with_capacity(spec.products.len());
            for (name, stoich) in &spec.products {
                products.push((lookup_species(&spec.name, name)?, *stoich));
            }
            let rate = match &spec.rate {
                RateLawSpec::MassAction { k } => RateLaw::MassAction {
                    k: lookup_parameter(&spec.name, k)?,
                },
                RateLawSpec::MichaelisMenten { vmax, km, substrate } => RateLaw::MichaelisMenten {
                    vmax: lookup_parameter(&spec.name, vmax)?,
                    km: lookup_parameter(&spec.name, km)?,
                    substrate: lookup_species(&spec.name, substrate)?,
                },
                RateLawSpec::Hill {
                    vmax,
                    khalf,
                    n,
                    regulator,
                } => RateLaw::Hill {
                    vmax: lookup_parameter(&spec.name, vmax)?,
                    khalf: lookup_parameter(&spec.name, khalf)?,
                    n: lookup_parameter(&spec.name, n)?,
                    regulator: lookup_species(&spec.name, regulator)?,
                },
                RateLawSpec::Pulse { k, start, end } => RateLaw::Pulse {
                    k: lookup_parameter(&spec.name, k)?,
                    start: *start,
                    end: *end,
                },
            };
            reactions.push(Reaction {
                name: spec.name.clone(),
                reactants,
                products,
                rate,
            });
        }

        Ok(ReactionNetwork {
            species: self.species,
            parameters: self.parameters,
            reactions,
            species_index,
            parameter_index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn conversion_model() -> ReactionNetwork {
        ReactionNetwork::builder()
            .species("X", 1.0)
            .species("Xp", 0.0)
            .parameter("k_act", 1.0)
            .parameter("k_deg", 0.5)
            .reaction(
                ReactionSpec::mass_action("activation", "k_act")
                    .reactant("X")
                    .product("Xp"),
            )
            .reaction(ReactionSpec::mass_action("degradation", "k_deg").reactant("Xp"))
            .build()
            .unwrap()
    }

    #[test]
    fn derivatives_conserve_mass_action_flux() {
        let network = conversion_model();
        let x = network.initial_state();
        let p = network.default_parameters();
        let dx = network.derivatives(&x, &p, 0.0);
        // activation flux 1.0 * 1.0 leaves X and enters Xp; no Xp to degrade yet
        assert_relative_eq!(dx[0], -1.0);
        assert_relative_eq!(dx[1], 1.0);
    }

    #[test]
    fn duplicate_species_is_rejected() {
        let err = ReactionNetwork::builder()
            .species("X", 1.0)
            .species("X", 2.0)
            .build()
            .unwrap_err();
        assert_eq!(err, ModelError::DuplicateSpecies("X".to_string()));
    }

    #[test]
    fn duplicate_parameter_is_rejected() {
        let err = ReactionNetwork::builder()
            .species("X", 1.0)
            .parameter("k", 1.0)
            .parameter("k", 2.0)
            .build()
            .unwrap_err();
        assert_eq!(err, ModelError::DuplicateParameter("k".to_string()));
    }

    #[test]
    fn unknown_rate_parameter_is_rejected() {
        let err = ReactionNetwork::builder()
            .species("X", 1.0)
            .reaction(ReactionSpec::mass_action("decay", "missing").reactant("X"))
            .build()
            .unwrap_err();
        assert!(matches!(err, ModelError::UnknownParameter { .. }));
    }

    #[test]
    fn unknown_reactant_is_rejected() {
        let err = ReactionNetwork::builder()
            .species("X", 1.0)
            .parameter("k", 1.0)
            .reaction(ReactionSpec::mass_action("decay", "k").reactant("Y"))
            .build()
            .unwrap_err();
        assert!(matches!(err, ModelError::UnknownSpecies { .. }));
    }

    #[test]
    fn inverted_range_is_rejected() {
        let err = ReactionNetwork::builder()
            .species("X", 1.0)
            .parameter_in("k", 1.0, Range::new(2.0, 1.0))
            .build()
            .unwrap_err();
        assert!(matches!(err, ModelError::InvalidRange { .. }));
    }

    #[test]
    fn indices_follow_declaration_order() {
        let network = conversion_model();
        assert_eq!(network.species_index("X"), Some(0));
        assert_eq!(network.species_index("Xp"), Some(1));
        assert_eq!(network.parameter_index("k_deg"), Some(1));
        assert_eq!(network.parameter_index("nope"), None);
    }

    #[test]
    fn builder_round_trips_through_json() {
        let builder = ReactionNetwork::builder()
            .species("X", 1.0)
            .parameter("k", 0.5)
            .reaction(ReactionSpec::mass_action("decay", "k").reactant("X"));
        let json = builder.to_json().unwrap();
        let network = NetworkBuilder::from_json(&json).unwrap().build().unwrap();
        assert_eq!(network.nspecies(), 1);
        assert_eq!(network.reactions().len(), 1);
    }

    #[test]
    fn network_round_trips_through_json() {
        let network = conversion_model();
        let json = serde_json::to_string(&network).unwrap();
        let back: ReactionNetwork = serde_json::from_str(&json).unwrap();
        assert_eq!(back.nspecies(), 2);
        assert_eq!(back.parameter_index("k_act"), Some(0));
    }
}
