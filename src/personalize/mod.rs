//! Parameter personalization
//!
//! Maps a patient's adjustment specification onto the network's default
//! parameter vector and initial state, producing a [`PatientParameters`]
//! ready for simulation. Adjustments that would leave a parameter's declared
//! valid range are clamped to the boundary and recorded as [`ClampWarning`]s
//! — clamping is never silent, the warning list is part of the per-patient
//! audit trail.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::model::ReactionNetwork;
use crate::patient::{Adjustment, PatientSpec};
use crate::simulator::V;

/// Bad per-patient adjustment. Isolated to that patient: the pipeline
/// records it in the cohort result and continues with the rest.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PersonalizationError {
    #[error("Patient {patient}: adjustment references unknown parameter: {name}")]
    UnknownParameter { patient: String, name: String },
    #[error("Patient {patient}: adjustment references unknown species: {name}")]
    UnknownSpecies { patient: String, name: String },
    #[error("Patient {patient}: adjustment for {name} produces a non-finite value")]
    NonFiniteValue { patient: String, name: String },
}

/// Record of a value clamped to its valid range during personalization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClampWarning {
    /// Parameter (or species, for initial-condition scaling) that was clamped.
    pub name: String,
    /// Value the adjustment asked for.
    pub requested: f64,
    /// Boundary value actually applied.
    pub applied: f64,
}

impl fmt::Display for ClampWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} clamped from {} to {}",
            self.name, self.requested, self.applied
        )
    }
}

/// Patient-specific parameter vector and initial state, plus the clamp
/// warnings accumulated while deriving them. Read-only input to the
/// simulator; one per patient.
#[derive(Clone, Debug, PartialEq)]
pub struct PatientParameters {
    patient_id: String,
    values: V,
    initial_state: V,
    warnings: Vec<ClampWarning>,
}

impl PatientParameters {
    pub fn patient_id(&self) -> &str {
        &self.patient_id
    }

    /// Parameter values in the network's declared order.
    pub fn values(&self) -> &V {
        &self.values
    }

    /// Personalized initial state in the network's species order.
    pub fn initial_state(&self) -> &V {
        &self.initial_state
    }

    pub fn warnings(&self) -> &[ClampWarning] {
        &self.warnings
    }
}

/// Derive a patient-specific parameter vector from the network defaults.
pub fn personalize(
    network: &ReactionNetwork,
    spec: &PatientSpec,
) -> Result<PatientParameters, PersonalizationError> {
    personalize_with_overrides(network, spec, &[])
}

/// Like [`personalize`], with extra adjustments applied after the patient's
/// own. Used by the pipeline to superimpose simulated perturbation
/// conditions on an already-personalized model.
pub fn personalize_with_overrides(
    network: &ReactionNetwork,
    spec: &PatientSpec,
    overrides: &[Adjustment],
) -> Result<PatientParameters, PersonalizationError> {
    let mut values = network.default_parameters();
    let mut initial_state = network.initial_state();
    let mut warnings = Vec::new();

    for adjustment in spec.adjustments().iter().chain(overrides.iter()) {
        apply(
            network,
            spec.id(),
            adjustment,
            &mut values,
            &mut initial_state,
            &mut warnings,
        )?;
    }

    Ok(PatientParameters {
        patient_id: spec.id().to_string(),
        values,
        initial_state,
        warnings,
    })
}

fn apply(
    network: &ReactionNetwork,
    patient: &str,
    adjustment: &Adjustment,
    values: &mut V,
    initial_state: &mut V,
    warnings: &mut Vec<ClampWarning>,
) -> Result<(), PersonalizationError> {
    match adjustment {
        Adjustment::Override { parameter, value } => {
            let idx = parameter_index(network, patient, parameter)?;
            set_parameter(network, idx, *value, values, warnings, patient, parameter)
        }
        Adjustment::Scale { parameter, factor } => {
            let idx = parameter_index(network, patient, parameter)?;
            let requested = values[idx] * factor;
            set_parameter(
                network, idx, requested, values, warnings, patient, parameter,
            )
        }
        Adjustment::ScaleInitial { species, factor } => {
            let idx = network.species_index(species).ok_or_else(|| {
                PersonalizationError::UnknownSpecies {
                    patient: patient.to_string(),
                    name: species.clone(),
                }
            })?;
            let requested = initial_state[idx] * factor;
            if !requested.is_finite() {
                return Err(PersonalizationError::NonFiniteValue {
                    patient: patient.to_string(),
                    name: species.clone(),
                });
            }
            // Concentrations cannot go negative; clamp and flag like parameters.
            let applied = requested.max(0.0);
            if applied != requested {
                warnings.push(ClampWarning {
                    name: species.clone(),
                    requested,
                    applied,
                });
            }
            initial_state[idx] = applied;
            Ok(())
        }
    }
}

fn parameter_index(
    network: &ReactionNetwork,
    patient: &str,
    name: &str,
) -> Result<usize, PersonalizationError> {
    network
        .parameter_index(name)
        .ok_or_else(|| PersonalizationError::UnknownParameter {
            patient: patient.to_string(),
            name: name.to_string(),
        })
}

#[allow(clippy::too_many_arguments)]
fn set_parameter(
    network: &ReactionNetwork,
    idx: usize,
    requested: f64,
    values: &mut V,
    warnings: &mut Vec<ClampWarning>,
    patient: &str,
    name: &str,
) -> Result<(), PersonalizationError> {
    if requested.is_nan() {
        return Err(PersonalizationError::NonFiniteValue {
            patient: patient.to_string(),
            name: name.to_string(),
        });
    }
    let range = network.parameters()[idx].range();
    let applied = range.clamp(requested);
    if applied != requested {
        warnings.push(ClampWarning {
            name: name.to_string(),
            requested,
            applied,
        });
    }
    values[idx] = applied;
    Ok(())
}
