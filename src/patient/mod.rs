//! Per-patient input data: adjustment specifications and cohorts
//!
//! A [`PatientSpec`] carries everything known about one patient before the
//! pipeline runs: an identifier, the parameter/initial-condition adjustments
//! derived from omics or clinical data, and (for supervised training) an
//! optional known subtype label. A [`Cohort`] is an ordered collection of
//! patient specs with unique identifiers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CohortError {
    #[error("Duplicate patient id: {0}")]
    DuplicatePatient(String),
}

/// One personalization step applied on top of the model defaults.
///
/// `Scale` variants express omics-derived factors (e.g. a rate constant or
/// baseline protein level multiplied by relative expression); `Override`
/// replaces a parameter value outright.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Adjustment {
    /// Set a parameter to an absolute value.
    Override { parameter: String, value: f64 },
    /// Multiply a parameter's current value by a factor.
    Scale { parameter: String, factor: f64 },
    /// Multiply a species' initial concentration by a factor.
    ScaleInitial { species: String, factor: f64 },
}

/// Adjustment specification for a single patient.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PatientSpec {
    id: String,
    adjustments: Vec<Adjustment>,
    label: Option<String>,
}

impl PatientSpec {
    pub fn new(id: impl Into<String>) -> Self {
        PatientSpec {
            id: id.into(),
            adjustments: Vec::new(),
            label: None,
        }
    }

    /// Attach a known subtype label (used for supervised training).
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn override_parameter(mut self, parameter: impl Into<String>, value: f64) -> Self {
        self.adjustments.push(Adjustment::Override {
            parameter: parameter.into(),
            value,
        });
        self
    }

    pub fn scale_parameter(mut self, parameter: impl Into<String>, factor: f64) -> Self {
        self.adjustments.push(Adjustment::Scale {
            parameter: parameter.into(),
            factor,
        });
        self
    }

    pub fn scale_initial(mut self, species: impl Into<String>, factor: f64) -> Self {
        self.adjustments.push(Adjustment::ScaleInitial {
            species: species.into(),
            factor,
        });
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn adjustments(&self) -> &[Adjustment] {
        &self.adjustments
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }
}

/// An ordered collection of patients with unique identifiers.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Cohort {
    patients: Vec<PatientSpec>,
}

impl Cohort {
    /// Build a cohort, rejecting duplicate patient ids.
    pub fn new(patients: Vec<PatientSpec>) -> Result<Self, CohortError> {
        let mut cohort = Cohort {
            patients: Vec::with_capacity(patients.len()),
        };
        for patient in patients {
            cohort.add(patient)?;
        }
        Ok(cohort)
    }

    pub fn add(&mut self, patient: PatientSpec) -> Result<(), CohortError> {
        if self.get(patient.id()).is_some() {
            return Err(CohortError::DuplicatePatient(patient.id().to_string()));
        }
        self.patients.push(patient);
        Ok(())
    }

    pub fn patients(&self) -> &[PatientSpec] {
        &self.patients
    }

    pub fn get(&self, id: &str) -> Option<&PatientSpec> {
        self.patients.iter().find(|p| p.id() == id)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.patients.iter().map(|p| p.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.patients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patients.is_empty()
    }
}
