//! Cohort pipeline
//!
//! Runs the full chain for every patient — personalize, simulate under each
//! configured condition, extract features — in parallel across the cohort,
//! then fits one classifier over the pooled feature matrix and assigns every
//! patient with a defined feature vector.
//!
//! Per-patient failures (bad adjustments, solver breakdown, exhausted step
//! budgets) are isolated: they mark that patient's record and never abort
//! the cohort run. Classification failures (for example too few labeled
//! training examples) are likewise recorded on the [`CohortResult`] rather
//! than returned as an error, so the simulation work is never thrown away.

use dashmap::DashMap;
use indicatif::ProgressBar;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::classify::{Assignment, ClassifierMode, TrainedClassifier};
use crate::features::{extract, FeatureError, FeatureSchema, FeatureVector};
use crate::model::ReactionNetwork;
use crate::patient::{Adjustment, Cohort, PatientSpec};
use crate::personalize::{personalize_with_overrides, ClampWarning};
use crate::simulator::{simulate_with_cache, SolverOptions, TimeGrid, TrajectoryStatus};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error("No simulation conditions configured")]
    NoConditions,
    #[error("Duplicate condition name: {0}")]
    DuplicateCondition(String),
    #[error("Unknown patient id: {0}")]
    UnknownPatient(String),
    #[error("Failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("CSV export failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("CSV export failed: {0}")]
    Io(#[from] std::io::Error),
}

/// One simulated perturbation applied on top of every patient's
/// personalized model — a growth-factor stimulus, a drug dose, a knockdown.
/// The baseline condition applies no overrides.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    name: String,
    overrides: Vec<Adjustment>,
}

impl Condition {
    pub fn baseline() -> Self {
        Condition {
            name: "baseline".to_string(),
            overrides: Vec::new(),
        }
    }

    pub fn new(name: impl Into<String>) -> Self {
        Condition {
            name: name.into(),
            overrides: Vec::new(),
        }
    }

    pub fn override_parameter(mut self, parameter: impl Into<String>, value: f64) -> Self {
        self.overrides.push(Adjustment::Override {
            parameter: parameter.into(),
            value,
        });
        self
    }

    pub fn scale_parameter(mut self, parameter: impl Into<String>, factor: f64) -> Self {
        self.overrides.push(Adjustment::Scale {
            parameter: parameter.into(),
            factor,
        });
        self
    }

    pub fn scale_initial(mut self, species: impl Into<String>, factor: f64) -> Self {
        self.overrides.push(Adjustment::ScaleInitial {
            species: species.into(),
            factor,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn overrides(&self) -> &[Adjustment] {
        &self.overrides
    }
}

/// Everything a cohort run needs besides the network and the patients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub grid: TimeGrid,
    pub solver: SolverOptions,
    pub schema: FeatureSchema,
    pub conditions: Vec<Condition>,
    pub mode: ClassifierMode,
    /// Worker thread count; `None` uses the global rayon pool.
    pub parallelism: Option<usize>,
    /// Memoize trajectories so partial re-runs skip unchanged patients.
    pub cache: bool,
    /// Show a progress bar while the cohort runs.
    pub progress: bool,
}

impl PipelineConfig {
    pub fn new(grid: TimeGrid, schema: FeatureSchema, mode: ClassifierMode) -> Self {
        PipelineConfig {
            grid,
            solver: SolverOptions::default(),
            schema,
            conditions: vec![Condition::baseline()],
            mode,
            parallelism: None,
            cache: true,
            progress: false,
        }
    }

    pub fn with_solver(mut self, solver: SolverOptions) -> Self {
        self.solver = solver;
        self
    }

    pub fn with_conditions(mut self, conditions: Vec<Condition>) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn with_parallelism(mut self, threads: usize) -> Self {
        self.parallelism = Some(threads);
        self
    }

    pub fn with_cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }
}

/// Everything the pipeline produced for one patient.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PatientRecord {
    /// Known subtype label, when the patient came in with one.
    pub label: Option<String>,
    /// Personalization failure, if the patient's adjustments were invalid.
    pub error: Option<String>,
    /// Clamp warnings accumulated during personalization.
    pub warnings: Vec<ClampWarning>,
    /// Simulation outcome per condition name.
    pub statuses: BTreeMap<String, TrajectoryStatus>,
    /// Features concatenated across conditions, or the reason they are
    /// undefined.
    pub features: FeatureVector,
    /// Classification outcome; `None` when the features are undefined or
    /// no classifier could be fitted.
    pub assignment: Option<Assignment>,
}

/// Full cohort output: per-patient records keyed by id, in id order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CohortResult {
    records: BTreeMap<String, PatientRecord>,
    feature_names: Vec<String>,
    classifier: Option<TrainedClassifier>,
    classification_error: Option<String>,
}

impl CohortResult {
    pub fn records(&self) -> &BTreeMap<String, PatientRecord> {
        &self.records
    }

    pub fn record(&self, id: &str) -> Option<&PatientRecord> {
        self.records.get(id)
    }

    /// Column names of the concatenated feature matrix.
    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    /// The classifier fitted during this run, when one could be.
    pub fn classifier(&self) -> Option<&TrainedClassifier> {
        self.classifier.as_ref()
    }

    /// Why no classifier could be fitted, when that happened.
    pub fn classification_error(&self) -> Option<&str> {
        self.classification_error.as_deref()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Export one row per patient: id, label, assignment, score, status,
    /// clamp warnings, then the feature columns (empty cells when
    /// undefined).
    pub fn write_csv<W: std::io::Write>(&self, writer: W) -> Result<(), PipelineError> {
        let mut wtr = csv::Writer::from_writer(writer);

        let mut header = vec![
            "patient_id".to_string(),
            "label".to_string(),
            "assignment".to_string(),
            "score".to_string(),
            "status".to_string(),
            "warnings".to_string(),
        ];
        header.extend(self.feature_names.iter().cloned());
        wtr.write_record(&header)?;

        for (id, record) in &self.records {
            let (assignment, score) = match &record.assignment {
                Some(Assignment::Subtype { label, confidence }) => {
                    (label.clone(), confidence.to_string())
                }
                Some(Assignment::Cluster { id, cohesion }) => {
                    (format!("cluster_{id}"), cohesion.to_string())
                }
                None => (String::new(), String::new()),
            };

            let mut row = vec![
                id.clone(),
                record.label.clone().unwrap_or_default(),
                assignment,
                score,
                summarize_status(record),
                record
                    .warnings
                    .iter()
                    .map(|w| w.to_string())
                    .collect::<Vec<_>>()
                    .join("; "),
            ];
            match &record.features {
                FeatureVector::Defined(values) => {
                    row.extend(values.iter().map(|v| v.to_string()));
                }
                FeatureVector::Undefined { .. } => {
                    row.extend(std::iter::repeat(String::new()).take(self.feature_names.len()));
                }
            }
            wtr.write_record(&row)?;
        }
        wtr.flush()?;
        Ok(())
    }
}

fn summarize_status(record: &PatientRecord) -> String {
    if let Some(error) = &record.error {
        return error.clone();
    }
    for (condition, status) in &record.statuses {
        match status {
            TrajectoryStatus::Success => {}
            TrajectoryStatus::NumericalFailure { reason } => {
                return format!("{condition}: {reason}");
            }
            TrajectoryStatus::Timeout => {
                return format!("{condition}: step budget exhausted");
            }
        }
    }
    "ok".to_string()
}

/// A validated network-plus-configuration pair, ready to run cohorts.
pub struct Pipeline {
    network: Arc<ReactionNetwork>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(network: ReactionNetwork, config: PipelineConfig) -> Result<Self, PipelineError> {
        if config.conditions.is_empty() {
            return Err(PipelineError::NoConditions);
        }
        for (i, condition) in config.conditions.iter().enumerate() {
            if config.conditions[..i].iter().any(|c| c.name == condition.name) {
                return Err(PipelineError::DuplicateCondition(condition.name.clone()));
            }
        }
        config.schema.validate(&network)?;
        Ok(Pipeline {
            network: Arc::new(network),
            config,
        })
    }

    pub fn network(&self) -> &ReactionNetwork {
        &self.network
    }

    /// Column names of the concatenated feature matrix: the schema's names,
    /// prefixed by condition when more than one condition is configured.
    pub fn feature_names(&self) -> Vec<String> {
        if self.config.conditions.len() == 1 {
            self.config.schema.names()
        } else {
            self.config
                .conditions
                .iter()
                .flat_map(|c| {
                    self.config
                        .schema
                        .names()
                        .into_iter()
                        .map(move |n| format!("{}:{}", c.name, n))
                })
                .collect()
        }
    }

    /// Run the full cohort: evaluate every patient, fit one classifier over
    /// the pooled features, assign everyone with defined features.
    pub fn run(&self, cohort: &Cohort) -> Result<CohortResult, PipelineError> {
        let mut records = self.evaluate(cohort.patients())?;
        let (classifier, classification_error) = self.classify(&mut records);
        Ok(CohortResult {
            records,
            feature_names: self.feature_names(),
            classifier,
            classification_error,
        })
    }

    /// Re-evaluate a subset of patients against an earlier result, then
    /// retrain and reassign over the merged feature matrix. Patients outside
    /// the subset reuse their previous simulation work (and hit the
    /// trajectory cache if enabled).
    pub fn rerun(
        &self,
        previous: &CohortResult,
        cohort: &Cohort,
        ids: &[String],
    ) -> Result<CohortResult, PipelineError> {
        let mut subset = Vec::with_capacity(ids.len());
        for id in ids {
            match cohort.get(id) {
                Some(spec) => subset.push(spec.clone()),
                None => return Err(PipelineError::UnknownPatient(id.clone())),
            }
        }

        let fresh = self.evaluate(&subset)?;
        let mut records = previous.records.clone();
        for (id, record) in fresh {
            records.insert(id, record);
        }

        let (classifier, classification_error) = self.classify(&mut records);
        Ok(CohortResult {
            records,
            feature_names: self.feature_names(),
            classifier,
            classification_error,
        })
    }

    fn evaluate(
        &self,
        patients: &[PatientSpec],
    ) -> Result<BTreeMap<String, PatientRecord>, PipelineError> {
        let bar = if self.config.progress {
            ProgressBar::new(patients.len() as u64)
        } else {
            ProgressBar::hidden()
        };

        let accumulator: DashMap<String, PatientRecord> = DashMap::with_capacity(patients.len());
        let work = || {
            patients.par_iter().for_each(|patient| {
                accumulator.insert(patient.id().to_string(), self.evaluate_patient(patient));
                bar.inc(1);
            });
        };
        match self.config.parallelism {
            Some(threads) => rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()?
                .install(work),
            None => work(),
        }
        bar.finish_and_clear();

        Ok(accumulator.into_iter().collect())
    }

    fn evaluate_patient(&self, patient: &PatientSpec) -> PatientRecord {
        let mut warnings: Vec<ClampWarning> = Vec::new();
        let mut statuses = BTreeMap::new();
        let mut values = Vec::new();
        let mut undefined: Option<String> = None;

        for condition in &self.config.conditions {
            let params =
                match personalize_with_overrides(&self.network, patient, condition.overrides()) {
                    Ok(params) => params,
                    Err(e) => {
                        let reason = e.to_string();
                        return PatientRecord {
                            label: patient.label().map(String::from),
                            error: Some(reason.clone()),
                            warnings,
                            statuses,
                            features: FeatureVector::Undefined { reason },
                            assignment: None,
                        };
                    }
                };
            for warning in params.warnings() {
                if !warnings.contains(warning) {
                    warnings.push(warning.clone());
                }
            }

            let trajectory = simulate_with_cache(
                &self.network,
                &params,
                &self.config.grid,
                &self.config.solver,
                self.config.cache,
            );
            statuses.insert(condition.name.clone(), trajectory.status().clone());

            match extract(&self.network, &self.config.schema, &trajectory) {
                FeatureVector::Defined(v) => values.extend(v),
                FeatureVector::Undefined { reason } => {
                    if undefined.is_none() {
                        undefined = Some(format!("{}: {reason}", condition.name));
                    }
                }
            }
        }

        let features = match undefined {
            Some(reason) => FeatureVector::Undefined { reason },
            None => FeatureVector::Defined(values),
        };
        PatientRecord {
            label: patient.label().map(String::from),
            error: None,
            warnings,
            statuses,
            features,
            assignment: None,
        }
    }

    /// Fit one classifier over every defined feature vector, then assign
    /// each of those patients. Fitting failure is recorded, not raised.
    fn classify(
        &self,
        records: &mut BTreeMap<String, PatientRecord>,
    ) -> (Option<TrainedClassifier>, Option<String>) {
        let samples: Vec<(Option<String>, Vec<f64>)> = records
            .values()
            .filter_map(|r| {
                r.features
                    .values()
                    .map(|v| (r.label.clone(), v.to_vec()))
            })
            .collect();
        if samples.is_empty() {
            return (
                None,
                Some("no patient produced a defined feature vector".to_string()),
            );
        }

        let classifier = match TrainedClassifier::fit(&self.config.mode, &samples) {
            Ok(classifier) => classifier,
            Err(e) => return (None, Some(e.to_string())),
        };
        for record in records.values_mut() {
            if let Some(values) = record.features.values() {
                record.assignment = classifier.classify(values).ok();
            }
        }
        (Some(classifier), None)
    }
}
